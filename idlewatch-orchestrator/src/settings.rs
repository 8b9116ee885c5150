use anyhow::{bail, Context, Result};
use idlewatch_common::{CredentialSet, IdleThresholds, MasterRegistry};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use crate::inventory::{compile_name_pattern, InventoryConfig};
use crate::probe::ProbeConfig;

pub const DEFAULT_MASTERS_URL: &str =
    "https://hg.mozilla.org/build/tools/raw-file/default/buildfarm/maintenance/production-masters.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Ec2,
    Mock,
}

impl ProviderKind {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "" | "ec2" | "aws" => Ok(Self::Ec2),
            "mock" => Ok(Self::Mock),
            other => bail!("unknown provider '{}' (expected ec2 or mock)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub provider: ProviderKind,
    pub regions: Vec<String>,
    pub concurrency: usize,
    pub dry_run: bool,
    pub credentials_file: PathBuf,
    pub masters_json: String,
    pub aws_secrets_file: Option<PathBuf>,
    pub mock_fleet_file: Option<PathBuf>,
    pub ready_tag_key: String,
    pub ready_tag_value: String,
    pub type_tag_key: String,
    pub name_pattern: String,
    pub min_running_per_type: usize,
    pub thresholds: IdleThresholds,
    pub ssh_connect_timeout: Duration,
    pub ssh_command_timeout: Duration,
    pub http_timeout: Duration,
    pub poll_interval: Duration,
    pub worker_log_dir: String,
    pub log_tail_lines: usize,
}

fn env_flag(raw: Option<String>) -> bool {
    raw.map(|v| {
        let v = v.trim().to_ascii_lowercase();
        v == "1" || v == "true" || v == "yes"
    })
    .unwrap_or(false)
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source. Unparsable numbers
    /// fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("IDLEWATCH_{}", name));
        let num = |name: &str, default: u64| -> u64 {
            match var(name) {
                Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                    warn!("IDLEWATCH_{}={:?} is not a number; using {}", name, raw, default);
                    default
                }),
                None => default,
            }
        };

        let provider = ProviderKind::parse(&var("PROVIDER").unwrap_or_default())?;
        let regions = var("REGIONS")
            .map(|raw| {
                raw.split(',')
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let credentials_file = non_empty(var("CREDENTIALS_FILE"))
            .map(PathBuf::from)
            .context("IDLEWATCH_CREDENTIALS_FILE must be set")?;

        let name_pattern = var("NAME_PATTERN").unwrap_or_else(|| r".*-ec2-\d+".to_string());
        compile_name_pattern(&name_pattern)?;

        let defaults = IdleThresholds::default();
        let thresholds = IdleThresholds {
            boot_grace_secs: num("BOOT_GRACE_SECS", defaults.boot_grace_secs),
            stale_warn_secs: num("STALE_WARN_SECS", defaults.stale_warn_secs),
            stale_reboot_secs: num("STALE_REBOOT_SECS", defaults.stale_reboot_secs),
            no_evidence_reboot_secs: num("NO_EVIDENCE_REBOOT_SECS", defaults.no_evidence_reboot_secs),
            idle_shutdown_secs: num("IDLE_SHUTDOWN_SECS", defaults.idle_shutdown_secs),
            impaired_grace_secs: num("IMPAIRED_GRACE_SECS", defaults.impaired_grace_secs),
        };

        let settings = Self {
            provider,
            regions,
            concurrency: (num("CONCURRENCY", 8) as usize).max(1),
            dry_run: env_flag(var("DRY_RUN")),
            credentials_file,
            masters_json: non_empty(var("MASTERS_JSON"))
                .unwrap_or_else(|| DEFAULT_MASTERS_URL.to_string()),
            aws_secrets_file: non_empty(var("AWS_SECRETS_FILE")).map(PathBuf::from),
            mock_fleet_file: non_empty(var("MOCK_FLEET_FILE")).map(PathBuf::from),
            ready_tag_key: non_empty(var("READY_TAG_KEY")).unwrap_or_else(|| "moz-state".to_string()),
            ready_tag_value: non_empty(var("READY_TAG_VALUE")).unwrap_or_else(|| "ready".to_string()),
            type_tag_key: non_empty(var("TYPE_TAG_KEY")).unwrap_or_else(|| "moz-type".to_string()),
            name_pattern,
            min_running_per_type: num("MIN_RUNNING_PER_TYPE", 0) as usize,
            thresholds,
            ssh_connect_timeout: Duration::from_secs(num("SSH_CONNECT_TIMEOUT_SECS", 10)),
            ssh_command_timeout: Duration::from_secs(num("SSH_COMMAND_TIMEOUT_SECS", 30)),
            http_timeout: Duration::from_secs(num("HTTP_TIMEOUT_SECS", 10)),
            poll_interval: Duration::from_millis(num("POLL_INTERVAL_MS", 500).max(1)),
            worker_log_dir: non_empty(var("WORKER_LOG_DIR"))
                .unwrap_or_else(|| "/builds/slave".to_string()),
            log_tail_lines: (num("LOG_TAIL_LINES", 100) as usize).max(1),
        };
        Ok(settings)
    }

    pub fn inventory_config(&self) -> Result<InventoryConfig> {
        let mut config = InventoryConfig::new(&self.name_pattern)?;
        config.ready_tag_key = self.ready_tag_key.clone();
        config.ready_tag_value = self.ready_tag_value.clone();
        config.type_tag_key = self.type_tag_key.clone();
        config.min_running_per_type = self.min_running_per_type;
        Ok(config)
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            thresholds: self.thresholds,
            worker_dir: self.worker_log_dir.clone(),
            tail_lines: self.log_tail_lines,
            // TCP connect, then handshake and auth under the session timeout
            attempt_timeout: self.ssh_connect_timeout + self.ssh_command_timeout,
            dry_run: self.dry_run,
        }
    }
}

pub fn load_credentials(path: &std::path::Path) -> Result<CredentialSet> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read credentials file {}", path.display()))?;
    let credentials = CredentialSet::from_json(&raw)
        .with_context(|| format!("parse credentials file {}", path.display()))?;
    if credentials.is_empty() {
        warn!("credentials file {} has no passwords; every login will fail", path.display());
    }
    Ok(credentials)
}

/// Read the registry from a local file; if that fails, treat `source` as a URL.
pub async fn load_master_registry(source: &str, timeout: Duration) -> Result<MasterRegistry> {
    let raw = match tokio::fs::read_to_string(source).await {
        Ok(raw) => raw,
        Err(e) => {
            debug!("{} is not a readable file ({}); fetching as URL", source, e);
            let client = reqwest::Client::builder().timeout(timeout).build()?;
            client
                .get(source)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .with_context(|| format!("fetch master registry {}", source))?
                .text()
                .await
                .with_context(|| format!("read master registry body from {}", source))?
        }
    };
    MasterRegistry::from_json(&raw).with_context(|| format!("parse master registry {}", source))
}
