use anyhow::{Context, Result};
use idlewatch_common::{CredentialSet, MasterRegistry};
use idlewatch_providers::FleetProvider;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::inventory::{InstanceInventory, InventoryConfig};
use crate::pool::WorkerPool;
use crate::probe::{ActivityProbe, ProbeConfig};
use crate::provider_manager::ProviderManager;
use crate::remote::{RemoteConnector, SshConnector};
use crate::settings::{load_credentials, load_master_registry, Settings};
use crate::shutdown::{HttpShutdownRequester, ShutdownOrchestrator, ShutdownRequester};
use crate::summary::{self, PassSummary};

#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub summary: PassSummary,
    /// Candidates found by the inventory, before any was processed.
    pub candidates: usize,
    pub cancelled: bool,
}

/// One idle pass: inventory, per-instance decisions through the pool, summary.
pub struct IdlePass {
    provider: Arc<dyn FleetProvider>,
    connector: Arc<dyn RemoteConnector>,
    requester: Arc<dyn ShutdownRequester>,
    credentials: Arc<CredentialSet>,
    registry: Arc<MasterRegistry>,
    regions: Vec<String>,
    inventory_config: InventoryConfig,
    probe_config: ProbeConfig,
    pool: WorkerPool,
}

impl IdlePass {
    pub fn new(
        provider: Arc<dyn FleetProvider>,
        connector: Arc<dyn RemoteConnector>,
        requester: Arc<dyn ShutdownRequester>,
        credentials: Arc<CredentialSet>,
        registry: Arc<MasterRegistry>,
        inventory_config: InventoryConfig,
    ) -> Self {
        Self {
            provider,
            connector,
            requester,
            credentials,
            registry,
            regions: Vec::new(),
            inventory_config,
            probe_config: ProbeConfig::default(),
            pool: WorkerPool::default(),
        }
    }

    pub fn with_regions(mut self, regions: Vec<String>) -> Self {
        self.regions = regions;
        self
    }

    pub fn with_probe_config(mut self, probe_config: ProbeConfig) -> Self {
        self.probe_config = probe_config;
        self
    }

    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self
    }

    /// Production wiring: provider from settings, SSH, HTTP, files/URLs.
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        let provider = ProviderManager::get_provider(settings).with_context(|| {
            format!(
                "initialise provider {}",
                ProviderManager::current_provider_name(settings)
            )
        })?;
        let credentials = load_credentials(&settings.credentials_file)?;
        let registry = load_master_registry(&settings.masters_json, settings.http_timeout).await?;
        info!("loaded {} master(s) from {}", registry.len(), settings.masters_json);

        let connector = Arc::new(SshConnector::new(
            settings.ssh_connect_timeout,
            settings.ssh_command_timeout,
        ));
        let requester = Arc::new(HttpShutdownRequester::new(settings.http_timeout)?);

        Ok(Self::new(
            provider,
            connector,
            requester,
            Arc::new(credentials),
            Arc::new(registry),
            settings.inventory_config()?,
        )
        .with_regions(settings.regions.clone())
        .with_probe_config(settings.probe_config())
        .with_pool(WorkerPool::new(settings.concurrency, settings.poll_interval)))
    }

    /// Inventory failures abort the pass; per-instance failures never do.
    pub async fn run(&self, cancel: CancellationToken) -> Result<PassReport> {
        let dry_run = self.probe_config.dry_run;
        info!(
            "💤 idle pass started{}",
            if dry_run { " (dry run, nothing will be stopped)" } else { "" }
        );

        let inventory = InstanceInventory::new(self.provider.clone(), self.inventory_config.clone());
        let snapshot = inventory.snapshot(&self.regions).await?;
        let candidates = snapshot.candidates.len();
        info!(
            "💤 {} candidate(s) in {} region(s), {} impaired",
            candidates,
            snapshot.regions.len(),
            snapshot.impaired.len()
        );

        let probe = ActivityProbe::new(
            self.connector.clone(),
            self.credentials.clone(),
            self.probe_config.clone(),
        );
        let orchestrator = ShutdownOrchestrator::new(
            self.provider.clone(),
            probe,
            self.requester.clone(),
            self.registry.clone(),
            Arc::new(snapshot.impaired),
        );

        let mut run = self
            .pool
            .run(Arc::new(orchestrator), snapshot.candidates, cancel)
            .await;
        let summary = summary::drain(&mut run.results, &self.inventory_config.type_tag_key);
        summary.log(dry_run);

        if run.cancelled {
            warn!(
                "💤 idle pass interrupted after {} of {} instance(s)",
                summary.processed, candidates
            );
        } else {
            info!("💤 idle pass finished: {} instance(s) processed", summary.processed);
        }

        let report = PassReport {
            summary,
            candidates,
            cancelled: run.cancelled,
        };
        debug!(
            "{}",
            serde_json::json!({
                "event": "idle_pass_finished",
                "dry_run": dry_run,
                "report": report,
            })
        );
        Ok(report)
    }
}
