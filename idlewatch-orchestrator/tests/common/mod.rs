#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use idlewatch_common::{CredentialSet, MasterRegistry, ShutdownError};
use idlewatch_orchestrator::remote::{RemoteConnector, RemoteSession};
use idlewatch_orchestrator::shutdown::ShutdownRequester;
use idlewatch_providers::inventory::FleetInstance;
use idlewatch_providers::mock::{FleetSnapshot, MockInstance, MockProvider};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

pub const CLOCK: &str = "20240301120000";
pub const MASTER: &str = "bm1.build.example.com";

pub fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// What a fake worker answers to the probe's commands.
#[derive(Debug, Clone)]
pub struct WorkerScript {
    /// Accepted (username, password) pairs.
    pub logins: Vec<(String, String)>,
    pub clock: String,
    pub uptime: String,
    /// Successive answers to the log tail; the last one repeats.
    pub tails: Vec<String>,
    pub tac: String,
}

impl WorkerScript {
    fn base(tails: Vec<&str>) -> Self {
        Self {
            logins: vec![("root".to_string(), "hunter2".to_string())],
            clock: CLOCK.to_string(),
            uptime: "7200.00 14000.00".to_string(),
            tails: tails.into_iter().map(String::from).collect(),
            tac: format!("basedir = '/builds/slave'\nbuildmaster_host = '{}'\nport = 9001\n", MASTER),
        }
    }

    /// Last command finished ten minutes ago; shuts down once asked to.
    pub fn idle() -> Self {
        Self::base(vec![
            "2024-03-01 11:40:00-0800 [-] RunProcess._startCommand\n\
             2024-03-01 11:50:00-0800 [-] commandComplete\n",
            "2024-03-01 11:50:00-0800 [-] commandComplete\n\
             2024-03-01 11:59:30-0800 [-] Server Shut Down.\n",
        ])
    }

    /// Idle, but still running when checked again after the shutdown request.
    pub fn draining() -> Self {
        let mut script = Self::idle();
        script.tails.truncate(1);
        script
    }

    /// Newest log line is a shutdown during this boot.
    pub fn shut_down() -> Self {
        Self::base(vec!["2024-03-01 11:58:00-0800 [-] Server Shut Down.\n"])
    }

    /// A command is still running.
    pub fn busy() -> Self {
        Self::base(vec![
            "2024-03-01 11:00:00-0800 [-] commandComplete\n\
             2024-03-01 11:58:00-0800 [-] using PTY: False\n\
             2024-03-01 11:59:00-0800 [-] compiling\n",
        ])
    }

    /// Up for a long time with an empty log.
    pub fn silent() -> Self {
        let mut script = Self::base(vec![""]);
        script.uptime = "2000.00 3000.00".to_string();
        script
    }

    pub fn with_clock(mut self, clock: &str) -> Self {
        self.clock = clock.to_string();
        self
    }

    pub fn with_master(mut self, host: &str) -> Self {
        self.tac = format!("buildmaster_host = '{}'\n", host);
        self
    }

    pub fn with_logins(mut self, logins: &[(&str, &str)]) -> Self {
        self.logins = logins
            .iter()
            .map(|(u, p)| (u.to_string(), p.to_string()))
            .collect();
        self
    }
}

/// Connector keyed by host address. Unknown hosts refuse every login.
#[derive(Default)]
pub struct FakeConnector {
    workers: HashMap<String, WorkerScript>,
    /// (host, username, password) in attempt order.
    pub attempts: Arc<Mutex<Vec<(String, String, String)>>>,
    /// (host, command) for every fire-and-forget command.
    pub fired: Arc<Mutex<Vec<(String, String)>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn worker(mut self, host: &str, script: WorkerScript) -> Self {
        self.workers.insert(host.to_string(), script);
        self
    }

    pub fn attempts(&self) -> Vec<(String, String, String)> {
        lock(&self.attempts).clone()
    }

    pub fn fired(&self) -> Vec<(String, String)> {
        lock(&self.fired).clone()
    }
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn connect(
        &self,
        host: &str,
        username: &str,
        password: &str,
    ) -> Result<Box<dyn RemoteSession>> {
        lock(&self.attempts).push((host.to_string(), username.to_string(), password.to_string()));
        let Some(script) = self.workers.get(host) else {
            bail!("connection refused");
        };
        if !script
            .logins
            .iter()
            .any(|(u, p)| u == username && p == password)
        {
            bail!("authentication failed");
        }
        Ok(Box::new(FakeSession {
            host: host.to_string(),
            script: script.clone(),
            tails_served: Mutex::new(0),
            fired: self.fired.clone(),
        }))
    }
}

pub struct FakeSession {
    host: String,
    script: WorkerScript,
    tails_served: Mutex<usize>,
    fired: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn exec(&self, command: &str) -> Result<String> {
        if command.starts_with("date ") {
            return Ok(format!("{}\n", self.script.clock));
        }
        if command == "cat /proc/uptime" {
            return Ok(format!("{}\n", self.script.uptime));
        }
        if command.starts_with("tail ") {
            let mut served = lock(&self.tails_served);
            let idx = (*served).min(self.script.tails.len().saturating_sub(1));
            *served += 1;
            return Ok(self.script.tails.get(idx).cloned().unwrap_or_default());
        }
        if command.ends_with("/buildbot.tac") {
            return Ok(self.script.tac.clone());
        }
        bail!("unexpected command {:?}", command)
    }

    async fn fire(&self, command: &str) -> Result<()> {
        lock(&self.fired).push((self.host.clone(), command.to_string()));
        Ok(())
    }
}

/// Records graceful-shutdown requests instead of sending them.
#[derive(Default)]
pub struct RecordingRequester {
    pub calls: Mutex<Vec<(String, u16, String)>>,
}

impl RecordingRequester {
    pub fn calls(&self) -> Vec<(String, u16, String)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl ShutdownRequester for RecordingRequester {
    async fn request_shutdown(
        &self,
        host: &str,
        port: u16,
        worker_name: &str,
    ) -> Result<(), ShutdownError> {
        lock(&self.calls).push((host.to_string(), port, worker_name.to_string()));
        Ok(())
    }
}

pub fn credentials() -> Arc<CredentialSet> {
    Arc::new(CredentialSet::from_json(r#"{"root": ["hunter2"]}"#).unwrap())
}

pub fn registry() -> Arc<MasterRegistry> {
    Arc::new(
        MasterRegistry::from_json(&format!(
            r#"[{{"hostname": "{}", "http_port": 8001, "role": "build"}}]"#,
            MASTER
        ))
        .unwrap(),
    )
}

/// A ready worker in us-east-1 launched `age_secs` ago.
pub fn instance(name: &str, ip: Option<&str>, ty: Option<&str>, age_secs: i64) -> FleetInstance {
    let mut tags = BTreeMap::new();
    tags.insert("moz-state".to_string(), "ready".to_string());
    if let Some(ty) = ty {
        tags.insert("moz-type".to_string(), ty.to_string());
    }
    FleetInstance {
        id: format!("i-{}", name),
        name: name.to_string(),
        region: "us-east-1".to_string(),
        private_ip: ip.map(String::from),
        launch_time: Utc::now() - ChronoDuration::seconds(age_secs),
        tags,
    }
}

pub fn fleet(instances: Vec<FleetInstance>, impaired: &[&str]) -> MockProvider {
    MockProvider::new(FleetSnapshot {
        regions: vec!["us-east-1".to_string()],
        instances: instances
            .into_iter()
            .map(|instance| MockInstance {
                instance,
                state: "running".to_string(),
            })
            .collect(),
        impaired: impaired.iter().map(|s| s.to_string()).collect(),
    })
}
