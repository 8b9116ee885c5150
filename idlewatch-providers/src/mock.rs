use crate::{inventory::FleetInstance, FleetProvider};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

fn default_state() -> String {
    "running".to_string()
}

#[derive(Clone, Debug, Deserialize)]
pub struct MockInstance {
    #[serde(flatten)]
    pub instance: FleetInstance,
    #[serde(default = "default_state")]
    pub state: String,
}

/// Fleet snapshot the mock provider serves, usually loaded from JSON.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FleetSnapshot {
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub instances: Vec<MockInstance>,
    #[serde(default)]
    pub impaired: Vec<String>,
}

/// In-memory provider for offline dry runs and tests. Stop calls are recorded
/// instead of touching any cloud API.
pub struct MockProvider {
    snapshot: FleetSnapshot,
    failing_stops: HashSet<String>,
    refused_stops: HashSet<String>,
    stopped: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new(snapshot: FleetSnapshot) -> Self {
        Self {
            snapshot,
            failing_stops: HashSet::new(),
            refused_stops: HashSet::new(),
            stopped: Mutex::new(Vec::new()),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read mock fleet file {}", path.display()))?;
        let snapshot: FleetSnapshot = serde_json::from_str(&raw)
            .with_context(|| format!("parse mock fleet file {}", path.display()))?;
        Ok(Self::new(snapshot))
    }

    /// Make `stop_instance` fail for this id.
    pub fn with_failing_stop(mut self, instance_id: &str) -> Self {
        self.failing_stops.insert(instance_id.to_string());
        self
    }

    /// Make `stop_instance` answer `Ok(false)` for this id, as EC2 does when
    /// the instance is missing from the StopInstances response.
    pub fn with_refused_stop(mut self, instance_id: &str) -> Self {
        self.refused_stops.insert(instance_id.to_string());
        self
    }

    /// Ids that received a successful stop call, in call order.
    pub fn stopped_ids(&self) -> Vec<String> {
        self.stopped
            .lock()
            .map(|v| v.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn region_known(&self, region: &str) -> bool {
        self.snapshot.regions.iter().any(|r| r == region)
            || self
                .snapshot
                .instances
                .iter()
                .any(|m| m.instance.region == region)
    }
}

#[async_trait]
impl FleetProvider for MockProvider {
    async fn list_regions(&self) -> Result<Vec<String>> {
        let mut regions = self.snapshot.regions.clone();
        for m in &self.snapshot.instances {
            if !regions.contains(&m.instance.region) {
                regions.push(m.instance.region.clone());
            }
        }
        Ok(regions)
    }

    async fn list_ready_instances(
        &self,
        region: &str,
        ready_tag_key: &str,
        ready_tag_value: &str,
    ) -> Result<Vec<FleetInstance>> {
        if !self.region_known(region) {
            anyhow::bail!("MockProvider: unknown region '{}'", region);
        }
        Ok(self
            .snapshot
            .instances
            .iter()
            .filter(|m| m.instance.region == region && m.state == "running")
            .filter(|m| m.instance.readiness(ready_tag_key) == Some(ready_tag_value))
            .map(|m| m.instance.clone())
            .collect())
    }

    async fn list_impaired_instance_ids(&self, region: &str) -> Result<Vec<String>> {
        Ok(self
            .snapshot
            .instances
            .iter()
            .filter(|m| m.instance.region == region)
            .filter(|m| self.snapshot.impaired.contains(&m.instance.id))
            .map(|m| m.instance.id.clone())
            .collect())
    }

    async fn stop_instance(&self, region: &str, instance_id: &str) -> Result<bool> {
        if self.failing_stops.contains(instance_id) {
            anyhow::bail!("MockProvider: stop failed for {} in {}", instance_id, region);
        }
        if self.refused_stops.contains(instance_id) {
            tracing::debug!("MockProvider: stop {} ({}) not accepted", instance_id, region);
            return Ok(false);
        }
        tracing::debug!("MockProvider: stop {} ({})", instance_id, region);
        match self.stopped.lock() {
            Ok(mut stopped) => stopped.push(instance_id.to_string()),
            Err(poisoned) => poisoned.into_inner().push(instance_id.to_string()),
        }
        Ok(true)
    }
}
