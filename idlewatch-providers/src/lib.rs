use anyhow::Result;
use async_trait::async_trait;

/// Cloud-side view of the worker fleet.
///
/// The idle pass only ever reads inventory and issues stops; instance
/// creation, tagging and termination live elsewhere.
#[async_trait]
pub trait FleetProvider: Send + Sync {
    /// All regions the account can see. Used when no regions are configured.
    async fn list_regions(&self) -> Result<Vec<String>>;

    /// Running instances in `region` whose `ready_tag_key` tag equals `ready_tag_value`.
    async fn list_ready_instances(
        &self,
        region: &str,
        ready_tag_key: &str,
        ready_tag_value: &str,
    ) -> Result<Vec<inventory::FleetInstance>>;

    /// Ids of instances in `region` whose instance status check reports "impaired".
    async fn list_impaired_instance_ids(&self, region: &str) -> Result<Vec<String>>;

    /// Request a stop. Returns once the provider accepted the request; does
    /// not wait for the instance to actually reach the stopped state.
    async fn stop_instance(&self, region: &str, instance_id: &str) -> Result<bool>;
}

pub mod inventory {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    pub struct FleetInstance {
        pub id: String,
        pub name: String,
        pub region: String,
        pub private_ip: Option<String>,
        pub launch_time: DateTime<Utc>,
        #[serde(default)]
        pub tags: BTreeMap<String, String>,
    }

    impl FleetInstance {
        pub fn tag(&self, key: &str) -> Option<&str> {
            self.tags.get(key).map(|s| s.as_str())
        }

        /// Declared worker type (e.g. the `moz-type` tag), if any.
        pub fn instance_type(&self, type_tag_key: &str) -> Option<&str> {
            self.tag(type_tag_key).filter(|t| !t.trim().is_empty())
        }

        pub fn readiness(&self, ready_tag_key: &str) -> Option<&str> {
            self.tag(ready_tag_key)
        }

        /// Seconds since launch, as seen from `now`.
        pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
            (now - self.launch_time).num_seconds()
        }
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "ec2")]
pub mod ec2;
