use crate::{inventory::FleetInstance, FleetProvider};
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_ec2::config::{Credentials, Region};
use aws_sdk_ec2::types::{Filter, Instance};
use aws_sdk_ec2::Client;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::sync::Mutex;

// Region used only to enumerate the other regions.
const DISCOVERY_REGION: &str = "us-east-1";

/// Static AWS keys, as stored in the legacy secrets JSON file.
#[derive(Clone, Deserialize)]
pub struct AwsSecrets {
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
}

impl AwsSecrets {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read AWS secrets file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parse AWS secrets file {}", path.display()))
    }
}

pub struct Ec2Provider {
    secrets: Option<AwsSecrets>,
    // One SDK client per region, built lazily.
    clients: Mutex<HashMap<String, Client>>,
}

impl Ec2Provider {
    /// Without `secrets` the default AWS credential chain (env, profile, IMDS) is used.
    pub fn new(secrets: Option<AwsSecrets>) -> Self {
        Self {
            secrets,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, region: &str) -> Client {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(region) {
            return client.clone();
        }

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.to_string()));
        if let Some(secrets) = &self.secrets {
            loader = loader.credentials_provider(Credentials::new(
                secrets.aws_access_key_id.clone(),
                secrets.aws_secret_access_key.clone(),
                None,
                None,
                "idlewatch-secrets-file",
            ));
        }
        let config = loader.load().await;
        let client = Client::new(&config);
        clients.insert(region.to_string(), client.clone());
        client
    }
}

fn to_fleet_instance(region: &str, i: &Instance) -> Option<FleetInstance> {
    let id = i.instance_id()?.to_string();
    let tags: BTreeMap<String, String> = i
        .tags()
        .iter()
        .filter_map(|t| Some((t.key()?.to_string(), t.value().unwrap_or_default().to_string())))
        .collect();
    let name = tags.get("Name").cloned().unwrap_or_default();
    let launch_time: DateTime<Utc> = i
        .launch_time()
        .and_then(|t| Utc.timestamp_opt(t.secs(), 0).single())
        .unwrap_or_else(Utc::now);

    Some(FleetInstance {
        id,
        name,
        region: region.to_string(),
        private_ip: i.private_ip_address().map(|s| s.to_string()),
        launch_time,
        tags,
    })
}

#[async_trait]
impl FleetProvider for Ec2Provider {
    async fn list_regions(&self) -> Result<Vec<String>> {
        let client = self.client(DISCOVERY_REGION).await;
        let out = client
            .describe_regions()
            .send()
            .await
            .context("ec2 DescribeRegions")?;
        Ok(out
            .regions()
            .iter()
            .filter_map(|r| r.region_name().map(|s| s.to_string()))
            .collect())
    }

    async fn list_ready_instances(
        &self,
        region: &str,
        ready_tag_key: &str,
        ready_tag_value: &str,
    ) -> Result<Vec<FleetInstance>> {
        let client = self.client(region).await;
        let mut found = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let out = client
                .describe_instances()
                .filters(
                    Filter::builder()
                        .name(format!("tag:{}", ready_tag_key))
                        .values(ready_tag_value)
                        .build(),
                )
                .filters(
                    Filter::builder()
                        .name("instance-state-name")
                        .values("running")
                        .build(),
                )
                .set_next_token(next_token.take())
                .send()
                .await
                .with_context(|| format!("ec2 DescribeInstances in {}", region))?;

            for reservation in out.reservations() {
                found.extend(
                    reservation
                        .instances()
                        .iter()
                        .filter_map(|i| to_fleet_instance(region, i)),
                );
            }

            next_token = out.next_token().map(|s| s.to_string());
            if next_token.is_none() {
                break;
            }
        }

        Ok(found)
    }

    async fn list_impaired_instance_ids(&self, region: &str) -> Result<Vec<String>> {
        let client = self.client(region).await;
        let mut ids = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let out = client
                .describe_instance_status()
                .filters(
                    Filter::builder()
                        .name("instance-status.status")
                        .values("impaired")
                        .build(),
                )
                .set_next_token(next_token.take())
                .send()
                .await
                .with_context(|| format!("ec2 DescribeInstanceStatus in {}", region))?;

            ids.extend(
                out.instance_statuses()
                    .iter()
                    .filter_map(|s| s.instance_id().map(|id| id.to_string())),
            );

            next_token = out.next_token().map(|s| s.to_string());
            if next_token.is_none() {
                break;
            }
        }

        Ok(ids)
    }

    async fn stop_instance(&self, region: &str, instance_id: &str) -> Result<bool> {
        let client = self.client(region).await;
        let out = client
            .stop_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .with_context(|| format!("ec2 StopInstances {} in {}", instance_id, region))?;
        Ok(out
            .stopping_instances()
            .iter()
            .any(|change| change.instance_id() == Some(instance_id)))
    }
}
