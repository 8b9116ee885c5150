use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idlewatch_common::{
    ActivityState, IdleThresholds, ImpairedSet, MasterRegistry, Outcome, ProbeError,
    ShutdownError,
};
use idlewatch_providers::inventory::FleetInstance;
use idlewatch_providers::FleetProvider;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::pool::InstanceHandler;
use crate::probe::ActivityProbe;
use crate::remote::RemoteSession;

/// What the probe gave us to decide on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    State(ActivityState),
    /// Could not log in, or the worker answered with garbage.
    Unclassifiable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    NoAction,
    Stop,
    RequestGracefulShutdown,
}

/// Pure per-instance decision table.
pub fn decide(
    verdict: Verdict,
    impaired: bool,
    age_secs: i64,
    thresholds: &IdleThresholds,
) -> Decision {
    match verdict {
        Verdict::Unclassifiable => {
            if impaired && age_secs > thresholds.impaired_grace_secs as i64 {
                Decision::Stop
            } else {
                Decision::NoAction
            }
        }
        Verdict::State(ActivityState::Stopped) => Decision::Stop,
        Verdict::State(ActivityState::IdleFor(secs))
            if secs > thresholds.idle_shutdown_secs as f64 =>
        {
            Decision::RequestGracefulShutdown
        }
        Verdict::State(_) => Decision::NoAction,
    }
}

/// Asks a coordinator to let one worker finish its job and exit.
#[async_trait]
pub trait ShutdownRequester: Send + Sync {
    async fn request_shutdown(
        &self,
        host: &str,
        port: u16,
        worker_name: &str,
    ) -> Result<(), ShutdownError>;
}

pub struct HttpShutdownRequester {
    client: reqwest::Client,
}

impl HttpShutdownRequester {
    pub fn new(timeout: Duration) -> Result<Self> {
        // Default reqwest client has no overall timeout and follows redirects;
        // the coordinator answers with a redirect we must not chase.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ShutdownRequester for HttpShutdownRequester {
    async fn request_shutdown(
        &self,
        host: &str,
        port: u16,
        worker_name: &str,
    ) -> Result<(), ShutdownError> {
        let url = format!(
            "http://{}:{}/buildslaves/{}/shutdown",
            host, port, worker_name
        );
        debug!("{} - POSTing to {}", worker_name, url);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| ShutdownError::Http(e.to_string()))?;

        // The response status is not acted upon; the follow-up probe is the
        // source of truth for whether the worker went away.
        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            warn!("{} - graceful shutdown POST returned {}", worker_name, status);
        } else {
            debug!("{} - graceful shutdown POST returned {}", worker_name, status);
        }
        Ok(())
    }
}

/// Applies probe + decision + action to one instance. Shared read-only by
/// every worker of the pool for the duration of a pass.
pub struct ShutdownOrchestrator {
    provider: Arc<dyn FleetProvider>,
    probe: ActivityProbe,
    requester: Arc<dyn ShutdownRequester>,
    registry: Arc<MasterRegistry>,
    impaired: Arc<ImpairedSet>,
    thresholds: IdleThresholds,
    dry_run: bool,
}

impl ShutdownOrchestrator {
    pub fn new(
        provider: Arc<dyn FleetProvider>,
        probe: ActivityProbe,
        requester: Arc<dyn ShutdownRequester>,
        registry: Arc<MasterRegistry>,
        impaired: Arc<ImpairedSet>,
    ) -> Self {
        let thresholds = probe.config().thresholds;
        let dry_run = probe.config().dry_run;
        Self {
            provider,
            probe,
            requester,
            registry,
            impaired,
            thresholds,
            dry_run,
        }
    }

    /// Never fails: any error is logged with the instance name and becomes
    /// `Outcome::Failed`.
    pub async fn process(&self, instance: &FleetInstance) -> Outcome {
        match self.try_process(instance, Utc::now()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("{} - unable to stop: {:#}", instance.name, e);
                Outcome::Failed(format!("{:#}", e))
            }
        }
    }

    async fn try_process(&self, instance: &FleetInstance, now: DateTime<Utc>) -> Result<Outcome> {
        let name = instance.name.as_str();

        let session = match instance.private_ip.as_deref() {
            Some(ip) if !ip.trim().is_empty() => self.probe.connect(name, ip).await,
            _ => {
                debug!("{} - no private address ({})", name, instance.id);
                Err(ProbeError::Unreachable)
            }
        };
        let session = match session {
            Ok(session) => session,
            Err(e) => return self.unclassifiable(instance, e, now).await,
        };

        let report = match self.probe.last_activity(name, session.as_ref()).await {
            Ok(report) => report,
            Err(e) if e.is_unclassifiable() => return self.unclassifiable(instance, e, now).await,
            Err(e) => return Err(e.into()),
        };

        let decision = decide(
            Verdict::State(report.state),
            self.impaired.contains(&instance.id),
            instance.age_secs(now),
            &self.thresholds,
        );

        let outcome = match decision {
            Decision::Stop => {
                self.stop(instance, &format!("stopping instance (launched {})", instance.launch_time))
                    .await?
            }
            Decision::RequestGracefulShutdown => {
                if let ActivityState::IdleFor(secs) = report.state {
                    debug!("{} - last activity {:.0}s ago", name, secs);
                }
                self.graceful_shutdown(instance, session.as_ref()).await?
            }
            Decision::NoAction => {
                debug!("{} - not stopping ({})", name, report.state);
                Outcome::NoAction
            }
        };

        if outcome == Outcome::NoAction && report.reboot_issued {
            return Ok(Outcome::RebootIssued);
        }
        Ok(outcome)
    }

    async fn unclassifiable(
        &self,
        instance: &FleetInstance,
        cause: ProbeError,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let impaired = self.impaired.contains(&instance.id);
        match decide(
            Verdict::Unclassifiable,
            impaired,
            instance.age_secs(now),
            &self.thresholds,
        ) {
            Decision::Stop => {
                self.stop(instance, &format!("shut down an instance with impaired status ({})", cause))
                    .await
            }
            _ => {
                debug!("{} - cannot classify, leaving for next pass: {}", instance.name, cause);
                Ok(Outcome::NoAction)
            }
        }
    }

    async fn stop(&self, instance: &FleetInstance, reason: &str) -> Result<Outcome> {
        if self.dry_run {
            info!("{} - would have stopped ({})", instance.name, reason);
            return Ok(Outcome::WouldStop);
        }
        warn!("{} - {}", instance.name, reason);
        let accepted = self
            .provider
            .stop_instance(&instance.region, &instance.id)
            .await?;
        if !accepted {
            anyhow::bail!("provider did not accept stop for {}", instance.id);
        }
        Ok(Outcome::Stopped)
    }

    async fn graceful_shutdown(
        &self,
        instance: &FleetInstance,
        session: &dyn RemoteSession,
    ) -> Result<Outcome> {
        let name = instance.name.as_str();
        if self.dry_run {
            info!("{} - would have started graceful shutdown", name);
            return Ok(Outcome::WouldStop);
        }

        debug!("{} - looking up which master we're attached to", name);
        let host = self
            .probe
            .master_host(session)
            .await?
            .ok_or(ShutdownError::MissingMasterHost)?;
        let port = self
            .registry
            .http_port(&host)
            .ok_or_else(|| ShutdownError::RegistryLookup { host: host.clone() })?;

        debug!("{} - starting graceful shutdown", name);
        self.requester.request_shutdown(&host, port, name).await?;

        // Check if we've exited right away
        let report = self.probe.last_activity(name, session).await?;
        if report.state == ActivityState::Stopped {
            return self.stop(instance, "stopping instance after graceful shutdown").await;
        }
        info!("{} - not stopping, waiting for graceful shutdown", name);
        Ok(Outcome::NoAction)
    }
}

#[async_trait]
impl InstanceHandler for ShutdownOrchestrator {
    async fn handle(&self, instance: &FleetInstance) -> Outcome {
        self.process(instance).await
    }
}
