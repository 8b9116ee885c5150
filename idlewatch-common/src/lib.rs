use std::collections::HashSet;
use std::fmt;

pub mod error;
pub mod registry;

pub use error::{ProbeError, ShutdownError};
pub use registry::{CredentialSet, Master, MasterRegistry};

// --- Enums ---

/// What a probe concluded about a worker's current activity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActivityState {
    /// Recently booted, or the newest shutdown evidence predates this boot.
    Booting,
    /// The worker process logged a shutdown since this boot.
    Stopped,
    /// Seconds since the last logged activity (0 while a command is running).
    IdleFor(f64),
    /// Up past the boot grace window but no timestamped log line was found.
    NoEvidence,
}

impl fmt::Display for ActivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityState::Booting => write!(f, "booting"),
            ActivityState::Stopped => write!(f, "stopped"),
            ActivityState::IdleFor(secs) => write!(f, "idle for {:.0}s", secs),
            ActivityState::NoEvidence => write!(f, "no activity"),
        }
    }
}

/// Result of processing one instance during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Stopped,
    WouldStop,
    RebootIssued,
    NoAction,
    Failed(String),
}

impl Outcome {
    /// True for outcomes tallied as "stopped" in the pass summary.
    pub fn counts_as_stopped(&self) -> bool {
        matches!(self, Outcome::Stopped | Outcome::WouldStop)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Stopped => "stopped",
            Outcome::WouldStop => "would_stop",
            Outcome::RebootIssued => "reboot_issued",
            Outcome::NoAction => "no_action",
            Outcome::Failed(_) => "failed",
        }
    }
}

// --- Entities ---

/// Instance ids reporting impaired provider health, snapshotted once per pass.
#[derive(Debug, Clone, Default)]
pub struct ImpairedSet(HashSet<String>);

impl ImpairedSet {
    pub fn contains(&self, instance_id: &str) -> bool {
        self.0.contains(instance_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<String> for ImpairedSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        ImpairedSet(iter.into_iter().collect())
    }
}

impl Extend<String> for ImpairedSet {
    fn extend<I: IntoIterator<Item = String>>(&mut self, iter: I) {
        self.0.extend(iter)
    }
}

/// Time thresholds (seconds) driving classification and the stop decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdleThresholds {
    /// Uptime below which a worker is always considered booting.
    pub boot_grace_secs: u64,
    /// Stale-evidence age that only produces a warning.
    pub stale_warn_secs: u64,
    /// Stale-evidence age that triggers a remote reboot.
    pub stale_reboot_secs: u64,
    /// Uptime after which a worker with no log evidence at all is rebooted.
    pub no_evidence_reboot_secs: u64,
    /// Idle time that must be exceeded before a graceful shutdown is requested.
    pub idle_shutdown_secs: u64,
    /// Age an unreachable, impaired instance must reach before it is stopped.
    pub impaired_grace_secs: u64,
}

impl Default for IdleThresholds {
    fn default() -> Self {
        Self {
            boot_grace_secs: 180,
            stale_warn_secs: 600,
            stale_reboot_secs: 1800,
            no_evidence_reboot_secs: 900,
            idle_shutdown_secs: 300,
            impaired_grace_secs: 600,
        }
    }
}
