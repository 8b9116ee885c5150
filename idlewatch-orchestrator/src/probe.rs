// ============================================================================
// ACTIVITY PROBE: log into a worker and decide what it is doing
// ============================================================================

use chrono::NaiveDateTime;
use idlewatch_common::{ActivityState, CredentialSet, IdleThresholds, ProbeError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::remote::{RemoteConnector, RemoteSession};

const CLOCK_FORMAT: &str = "%Y%m%d%H%M%S";
const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const LOG_TIMESTAMP_LEN: usize = 19;

const COMMAND_STARTED_MARKERS: [&str; 2] = ["RunProcess._startCommand", "using PTY: "];
const COMMAND_COMPLETED_MARKERS: [&str; 2] = ["commandComplete", "stopCommand"];
const SHUTDOWN_MARKER: &str = "Shut Down";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    CommandStarted,
    CommandCompleted,
    ShutDown,
    Activity,
}

/// One timestamped line of the worker activity log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: NaiveDateTime,
    pub event: LogEvent,
    pub line: String,
}

fn leading_timestamp(line: &str) -> Option<NaiveDateTime> {
    let head = line.get(..LOG_TIMESTAMP_LEN)?;
    if !head.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    NaiveDateTime::parse_from_str(head, LOG_TIMESTAMP_FORMAT).ok()
}

/// Turn the raw tail output into timestamped records, oldest first. Lines
/// without a leading timestamp (tracebacks, `tail` file headers) are dropped.
pub fn parse_log_tail(tail: &str) -> Vec<LogRecord> {
    tail.lines()
        .filter_map(|line| {
            let timestamp = leading_timestamp(line)?;
            let event = if COMMAND_STARTED_MARKERS.iter().any(|m| line.contains(m)) {
                LogEvent::CommandStarted
            } else if COMMAND_COMPLETED_MARKERS.iter().any(|m| line.contains(m)) {
                LogEvent::CommandCompleted
            } else if line.contains(SHUTDOWN_MARKER) {
                LogEvent::ShutDown
            } else {
                LogEvent::Activity
            };
            Some(LogRecord {
                timestamp,
                event,
                line: line.trim_end().to_string(),
            })
        })
        .collect()
}

/// Side effect requested by the classifier, independent of the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remediation {
    None,
    /// Newest evidence is stale; worth a warning only.
    Warn,
    /// Newest evidence is very stale, or there is none at all on a long-up host.
    Reboot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub state: ActivityState,
    /// Seconds between the worker clock and its newest log line.
    pub evidence_age: Option<f64>,
    pub remediation: Remediation,
}

fn seconds_between(later: NaiveDateTime, earlier: NaiveDateTime) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 1000.0
}

/// Classify a worker from its clock, uptime and parsed log records.
///
/// Every timestamped record re-evaluates the state, so the newest line wins:
/// a shutdown line yields `Stopped` (or `Booting` when it predates this boot),
/// any other line yields `IdleFor(0)` while a command is running and the
/// line's age otherwise.
pub fn classify(
    wall_clock: NaiveDateTime,
    uptime_secs: f64,
    records: &[LogRecord],
    thresholds: &IdleThresholds,
) -> Classification {
    if uptime_secs < thresholds.boot_grace_secs as f64 {
        return Classification {
            state: ActivityState::Booting,
            evidence_age: None,
            remediation: Remediation::None,
        };
    }

    let mut running = false;
    let mut state = None;
    for record in records {
        match record.event {
            LogEvent::CommandStarted => running = true,
            LogEvent::CommandCompleted => running = false,
            LogEvent::ShutDown | LogEvent::Activity => {}
        }

        let age = seconds_between(wall_clock, record.timestamp);
        state = Some(if record.event == LogEvent::ShutDown {
            if age > uptime_secs {
                ActivityState::Booting
            } else {
                ActivityState::Stopped
            }
        } else if running {
            ActivityState::IdleFor(0.0)
        } else {
            ActivityState::IdleFor(age.max(0.0))
        });
    }

    let evidence_age = records
        .last()
        .map(|r| seconds_between(wall_clock, r.timestamp));

    let remediation = match evidence_age {
        Some(age) if age > uptime_secs && age > thresholds.stale_reboot_secs as f64 => {
            Remediation::Reboot
        }
        Some(age) if age > uptime_secs && age > thresholds.stale_warn_secs as f64 => {
            Remediation::Warn
        }
        Some(_) => Remediation::None,
        None if uptime_secs > thresholds.no_evidence_reboot_secs as f64 => Remediation::Reboot,
        None => Remediation::None,
    };

    Classification {
        state: state.unwrap_or(ActivityState::NoEvidence),
        evidence_age,
        remediation,
    }
}

/// Coordinator host from the worker's `buildbot.tac`.
pub fn parse_master_host(tac: &str) -> Option<String> {
    tac.lines().find_map(|line| {
        line.trim_end()
            .strip_prefix("buildmaster_host = '")?
            .strip_suffix('\'')
            .filter(|host| !host.is_empty())
            .map(|host| host.to_string())
    })
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub thresholds: IdleThresholds,
    /// Directory holding `twistd.log`, `twistd.log.1` and `buildbot.tac`.
    pub worker_dir: String,
    pub tail_lines: usize,
    /// Upper bound on one credential attempt, on top of the connector's own timeouts.
    pub attempt_timeout: Duration,
    pub dry_run: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            thresholds: IdleThresholds::default(),
            worker_dir: "/builds/slave".to_string(),
            tail_lines: 100,
            attempt_timeout: Duration::from_secs(40),
            dry_run: false,
        }
    }
}

/// What one probe concluded, plus whether it rebooted the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub state: ActivityState,
    pub reboot_issued: bool,
}

pub struct ActivityProbe {
    connector: Arc<dyn RemoteConnector>,
    credentials: Arc<CredentialSet>,
    config: ProbeConfig,
}

impl ActivityProbe {
    pub fn new(
        connector: Arc<dyn RemoteConnector>,
        credentials: Arc<CredentialSet>,
        config: ProbeConfig,
    ) -> Self {
        Self {
            connector,
            credentials,
            config,
        }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Try every (username, password) pair in order; first success wins.
    pub async fn connect(
        &self,
        name: &str,
        ip: &str,
    ) -> Result<Box<dyn RemoteSession>, ProbeError> {
        for (username, password) in self.credentials.attempts() {
            let attempt = tokio::time::timeout(
                self.config.attempt_timeout,
                self.connector.connect(ip, username, password),
            )
            .await;
            match attempt {
                Ok(Ok(session)) => {
                    debug!("{} - logged in as {}", name, username);
                    return Ok(session);
                }
                Ok(Err(e)) => debug!("{} - login as {} failed: {:#}", name, username, e),
                Err(_) => debug!(
                    "{} - login as {} timed out after {:?}",
                    name, username, self.config.attempt_timeout
                ),
            }
        }

        warn!(
            "Couldn't log into {} at {} with any known passwords",
            name, ip
        );
        Err(ProbeError::Unreachable)
    }

    async fn run(&self, session: &dyn RemoteSession, command: &str) -> Result<String, ProbeError> {
        session
            .exec(command)
            .await
            .map_err(|e| ProbeError::Remote(format!("{}: {:#}", command, e)))
    }

    async fn wall_clock(&self, session: &dyn RemoteSession) -> Result<NaiveDateTime, ProbeError> {
        let raw = self.run(session, "date +%Y%m%d%H%M%S").await?;
        NaiveDateTime::parse_from_str(raw.trim(), CLOCK_FORMAT)
            .map_err(|_| ProbeError::Protocol(format!("unparsable date output {:?}", raw.trim())))
    }

    async fn uptime(&self, session: &dyn RemoteSession) -> Result<f64, ProbeError> {
        let raw = self.run(session, "cat /proc/uptime").await?;
        raw.split_whitespace()
            .next()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| ProbeError::Protocol(format!("unparsable uptime output {:?}", raw.trim())))
    }

    /// Read clock, uptime and the activity log tail, classify, and apply any
    /// reboot remediation (fire-and-forget; suppressed in dry-run).
    pub async fn last_activity(
        &self,
        name: &str,
        session: &dyn RemoteSession,
    ) -> Result<ProbeReport, ProbeError> {
        let wall_clock = self.wall_clock(session).await?;
        let uptime = self.uptime(session).await?;
        let thresholds = &self.config.thresholds;

        if uptime < thresholds.boot_grace_secs as f64 {
            debug!("{} - uptime is {:.2}; assuming we're still booting up", name, uptime);
            return Ok(ProbeReport {
                state: ActivityState::Booting,
                reboot_issued: false,
            });
        }

        let dir = self.config.worker_dir.trim_end_matches('/');
        let tail = self
            .run(
                session,
                &format!(
                    "tail -n {n} {dir}/twistd.log.1 {dir}/twistd.log",
                    n = self.config.tail_lines,
                    dir = dir
                ),
            )
            .await?;
        let records = parse_log_tail(&tail);
        let classification = classify(wall_clock, uptime, &records, thresholds);
        let last_line = records.last().map(|r| r.line.as_str()).unwrap_or("");

        let mut reboot_issued = false;
        match (classification.remediation, classification.evidence_age) {
            (Remediation::None, _) => {}
            (remediation, Some(age)) => {
                warn!(
                    "{} - last activity happened {:.0}s ago, but we've been up for {:.0}s - {}",
                    name, age, uptime, last_line
                );
                if remediation == Remediation::Reboot {
                    reboot_issued = self.reboot(name, session).await;
                }
            }
            (_, None) => {
                warn!("{} - no activity after {:.0}s of uptime; rebooting", name, uptime);
                reboot_issued = self.reboot(name, session).await;
            }
        }

        debug!("{} - {} - {}", name, classification.state, last_line);
        Ok(ProbeReport {
            state: classification.state,
            reboot_issued,
        })
    }

    async fn reboot(&self, name: &str, session: &dyn RemoteSession) -> bool {
        if self.config.dry_run {
            info!("{} - would have rebooted", name);
            return true;
        }
        warn!("{} - rebooting", name);
        match session.fire("sudo reboot").await {
            Ok(()) => true,
            Err(e) => {
                warn!("{} - reboot command failed: {:#}", name, e);
                false
            }
        }
    }

    /// Read the coordinator host this worker reports to.
    pub async fn master_host(
        &self,
        session: &dyn RemoteSession,
    ) -> Result<Option<String>, ProbeError> {
        let dir = self.config.worker_dir.trim_end_matches('/');
        let tac = self.run(session, &format!("cat {}/buildbot.tac", dir)).await?;
        Ok(parse_master_host(&tac))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn thresholds() -> IdleThresholds {
        IdleThresholds::default()
    }

    #[test]
    fn parses_timestamps_and_markers() {
        let tail = "\
==> /builds/slave/twistd.log.1 <==
2024-03-01 10:00:00-0800 [-] RunProcess._startCommand
2024-03-01 10:05:00-0800 [-] command ended
Traceback (most recent call last):
2024-03-01 10:05:01-0800 [-] commandComplete(...)
2024-03-01 10:06:00-0800 [-] Server Shut Down.
2024-03-01 10:07:00-0800 [-]  using PTY: False
";
        let records = parse_log_tail(tail);
        let events: Vec<_> = records.iter().map(|r| r.event).collect();
        assert_eq!(
            events,
            vec![
                LogEvent::CommandStarted,
                LogEvent::Activity,
                LogEvent::CommandCompleted,
                LogEvent::ShutDown,
                LogEvent::CommandStarted,
            ]
        );
        assert_eq!(records[0].timestamp, at(10, 0, 0));
    }

    #[test]
    fn short_or_garbled_lines_are_skipped() {
        assert!(parse_log_tail("2024-03-01\nnot a date at all 12:00:00\n").is_empty());
        assert!(parse_log_tail("").is_empty());
    }

    #[test]
    fn recent_boot_is_always_booting() {
        let records = parse_log_tail("2024-03-01 10:00:00 [-] Server Shut Down.\n");
        for uptime in [0.0, 42.5, 179.9] {
            let c = classify(at(12, 0, 0), uptime, &records, &thresholds());
            assert_eq!(c.state, ActivityState::Booting);
            assert_eq!(c.remediation, Remediation::None);
        }
    }

    #[test]
    fn shutdown_before_boot_is_booting_after_boot_is_stopped() {
        let records = parse_log_tail("2024-03-01 11:50:00 [-] Server Shut Down.\n");
        // Shutdown 600s ago, up for 1200s: happened during this boot.
        let after_boot = classify(at(12, 0, 0), 1200.0, &records, &thresholds());
        assert_eq!(after_boot.state, ActivityState::Stopped);
        // Shutdown 600s ago, up for 300s: left over from the previous boot.
        let before_boot = classify(at(12, 0, 0), 300.0, &records, &thresholds());
        assert_eq!(before_boot.state, ActivityState::Booting);
    }

    #[test]
    fn running_command_means_zero_idle() {
        let records = parse_log_tail(
            "2024-03-01 11:00:00 [-] RunProcess._startCommand\n2024-03-01 11:10:00 [-] output chunk\n",
        );
        let c = classify(at(12, 0, 0), 7200.0, &records, &thresholds());
        assert_eq!(c.state, ActivityState::IdleFor(0.0));
    }

    #[test]
    fn idle_since_last_line_after_command_completed() {
        let records = parse_log_tail(
            "2024-03-01 11:00:00 [-] RunProcess._startCommand\n2024-03-01 11:55:00 [-] commandComplete\n",
        );
        let c = classify(at(12, 0, 0), 7200.0, &records, &thresholds());
        assert_eq!(c.state, ActivityState::IdleFor(300.0));
        assert_eq!(c.evidence_age, Some(300.0));
    }

    #[test]
    fn newest_line_wins_over_earlier_shutdown() {
        let records = parse_log_tail(
            "2024-03-01 11:00:00 [-] Server Shut Down.\n2024-03-01 11:30:00 [-] connected to master\n",
        );
        let c = classify(at(12, 0, 0), 7200.0, &records, &thresholds());
        assert_eq!(c.state, ActivityState::IdleFor(1800.0));
    }

    #[test]
    fn stale_evidence_warns_then_reboots() {
        // 20 minutes stale, up 15 minutes: warn only.
        let warn = classify(
            at(12, 0, 0),
            900.0,
            &parse_log_tail("2024-03-01 11:40:00 [-] idle\n"),
            &thresholds(),
        );
        assert_eq!(warn.remediation, Remediation::Warn);

        // 40 minutes stale, up 15 minutes: reboot.
        let reboot = classify(
            at(12, 0, 0),
            900.0,
            &parse_log_tail("2024-03-01 11:20:00 [-] idle\n"),
            &thresholds(),
        );
        assert_eq!(reboot.remediation, Remediation::Reboot);

        // 40 minutes stale but up for two hours: not stale relative to uptime.
        let fine = classify(
            at(12, 0, 0),
            7200.0,
            &parse_log_tail("2024-03-01 11:20:00 [-] idle\n"),
            &thresholds(),
        );
        assert_eq!(fine.remediation, Remediation::None);
    }

    #[test]
    fn no_evidence_reboots_only_after_threshold() {
        let quiet = classify(at(12, 0, 0), 600.0, &[], &thresholds());
        assert_eq!(quiet.state, ActivityState::NoEvidence);
        assert_eq!(quiet.remediation, Remediation::None);

        let stuck = classify(at(12, 0, 0), 901.0, &[], &thresholds());
        assert_eq!(stuck.state, ActivityState::NoEvidence);
        assert_eq!(stuck.remediation, Remediation::Reboot);
    }

    #[test]
    fn future_timestamps_clamp_to_zero_idle() {
        let records = parse_log_tail("2024-03-01 12:00:30 [-] clock skew\n");
        let c = classify(at(12, 0, 0), 7200.0, &records, &thresholds());
        assert_eq!(c.state, ActivityState::IdleFor(0.0));
    }

    #[test]
    fn master_host_from_tac() {
        let tac = "\
from twisted.application import service
buildmaster_host = 'buildbot-master01.bb.releng.use1.mozilla.com'
port = 9001
";
        assert_eq!(
            parse_master_host(tac).as_deref(),
            Some("buildbot-master01.bb.releng.use1.mozilla.com")
        );
        assert_eq!(parse_master_host("port = 9001\n"), None);
        assert_eq!(parse_master_host("buildmaster_host = ''\n"), None);
    }
}
