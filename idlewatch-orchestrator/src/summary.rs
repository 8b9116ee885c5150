use idlewatch_common::Outcome;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::info;

use crate::pool::InstanceResult;

/// Bucket for stopped instances that carry no type tag.
pub const UNTYPED: &str = "untyped";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    /// Stopped (or would-stop) counts keyed by type, sorted by type name.
    pub stopped_by_type: BTreeMap<String, usize>,
    pub reboots: usize,
    pub failures: usize,
    pub no_action: usize,
    pub processed: usize,
}

impl PassSummary {
    pub fn total_stopped(&self) -> usize {
        self.stopped_by_type.values().sum()
    }

    pub fn record(&mut self, result: &InstanceResult, type_tag_key: &str) {
        self.processed += 1;
        match &result.outcome {
            Outcome::Stopped | Outcome::WouldStop => {
                let ty = match result.instance.instance_type(type_tag_key) {
                    Some(ty) => ty,
                    None => {
                        info!(
                            "{} - has no {}! ({})",
                            result.instance.name, type_tag_key, result.instance.id
                        );
                        UNTYPED
                    }
                };
                *self.stopped_by_type.entry(ty.to_string()).or_insert(0) += 1;
            }
            Outcome::RebootIssued => self.reboots += 1,
            Outcome::NoAction => self.no_action += 1,
            Outcome::Failed(_) => self.failures += 1,
        }
    }

    pub fn log(&self, dry_run: bool) {
        let verb = if dry_run { "would stop" } else { "stopped" };
        for (ty, count) in &self.stopped_by_type {
            info!("{} - {} {}", ty, verb, count);
        }
        info!(
            "processed {} instance(s): {} {}, {} rebooted, {} failed, {} left alone",
            self.processed,
            self.total_stopped(),
            verb,
            self.reboots,
            self.failures,
            self.no_action
        );
    }
}

/// Drain every result the pool produced. Call after the pool returned, so
/// the channel only holds finished work.
pub fn drain(
    results: &mut mpsc::UnboundedReceiver<InstanceResult>,
    type_tag_key: &str,
) -> PassSummary {
    let mut summary = PassSummary::default();
    while let Ok(result) = results.try_recv() {
        summary.record(&result, type_tag_key);
    }
    summary
}
