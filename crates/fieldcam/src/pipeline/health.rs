//! Health signals consumed by external indicators and log shippers.

use std::fmt;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::logging::STATUS_TARGET;

use super::state::PipelineState;
use super::stats::StatsSnapshot;

/// Severity of a subsystem's condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Working normally.
    Healthy,
    /// Working with reduced capability.
    Degraded,
    /// Not working.
    Error,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Health of one subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubsystemHealth {
    /// Subsystem name (`camera`, `position`, `storage`).
    pub name: &'static str,
    /// Current severity.
    pub status: HealthStatus,
    /// Human-readable detail.
    pub message: String,
}

impl SubsystemHealth {
    /// Create a health entry.
    #[must_use]
    pub fn new(name: &'static str, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            name,
            status,
            message: message.into(),
        }
    }

    /// Whether the subsystem is fully working.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Aggregate health of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Lifecycle state.
    pub state: PipelineState,
    /// Per-subsystem health, in dependency order.
    pub subsystems: Vec<SubsystemHealth>,
    /// Pipeline counters.
    pub counters: StatsSnapshot,
}

impl HealthReport {
    /// The worst status across all subsystems.
    #[must_use]
    pub fn overall(&self) -> HealthStatus {
        self.subsystems
            .iter()
            .map(|s| s.status)
            .max()
            .unwrap_or(HealthStatus::Healthy)
    }

    /// Health of the named subsystem.
    #[must_use]
    pub fn subsystem(&self, name: &str) -> Option<&SubsystemHealth> {
        self.subsystems.iter().find(|s| s.name == name)
    }
}

/// Outcome of one pipeline cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// A frame was tagged and persisted.
    Persisted {
        /// Frame sequence number.
        sequence: u64,
        /// Session the image landed in.
        session: String,
        /// Whether the image carries a real fix.
        real_fix: bool,
    },
    /// No frame this cycle.
    Dropped {
        /// Stage that failed.
        stage: &'static str,
        /// Why.
        reason: String,
    },
    /// Persistence is paused until storage recovers.
    Paused {
        /// Frame sequence number that was not stored.
        sequence: u64,
    },
}

/// Receives structured status events from the pipeline.
pub trait StatusSink: Send + Sync + fmt::Debug {
    /// One cycle finished.
    fn cycle(&self, cycle: u64, outcome: &CycleOutcome);

    /// A health report, emitted on state changes and periodically.
    fn health(&self, report: &HealthReport);
}

/// Emits status events as `tracing` events under [`STATUS_TARGET`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStatusSink;

impl StatusSink for TracingStatusSink {
    fn cycle(&self, cycle: u64, outcome: &CycleOutcome) {
        match outcome {
            CycleOutcome::Persisted {
                sequence,
                session,
                real_fix,
            } => info!(
                target: STATUS_TARGET,
                cycle,
                sequence,
                session = %session,
                fix = if *real_fix { "REAL" } else { "FALLBACK" },
                "cycle"
            ),
            CycleOutcome::Dropped { stage, reason } => warn!(
                target: STATUS_TARGET,
                cycle,
                stage,
                reason = %reason,
                "frame dropped"
            ),
            CycleOutcome::Paused { sequence } => warn!(
                target: STATUS_TARGET,
                cycle,
                sequence,
                "persistence paused"
            ),
        }
    }

    fn health(&self, report: &HealthReport) {
        let subsystems: Vec<String> = report
            .subsystems
            .iter()
            .map(|s| format!("{}={}", s.name, s.status))
            .collect();
        let subsystems = subsystems.join(",");
        match report.overall() {
            HealthStatus::Error => error!(
                target: STATUS_TARGET,
                state = %report.state,
                subsystems = %subsystems,
                persisted = report.counters.frames_persisted,
                dropped = report.counters.dropped_frames,
                "health"
            ),
            HealthStatus::Degraded => warn!(
                target: STATUS_TARGET,
                state = %report.state,
                subsystems = %subsystems,
                persisted = report.counters.frames_persisted,
                dropped = report.counters.dropped_frames,
                "health"
            ),
            HealthStatus::Healthy => info!(
                target: STATUS_TARGET,
                state = %report.state,
                subsystems = %subsystems,
                persisted = report.counters.frames_persisted,
                dropped = report.counters.dropped_frames,
                "health"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(statuses: &[(&'static str, HealthStatus)]) -> HealthReport {
        HealthReport {
            state: PipelineState::Running,
            subsystems: statuses
                .iter()
                .map(|&(name, status)| SubsystemHealth::new(name, status, "x"))
                .collect(),
            counters: StatsSnapshot::default(),
        }
    }

    #[test]
    fn test_overall_is_worst_status() {
        assert_eq!(report(&[]).overall(), HealthStatus::Healthy);
        assert_eq!(
            report(&[("camera", HealthStatus::Healthy), ("position", HealthStatus::Degraded)]).overall(),
            HealthStatus::Degraded
        );
        assert_eq!(
            report(&[("storage", HealthStatus::Error), ("position", HealthStatus::Degraded)]).overall(),
            HealthStatus::Error
        );
    }

    #[test]
    fn test_subsystem_lookup() {
        let report = report(&[("camera", HealthStatus::Healthy)]);
        assert!(report.subsystem("camera").unwrap().is_healthy());
        assert!(report.subsystem("storage").is_none());
    }

    #[test]
    fn test_report_serializes() {
        let json = serde_json::to_value(report(&[("storage", HealthStatus::Degraded)])).unwrap();
        assert_eq!(json["state"], "RUNNING");
        assert_eq!(json["subsystems"][0]["status"], "degraded");
        assert_eq!(json["counters"]["frames_persisted"], 0);
    }

    #[test]
    fn test_cycle_outcome_serializes_tagged() {
        let outcome = CycleOutcome::Dropped {
            stage: "capture",
            reason: "timeout".into(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "dropped");
        assert_eq!(json["stage"], "capture");
    }

    #[test]
    fn test_tracing_sink_does_not_panic() {
        crate::logging::init_test_logging();
        let sink = TracingStatusSink;
        sink.cycle(
            1,
            &CycleOutcome::Persisted {
                sequence: 1,
                session: "20240601_0000".into(),
                real_fix: false,
            },
        );
        sink.health(&report(&[("camera", HealthStatus::Error)]));
    }
}
