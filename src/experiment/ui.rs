//! Notifications for an attached user interface.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Progress of the active run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Run number.
    pub run: u64,
    /// Points completed.
    pub point: u64,
    /// Total points, if known.
    pub total: Option<usize>,
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.total {
            Some(total) => write!(f, "run {}: {}/{}", self.run, self.point, total),
            None => write!(f, "run {}: {}/?", self.run, self.point),
        }
    }
}

/// UI callbacks. Every method defaults to a no-op.
pub trait ExperimentUi: Send + Sync {
    /// Experiment became idle.
    fn enter_idle(&self) {}

    /// A run started or resumed.
    fn enter_running(&self) {}

    /// The run paused.
    fn enter_paused(&self) {}

    /// A run finished.
    fn running_to_idle(&self) {}

    /// A point completed.
    fn soft_update(&self, _progress: Progress) {}

    /// Periodic refresh while idle or paused.
    fn update_timing_ui(&self, _progress: Option<Progress>) {}
}

/// UI stand-in when running without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessUi;

impl ExperimentUi for HeadlessUi {}

/// UI that reports progress through the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogUi;

impl ExperimentUi for LogUi {
    fn enter_running(&self) {
        info!("Run in progress");
    }

    fn enter_paused(&self) {
        info!("Run paused");
    }

    fn running_to_idle(&self) {
        info!("Run finished");
    }

    fn soft_update(&self, progress: Progress) {
        debug!(%progress, "Point complete");
    }
}
