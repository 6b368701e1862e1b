//! Experiment states, messages and broadcast events.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::scan::ScanConfig;
use crate::value::{AxisPath, Value};

/// Experiment lifecycle state.
///
/// # State Machine
///
/// ```text
/// Startup ──Initialize──> Idle ──Start/StartManual──> Running ──Pause──> Paused
///                          ▲                            │  ▲               │
///                          └────────────Stop────────────┘  └────Start──────┤
///                          ▲                                               │
///                          └────────────────────Stop───────────────────────┘
///
/// any non-terminal state ──Shutdown──> Shutdown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExperimentState {
    /// Constructed, waiting for Initialize
    Startup,
    /// No run active
    Idle,
    /// A run is executing
    Running,
    /// The active run is suspended
    Paused,
    /// Terminal
    Shutdown,
}

impl std::fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExperimentState::Startup => write!(f, "Startup"),
            ExperimentState::Idle => write!(f, "Idle"),
            ExperimentState::Running => write!(f, "Running"),
            ExperimentState::Paused => write!(f, "Paused"),
            ExperimentState::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl ExperimentState {
    /// Whether a run may be active.
    pub fn has_run(&self) -> bool {
        matches!(self, ExperimentState::Running | ExperimentState::Paused)
    }
}

/// Transition triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transition {
    /// Startup to Idle, posted by the experiment itself.
    Initialize,
    /// Begin or resume a scan.
    Start,
    /// Begin a run driven by remote axis commands.
    StartManual,
    /// Suspend the active run.
    Pause,
    /// End the active run.
    Stop,
    /// Terminate.
    Shutdown,
}

/// Everything the experiment's mailbox accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum ExperimentMessage {
    /// A transition trigger.
    Transition(Transition),
    /// Persist, drain background saves and stop.
    RequestShutdown,
    /// Remote alias of `Start`.
    StartRun,
    /// Remote alias of `Pause`.
    PauseRun,
    /// Remote alias of `Stop`.
    StopRun,
    /// Replace the stored configuration for a scan method.
    SetScanConfig {
        /// Scan method name.
        method: String,
        /// New configuration.
        config: ScanConfig,
    },
    /// Choose the scan method used when the queue is empty.
    SelectMethod(String),
    /// Queue a configuration from history, or the current one.
    Enqueue {
        /// History index; `None` queues the selected method's configuration.
        index: Option<usize>,
    },
    /// Read an axis.
    ReadAxis {
        /// Axis to read.
        path: AxisPath,
    },
    /// Write an axis.
    WriteAxis {
        /// Axis to write.
        path: AxisPath,
        /// Setpoint.
        value: Value,
    },
}

impl From<Transition> for ExperimentMessage {
    fn from(transition: Transition) -> Self {
        ExperimentMessage::Transition(transition)
    }
}

/// Broadcast to subscribers of [`Experiment::subscribe`](super::Experiment::subscribe).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExperimentEvent {
    /// A transition completed.
    StateChanged {
        from: ExperimentState,
        to: ExperimentState,
    },
    /// A run was built and is about to take its first step.
    RunStarted {
        run: u64,
        method: String,
        n_points: Option<usize>,
    },
    /// A value was recorded.
    Data {
        run: u64,
        path: AxisPath,
        value: Value,
        step: u64,
        point: u64,
    },
    /// Stream names the active run collates.
    Collation {
        independent: Vec<String>,
        dependent: Vec<String>,
    },
    /// A remote axis command completed outside a run.
    AxisValue { path: AxisPath, value: Value },
    /// A run was persisted.
    RunSaved { run: u64, directory: PathBuf },
    /// Persisting a run failed.
    SaveFailed { run: u64, error: String },
    /// A comment was added to the active run.
    Comment { run: u64, comment: String },
}

/// Queued scan: method name and configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedScan {
    /// Scan method name.
    pub method: String,
    /// Configuration to run with.
    pub config: ScanConfig,
}
