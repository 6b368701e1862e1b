//! Axis I/O.
//!
//! Every controllable or readable quantity implements [`Axis`]: `read`,
//! `write` and `settle`. Strategies:
//!
//! - [`ManualAxis`]: user-supplied async read/write functions
//! - [`SimulatedAxis`]: mock functions, read-only without a mock write
//! - [`ProxiedAxis`]: driver write plus poll predicate with exponential backoff
//! - [`LogicalAxis`]: coordinate transform over several physical axes
//!
//! Scalar numeric axes publish every read and effective write on their
//! [`ValueStream`].

pub mod logical;
pub mod manual;
pub mod proxied;
pub mod stream;

pub use logical::{LogicalAxis, LogicalAxisBuilder, LogicalAxisState, LogicalSubAxis};
pub use manual::{ManualAxis, SimulatedAxis};
pub use proxied::{AxisDriver, Backoff, ProxiedAxis};
pub use stream::{Observation, ValueStream};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppResult;
use crate::value::Value;

/// Runtime motion state of an axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AxisStatus {
    /// No write in flight.
    Idle,
    /// A write has been issued and has not completed.
    Moving,
}

impl std::fmt::Display for AxisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AxisStatus::Idle => write!(f, "idle"),
            AxisStatus::Moving => write!(f, "moving"),
        }
    }
}

/// Uniform read/write/settle contract.
#[async_trait]
pub trait Axis: Send + Sync {
    /// Axis name.
    fn name(&self) -> &str;

    /// Read the current value.
    async fn read(&self) -> AppResult<Value>;

    /// Write a setpoint, returning once it has taken effect.
    async fn write(&self, value: Value) -> AppResult<()>;

    /// Wait for any in-flight motion to finish.
    async fn settle(&self) -> AppResult<()> {
        Ok(())
    }

    /// Motion state.
    fn status(&self) -> AxisStatus {
        AxisStatus::Idle
    }

    /// Observation history.
    fn values(&self) -> &ValueStream;

    /// Persistent state beyond the hardware position, if any.
    fn snapshot(&self) -> AppResult<Option<serde_json::Value>> {
        Ok(None)
    }

    /// Restore a snapshot.
    fn restore(&self, _state: serde_json::Value) -> AppResult<()> {
        Ok(())
    }
}
