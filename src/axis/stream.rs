//! Per-axis value history for live plotting.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;

use crate::value::Value;

/// Default number of observations kept per axis.
pub const DEFAULT_HISTORY: usize = 10_000;

/// A timestamped scalar reading or setpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Numeric value.
    pub value: f64,
    /// When it was observed.
    pub time: DateTime<Utc>,
}

/// Bounded history of observations plus a live broadcast.
///
/// Only scalar numeric values are recorded; vectors, arrays and text pass
/// through untouched.
#[derive(Debug)]
pub struct ValueStream {
    history: Mutex<VecDeque<Observation>>,
    capacity: usize,
    tx: broadcast::Sender<Observation>,
}

impl ValueStream {
    /// Stream keeping at most `capacity` observations.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            history: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            tx,
        }
    }

    /// Record `value` if it is a scalar number.
    pub fn record(&self, value: &Value) {
        if !value.is_scalar_numeric() {
            return;
        }
        let Some(v) = value.as_f64() else { return };
        let observation = Observation {
            value: v,
            time: Utc::now(),
        };
        {
            let mut history = self.history.lock();
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(observation.clone());
        }
        // No live subscribers is fine.
        let _ = self.tx.send(observation);
    }

    /// Snapshot of the history, oldest first.
    pub fn history(&self) -> Vec<Observation> {
        self.history.lock().iter().cloned().collect()
    }

    /// Latest observation.
    pub fn last(&self) -> Option<Observation> {
        self.history.lock().back().cloned()
    }

    /// Number of recorded observations.
    pub fn len(&self) -> usize {
        self.history.lock().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all history.
    pub fn reset(&self) {
        self.history.lock().clear();
    }

    /// Receive observations as they are recorded.
    pub fn subscribe(&self) -> broadcast::Receiver<Observation> {
        self.tx.subscribe()
    }
}

impl Default for ValueStream {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}
