//! Application state at rest.
//!
//! Between launches the app keeps the run-independent state of every actor
//! (selected scan, stored configurations, queue, run number) and of every
//! axis that can snapshot itself, such as logical axes.
//!
//! States are written as `app-state-<timestamp>.json` under the configured
//! state directory. On start the newest file is loaded; a missing or
//! unreadable file only produces a log line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::actor::Actor;
use crate::error::AppResult;
use crate::instrument::InstrumentRegistry;

const STATE_PREFIX: &str = "app-state-";
const STATE_SUFFIX: &str = ".json";

/// Snapshot of actor and axis state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppStateAtRest {
    /// Actor name to collected state.
    pub actors: BTreeMap<String, serde_json::Value>,
    /// Axis path to snapshot.
    pub axes: BTreeMap<String, serde_json::Value>,
    /// When the snapshot was taken.
    pub saved_at: DateTime<Utc>,
}

impl AppStateAtRest {
    /// Collect from live actors and instruments.
    pub fn collect(actors: &[Box<dyn Actor>], instruments: &InstrumentRegistry) -> Self {
        let actors = actors
            .iter()
            .filter_map(|actor| {
                actor
                    .collect_state()
                    .map(|state| (actor.name().to_string(), state))
            })
            .collect();
        Self {
            actors,
            axes: instruments.collect_axis_state(),
            saved_at: Utc::now(),
        }
    }

    /// Hand each actor and axis its saved state. Failures are logged.
    pub fn apply(mut self, actors: &mut [Box<dyn Actor>], instruments: &InstrumentRegistry) {
        for actor in actors.iter_mut() {
            let Some(state) = self.actors.remove(actor.name()) else {
                continue;
            };
            match actor.receive_state(state) {
                Ok(()) => debug!(actor = actor.name(), "Restored actor state"),
                Err(e) => warn!(actor = actor.name(), error = %e, "Could not restore actor state"),
            }
        }
        for name in self.actors.keys() {
            debug!(actor = %name, "No actor for saved state");
        }
        instruments.restore_axis_state(self.axes);
    }
}

/// Write `state` into `directory`, returning the file path.
pub fn save_state(state: &AppStateAtRest, directory: &Path) -> AppResult<PathBuf> {
    fs::create_dir_all(directory)?;
    let path = directory.join(format!(
        "{STATE_PREFIX}{}{STATE_SUFFIX}",
        state.saved_at.format("%Y%m%dT%H%M%S%3f")
    ));
    let json = serde_json::to_string_pretty(state)?;
    fs::write(&path, json)?;
    info!(path = %path.display(), "Saved application state");
    Ok(path)
}

/// Read a state file.
pub fn load_state(path: &Path) -> AppResult<AppStateAtRest> {
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

/// Newest state file in `directory`.
pub fn latest_state_file(directory: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(directory).ok()?;
    entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(STATE_PREFIX) && name.ends_with(STATE_SUFFIX))
        })
        // Timestamps sort lexically
        .max()
}

/// Newest readable state, if any.
pub fn load_latest(directory: &Path) -> Option<AppStateAtRest> {
    let Some(path) = latest_state_file(directory) else {
        debug!(directory = %directory.display(), "No saved application state");
        return None;
    };
    match load_state(&path) {
        Ok(state) => {
            info!(path = %path.display(), "Loaded application state");
            Some(state)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable application state");
            None
        }
    }
}
