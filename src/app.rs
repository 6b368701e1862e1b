//! Application runtime.
//!
//! [`DaqApp`] owns the settings, the instrument registry and every actor.
//! `run` restores saved state, prepares the actors and runs them
//! concurrently. The first fatal actor error aborts the rest. Whatever state
//! the finished actors hold is then saved for the next launch.
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::actor::Actor;
use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::instrument::InstrumentRegistry;
use crate::session::{self, AppStateAtRest};

/// The assembled application.
pub struct DaqApp {
    settings: Settings,
    instruments: Arc<InstrumentRegistry>,
    actors: Vec<Box<dyn Actor>>,
}

impl DaqApp {
    /// App with no actors.
    pub fn new(settings: Settings, instruments: Arc<InstrumentRegistry>) -> Self {
        Self {
            settings,
            instruments,
            actors: Vec::new(),
        }
    }

    /// Add an actor.
    pub fn with_actor(mut self, actor: impl Actor + 'static) -> Self {
        self.actors.push(Box::new(actor));
        self
    }

    /// Shared instrument registry.
    pub fn instruments(&self) -> &Arc<InstrumentRegistry> {
        &self.instruments
    }

    /// Settings in use.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Restore state, prepare every actor and run them until all stop.
    ///
    /// Returns the first fatal actor error, after the others were aborted
    /// and state was saved.
    pub async fn run(mut self) -> AppResult<()> {
        let state_directory = self.settings.experiment.state_directory.clone();
        if let Some(state) = session::load_latest(&state_directory) {
            state.apply(&mut self.actors, &self.instruments);
        }

        for actor in &mut self.actors {
            actor.prepare().await?;
            debug!(actor = actor.name(), "Prepared");
        }

        let mut tasks = JoinSet::new();
        for mut actor in self.actors.drain(..) {
            info!(actor = actor.name(), "Starting actor");
            tasks.spawn(async move {
                let result = actor.run().await;
                (actor, result)
            });
        }

        let mut finished: Vec<Box<dyn Actor>> = Vec::new();
        let mut failure: Option<DaqError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((mut actor, Ok(()))) => {
                    info!(actor = actor.name(), "Actor finished");
                    if let Err(e) = actor.shutdown().await {
                        warn!(actor = actor.name(), error = %e, "Actor shutdown failed");
                    }
                    finished.push(actor);
                }
                Ok((actor, Err(e))) => {
                    error!(actor = actor.name(), error = %e, "Actor failed, aborting the rest");
                    finished.push(actor);
                    if failure.is_none() {
                        failure = Some(e);
                        tasks.abort_all();
                    }
                }
                Err(e) if e.is_cancelled() => debug!("Actor task aborted"),
                Err(e) => {
                    error!(error = %e, "Actor task panicked, aborting the rest");
                    if failure.is_none() {
                        failure = Some(DaqError::Other(anyhow::anyhow!("actor task panicked: {e}")));
                        tasks.abort_all();
                    }
                }
            }
        }

        let state = AppStateAtRest::collect(&finished, &self.instruments);
        if let Err(e) = session::save_state(&state, &state_directory) {
            warn!(error = %e, "Could not save application state");
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
