//! Run records.
//!
//! A [`Run`] is one execution of a scan configuration. It owns the step and
//! point counters and every recorded value, keyed by axis path. Points are
//! bracketed either by explicit [`Run::begin_point`]/[`Run::end_point`] calls
//! or by a [`PointScope`] guard, which closes the point when dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use super::registrar::MetadataEntry;
use crate::collation::{DaqRecord, DaqValues};
use crate::error::{AppResult, DaqError};
use crate::scan::{DaqIntent, ScanConfig};
use crate::value::{AxisPath, Value};

/// A timestamped note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedComment {
    /// When it was made.
    pub time: DateTime<Utc>,
    /// Text.
    pub comment: String,
}

/// One dispatched step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step index.
    pub step: u64,
    /// Point open at the time.
    pub point: u64,
    /// Completion time.
    pub time: DateTime<Utc>,
    /// Rendered intents.
    pub intents: Vec<String>,
}

/// The small metadata record saved next to every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run number.
    pub number: u64,
    /// Unique id.
    pub uid: Uuid,
    /// Operator.
    pub user: String,
    /// Session name.
    pub session: String,
    /// Scan method name.
    pub method: String,
    /// Host the run executed on.
    pub hostname: String,
    /// Scan configuration.
    pub config: ScanConfig,
    /// When the run started.
    pub start_time: DateTime<Utc>,
    /// When the run finished, if it has.
    pub end_time: Option<DateTime<Utc>>,
    /// Steps dispatched.
    pub n_steps: u64,
    /// Points completed.
    pub n_points: u64,
    /// Whether the scan used inverted control.
    pub is_inverted: bool,
}

/// One execution of a scan configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Run number, increasing per experiment.
    pub number: u64,
    /// Globally unique id.
    pub uid: Uuid,
    /// Operator.
    pub user: String,
    /// Session label.
    pub session: String,
    /// Scan method name, `manual` for manual runs.
    pub method: String,
    /// Configuration the run was started with.
    pub config: ScanConfig,
    /// Host the run executed on.
    pub hostname: String,
    /// Start time.
    pub start_time: DateTime<Utc>,
    /// End time, set by [`finalize`](Self::finalize).
    pub end_time: Option<DateTime<Utc>>,
    /// Steps taken so far.
    pub step: u64,
    /// Points completed so far.
    pub point: u64,
    /// Whether the orchestrator pulls steps.
    pub is_inverted: bool,
    /// Side-channel metadata collected at run end.
    pub metadata: BTreeMap<String, Vec<MetadataEntry>>,
    /// Operator and orchestrator notes.
    pub comments: Vec<TimedComment>,
    /// Every dispatched step.
    pub steps_taken: Vec<StepRecord>,
    /// Point open times.
    pub point_started: Vec<DateTime<Utc>>,
    /// Point close times.
    pub point_ended: Vec<DateTime<Utc>>,
    /// Recorded data.
    pub daq_values: DaqValues,
    /// Extra plots requested by the scan.
    pub additional_plots: Vec<String>,
    #[serde(skip)]
    point_open: bool,
}

impl Run {
    /// A fresh run, started now.
    pub fn new(
        number: u64,
        user: impl Into<String>,
        session: impl Into<String>,
        method: impl Into<String>,
        config: ScanConfig,
        is_inverted: bool,
    ) -> Self {
        Self {
            number,
            uid: Uuid::new_v4(),
            user: user.into(),
            session: session.into(),
            method: method.into(),
            config,
            hostname: local_hostname(),
            start_time: Utc::now(),
            end_time: None,
            step: 0,
            point: 0,
            is_inverted,
            metadata: BTreeMap::new(),
            comments: Vec::new(),
            steps_taken: Vec::new(),
            point_started: Vec::new(),
            point_ended: Vec::new(),
            daq_values: DaqValues::new(),
            additional_plots: Vec::new(),
            point_open: false,
        }
    }

    /// Add a timestamped comment.
    pub fn comment(&mut self, comment: impl Into<String>) {
        self.comments.push(TimedComment {
            time: Utc::now(),
            comment: comment.into(),
        });
    }

    /// Record one value at the current step and point.
    pub fn record_data(&mut self, path: &AxisPath, data: Value) {
        self.daq_values
            .entry(path.clone())
            .or_default()
            .push(DaqRecord {
                data,
                time: Utc::now(),
                step: self.step,
                point: self.point,
            });
    }

    /// Close the current step.
    pub fn record_step(&mut self, intents: &[DaqIntent]) {
        self.steps_taken.push(StepRecord {
            step: self.step,
            point: self.point,
            time: Utc::now(),
            intents: intents.iter().map(ToString::to_string).collect(),
        });
        self.step += 1;
    }

    /// Open a point. Opening twice closes the previous one first.
    pub fn begin_point(&mut self) {
        if self.point_open {
            warn!(run = self.number, point = self.point, "Point opened twice");
            self.end_point();
        }
        self.point_open = true;
        self.point_started.push(Utc::now());
    }

    /// Close the open point and advance the point counter.
    pub fn end_point(&mut self) {
        if !self.point_open {
            debug!(run = self.number, "No open point to close");
            return;
        }
        self.point_open = false;
        self.point_ended.push(Utc::now());
        self.point += 1;
    }

    /// Whether a point is open.
    pub fn in_point(&self) -> bool {
        self.point_open
    }

    /// Bracket one point; it closes when the guard drops.
    pub fn point(&mut self) -> PointScope<'_> {
        self.begin_point();
        PointScope { run: self }
    }

    /// Close any open point and stamp the end time.
    pub fn finalize(&mut self) {
        if self.point_open {
            self.end_point();
        }
        if self.end_time.is_none() {
            self.end_time = Some(Utc::now());
        }
    }

    /// Small metadata record.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            number: self.number,
            uid: self.uid,
            user: self.user.clone(),
            session: self.session.clone(),
            method: self.method.clone(),
            hostname: self.hostname.clone(),
            config: self.config.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            n_steps: self.step,
            n_points: self.point,
            is_inverted: self.is_inverted,
        }
    }

    /// Render the save directory below `base`.
    ///
    /// `template` may use `{user}`, `{session}`, `{run}`, `{method}`,
    /// `{date}` and `{time}`. An existing directory gets a time postfix.
    pub fn save_directory(&self, template: &str, base: &Path) -> AppResult<PathBuf> {
        let mut vars = HashMap::new();
        vars.insert("user".to_string(), self.user.clone());
        vars.insert("session".to_string(), self.session.clone());
        vars.insert("run".to_string(), self.number.to_string());
        vars.insert("method".to_string(), self.method.clone());
        vars.insert("date".to_string(), self.start_time.format("%Y-%m-%d").to_string());
        vars.insert("time".to_string(), self.start_time.format("%H-%M-%S").to_string());

        let relative = strfmt::strfmt(template, &vars).map_err(|e| {
            DaqError::Persistence(format!("save_format '{template}' does not render: {e}"))
        })?;
        let directory = base.join(relative);
        if directory.exists() {
            let postfix = Utc::now().format("%H%M%S%3f");
            return Ok(PathBuf::from(format!("{}-{postfix}", directory.display())));
        }
        Ok(directory)
    }
}

/// Guard holding one point open.
pub struct PointScope<'a> {
    run: &'a mut Run,
}

impl PointScope<'_> {
    /// Record a value inside this point.
    pub fn record(&mut self, path: &AxisPath, data: Value) {
        self.run.record_data(path, data);
    }

    /// The run.
    pub fn run(&mut self) -> &mut Run {
        self.run
    }
}

impl Drop for PointScope<'_> {
    fn drop(&mut self) {
        self.run.end_point();
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run() -> Run {
        Run::new(3, "alice", "beamtime", "line", ScanConfig::default(), true)
    }

    #[test]
    fn data_is_tagged_with_step_and_point() {
        let mut run = run();
        let x = AxisPath::parse("mc.stages[0]");

        run.begin_point();
        run.record_data(&x, Value::Float(1.0));
        run.record_step(&[DaqIntent::write("mc.stages[0]", 1.0)]);
        run.record_data(&x, Value::Float(2.0));
        run.end_point();

        let records = &run.daq_values[&x];
        assert_eq!((records[0].step, records[0].point), (0, 0));
        assert_eq!((records[1].step, records[1].point), (1, 0));
        assert_eq!(run.point, 1);
        assert_eq!(run.steps_taken[0].intents, vec!["write mc.stages[0] = 1"]);
    }

    #[test]
    fn point_scope_closes_on_early_exit() {
        fn fails_inside(run: &mut Run) -> AppResult<()> {
            let mut point = run.point();
            point.record(&AxisPath::parse("pm.device"), Value::Float(0.5));
            Err(DaqError::Interlock("beam dump".into()))
        }

        let mut run = run();
        assert!(fails_inside(&mut run).is_err());
        assert!(!run.in_point());
        assert_eq!(run.point, 1);
        assert_eq!(run.point_started.len(), run.point_ended.len());
    }

    #[test]
    fn finalize_closes_open_point() {
        let mut run = run();
        run.begin_point();
        run.finalize();
        assert_eq!(run.point, 1);
        assert!(run.end_time.is_some());
        assert_eq!(run.summary().n_points, 1);
    }

    #[test]
    fn save_directory_renders_and_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let run = run();

        let first = run.save_directory("{user}/{session}/{run}", dir.path()).unwrap();
        assert_eq!(first, dir.path().join("alice/beamtime/3"));

        std::fs::create_dir_all(&first).unwrap();
        let second = run.save_directory("{user}/{session}/{run}", dir.path()).unwrap();
        assert_ne!(first, second);
        assert!(second.display().to_string().starts_with(&first.display().to_string()));

        assert!(run.save_directory("{nope}", dir.path()).is_err());
    }
}
