//! Run persistence.
//!
//! A [`RunSaver`] gets the finished run, its collated dataset and a target
//! directory. Savers are synchronous so the experiment can move them onto a
//! blocking worker.

use serde::Serialize;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;
use tracing::debug;

use super::run::Run;
use crate::collation::Dataset;
use crate::error::AppResult;

/// Durable storage for finished runs.
pub trait RunSaver: Send + Sync {
    /// Format name.
    fn name(&self) -> &str;

    /// Write one run into `directory`, creating it if needed.
    fn save(&self, run: &Run, dataset: Option<&Dataset>, directory: &Path) -> AppResult<()>;
}

/// JSON files per run.
///
/// ```text
/// <directory>/
///   metadata-small.json   run summary
///   metadata.json         comments, metadata, steps and point bracketing
///   raw_daq.json          every recorded value by axis path
///   collated.json         dense dataset, when a collation was declared
/// ```
#[derive(Debug, Clone, Copy)]
pub struct JsonSaver {
    pretty: bool,
}

impl JsonSaver {
    /// Pretty-printed output.
    pub fn new() -> Self {
        Self { pretty: true }
    }

    /// Compact output.
    pub fn compact() -> Self {
        Self { pretty: false }
    }

    fn write(&self, path: &Path, value: &impl Serialize) -> AppResult<()> {
        let writer = BufWriter::new(File::create(path)?);
        if self.pretty {
            serde_json::to_writer_pretty(writer, value)?;
        } else {
            serde_json::to_writer(writer, value)?;
        }
        debug!(path = %path.display(), "Wrote run file");
        Ok(())
    }
}

impl Default for JsonSaver {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSaver for JsonSaver {
    fn name(&self) -> &str {
        "json"
    }

    fn save(&self, run: &Run, dataset: Option<&Dataset>, directory: &Path) -> AppResult<()> {
        fs::create_dir_all(directory)?;

        self.write(&directory.join("metadata-small.json"), &run.summary())?;
        self.write(
            &directory.join("metadata.json"),
            &serde_json::json!({
                "summary": run.summary(),
                "metadata": run.metadata,
                "comments": run.comments,
                "steps_taken": run.steps_taken,
                "point_started": run.point_started,
                "point_ended": run.point_ended,
                "additional_plots": run.additional_plots,
            }),
        )?;
        self.write(&directory.join("raw_daq.json"), &run.daq_values)?;
        if let Some(dataset) = dataset {
            self.write(&directory.join("collated.json"), dataset)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collation::Collation;
    use crate::scan::ScanConfig;
    use crate::value::{AxisPath, Value};

    #[test]
    fn json_saver_writes_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let x = AxisPath::parse("mc.x");
        let y = AxisPath::parse("pm.device");

        let mut run = Run::new(1, "alice", "s", "line", ScanConfig::default(), true);
        let mut collation = Collation::new(vec![(x.clone(), "x".into())], vec![(y.clone(), "y".into())]);
        for i in 0..3 {
            let mut point = run.point();
            point.record(&x, Value::Float(i as f64));
            point.record(&y, Value::Float((i * i) as f64));
            collation.receive(&x, &Value::Float(i as f64));
        }
        run.comment("done");
        run.finalize();
        let dataset = collation.to_dataset(&run.daq_values).unwrap();

        let target = dir.path().join("alice/s/1");
        JsonSaver::new().save(&run, dataset.as_ref(), &target).unwrap();

        for file in ["metadata-small.json", "metadata.json", "raw_daq.json", "collated.json"] {
            assert!(target.join(file).exists(), "missing {file}");
        }

        let raw: serde_json::Value =
            serde_json::from_reader(File::open(target.join("raw_daq.json")).unwrap()).unwrap();
        assert_eq!(raw["pm.device"].as_array().unwrap().len(), 3);

        let collated: Dataset =
            serde_json::from_reader(File::open(target.join("collated.json")).unwrap()).unwrap();
        assert_eq!(collated.data_vars["y"].data, vec![0.0, 1.0, 4.0]);
    }
}
