//! Side-channel metadata.
//!
//! Instruments and user code record metadata (calibration constants, driver
//! responses, operator notes) into a [`MetadataRegistrar`] handed to them
//! explicitly. The experiment drains it into the run record when a run ends.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::AppResult;

/// One recorded item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    /// Key within the source.
    pub key: String,
    /// Recorded value.
    pub value: serde_json::Value,
    /// When it was recorded.
    pub time: DateTime<Utc>,
}

/// Shared buffers of metadata keyed by source name.
#[derive(Debug, Clone, Default)]
pub struct MetadataRegistrar {
    buffers: Arc<Mutex<BTreeMap<String, Vec<MetadataEntry>>>>,
}

impl MetadataRegistrar {
    /// Empty registrar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `source` known even before it records anything.
    pub fn register(&self, source: impl Into<String>) {
        self.buffers.lock().entry(source.into()).or_default();
    }

    /// Append an entry for `source`.
    pub fn record(
        &self,
        source: impl Into<String>,
        key: impl Into<String>,
        value: impl Serialize,
    ) -> AppResult<()> {
        let entry = MetadataEntry {
            key: key.into(),
            value: serde_json::to_value(value)?,
            time: Utc::now(),
        };
        self.buffers
            .lock()
            .entry(source.into())
            .or_default()
            .push(entry);
        Ok(())
    }

    /// Known sources.
    pub fn sources(&self) -> Vec<String> {
        self.buffers.lock().keys().cloned().collect()
    }

    /// Take every buffered entry, leaving registered sources empty.
    pub fn collect(&self) -> BTreeMap<String, Vec<MetadataEntry>> {
        let mut buffers = self.buffers.lock();
        buffers
            .iter_mut()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(source, entries)| (source.clone(), std::mem::take(entries)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_drains_and_keeps_sources() {
        let registrar = MetadataRegistrar::new();
        registrar.register("pm");
        let handle = registrar.clone();
        handle.record("mc", "calibration", [1.0, 2.0]).unwrap();
        handle.record("mc", "firmware", "v2").unwrap();

        let collected = registrar.collect();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected["mc"].len(), 2);
        assert_eq!(collected["mc"][1].value, serde_json::json!("v2"));

        assert!(registrar.collect().is_empty());
        assert_eq!(registrar.sources(), vec!["mc", "pm"]);
    }
}
