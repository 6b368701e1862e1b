//! Scan composition.
//!
//! A [`DegreeOfFreedom`] is one or more axes scanned together. It declares
//! its configuration fields, iterates its coordinates for a given
//! [`ScanConfig`], and turns one coordinate into [`DaqIntent`]s the
//! orchestrator dispatches.
//!
//! # Variants
//!
//! - [`ScanAxis`]: one axis over a linear range or explicit values
//! - [`ScanProperty`] / [`ScanChoiceProperty`]: enumerable settings
//! - [`StaircaseProduct`]: outer x inner with serpentine inner order
//! - [`ScanTogether`]: positional zip of equally long sequences
//! - [`SimpleStrategyScan`]: reordering applied after another DOF
//!
//! Independent axes are combined by plain Cartesian product in [`Scan`].
//!
//! # Restartability
//!
//! `iterate` builds a fresh iterator on every call, so one configuration can
//! drive any number of runs.

pub mod axis;
pub mod compose;
pub mod method;
pub mod strategy;

pub use axis::{ScanAxis, ScanChoiceProperty, ScanProperty};
pub use compose::{ScanTogether, StaircaseProduct};
pub use method::{
    scan, DirectScan, DirectSequence, InvertedSequence, Scan, ScanMethod, Sequence,
    SequenceContext, SequenceEvent,
};
pub use strategy::{SimpleStrategyScan, StepExt, Strategy};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{AppResult, DaqError};
use crate::value::{AxisPath, Value};

/// One coordinate produced by a degree of freedom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Coordinate {
    /// Single axis value.
    Value(Value),
    /// Composite coordinate, one entry per component.
    Tuple(Vec<Coordinate>),
}

impl Coordinate {
    /// Components of a tuple coordinate.
    pub fn components(&self, expected: usize) -> AppResult<&[Coordinate]> {
        match self {
            Coordinate::Tuple(parts) if parts.len() == expected => Ok(parts),
            other => Err(DaqError::ScanMisconfigured(format!(
                "expected a {expected}-tuple coordinate, got {other}"
            ))),
        }
    }

    /// Scalar value of a leaf coordinate.
    pub fn value(&self) -> AppResult<&Value> {
        match self {
            Coordinate::Value(v) => Ok(v),
            other => Err(DaqError::ScanMisconfigured(format!(
                "expected a scalar coordinate, got {other}"
            ))),
        }
    }
}

impl From<Value> for Coordinate {
    fn from(v: Value) -> Self {
        Coordinate::Value(v)
    }
}

impl From<f64> for Coordinate {
    fn from(v: f64) -> Self {
        Coordinate::Value(Value::Float(v))
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Coordinate::Value(v) => write!(f, "{v}"),
            Coordinate::Tuple(parts) => {
                write!(f, "(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{part}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Operation on one axis or property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DaqOp {
    /// Read the axis and record the result.
    Read,
    /// Move the axis and record the setpoint.
    Write(Value),
    /// Set a property and record the value.
    Set(Value),
}

/// An operation tagged with the path that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaqIntent {
    /// Fully-qualified axis or property path.
    pub path: AxisPath,
    /// What to do.
    pub op: DaqOp,
}

impl DaqIntent {
    /// Read intent.
    pub fn read(path: impl Into<AxisPath>) -> Self {
        Self {
            path: path.into(),
            op: DaqOp::Read,
        }
    }

    /// Write intent.
    pub fn write(path: impl Into<AxisPath>, value: impl Into<Value>) -> Self {
        Self {
            path: path.into(),
            op: DaqOp::Write(value.into()),
        }
    }

    /// Property set intent.
    pub fn set(path: impl Into<AxisPath>, value: impl Into<Value>) -> Self {
        Self {
            path: path.into(),
            op: DaqOp::Set(value.into()),
        }
    }
}

impl fmt::Display for DaqIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            DaqOp::Read => write!(f, "read {}", self.path),
            DaqOp::Write(v) => write!(f, "write {} = {v}", self.path),
            DaqOp::Set(v) => write!(f, "set {} = {v}", self.path),
        }
    }
}

/// A configuration field value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Counts and indices.
    Int(i64),
    /// Range endpoints.
    Float(f64),
}

impl FieldValue {
    /// As a float.
    pub fn as_f64(self) -> f64 {
        match self {
            FieldValue::Int(v) => v as f64,
            FieldValue::Float(v) => v,
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(i64::from(v))
    }
}

impl From<usize> for FieldValue {
    fn from(v: usize) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

/// A user-facing configuration knob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name, e.g. `n_x`.
    pub name: String,
    /// Default value.
    pub default: FieldValue,
}

impl FieldSpec {
    /// New field.
    pub fn new(name: impl Into<String>, default: impl Into<FieldValue>) -> Self {
        Self {
            name: name.into(),
            default: default.into(),
        }
    }
}

/// Configuration record for one scan method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanConfig {
    fields: BTreeMap<String, FieldValue>,
}

impl ScanConfig {
    /// Config holding every field's default.
    pub fn from_fields(fields: &[FieldSpec]) -> Self {
        Self {
            fields: fields
                .iter()
                .map(|f| (f.name.clone(), f.default))
                .collect(),
        }
    }

    /// Set a field.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Builder-style [`set`](Self::set).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Raw field value.
    pub fn get(&self, name: &str) -> AppResult<FieldValue> {
        self.fields
            .get(name)
            .copied()
            .ok_or_else(|| DaqError::ScanMisconfigured(format!("missing field '{name}'")))
    }

    /// Field as a float.
    pub fn get_f64(&self, name: &str) -> AppResult<f64> {
        Ok(self.get(name)?.as_f64())
    }

    /// Field as a non-negative integer.
    pub fn get_usize(&self, name: &str) -> AppResult<usize> {
        let value = self.get(name)?.as_f64();
        if value < 0.0 || value.fract() != 0.0 {
            return Err(DaqError::ScanMisconfigured(format!(
                "field '{name}' must be a non-negative integer, got {value}"
            )));
        }
        Ok(value as usize)
    }

    /// Field names and values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Boxed coordinate iterator.
pub type Coordinates = Box<dyn Iterator<Item = Coordinate> + Send>;

/// An algebraic unit of scan composition.
pub trait DegreeOfFreedom: Send + Sync {
    /// Configuration fields for this DOF when mounted under `name`.
    fn fields(&self, name: &str) -> Vec<FieldSpec>;

    /// Fresh coordinate sequence for `config`.
    fn iterate(&self, config: &ScanConfig, name: &str) -> AppResult<Coordinates>;

    /// Intents that move to `coordinate`.
    fn write(&self, coordinate: &Coordinate) -> AppResult<Vec<DaqIntent>>;

    /// Collated independent axes and their output names.
    fn independent(&self, name: &str) -> Vec<(AxisPath, String)>;
}

impl<D: DegreeOfFreedom + ?Sized> DegreeOfFreedom for Box<D> {
    fn fields(&self, name: &str) -> Vec<FieldSpec> {
        (**self).fields(name)
    }

    fn iterate(&self, config: &ScanConfig, name: &str) -> AppResult<Coordinates> {
        (**self).iterate(config, name)
    }

    fn write(&self, coordinate: &Coordinate) -> AppResult<Vec<DaqIntent>> {
        (**self).write(coordinate)
    }

    fn independent(&self, name: &str) -> Vec<(AxisPath, String)> {
        (**self).independent(name)
    }
}

/// `n` evenly spaced points from `start` to `stop` inclusive.
pub fn linspace(start: f64, stop: f64, n: usize) -> impl Iterator<Item = f64> + Send {
    let step = if n > 1 {
        (stop - start) / (n - 1) as f64
    } else {
        0.0
    };
    (0..n).map(move |i| {
        if n > 1 && i == n - 1 {
            stop
        } else {
            start + step * i as f64
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linspace_includes_endpoint() {
        assert_eq!(linspace(0.0, 3.0, 4).collect::<Vec<_>>(), vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(linspace(5.0, 9.0, 1).collect::<Vec<_>>(), vec![5.0]);
        assert_eq!(linspace(0.0, 1.0, 0).count(), 0);
    }

    #[test]
    fn config_accessors() {
        let config = ScanConfig::from_fields(&[
            FieldSpec::new("n_x", 3),
            FieldSpec::new("start_x", 0.5),
        ])
        .with("stop_x", 2.0);

        assert_eq!(config.get_usize("n_x").unwrap(), 3);
        assert_eq!(config.get_f64("start_x").unwrap(), 0.5);
        assert_eq!(config.get_f64("stop_x").unwrap(), 2.0);
        assert!(config.get("n_y").is_err());
        assert!(config.clone().with("n_x", -1).get_usize("n_x").is_err());
    }

    #[test]
    fn config_serializes_flat() {
        let config = ScanConfig::default().with("n_x", 3).with("start_x", 1.5);
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json, serde_json::json!({"n_x": 3, "start_x": 1.5}));
    }
}
