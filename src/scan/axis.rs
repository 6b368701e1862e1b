//! Leaf degrees of freedom.

use crate::error::{AppResult, DaqError};
use crate::instrument::Choice;
use crate::value::{AxisPath, Value};

use super::{linspace, Coordinate, Coordinates, DaqIntent, DegreeOfFreedom, FieldSpec, ScanConfig};

const DEFAULT_N: i64 = 10;

/// One axis scanned over a linear range.
///
/// Fields under name `x`: `n_x`, `start_x`, `stop_x`.
#[derive(Debug, Clone)]
pub struct ScanAxis {
    path: AxisPath,
    limits: Option<(f64, f64)>,
}

impl ScanAxis {
    /// Range scan of the axis at `path`.
    pub fn new(path: impl Into<AxisPath>) -> Self {
        Self {
            path: path.into(),
            limits: None,
        }
    }

    /// Default range and clamp for configured endpoints.
    pub fn with_limits(mut self, low: f64, high: f64) -> Self {
        self.limits = Some((low.min(high), low.max(high)));
        self
    }

    /// Axis path.
    pub fn path(&self) -> &AxisPath {
        &self.path
    }
}

impl DegreeOfFreedom for ScanAxis {
    fn fields(&self, name: &str) -> Vec<FieldSpec> {
        let (start, stop) = self.limits.unwrap_or((0.0, 1.0));
        vec![
            FieldSpec::new(format!("n_{name}"), DEFAULT_N),
            FieldSpec::new(format!("start_{name}"), start),
            FieldSpec::new(format!("stop_{name}"), stop),
        ]
    }

    fn iterate(&self, config: &ScanConfig, name: &str) -> AppResult<Coordinates> {
        let n = config.get_usize(&format!("n_{name}"))?;
        let mut start = config.get_f64(&format!("start_{name}"))?;
        let mut stop = config.get_f64(&format!("stop_{name}"))?;
        if let Some((low, high)) = self.limits {
            start = start.clamp(low, high);
            stop = stop.clamp(low, high);
        }
        Ok(Box::new(
            linspace(start, stop, n).map(|v| Coordinate::Value(Value::Float(v))),
        ))
    }

    fn write(&self, coordinate: &Coordinate) -> AppResult<Vec<DaqIntent>> {
        Ok(vec![DaqIntent::write(self.path.clone(), coordinate.value()?.clone())])
    }

    fn independent(&self, name: &str) -> Vec<(AxisPath, String)> {
        vec![(self.path.clone(), name.to_string())]
    }
}

/// Inclusive `[start, stop]` index window over `len` items.
fn index_window(config: &ScanConfig, name: &str, len: usize) -> AppResult<std::ops::RangeInclusive<usize>> {
    let start = config.get_usize(&format!("start_{name}"))?;
    let stop = config.get_usize(&format!("stop_{name}"))?;
    if len == 0 || start > stop || stop >= len {
        return Err(DaqError::ScanMisconfigured(format!(
            "index window {start}..={stop} is outside 0..{len} for '{name}'"
        )));
    }
    Ok(start..=stop)
}

fn index_fields(name: &str, len: usize) -> Vec<FieldSpec> {
    vec![
        FieldSpec::new(format!("start_{name}"), 0),
        FieldSpec::new(format!("stop_{name}"), len.saturating_sub(1)),
    ]
}

/// A property stepped through explicit values.
///
/// Fields under name `x`: `start_x`, `stop_x`, inclusive indices into the
/// value list. Coordinates are the values themselves.
#[derive(Debug, Clone)]
pub struct ScanProperty {
    path: AxisPath,
    values: Vec<Value>,
}

impl ScanProperty {
    /// Property at `path` stepped through `values`.
    pub fn new(path: impl Into<AxisPath>, values: Vec<Value>) -> Self {
        Self {
            path: path.into(),
            values,
        }
    }
}

impl DegreeOfFreedom for ScanProperty {
    fn fields(&self, name: &str) -> Vec<FieldSpec> {
        index_fields(name, self.values.len())
    }

    fn iterate(&self, config: &ScanConfig, name: &str) -> AppResult<Coordinates> {
        let window = index_window(config, name, self.values.len())?;
        let values: Vec<Coordinate> = self.values[window]
            .iter()
            .cloned()
            .map(Coordinate::Value)
            .collect();
        Ok(Box::new(values.into_iter()))
    }

    fn write(&self, coordinate: &Coordinate) -> AppResult<Vec<DaqIntent>> {
        Ok(vec![DaqIntent::set(self.path.clone(), coordinate.value()?.clone())])
    }

    fn independent(&self, name: &str) -> Vec<(AxisPath, String)> {
        vec![(self.path.clone(), name.to_string())]
    }
}

/// A keyed choice property.
///
/// Coordinates are choice indices; `write` maps the index to the hardware
/// value, which is what the run records and collates.
#[derive(Debug, Clone)]
pub struct ScanChoiceProperty {
    path: AxisPath,
    choices: Vec<Choice>,
}

impl ScanChoiceProperty {
    /// Choice property at `path`.
    pub fn new(path: impl Into<AxisPath>, choices: Vec<Choice>) -> Self {
        Self {
            path: path.into(),
            choices,
        }
    }

    /// Choice key for an index coordinate.
    pub fn key(&self, index: usize) -> Option<&str> {
        self.choices.get(index).map(|c| c.key.as_str())
    }
}

impl DegreeOfFreedom for ScanChoiceProperty {
    fn fields(&self, name: &str) -> Vec<FieldSpec> {
        index_fields(name, self.choices.len())
    }

    fn iterate(&self, config: &ScanConfig, name: &str) -> AppResult<Coordinates> {
        let window = index_window(config, name, self.choices.len())?;
        Ok(Box::new(
            window.map(|i| Coordinate::Value(Value::Int(i as i64))),
        ))
    }

    fn write(&self, coordinate: &Coordinate) -> AppResult<Vec<DaqIntent>> {
        let index = coordinate.value()?.to_f64()? as usize;
        let choice = self.choices.get(index).ok_or_else(|| {
            DaqError::ScanMisconfigured(format!("no choice {index} for {}", self.path))
        })?;
        Ok(vec![DaqIntent::set(self.path.clone(), choice.value.clone())])
    }

    fn independent(&self, name: &str) -> Vec<(AxisPath, String)> {
        vec![(self.path.clone(), name.to_string())]
    }
}
