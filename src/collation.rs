//! Collation: reshaping point-tagged streams into a dense labeled array.
//!
//! During a run, [`Collation::receive`] is called for every accepted write and
//! tracks min, max and the distinct values of each declared independent axis.
//! At run end [`Collation::to_dataset`]:
//!
//! 1. builds one coordinate axis per independent stream from the sorted set
//!    of every value observed for it; streams carrying text (choice values)
//!    get a categorical axis of sorted labels, positioned at `0..n`,
//! 2. allocates a zero-filled array per stream, adding `{name}-dim_{i}`
//!    dimensions for array-valued streams,
//! 3. joins all streams on the point index,
//! 4. writes each point's values at the grid cell its independent values
//!    select.
//!
//! Because the coordinate axes come from observed values, traversal order
//! (serpentine, shuffled, truncated) does not affect the output grid.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::error::{AppResult, DaqError};
use crate::value::{AxisPath, Value};

/// One recorded reading or setpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaqRecord {
    /// Recorded value.
    pub data: Value,
    /// When it was recorded.
    pub time: DateTime<Utc>,
    /// Step counter at the time.
    pub step: u64,
    /// Point counter at the time.
    pub point: u64,
}

/// Recorded data by axis path.
pub type DaqValues = BTreeMap<AxisPath, Vec<DaqRecord>>;

/// Totally ordered float for value sets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderedValue(pub f64);

impl PartialEq for OrderedValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedValue {}

impl PartialOrd for OrderedValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Running statistics for one independent axis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisStatistics {
    /// Smallest observed value.
    pub min: Option<f64>,
    /// Largest observed value.
    pub max: Option<f64>,
    /// Distinct observed values.
    pub seen: BTreeSet<OrderedValue>,
    /// Distinct observed text values.
    #[serde(default)]
    pub labels: BTreeSet<String>,
}

impl AxisStatistics {
    fn observe(&mut self, v: f64) {
        self.min = Some(self.min.map_or(v, |m| m.min(v)));
        self.max = Some(self.max.map_or(v, |m| m.max(v)));
        self.seen.insert(OrderedValue(v));
    }
}

/// Sorted distinct values of one independent stream.
#[derive(Debug, Clone, PartialEq)]
pub enum AxisValues {
    /// Numeric coordinates.
    Numeric(Vec<f64>),
    /// Categorical labels.
    Labels(Vec<String>),
}

impl AxisValues {
    /// Number of distinct values.
    pub fn len(&self) -> usize {
        match self {
            AxisValues::Numeric(v) => v.len(),
            AxisValues::Labels(l) => l.len(),
        }
    }

    /// Whether nothing was observed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Coordinate values; labels are placed at their sorted positions.
    pub fn coordinates(&self) -> Vec<f64> {
        match self {
            AxisValues::Numeric(v) => v.clone(),
            AxisValues::Labels(l) => (0..l.len()).map(|i| i as f64).collect(),
        }
    }

    /// Index of `value` on this axis.
    pub fn position(&self, value: &Value) -> Option<usize> {
        match self {
            AxisValues::Numeric(coords) => {
                let v = value.as_f64().filter(|_| value.is_scalar_numeric())?;
                coords.binary_search_by(|c| c.total_cmp(&v)).ok()
            }
            AxisValues::Labels(labels) => {
                let label = label(value)?;
                labels.binary_search(&label).ok()
            }
        }
    }
}

/// Label of a scalar value on a categorical axis.
fn label(value: &Value) -> Option<String> {
    match value {
        Value::Text(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Int(v) => Some(v.to_string()),
        Value::Float(v) => Some(v.to_string()),
        Value::Vector(_) | Value::Array { .. } => None,
    }
}

/// Declared independent/dependent streams plus independent-axis statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collation {
    independent: Vec<(AxisPath, String)>,
    dependent: Vec<(AxisPath, String)>,
    statistics: BTreeMap<AxisPath, AxisStatistics>,
}

/// A labeled n-dimensional array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataArray {
    /// Dimension names.
    pub dims: Vec<String>,
    /// Extent per dimension.
    pub shape: Vec<usize>,
    /// Row-major samples.
    pub data: Vec<f64>,
}

impl DataArray {
    fn zeros(dims: Vec<String>, shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            dims,
            shape,
            data: vec![0.0; len],
        }
    }

    /// Sample at a full index.
    pub fn get(&self, index: &[usize]) -> Option<f64> {
        self.offset(index).and_then(|o| self.data.get(o).copied())
    }

    fn offset(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut offset = 0;
        for (&i, &extent) in index.iter().zip(&self.shape) {
            if i >= extent {
                return None;
            }
            offset = offset * extent + i;
        }
        Some(offset)
    }

    fn write_cell(&mut self, cell: &[usize], samples: &[f64]) -> bool {
        let inner: usize = self.shape[cell.len()..].iter().product();
        if samples.len() != inner {
            return false;
        }
        let mut index = cell.to_vec();
        index.extend(std::iter::repeat(0).take(self.shape.len() - cell.len()));
        match self.offset(&index) {
            Some(start) => {
                self.data[start..start + inner].copy_from_slice(samples);
                true
            }
            None => false,
        }
    }
}

/// Dense, coordinate-labeled output of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Coordinate values per dimension name.
    pub coords: BTreeMap<String, Vec<f64>>,
    /// Sorted labels of categorical dimensions, indexed by coordinate.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, Vec<String>>,
    /// Data arrays per stream name.
    pub data_vars: BTreeMap<String, DataArray>,
    /// Free-form attributes.
    pub attrs: BTreeMap<String, serde_json::Value>,
}

impl Collation {
    /// Declare streams. Order of `independent` fixes dimension order.
    pub fn new(independent: Vec<(AxisPath, String)>, dependent: Vec<(AxisPath, String)>) -> Self {
        Self {
            independent,
            dependent,
            statistics: BTreeMap::new(),
        }
    }

    /// Independent stream names in dimension order.
    pub fn independent_names(&self) -> Vec<&str> {
        self.independent.iter().map(|(_, n)| n.as_str()).collect()
    }

    /// Dependent stream names.
    pub fn dependent_names(&self) -> Vec<&str> {
        self.dependent.iter().map(|(_, n)| n.as_str()).collect()
    }

    /// Declared independent streams.
    pub fn independent(&self) -> &[(AxisPath, String)] {
        &self.independent
    }

    /// Declared dependent streams.
    pub fn dependent(&self) -> &[(AxisPath, String)] {
        &self.dependent
    }

    /// Statistics for an independent path.
    pub fn statistics(&self, path: &AxisPath) -> Option<&AxisStatistics> {
        self.statistics.get(path)
    }

    /// Note a write. Only declared independent scalar streams are tracked.
    pub fn receive(&mut self, path: &AxisPath, value: &Value) {
        if !self.independent.iter().any(|(p, _)| p == path) {
            return;
        }
        match value {
            Value::Float(_) | Value::Int(_) => {
                if let Some(v) = value.as_f64() {
                    self.statistics.entry(path.clone()).or_default().observe(v)
                }
            }
            Value::Text(_) | Value::Bool(_) => {
                if let Some(l) = label(value) {
                    self.statistics.entry(path.clone()).or_default().labels.insert(l);
                }
            }
            _ => debug!(axis = %path, "Ignoring non-scalar value for collation"),
        }
    }

    /// Sorted coordinate values per independent stream.
    ///
    /// Values recorded in `daq_values` are merged in, so streams that were
    /// never seen through [`receive`](Self::receive) still get an axis.
    pub fn internal_axes(&self, daq_values: &DaqValues) -> Vec<(String, AxisValues)> {
        self.independent
            .iter()
            .map(|(path, name)| {
                let stats = self.statistics.get(path);
                let mut seen: BTreeSet<OrderedValue> =
                    stats.map(|s| s.seen.clone()).unwrap_or_default();
                let mut labels: BTreeSet<String> =
                    stats.map(|s| s.labels.clone()).unwrap_or_default();
                for record in daq_values.get(path).into_iter().flatten() {
                    match &record.data {
                        v @ (Value::Float(_) | Value::Int(_)) => {
                            if let Some(v) = v.as_f64() {
                                seen.insert(OrderedValue(v));
                            }
                        }
                        v @ (Value::Text(_) | Value::Bool(_)) => labels.extend(label(v)),
                        _ => {}
                    }
                }
                let values = if labels.is_empty() {
                    AxisValues::Numeric(seen.into_iter().map(|v| v.0).collect())
                } else {
                    // Mixed streams fall back to labels for every value.
                    labels.extend(seen.iter().map(|v| v.0.to_string()));
                    AxisValues::Labels(labels.into_iter().collect())
                };
                (name.clone(), values)
            })
            .collect()
    }

    /// One map per point, keyed by stream name, over points present in every
    /// stream. Points with several records for a dependent stream are
    /// stacked; independent streams keep the last value.
    pub fn group_points(&self, daq_values: &DaqValues) -> AppResult<Vec<BTreeMap<String, Value>>> {
        let streams: Vec<(&AxisPath, &String, bool)> = self
            .independent
            .iter()
            .map(|(p, n)| (p, n, true))
            .chain(self.dependent.iter().map(|(p, n)| (p, n, false)))
            .collect();

        let mut by_point: Vec<BTreeMap<u64, Vec<&Value>>> = Vec::with_capacity(streams.len());
        for (path, _, _) in &streams {
            let mut grouped: BTreeMap<u64, Vec<&Value>> = BTreeMap::new();
            for record in daq_values.get(*path).into_iter().flatten() {
                grouped.entry(record.point).or_default().push(&record.data);
            }
            by_point.push(grouped);
        }

        let Some(first) = by_point.first() else {
            return Ok(Vec::new());
        };
        let common: Vec<u64> = first
            .keys()
            .copied()
            .filter(|point| by_point.iter().all(|g| g.contains_key(point)))
            .collect();

        let mut points = Vec::with_capacity(common.len());
        for point in common {
            let mut row = BTreeMap::new();
            for ((_, name, independent), grouped) in streams.iter().zip(&by_point) {
                let values = &grouped[&point];
                let value = match (values.as_slice(), independent) {
                    ([single], _) => (*single).clone(),
                    (many, true) => many
                        .last()
                        .map(|v| (*v).clone())
                        .ok_or_else(|| DaqError::Collation(format!("empty point {point}")))?,
                    (many, false) => {
                        Value::stack(&many.iter().map(|v| (*v).clone()).collect::<Vec<_>>())?
                    }
                };
                row.insert((*name).clone(), value);
            }
            points.push(row);
        }
        Ok(points)
    }

    /// Build the dense dataset, or `None` if nothing was collected.
    pub fn to_dataset(&self, daq_values: &DaqValues) -> AppResult<Option<Dataset>> {
        let declared = self.independent.iter().chain(&self.dependent);
        if declared.clone().all(|(p, _)| daq_values.get(p).map_or(true, Vec::is_empty)) {
            return Ok(None);
        }
        for (path, name) in declared {
            if daq_values.get(path).map_or(true, Vec::is_empty) {
                warn!(stream = %name, axis = %path, "Declared stream has no data");
            }
        }

        let axes = self.internal_axes(daq_values);
        let dims: Vec<String> = axes.iter().map(|(n, _)| n.clone()).collect();
        let grid: Vec<usize> = axes.iter().map(|(_, c)| c.len()).collect();
        let points = self.group_points(daq_values)?;

        let axis_coords: Vec<Vec<f64>> = axes.iter().map(|(_, v)| v.coordinates()).collect();
        let mut coords: BTreeMap<String, Vec<f64>> = dims
            .iter()
            .cloned()
            .zip(axis_coords.iter().cloned())
            .collect();
        let labels: BTreeMap<String, Vec<String>> = axes
            .iter()
            .filter_map(|(name, values)| match values {
                AxisValues::Labels(l) => Some((name.clone(), l.clone())),
                AxisValues::Numeric(_) => None,
            })
            .collect();
        let mut data_vars = BTreeMap::new();

        for (_, name) in &self.independent {
            data_vars.insert(
                format!("{name}-values"),
                DataArray::zeros(dims.clone(), grid.clone()),
            );
        }
        for (_, name) in &self.dependent {
            let extra = points
                .first()
                .and_then(|p| p.get(name))
                .map(Value::shape)
                .unwrap_or_default();
            let mut var_dims = dims.clone();
            let mut shape = grid.clone();
            for (i, extent) in extra.iter().enumerate() {
                let dim = format!("{name}-dim_{i}");
                coords.insert(dim.clone(), (0..*extent).map(|v| v as f64).collect());
                var_dims.push(dim);
                shape.push(*extent);
            }
            data_vars.insert(name.clone(), DataArray::zeros(var_dims, shape));
        }

        let mut skipped = 0usize;
        for point in &points {
            let Some(cell) = locate(&axes, point) else {
                skipped += 1;
                continue;
            };
            for (dim, (_, name)) in self.independent.iter().enumerate() {
                if let Some(var) = data_vars.get_mut(&format!("{name}-values")) {
                    var.write_cell(&cell, &[axis_coords[dim][cell[dim]]]);
                }
            }
            for (_, name) in &self.dependent {
                let (Some(var), Some(value)) = (data_vars.get_mut(name), point.get(name)) else {
                    continue;
                };
                if !var.write_cell(&cell, &value.flatten()?) {
                    warn!(stream = %name, shape = ?value.shape(), "Value shape does not match its stream");
                }
            }
        }
        if skipped > 0 {
            warn!(skipped, "Points without a grid cell were skipped");
        }

        let mut attrs = BTreeMap::new();
        attrs.insert("n_points".to_string(), serde_json::json!(points.len()));
        Ok(Some(Dataset {
            coords,
            labels,
            data_vars,
            attrs,
        }))
    }
}

/// Grid cell for a point, by exact lookup on each sorted axis.
fn locate(axes: &[(String, AxisValues)], point: &BTreeMap<String, Value>) -> Option<Vec<usize>> {
    axes.iter()
        .map(|(name, values)| values.position(point.get(name)?))
        .collect()
}
