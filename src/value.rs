//! Measurement values and axis addressing.
//!
//! [`Value`] is what flows through axis reads and writes, the run record and
//! the collation engine. [`AxisPath`] is the fully-qualified address of an
//! axis or property, e.g. `mc.stages[0]` or `power_meter.device`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AppResult, DaqError};

/// A single reading or setpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean flag.
    Bool(bool),
    /// Integer reading or index.
    Int(i64),
    /// Floating point scalar.
    Float(f64),
    /// Free-form text (choice keys, identifiers).
    Text(String),
    /// Flat vector, used for logical axis coordinates.
    Vector(Vec<f64>),
    /// Row-major n-dimensional array, e.g. a detector frame.
    Array {
        /// Extent of each dimension.
        shape: Vec<usize>,
        /// Row-major samples.
        data: Vec<f64>,
    },
}

impl Value {
    /// Numeric view of a scalar value.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Numeric view, failing for non-scalars.
    pub fn to_f64(&self) -> AppResult<f64> {
        self.as_f64()
            .ok_or_else(|| DaqError::InvalidValue(format!("expected a scalar, got {self}")))
    }

    /// Whether this is a scalar numeric value.
    pub fn is_scalar_numeric(&self) -> bool {
        matches!(self, Value::Float(_) | Value::Int(_))
    }

    /// Array shape, empty for scalars.
    pub fn shape(&self) -> Vec<usize> {
        match self {
            Value::Vector(v) => vec![v.len()],
            Value::Array { shape, .. } => shape.clone(),
            _ => Vec::new(),
        }
    }

    /// Flattened numeric samples.
    pub fn flatten(&self) -> AppResult<Vec<f64>> {
        match self {
            Value::Vector(v) => Ok(v.clone()),
            Value::Array { data, .. } => Ok(data.clone()),
            other => Ok(vec![other.to_f64()?]),
        }
    }

    /// Components of a vector value.
    pub fn as_vector(&self) -> AppResult<Vec<f64>> {
        match self {
            Value::Vector(v) => Ok(v.clone()),
            other => Err(DaqError::InvalidValue(format!(
                "expected a coordinate vector, got {other}"
            ))),
        }
    }

    /// Stack equally-shaped values along a new leading dimension.
    pub fn stack(values: &[Value]) -> AppResult<Value> {
        let Some(first) = values.first() else {
            return Ok(Value::Vector(Vec::new()));
        };
        let inner = first.shape();
        let mut data = Vec::new();
        for value in values {
            if value.shape() != inner {
                return Err(DaqError::InvalidValue(format!(
                    "cannot stack shapes {:?} and {:?}",
                    inner,
                    value.shape()
                )));
            }
            data.extend(value.flatten()?);
        }
        let mut shape = vec![values.len()];
        shape.extend(inner);
        Ok(Value::Array { shape, data })
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Vector(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v:?}"),
            Value::Vector(v) => write!(f, "{v:?}"),
            Value::Array { shape, .. } => write!(f, "array{shape:?}"),
        }
    }
}

/// One segment of an [`AxisPath`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathSegment {
    /// Attribute or scope name.
    Name(String),
    /// Index into a list of axes.
    Index(usize),
}

/// Fully-qualified axis address: a scope name followed by attribute names and
/// list indices.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct AxisPath(Vec<PathSegment>);

impl AxisPath {
    /// Parse `scope.attr[0].sub` style addresses. Purely numeric segments
    /// become indices.
    pub fn parse(path: &str) -> Self {
        let segments = path
            .split(['.', '[', ']'])
            .filter(|s| !s.is_empty())
            .map(|s| match s.parse::<usize>() {
                Ok(i) => PathSegment::Index(i),
                Err(_) => PathSegment::Name(s.to_string()),
            })
            .collect();
        AxisPath(segments)
    }

    /// Build from segments.
    pub fn from_segments(segments: Vec<PathSegment>) -> Self {
        AxisPath(segments)
    }

    /// Leading scope (instrument or actor) name.
    pub fn scope(&self) -> Option<&str> {
        match self.0.first() {
            Some(PathSegment::Name(name)) => Some(name),
            _ => None,
        }
    }

    /// Path relative to the scope.
    pub fn relative(&self) -> AxisPath {
        AxisPath(self.0.iter().skip(1).cloned().collect())
    }

    /// Append an attribute name.
    pub fn child(&self, name: &str) -> AxisPath {
        let mut segments = self.0.clone();
        segments.extend(AxisPath::parse(name).0);
        AxisPath(segments)
    }

    /// Append a list index.
    pub fn index(&self, index: usize) -> AxisPath {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Index(index));
        AxisPath(segments)
    }

    /// Path segments.
    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    /// Whether the path has no segments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for AxisPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Name(name) if i == 0 => write!(f, "{name}")?,
                PathSegment::Name(name) => write!(f, ".{name}")?,
                PathSegment::Index(idx) => write!(f, "[{idx}]")?,
            }
        }
        Ok(())
    }
}

impl From<String> for AxisPath {
    fn from(s: String) -> Self {
        AxisPath::parse(&s)
    }
}

impl From<&str> for AxisPath {
    fn from(s: &str) -> Self {
        AxisPath::parse(s)
    }
}

impl From<AxisPath> for String {
    fn from(p: AxisPath) -> Self {
        p.to_string()
    }
}
