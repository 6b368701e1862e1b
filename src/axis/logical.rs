//! Logical axes: coordinate transforms over several physical axes.
//!
//! A logical axis maps an N-vector of logical coordinates onto M physical
//! axes through forward transforms, and back through inverse transforms.
//! Both see a user-defined internal state (calibration offsets and the like)
//! that is persisted with the application state.
//!
//! ```rust,ignore
//! let xyz = LogicalAxis::builder("x_y_z", Offsets::default())
//!     .physical("stages[0]", stage0, |s, c| c[0] - c[1] + s.x_off)
//!     .physical("stages[1]", stage1, |_, c| c[0] + c[1])
//!     .coordinate("x", |s, p| (p[0] - s.x_off + p[1]) / 2.0)
//!     .coordinate("y", |s, p| (p[1] - p[0] + s.x_off) / 2.0)
//!     .build()?;
//! let x = xyz.sub_axis("x")?;
//! ```

use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::{Axis, ValueStream};
use crate::error::{AppResult, DaqError};
use crate::value::Value;

/// `(internal state, coordinates) -> one coordinate` transform.
pub type Transform<S> = Arc<dyn Fn(&S, &[f64]) -> f64 + Send + Sync>;

struct PhysicalAxis<S> {
    path: String,
    axis: Arc<dyn Axis>,
    forward: Transform<S>,
}

/// Persisted form of a logical axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalAxisState {
    /// Serialized internal state record.
    pub internal_state: serde_json::Value,
    /// Last logical coordinates.
    pub logical_state: Vec<f64>,
    /// Last physical positions.
    pub physical_state: Vec<f64>,
}

/// Builder for [`LogicalAxis`].
pub struct LogicalAxisBuilder<S> {
    name: String,
    state: S,
    physical: Vec<PhysicalAxis<S>>,
    coordinates: Vec<(String, Transform<S>)>,
}

impl<S> LogicalAxisBuilder<S>
where
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Add a physical axis with its forward transform.
    pub fn physical(
        mut self,
        path: impl Into<String>,
        axis: Arc<dyn Axis>,
        forward: impl Fn(&S, &[f64]) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.physical.push(PhysicalAxis {
            path: path.into(),
            axis,
            forward: Arc::new(forward),
        });
        self
    }

    /// Add a logical coordinate with its inverse transform.
    pub fn coordinate(
        mut self,
        name: impl Into<String>,
        inverse: impl Fn(&S, &[f64]) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.coordinates.push((name.into(), Arc::new(inverse)));
        self
    }

    /// Finish building.
    pub fn build(self) -> AppResult<Arc<LogicalAxis<S>>> {
        if self.physical.is_empty() || self.coordinates.is_empty() {
            return Err(DaqError::Configuration(format!(
                "logical axis '{}' needs at least one physical axis and one coordinate",
                self.name
            )));
        }
        let n_logical = self.coordinates.len();
        let n_physical = self.physical.len();
        Ok(Arc::new(LogicalAxis {
            name: self.name,
            physical: self.physical,
            coordinates: self.coordinates,
            state: RwLock::new(self.state),
            logical_position: Mutex::new(vec![0.0; n_logical]),
            physical_position: Mutex::new(vec![0.0; n_physical]),
            values: ValueStream::default(),
        }))
    }
}

/// Coordinate-transform axis over several physical axes.
pub struct LogicalAxis<S> {
    name: String,
    physical: Vec<PhysicalAxis<S>>,
    coordinates: Vec<(String, Transform<S>)>,
    state: RwLock<S>,
    logical_position: Mutex<Vec<f64>>,
    physical_position: Mutex<Vec<f64>>,
    values: ValueStream,
}

impl<S> LogicalAxis<S>
where
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Start building a logical axis with an initial internal state.
    pub fn builder(name: impl Into<String>, state: S) -> LogicalAxisBuilder<S> {
        LogicalAxisBuilder {
            name: name.into(),
            state,
            physical: Vec::new(),
            coordinates: Vec::new(),
        }
    }

    /// Logical coordinate names, in vector order.
    pub fn coordinate_names(&self) -> Vec<&str> {
        self.coordinates.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Physical axis paths, in vector order.
    pub fn physical_paths(&self) -> Vec<&str> {
        self.physical.iter().map(|p| p.path.as_str()).collect()
    }

    /// Copy of the internal state.
    pub fn state(&self) -> S {
        self.state.read().clone()
    }

    /// Replace the internal state. Takes effect on the next read or write.
    pub fn set_state(&self, state: S) {
        *self.state.write() = state;
    }

    /// Last known logical coordinates.
    pub fn logical_position(&self) -> Vec<f64> {
        self.logical_position.lock().clone()
    }

    /// Last known physical positions.
    pub fn physical_position(&self) -> Vec<f64> {
        self.physical_position.lock().clone()
    }

    /// Physical targets for a logical vector.
    pub fn forward(&self, logical: &[f64]) -> Vec<f64> {
        let state = self.state.read();
        self.physical
            .iter()
            .map(|p| (p.forward)(&state, logical))
            .collect()
    }

    /// Logical coordinates for physical positions.
    pub fn inverse(&self, physical: &[f64]) -> Vec<f64> {
        let state = self.state.read();
        self.coordinates
            .iter()
            .map(|(_, inverse)| inverse(&state, physical))
            .collect()
    }

    /// View of one logical coordinate, scannable on its own.
    pub fn sub_axis(self: &Arc<Self>, coordinate: &str) -> AppResult<LogicalSubAxis<S>> {
        let index = self
            .coordinates
            .iter()
            .position(|(n, _)| n == coordinate)
            .ok_or_else(|| {
                DaqError::UnknownPath(format!("{}.{}", self.name, coordinate))
            })?;
        Ok(LogicalSubAxis {
            name: format!("{}.{}", self.name, coordinate),
            parent: Arc::clone(self),
            index,
            values: ValueStream::default(),
        })
    }

    async fn write_logical(&self, logical: Vec<f64>) -> AppResult<()> {
        if logical.len() != self.coordinates.len() {
            return Err(DaqError::InvalidValue(format!(
                "{} expects {} coordinates, got {}",
                self.name,
                self.coordinates.len(),
                logical.len()
            )));
        }
        let targets = self.forward(&logical);
        debug!(axis = %self.name, ?logical, ?targets, "Logical write");

        try_join_all(
            self.physical
                .iter()
                .zip(&targets)
                .map(|(p, target)| p.axis.write(Value::Float(*target))),
        )
        .await?;

        *self.logical_position.lock() = logical;
        *self.physical_position.lock() = targets;
        Ok(())
    }
}

#[async_trait]
impl<S> Axis for LogicalAxis<S>
where
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self) -> AppResult<Value> {
        let readings = try_join_all(self.physical.iter().map(|p| p.axis.read())).await?;
        let physical = readings
            .iter()
            .map(Value::to_f64)
            .collect::<AppResult<Vec<f64>>>()?;
        let logical = self.inverse(&physical);

        *self.physical_position.lock() = physical;
        *self.logical_position.lock() = logical.clone();
        Ok(Value::Vector(logical))
    }

    async fn write(&self, value: Value) -> AppResult<()> {
        self.write_logical(value.as_vector()?).await
    }

    async fn settle(&self) -> AppResult<()> {
        try_join_all(self.physical.iter().map(|p| p.axis.settle())).await?;
        Ok(())
    }

    fn values(&self) -> &ValueStream {
        &self.values
    }

    fn snapshot(&self) -> AppResult<Option<serde_json::Value>> {
        let state = LogicalAxisState {
            internal_state: serde_json::to_value(self.state())?,
            logical_state: self.logical_position(),
            physical_state: self.physical_position(),
        };
        Ok(Some(serde_json::to_value(state)?))
    }

    fn restore(&self, state: serde_json::Value) -> AppResult<()> {
        let state: LogicalAxisState = serde_json::from_value(state)?;
        self.set_state(serde_json::from_value(state.internal_state)?);
        if state.logical_state.len() == self.coordinates.len() {
            *self.logical_position.lock() = state.logical_state;
        }
        if state.physical_state.len() == self.physical.len() {
            *self.physical_position.lock() = state.physical_state;
        }
        Ok(())
    }
}

/// One coordinate of a [`LogicalAxis`].
///
/// Writing copies the parent's last logical vector, replaces this slot and
/// writes the whole vector. Reading is not supported.
pub struct LogicalSubAxis<S> {
    name: String,
    parent: Arc<LogicalAxis<S>>,
    index: usize,
    values: ValueStream,
}

#[async_trait]
impl<S> Axis for LogicalSubAxis<S>
where
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self) -> AppResult<Value> {
        Err(DaqError::NotSupported(format!(
            "reading sub-axis {}",
            self.name
        )))
    }

    async fn write(&self, value: Value) -> AppResult<()> {
        let mut logical = self.parent.logical_position();
        logical[self.index] = value.to_f64()?;
        self.parent.write_logical(logical).await?;
        self.values.record(&value);
        Ok(())
    }

    async fn settle(&self) -> AppResult<()> {
        self.parent.settle().await
    }

    fn values(&self) -> &ValueStream {
        &self.values
    }
}
