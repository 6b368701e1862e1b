//! Axes backed by user-supplied functions.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;

use super::{Axis, ValueStream};
use crate::error::{AppResult, DaqError};
use crate::value::Value;

type ReadFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
type WriteFn = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Axis whose read and write are arbitrary async functions.
pub struct ManualAxis {
    name: String,
    read_fn: ReadFn,
    write_fn: Option<WriteFn>,
    values: ValueStream,
}

impl ManualAxis {
    /// Read-only axis.
    pub fn reader<R, RF>(name: impl Into<String>, read: R) -> Self
    where
        R: Fn() -> RF + Send + Sync + 'static,
        RF: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            read_fn: Arc::new(move || read().boxed()),
            write_fn: None,
            values: ValueStream::default(),
        }
    }

    /// Add a write function.
    pub fn with_writer<W, WF>(mut self, write: W) -> Self
    where
        W: Fn(Value) -> WF + Send + Sync + 'static,
        WF: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.write_fn = Some(Arc::new(move |v| write(v).boxed()));
        self
    }
}

#[async_trait]
impl Axis for ManualAxis {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self) -> AppResult<Value> {
        let value = (self.read_fn)().await?;
        self.values.record(&value);
        Ok(value)
    }

    async fn write(&self, value: Value) -> AppResult<()> {
        let Some(write) = &self.write_fn else {
            return Err(DaqError::ReadOnly(self.name.clone()));
        };
        write(value.clone()).await?;
        self.values.record(&value);
        Ok(())
    }

    fn values(&self) -> &ValueStream {
        &self.values
    }
}

type MockRead = Arc<dyn Fn() -> Value + Send + Sync>;
type MockWrite = Arc<dyn Fn(&Value) + Send + Sync>;

/// Stand-in for hardware during development and tests.
///
/// Without a mock write the axis is read-only.
pub struct SimulatedAxis {
    name: String,
    mock_read: Option<MockRead>,
    mock_write: Option<MockWrite>,
    value: Arc<Mutex<Value>>,
    values: ValueStream,
}

impl SimulatedAxis {
    /// Read-only axis producing values from `read`.
    pub fn read_only(name: impl Into<String>, read: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            mock_read: Some(Arc::new(read)),
            mock_write: None,
            value: Arc::new(Mutex::new(Value::Float(0.0))),
            values: ValueStream::default(),
        }
    }

    /// Writable axis that reads back the last written value.
    pub fn writable(name: impl Into<String>, initial: Value) -> Self {
        let value = Arc::new(Mutex::new(initial));
        let cell = Arc::clone(&value);
        Self {
            name: name.into(),
            mock_read: None,
            mock_write: Some(Arc::new(move |v: &Value| *cell.lock() = v.clone())),
            value,
            values: ValueStream::default(),
        }
    }

    /// Fully custom mock functions.
    pub fn with_mocks(
        name: impl Into<String>,
        read: impl Fn() -> Value + Send + Sync + 'static,
        write: impl Fn(&Value) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            mock_read: Some(Arc::new(read)),
            mock_write: Some(Arc::new(write)),
            value: Arc::new(Mutex::new(Value::Float(0.0))),
            values: ValueStream::default(),
        }
    }

    /// Whether writes are accepted.
    pub fn is_read_only(&self) -> bool {
        self.mock_write.is_none()
    }
}

#[async_trait]
impl Axis for SimulatedAxis {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self) -> AppResult<Value> {
        let value = match &self.mock_read {
            Some(read) => read(),
            None => self.value.lock().clone(),
        };
        self.values.record(&value);
        Ok(value)
    }

    async fn write(&self, value: Value) -> AppResult<()> {
        let Some(write) = &self.mock_write else {
            return Err(DaqError::ReadOnly(self.name.clone()));
        };
        write(&value);
        self.values.record(&value);
        Ok(())
    }

    fn values(&self) -> &ValueStream {
        &self.values
    }
}
