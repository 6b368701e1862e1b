//! Start-of-run preconditions.

use async_trait::async_trait;
use std::future::Future;

use crate::axis::Axis;
use crate::instrument::InstrumentRegistry;
use crate::value::AxisPath;

/// A check run before every scan start. Failure aborts the start.
#[async_trait]
pub trait Interlock: Send + Sync {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Succeed if it is safe to start.
    async fn check(&self, instruments: &InstrumentRegistry) -> anyhow::Result<()>;
}

/// Interlock requiring an axis to read within `[min, max]`.
#[derive(Debug, Clone)]
pub struct AxisRangeInterlock {
    name: String,
    path: AxisPath,
    min: f64,
    max: f64,
}

impl AxisRangeInterlock {
    /// Require `path` to read inside `[min, max]`.
    pub fn new(name: impl Into<String>, path: impl Into<AxisPath>, min: f64, max: f64) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            min,
            max,
        }
    }
}

#[async_trait]
impl Interlock for AxisRangeInterlock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, instruments: &InstrumentRegistry) -> anyhow::Result<()> {
        let axis = instruments.axis(&self.path)?;
        let value = axis.read().await?.to_f64()?;
        if !(self.min..=self.max).contains(&value) {
            anyhow::bail!(
                "{} reads {value}, outside [{}, {}]",
                self.path,
                self.min,
                self.max
            );
        }
        Ok(())
    }
}

/// Interlock backed by an async closure.
pub struct FnInterlock<F> {
    name: String,
    check: F,
}

impl<F, Fut> FnInterlock<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    /// Interlock named `name` running `check`.
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }
}

#[async_trait]
impl<F, Fut> Interlock for FnInterlock<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, _instruments: &InstrumentRegistry) -> anyhow::Result<()> {
        (self.check)().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::SimulatedAxis;
    use crate::instrument::Instrument;
    use crate::value::Value;
    use std::sync::Arc;

    #[tokio::test]
    async fn range_interlock_reads_the_axis() {
        let registry = InstrumentRegistry::new().with(
            Instrument::new("shutter").with_axis("temperature", Arc::new(SimulatedAxis::writable("t", Value::Float(21.0)))),
        );

        let ok = AxisRangeInterlock::new("temp", "shutter.temperature", 15.0, 25.0);
        assert!(ok.check(&registry).await.is_ok());

        let hot = AxisRangeInterlock::new("temp", "shutter.temperature", 0.0, 20.0);
        let err = hot.check(&registry).await.unwrap_err();
        assert!(err.to_string().contains("outside"));

        let missing = AxisRangeInterlock::new("temp", "shutter.nothing", 0.0, 1.0);
        assert!(missing.check(&registry).await.is_err());
    }
}
