//! Polling axes.
//!
//! A [`ProxiedAxis`] issues a driver write and then polls the driver's
//! completion predicate on an exponential [`Backoff`] schedule. While a write
//! is in flight the axis is `Moving`:
//!
//! - a second write is rejected with [`DaqError::AlreadyMoving`]
//! - a read waits on the same backoff schedule until motion completes
//!
//! A write future dropped mid-poll leaves the motion unowned. The axis still
//! reports `Moving`, but the next read, settle or write asks the driver and
//! takes over once the hardware reports it has settled.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, trace};

use super::{Axis, AxisStatus, ValueStream};
use crate::config::AxisConfig;
use crate::error::{AppResult, DaqError};
use crate::value::Value;

/// Exponential polling schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// First interval.
    pub initial: Duration,
    /// Growth factor per poll.
    pub multiplier: f64,
    /// Largest interval.
    pub ceiling: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(30),
            multiplier: 1.5,
            ceiling: Duration::from_millis(200),
        }
    }
}

impl From<&AxisConfig> for Backoff {
    fn from(config: &AxisConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.backoff_initial_ms),
            multiplier: config.backoff_multiplier,
            ceiling: Duration::from_millis(config.backoff_ceiling_ms),
        }
    }
}

impl Backoff {
    /// Endless sequence of poll intervals.
    pub fn intervals(&self) -> impl Iterator<Item = Duration> {
        let multiplier = self.multiplier;
        let ceiling_ms = self.ceiling.as_secs_f64() * 1e3;
        let initial_ms = (self.initial.as_secs_f64() * 1e3).min(ceiling_ms);
        std::iter::successors(Some(initial_ms), move |ms| Some((ms * multiplier).min(ceiling_ms)))
            .map(|ms| Duration::from_nanos((ms * 1e6).round() as u64))
    }
}

/// Device-side primitives a [`ProxiedAxis`] drives.
#[async_trait]
pub trait AxisDriver: Send + Sync {
    /// Read the current value.
    async fn read(&self) -> anyhow::Result<Value>;

    /// Issue a setpoint. May return before the motion completes.
    async fn write(&self, value: Value) -> anyhow::Result<()>;

    /// Whether the last write has completed.
    async fn is_settled(&self) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Axis wrapping an [`AxisDriver`] with polling and a write guard.
pub struct ProxiedAxis {
    name: String,
    driver: Arc<dyn AxisDriver>,
    backoff: Backoff,
    motion: Mutex<Motion>,
    values: ValueStream,
}

#[derive(Debug, Clone, Copy)]
struct Motion {
    status: AxisStatus,
    /// A live write is polling this motion.
    owned: bool,
}

/// Releases ownership of the motion when the write finishes or is dropped.
struct WriteGuard<'a> {
    motion: &'a Mutex<Motion>,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.motion.lock().owned = false;
    }
}

impl ProxiedAxis {
    /// Axis with the default backoff.
    pub fn new(name: impl Into<String>, driver: Arc<dyn AxisDriver>) -> Self {
        Self {
            name: name.into(),
            driver,
            backoff: Backoff::default(),
            motion: Mutex::new(Motion {
                status: AxisStatus::Idle,
                owned: false,
            }),
            values: ValueStream::default(),
        }
    }

    /// Override the polling schedule.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Polling schedule in use.
    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    async fn poll_until_settled(&self) -> AppResult<()> {
        for interval in self.backoff.intervals() {
            tokio::time::sleep(interval).await;
            if self.driver.is_settled().await? {
                self.set_idle();
                return Ok(());
            }
            trace!(axis = %self.name, ?interval, "Still moving");
        }
        Ok(())
    }

    fn set_idle(&self) {
        self.motion.lock().status = AxisStatus::Idle;
    }

    fn already_moving(&self) -> DaqError {
        DaqError::AlreadyMoving {
            axis: self.name.clone(),
        }
    }
}

#[async_trait]
impl Axis for ProxiedAxis {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self) -> AppResult<Value> {
        if self.status() == AxisStatus::Moving {
            debug!(axis = %self.name, "Read while moving, waiting for motion to finish");
            self.poll_until_settled().await?;
        }
        let value = self.driver.read().await?;
        self.values.record(&value);
        Ok(value)
    }

    #[instrument(skip(self), fields(axis = %self.name), err)]
    async fn write(&self, value: Value) -> AppResult<()> {
        let abandoned = {
            let motion = self.motion.lock();
            if motion.owned {
                return Err(self.already_moving());
            }
            motion.status == AxisStatus::Moving
        };
        if abandoned {
            if !self.driver.is_settled().await? {
                return Err(self.already_moving());
            }
            debug!("Abandoned motion has settled, taking over");
        }

        {
            let mut motion = self.motion.lock();
            if motion.owned {
                return Err(self.already_moving());
            }
            motion.status = AxisStatus::Moving;
            motion.owned = true;
        }
        let _guard = WriteGuard {
            motion: &self.motion,
        };

        if let Err(e) = self.driver.write(value.clone()).await {
            self.set_idle();
            return Err(e.into());
        }
        if let Err(e) = self.poll_until_settled().await {
            self.set_idle();
            return Err(e);
        }

        self.values.record(&value);
        Ok(())
    }

    async fn settle(&self) -> AppResult<()> {
        if self.status() == AxisStatus::Moving {
            self.poll_until_settled().await?;
        }
        Ok(())
    }

    fn status(&self) -> AxisStatus {
        self.motion.lock().status
    }

    fn values(&self) -> &ValueStream {
        &self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Driver whose motion completes when `done` is set.
    struct Gate {
        done: AtomicBool,
        polls: AtomicUsize,
        position: Mutex<Value>,
    }

    impl Gate {
        fn new(done: bool) -> Arc<Self> {
            Arc::new(Self {
                done: AtomicBool::new(done),
                polls: AtomicUsize::new(0),
                position: Mutex::new(Value::Float(0.0)),
            })
        }
    }

    #[async_trait]
    impl AxisDriver for Gate {
        async fn read(&self) -> anyhow::Result<Value> {
            Ok(self.position.lock().clone())
        }

        async fn write(&self, value: Value) -> anyhow::Result<()> {
            *self.position.lock() = value;
            Ok(())
        }

        async fn is_settled(&self) -> anyhow::Result<bool> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(self.done.load(Ordering::SeqCst))
        }
    }

    fn fast() -> Backoff {
        Backoff {
            initial: Duration::from_millis(2),
            multiplier: 1.5,
            ceiling: Duration::from_millis(10),
        }
    }

    #[test]
    fn backoff_grows_to_ceiling() {
        let intervals: Vec<u128> = Backoff::default()
            .intervals()
            .take(7)
            .map(|d| d.as_micros())
            .collect();
        assert_eq!(
            intervals,
            vec![30_000, 45_000, 67_500, 101_250, 151_875, 200_000, 200_000]
        );
    }

    #[test]
    fn backoff_from_settings() {
        let config = AxisConfig {
            backoff_initial_ms: 10,
            backoff_multiplier: 2.0,
            backoff_ceiling_ms: 25,
        };
        let intervals: Vec<Duration> = Backoff::from(&config).intervals().take(3).collect();
        assert_eq!(
            intervals,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(25)
            ]
        );
    }

    #[tokio::test]
    async fn write_polls_until_settled() {
        let driver = Gate::new(true);
        let axis = ProxiedAxis::new("stage", driver.clone()).with_backoff(fast());

        axis.write(Value::Float(3.0)).await.unwrap();
        assert_eq!(axis.status(), AxisStatus::Idle);
        assert!(driver.polls.load(Ordering::SeqCst) >= 1);
        assert_eq!(axis.read().await.unwrap(), Value::Float(3.0));
    }

    #[tokio::test]
    async fn read_waits_for_motion_to_finish() {
        let driver = Gate::new(false);
        let axis = Arc::new(ProxiedAxis::new("stage", driver.clone()).with_backoff(fast()));

        let writer = {
            let axis = Arc::clone(&axis);
            tokio::spawn(async move { axis.write(Value::Float(1.0)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(axis.status(), AxisStatus::Moving);

        let reader = {
            let axis = Arc::clone(&axis);
            tokio::spawn(async move { axis.read().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        driver.done.store(true, Ordering::SeqCst);
        assert_eq!(reader.await.unwrap().unwrap(), Value::Float(1.0));
        writer.await.unwrap().unwrap();
        assert_eq!(axis.status(), AxisStatus::Idle);
    }

    #[tokio::test]
    async fn dropped_write_does_not_wedge_the_axis() {
        let driver = Gate::new(false);
        let axis = ProxiedAxis::new("stage", driver.clone()).with_backoff(fast());

        let cancelled = tokio::time::timeout(Duration::from_millis(20), axis.write(Value::Float(1.0))).await;
        assert!(cancelled.is_err());
        assert_eq!(axis.status(), AxisStatus::Moving);

        // Hardware still moving: the abandoned motion blocks new writes.
        let early = axis.write(Value::Float(2.0)).await;
        assert!(matches!(early, Err(DaqError::AlreadyMoving { .. })));

        driver.done.store(true, Ordering::SeqCst);
        axis.write(Value::Float(2.0)).await.unwrap();
        assert_eq!(axis.status(), AxisStatus::Idle);
        assert_eq!(axis.read().await.unwrap(), Value::Float(2.0));
    }

    #[tokio::test]
    async fn driver_error_resets_status() {
        struct Broken;

        #[async_trait]
        impl AxisDriver for Broken {
            async fn read(&self) -> anyhow::Result<Value> {
                anyhow::bail!("disconnected")
            }

            async fn write(&self, _value: Value) -> anyhow::Result<()> {
                anyhow::bail!("disconnected")
            }
        }

        let axis = ProxiedAxis::new("stage", Arc::new(Broken));
        assert!(axis.write(Value::Float(1.0)).await.is_err());
        assert_eq!(axis.status(), AxisStatus::Idle);
    }
}
