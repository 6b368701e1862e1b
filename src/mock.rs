//! Simulated instruments.
//!
//! Stand-ins for a motion controller, detectors and a power meter so scans
//! can run without hardware.
//!
//! | Builder | Axes | Properties |
//! |---|---|---|
//! | [`mock_motion_controller`] | `stages[i]` | |
//! | [`mock_scalar_detector`] | `device` | |
//! | [`mock_image_detector`] | `image` | |
//! | [`mock_power_meter`] | `device` | `range` |
//!
//! Stages built with [`Driver::Hardware`] go through [`ProxiedAxis`] over a
//! [`MockStageDriver`], so writes take time and exercise settle polling.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::axis::{Axis, AxisDriver, Backoff, ProxiedAxis, SimulatedAxis};
use crate::config::{AxisConfig, Settings};
use crate::error::{AppResult, DaqError};
use crate::experiment::Experiment;
use crate::instrument::{Choice, Instrument, InstrumentRegistry, Property};
use crate::scan::{scan, DirectScan, FieldSpec, ScanAxis, ScanChoiceProperty};
use crate::value::{AxisPath, Value};

/// Selects how mock stages are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Driver {
    /// Writes take effect immediately.
    #[default]
    Mock,
    /// Writes go through the device driver layer with timed motion.
    Hardware,
}

#[derive(Debug, Clone, Copy)]
struct Motion {
    from: f64,
    to: f64,
    started: Instant,
    duration: Duration,
}

impl Motion {
    fn at_rest(position: f64) -> Self {
        Self {
            from: position,
            to: position,
            started: Instant::now(),
            duration: Duration::ZERO,
        }
    }

    fn position(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed >= self.duration {
            return self.to;
        }
        let fraction = elapsed.as_secs_f64() / self.duration.as_secs_f64();
        self.from + (self.to - self.from) * fraction
    }

    fn is_done(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= self.duration
    }
}

/// Linear stage that moves at a fixed speed.
///
/// `write` returns as soon as motion starts. Reads interpolate along the
/// path until the target is reached.
#[derive(Debug)]
pub struct MockStageDriver {
    speed: f64,
    motion: Mutex<Motion>,
}

impl MockStageDriver {
    /// Stage at `position`, moving 10 units per second.
    pub fn new(position: f64) -> Self {
        Self {
            speed: 10.0,
            motion: Mutex::new(Motion::at_rest(position)),
        }
    }

    /// Override the speed in units per second.
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed.abs().max(f64::EPSILON);
        self
    }
}

impl Default for MockStageDriver {
    fn default() -> Self {
        Self::new(0.0)
    }
}

#[async_trait]
impl AxisDriver for MockStageDriver {
    async fn read(&self) -> anyhow::Result<Value> {
        Ok(Value::Float(self.motion.lock().position(Instant::now())))
    }

    async fn write(&self, value: Value) -> anyhow::Result<()> {
        let target = value.to_f64()?;
        let now = Instant::now();
        let mut motion = self.motion.lock();
        let from = motion.position(now);
        let duration = Duration::from_secs_f64((target - from).abs() / self.speed);
        trace!(from, target, ?duration, "Mock stage moving");
        *motion = Motion {
            from,
            to: target,
            started: now,
            duration,
        };
        Ok(())
    }

    async fn is_settled(&self) -> anyhow::Result<bool> {
        Ok(self.motion.lock().is_done(Instant::now()))
    }
}

/// Motion controller with `n_stages` stages under `stages`.
pub fn mock_motion_controller(
    name: &str,
    n_stages: usize,
    driver: Driver,
    axis_config: &AxisConfig,
) -> Instrument {
    let stages: Vec<Arc<dyn Axis>> = (0..n_stages)
        .map(|i| -> Arc<dyn Axis> {
            let stage = format!("{name}.stages[{i}]");
            match driver {
                Driver::Mock => Arc::new(SimulatedAxis::writable(stage, Value::Float(0.0))),
                Driver::Hardware => Arc::new(
                    ProxiedAxis::new(stage, Arc::new(MockStageDriver::default()))
                        .with_backoff(Backoff::from(axis_config)),
                ),
            }
        })
        .collect();
    Instrument::new(name).with_axis_list("stages", stages)
}

/// Detector reading a noisy value around 5.
pub fn mock_scalar_detector(name: &str) -> Instrument {
    Instrument::new(name).with_axis(
        "device",
        Arc::new(SimulatedAxis::read_only(format!("{name}.device"), || {
            Value::Float(5.0 + rand::thread_rng().gen_range(-0.05..0.05))
        })),
    )
}

/// Camera reading `width × height` frames of noise.
pub fn mock_image_detector(name: &str, width: usize, height: usize) -> Instrument {
    Instrument::new(name).with_axis(
        "image",
        Arc::new(SimulatedAxis::read_only(format!("{name}.image"), move || {
            let mut rng = rand::thread_rng();
            Value::Array {
                shape: vec![height, width],
                data: (0..width * height).map(|_| rng.gen_range(0.0..1.0)).collect(),
            }
        })),
    )
}

/// Ranges offered by [`mock_power_meter`], full scale in watts.
pub fn power_meter_ranges() -> Vec<Choice> {
    [("1mW", 1e-3), ("10mW", 1e-2), ("100mW", 1e-1), ("1W", 1.0)]
        .into_iter()
        .map(|(key, value)| Choice {
            key: key.to_string(),
            value: Value::Float(value),
        })
        .collect()
}

/// Power meter whose reading scales with its `range` property.
pub fn mock_power_meter(name: &str) -> AppResult<Instrument> {
    let range = Arc::new(Property::choice("range", power_meter_ranges())?);
    let reading = Arc::clone(&range);
    Ok(Instrument::new(name)
        .with_axis(
            "device",
            Arc::new(SimulatedAxis::read_only(format!("{name}.device"), move || {
                let full_scale = reading.get().as_f64().unwrap_or(1.0);
                Value::Float(full_scale * rand::thread_rng().gen_range(0.4..0.6))
            })),
        )
        .with_shared_property(range))
}

/// The standard bench: `mc` with two stages, `det`, `cam` and `pm`.
pub fn mock_registry(driver: Driver, axis_config: &AxisConfig) -> AppResult<InstrumentRegistry> {
    Ok(InstrumentRegistry::new()
        .with(mock_motion_controller("mc", 2, driver, axis_config))
        .with(mock_scalar_detector("det"))
        .with(mock_image_detector("cam", 4, 3))
        .with(mock_power_meter("pm")?))
}

/// Direct-control scan sampling `det.device` against a sample counter.
pub fn drift_scan() -> DirectScan {
    DirectScan::new("drift", |config, instruments| {
        let n = config.get_usize("n_samples")?;
        let path = AxisPath::parse("det.device");
        let detector = instruments.axis(&path)?;
        let stream = futures::stream::iter(0..n).then(move |i| {
            let detector = Arc::clone(&detector);
            let path = path.clone();
            async move {
                let value = detector.read().await?;
                Ok::<_, DaqError>(vec![
                    (AxisPath::parse("drift.sample"), Value::Int(i as i64)),
                    (path, value),
                ])
            }
        });
        Ok(stream.boxed())
    })
    .with_fields(vec![FieldSpec::new("n_samples", 20)])
    .collate(
        vec![(AxisPath::parse("drift.sample"), "sample".to_string())],
        vec![(AxisPath::parse("det.device"), "signal".to_string())],
    )
}

/// Experiment over [`mock_registry`] with the bench scans registered.
///
/// - `line`: stage 0 against the scalar detector
/// - `grid`: both stages against the scalar detector
/// - `images`: stage 0 against the camera
/// - `ranges`: every power meter range
/// - `drift`: see [`drift_scan`]
pub fn bench_experiment(settings: &Settings, instruments: Arc<InstrumentRegistry>) -> Experiment {
    Experiment::new(settings, instruments)
        .with_method(
            scan("line")
                .axis("x", ScanAxis::new("mc.stages[0]").with_limits(0.0, 10.0))
                .read("signal", "det.device"),
        )
        .with_method(
            scan("grid")
                .axis("x", ScanAxis::new("mc.stages[0]").with_limits(0.0, 10.0))
                .axis("y", ScanAxis::new("mc.stages[1]").with_limits(0.0, 10.0))
                .read("signal", "det.device"),
        )
        .with_method(
            scan("images")
                .axis("x", ScanAxis::new("mc.stages[0]").with_limits(0.0, 10.0))
                .read("frame", "cam.image"),
        )
        .with_method(
            scan("ranges")
                .axis("range", ScanChoiceProperty::new("pm.range", power_meter_ranges()))
                .read("power", "pm.device"),
        )
        .with_method(drift_scan())
}
