//! Reordering strategies.
//!
//! Strategies are pure sequence transforms applied after a degree of freedom
//! has produced its coordinates, chained left to right:
//!
//! ```rust,ignore
//! let x = ScanAxis::new("mc.stages[0]")
//!     .step(Strategy::ForwardsAndBackwards)
//!     .step(Strategy::Only(5));
//! ```

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::AppResult;
use crate::value::AxisPath;

use super::{Coordinate, Coordinates, DaqIntent, DegreeOfFreedom, FieldSpec, ScanConfig};

/// A sequence transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Shuffle.
    Randomly,
    /// Shuffle with a fixed seed.
    RandomlySeeded(u64),
    /// Reverse.
    Backwards,
    /// The sequence followed by its reverse.
    ForwardsAndBackwards,
    /// The first `n` items.
    Only(usize),
}

impl Strategy {
    /// Apply to a sequence.
    pub fn apply(self, mut items: Vec<Coordinate>) -> Vec<Coordinate> {
        match self {
            Strategy::Randomly => {
                items.shuffle(&mut rand::thread_rng());
                items
            }
            Strategy::RandomlySeeded(seed) => {
                items.shuffle(&mut StdRng::seed_from_u64(seed));
                items
            }
            Strategy::Backwards => {
                items.reverse();
                items
            }
            Strategy::ForwardsAndBackwards => {
                let back: Vec<Coordinate> = items.iter().rev().cloned().collect();
                items.extend(back);
                items
            }
            Strategy::Only(n) => {
                items.truncate(n);
                items
            }
        }
    }
}

/// A degree of freedom with strategies applied to its sequence.
pub struct SimpleStrategyScan {
    inner: Box<dyn DegreeOfFreedom>,
    strategies: Vec<Strategy>,
}

impl SimpleStrategyScan {
    /// Wrap `inner` with no strategies.
    pub fn new(inner: impl DegreeOfFreedom + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            strategies: Vec::new(),
        }
    }

    /// Append a strategy to the chain.
    pub fn step(mut self, strategy: Strategy) -> Self {
        self.strategies.push(strategy);
        self
    }

    /// Strategies in application order.
    pub fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }
}

impl DegreeOfFreedom for SimpleStrategyScan {
    fn fields(&self, name: &str) -> Vec<FieldSpec> {
        self.inner.fields(name)
    }

    fn iterate(&self, config: &ScanConfig, name: &str) -> AppResult<Coordinates> {
        let items: Vec<Coordinate> = self.inner.iterate(config, name)?.collect();
        let items = self
            .strategies
            .iter()
            .fold(items, |items, strategy| strategy.apply(items));
        Ok(Box::new(items.into_iter()))
    }

    fn write(&self, coordinate: &Coordinate) -> AppResult<Vec<DaqIntent>> {
        self.inner.write(coordinate)
    }

    fn independent(&self, name: &str) -> Vec<(AxisPath, String)> {
        self.inner.independent(name)
    }
}

/// `.step(strategy)` on any degree of freedom.
pub trait StepExt: DegreeOfFreedom + Sized + 'static {
    /// Wrap in a [`SimpleStrategyScan`] with `strategy` applied.
    fn step(self, strategy: Strategy) -> SimpleStrategyScan {
        SimpleStrategyScan::new(self).step(strategy)
    }
}

impl<D: DegreeOfFreedom + Sized + 'static> StepExt for D {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::ScanAxis;

    fn numbers(xs: &[f64]) -> Vec<Coordinate> {
        xs.iter().copied().map(Coordinate::from).collect()
    }

    fn three_points() -> (ScanConfig, ScanAxis) {
        let config = ScanConfig::default()
            .with("n_x", 3)
            .with("start_x", 0.0)
            .with("stop_x", 2.0);
        (config, ScanAxis::new("mc.stages[0]"))
    }

    #[test]
    fn forwards_and_backwards_mirrors() {
        let (config, x) = three_points();
        let scan = x.step(Strategy::ForwardsAndBackwards);
        let coords: Vec<Coordinate> = scan.iterate(&config, "x").unwrap().collect();
        assert_eq!(coords, numbers(&[0.0, 1.0, 2.0, 2.0, 1.0, 0.0]));
    }

    #[test]
    fn strategies_chain_left_to_right() {
        let (config, x) = three_points();
        let scan = x
            .step(Strategy::ForwardsAndBackwards)
            .step(Strategy::Only(5));
        let coords: Vec<Coordinate> = scan.iterate(&config, "x").unwrap().collect();
        assert_eq!(coords, numbers(&[0.0, 1.0, 2.0, 2.0, 1.0]));

        let (config, x) = three_points();
        let scan = x.step(Strategy::Backwards).step(Strategy::Only(2));
        let coords: Vec<Coordinate> = scan.iterate(&config, "x").unwrap().collect();
        assert_eq!(coords, numbers(&[2.0, 1.0]));
    }

    #[test]
    fn randomly_is_a_permutation() {
        let config = ScanConfig::default()
            .with("n_x", 20)
            .with("start_x", 0.0)
            .with("stop_x", 19.0);
        let scan = ScanAxis::new("mc.stages[0]").step(Strategy::Randomly);
        let mut values: Vec<f64> = scan
            .iterate(&config, "x")
            .unwrap()
            .map(|c| c.value().unwrap().to_f64().unwrap())
            .collect();
        values.sort_by(f64::total_cmp);
        assert_eq!(values, (0..20).map(f64::from).collect::<Vec<_>>());
    }

    #[test]
    fn seeded_shuffle_is_reproducible() {
        let (config, _) = three_points();
        let a = ScanAxis::new("a").step(Strategy::RandomlySeeded(7));
        let b = ScanAxis::new("a").step(Strategy::RandomlySeeded(7));
        let xs: Vec<Coordinate> = a.iterate(&config, "x").unwrap().collect();
        let ys: Vec<Coordinate> = b.iterate(&config, "x").unwrap().collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn wrapper_delegates_fields_and_writes() {
        let scan = ScanAxis::new("mc.stages[0]").step(Strategy::Backwards);
        assert_eq!(scan.fields("x").len(), 3);
        assert_eq!(scan.strategies(), &[Strategy::Backwards]);
        assert_eq!(
            scan.write(&Coordinate::from(1.0)).unwrap(),
            vec![DaqIntent::write("mc.stages[0]", 1.0)]
        );
    }
}
