//! Composite degrees of freedom.

use crate::error::{AppResult, DaqError};
use crate::value::AxisPath;

use super::{Coordinate, Coordinates, DaqIntent, DegreeOfFreedom, FieldSpec, ScanConfig};

/// Outer x inner product with serpentine inner order.
///
/// The inner sequence reverses direction every time the outer coordinate
/// advances, so the outer axis only ever moves forward. Fields are prefixed
/// `outer_` and `inner_`: for name `xy`, `n_outer_xy`, `start_inner_xy`, ...
pub struct StaircaseProduct {
    outer: Box<dyn DegreeOfFreedom>,
    inner: Box<dyn DegreeOfFreedom>,
}

impl StaircaseProduct {
    /// Staircase over `outer` and `inner`.
    pub fn new(outer: impl DegreeOfFreedom + 'static, inner: impl DegreeOfFreedom + 'static) -> Self {
        Self {
            outer: Box::new(outer),
            inner: Box::new(inner),
        }
    }
}

impl DegreeOfFreedom for StaircaseProduct {
    fn fields(&self, name: &str) -> Vec<FieldSpec> {
        let mut fields = self.outer.fields(&format!("outer_{name}"));
        fields.extend(self.inner.fields(&format!("inner_{name}")));
        fields
    }

    fn iterate(&self, config: &ScanConfig, name: &str) -> AppResult<Coordinates> {
        let outer = self.outer.iterate(config, &format!("outer_{name}"))?;
        let forward: Vec<Coordinate> = self.inner.iterate(config, &format!("inner_{name}"))?.collect();
        let backward: Vec<Coordinate> = forward.iter().rev().cloned().collect();

        Ok(Box::new(outer.enumerate().flat_map(move |(i, o)| {
            let inner = if i % 2 == 0 { forward.clone() } else { backward.clone() };
            inner
                .into_iter()
                .map(move |v| Coordinate::Tuple(vec![o.clone(), v]))
        })))
    }

    fn write(&self, coordinate: &Coordinate) -> AppResult<Vec<DaqIntent>> {
        let parts = coordinate.components(2)?;
        let mut intents = self.outer.write(&parts[0])?;
        intents.extend(self.inner.write(&parts[1])?);
        Ok(intents)
    }

    fn independent(&self, name: &str) -> Vec<(AxisPath, String)> {
        let mut axes = self.outer.independent(&format!("outer_{name}"));
        axes.extend(self.inner.independent(&format!("inner_{name}")));
        axes
    }
}

/// Positional zip of several degrees of freedom.
///
/// Every component must iterate to the same length; a mismatch is reported
/// as [`DaqError::ScanMisconfigured`] rather than truncated. Fields are
/// prefixed by component index: for name `xyz`, `n_0_xyz`, `n_1_xyz`, ...
pub struct ScanTogether {
    parts: Vec<Box<dyn DegreeOfFreedom>>,
}

impl ScanTogether {
    /// Empty zip; add components with [`with`](Self::with).
    pub fn new() -> Self {
        Self { parts: Vec::new() }
    }

    /// Add a component.
    pub fn with(mut self, dof: impl DegreeOfFreedom + 'static) -> Self {
        self.parts.push(Box::new(dof));
        self
    }

    fn part_name(i: usize, name: &str) -> String {
        format!("{i}_{name}")
    }
}

impl Default for ScanTogether {
    fn default() -> Self {
        Self::new()
    }
}

impl DegreeOfFreedom for ScanTogether {
    fn fields(&self, name: &str) -> Vec<FieldSpec> {
        self.parts
            .iter()
            .enumerate()
            .flat_map(|(i, part)| part.fields(&Self::part_name(i, name)))
            .collect()
    }

    fn iterate(&self, config: &ScanConfig, name: &str) -> AppResult<Coordinates> {
        let sequences = self
            .parts
            .iter()
            .enumerate()
            .map(|(i, part)| -> AppResult<Vec<Coordinate>> {
                Ok(part.iterate(config, &Self::part_name(i, name))?.collect())
            })
            .collect::<AppResult<Vec<Vec<Coordinate>>>>()?;

        let lengths: Vec<usize> = sequences.iter().map(Vec::len).collect();
        let len = lengths.first().copied().unwrap_or(0);
        if lengths.iter().any(|&l| l != len) {
            return Err(DaqError::ScanMisconfigured(format!(
                "'{name}' zips sequences of unequal length {lengths:?}"
            )));
        }

        Ok(Box::new((0..len).map(move |i| {
            Coordinate::Tuple(sequences.iter().map(|s| s[i].clone()).collect())
        })))
    }

    fn write(&self, coordinate: &Coordinate) -> AppResult<Vec<DaqIntent>> {
        let parts = coordinate.components(self.parts.len())?;
        let mut intents = Vec::new();
        for (dof, part) in self.parts.iter().zip(parts) {
            intents.extend(dof.write(part)?);
        }
        Ok(intents)
    }

    fn independent(&self, name: &str) -> Vec<(AxisPath, String)> {
        self.parts
            .iter()
            .enumerate()
            .flat_map(|(i, part)| part.independent(&Self::part_name(i, name)))
            .collect()
    }
}
