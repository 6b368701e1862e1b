//! Scan methods and the sequences they build.
//!
//! A [`ScanMethod`] turns a [`ScanConfig`] into a [`Sequence`]:
//!
//! - [`Sequence::Inverted`]: a pull iterator of [`SequenceEvent`]s. The
//!   orchestrator takes one step per tick and dispatches its intents
//!   concurrently.
//! - [`Sequence::Direct`]: an async stream that talks to hardware itself and
//!   yields recorded data. The orchestrator drains it in one tick.
//!
//! [`scan`] builds the common inverted case: a Cartesian product of degrees
//! of freedom with a set of reads at every location.

use futures::stream::BoxStream;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::collation::Collation;
use crate::error::AppResult;
use crate::instrument::{InstrumentRegistry, ScopeAccessors};
use crate::value::{AxisPath, Value};

use super::{Coordinate, DaqIntent, DegreeOfFreedom, FieldSpec, ScanConfig};

/// One item of an inverted-control sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum SequenceEvent {
    /// Open a point.
    BeginPoint,
    /// Close the open point.
    EndPoint,
    /// Intents dispatched together as one step.
    Step(Vec<DaqIntent>),
    /// Free-form note recorded in the run metadata.
    Comment(String),
}

/// Pull-based sequence.
pub type InvertedSequence = Box<dyn Iterator<Item = SequenceEvent> + Send>;

/// Push-based sequence; every item is one point of recorded data.
pub type DirectSequence = BoxStream<'static, AppResult<Vec<(AxisPath, Value)>>>;

/// What a scan method builds for a run.
pub enum Sequence {
    /// Orchestrator pulls and dispatches steps.
    Inverted(InvertedSequence),
    /// User code drives hardware and streams results.
    Direct(DirectSequence),
}

impl Sequence {
    /// Whether this is inverted control.
    pub fn is_inverted(&self) -> bool {
        matches!(self, Sequence::Inverted(_))
    }
}

/// What a scan method sees while building its sequence.
pub struct SequenceContext {
    scopes: ScopeAccessors,
    instruments: Arc<InstrumentRegistry>,
    collation: Option<Collation>,
    comments: Vec<String>,
}

impl SequenceContext {
    /// Context over `instruments`, with scopes resolved up front.
    pub fn new(instruments: Arc<InstrumentRegistry>) -> Self {
        Self {
            scopes: ScopeAccessors::resolve(&instruments),
            instruments,
            collation: None,
            comments: Vec::new(),
        }
    }

    /// Read-only scope accessors for building intents.
    pub fn scopes(&self) -> &ScopeAccessors {
        &self.scopes
    }

    /// The registry, for direct-control sequences.
    pub fn instruments(&self) -> Arc<InstrumentRegistry> {
        Arc::clone(&self.instruments)
    }

    /// Declare how this run's data is collated.
    pub fn collate(
        &mut self,
        independent: Vec<(AxisPath, String)>,
        dependent: Vec<(AxisPath, String)>,
    ) {
        self.collation = Some(Collation::new(independent, dependent));
    }

    /// Record a comment in the run metadata.
    pub fn comment(&mut self, comment: impl Into<String>) {
        self.comments.push(comment.into());
    }

    /// Take the declared collation.
    pub fn take_collation(&mut self) -> Option<Collation> {
        self.collation.take()
    }

    /// Take recorded comments.
    pub fn take_comments(&mut self) -> Vec<String> {
        std::mem::take(&mut self.comments)
    }
}

/// A user-selectable measurement procedure.
pub trait ScanMethod: Send + Sync {
    /// Unique name.
    fn name(&self) -> &str;

    /// Configuration fields.
    fn fields(&self) -> Vec<FieldSpec>;

    /// Configuration with every default.
    fn default_config(&self) -> ScanConfig {
        ScanConfig::from_fields(&self.fields())
    }

    /// Number of points for `config`, if known in advance.
    fn n_points(&self, _config: &ScanConfig) -> Option<usize> {
        None
    }

    /// Build the sequence for one run.
    fn build(&self, config: &ScanConfig, ctx: &mut SequenceContext) -> AppResult<Sequence>;
}

/// Start building an inverted-control scan.
pub fn scan(name: impl Into<String>) -> Scan {
    Scan {
        name: name.into(),
        axes: Vec::new(),
        reads: Vec::new(),
        setup: Vec::new(),
        teardown: Vec::new(),
    }
}

/// Cartesian product of degrees of freedom with reads at every location.
///
/// Each location becomes one point: a step of writes followed by a step of
/// reads. The last axis varies fastest.
pub struct Scan {
    name: String,
    axes: Vec<(String, Arc<dyn DegreeOfFreedom>)>,
    reads: Vec<(String, AxisPath)>,
    setup: Vec<DaqIntent>,
    teardown: Vec<DaqIntent>,
}

impl Scan {
    /// Add a degree of freedom under `name`.
    pub fn axis(mut self, name: impl Into<String>, dof: impl DegreeOfFreedom + 'static) -> Self {
        self.axes.push((name.into(), Arc::new(dof)));
        self
    }

    /// Read `path` at every location, collated as `name`.
    pub fn read(mut self, name: impl Into<String>, path: impl Into<AxisPath>) -> Self {
        self.reads.push((name.into(), path.into()));
        self
    }

    /// Step dispatched before the first point.
    pub fn setup(mut self, intents: Vec<DaqIntent>) -> Self {
        self.setup = intents;
        self
    }

    /// Step dispatched after the last point.
    pub fn teardown(mut self, intents: Vec<DaqIntent>) -> Self {
        self.teardown = intents;
        self
    }
}

impl ScanMethod for Scan {
    fn name(&self) -> &str {
        &self.name
    }

    fn fields(&self) -> Vec<FieldSpec> {
        self.axes
            .iter()
            .flat_map(|(name, dof)| dof.fields(name))
            .collect()
    }

    fn n_points(&self, config: &ScanConfig) -> Option<usize> {
        self.axes.iter().try_fold(1usize, |acc, (name, dof)| {
            let count = dof.iterate(config, name).ok()?.count();
            acc.checked_mul(count)
        })
    }

    fn build(&self, config: &ScanConfig, ctx: &mut SequenceContext) -> AppResult<Sequence> {
        let independent = self
            .axes
            .iter()
            .flat_map(|(name, dof)| dof.independent(name))
            .collect();
        let dependent = self
            .reads
            .iter()
            .map(|(name, path)| (path.clone(), name.clone()))
            .collect();
        ctx.collate(independent, dependent);

        // Writes per coordinate, per axis. The product only indexes into these.
        let mut writes: Vec<Vec<Vec<DaqIntent>>> = Vec::with_capacity(self.axes.len());
        for (name, dof) in &self.axes {
            let coordinates: Vec<Coordinate> = dof.iterate(config, name)?.collect();
            writes.push(
                coordinates
                    .iter()
                    .map(|c| dof.write(c))
                    .collect::<AppResult<_>>()?,
            );
        }

        let reads: Vec<DaqIntent> = self
            .reads
            .iter()
            .map(|(_, path)| DaqIntent::read(path.clone()))
            .collect();

        let mut pending = VecDeque::new();
        if !self.setup.is_empty() {
            pending.push_back(SequenceEvent::Step(self.setup.clone()));
        }

        Ok(Sequence::Inverted(Box::new(ProductSequence {
            odometer: Odometer::new(writes.iter().map(Vec::len).collect()),
            writes,
            reads,
            teardown: Some(self.teardown.clone()).filter(|t| !t.is_empty()),
            pending,
        })))
    }
}

/// Mixed-radix counter over axis lengths; the last digit turns fastest.
struct Odometer {
    lengths: Vec<usize>,
    current: Option<Vec<usize>>,
    started: bool,
}

impl Odometer {
    fn new(lengths: Vec<usize>) -> Self {
        Self {
            lengths,
            current: None,
            started: false,
        }
    }
}

impl Iterator for Odometer {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if !self.started {
            self.started = true;
            if self.lengths.iter().any(|&l| l == 0) {
                return None;
            }
            self.current = Some(vec![0; self.lengths.len()]);
            return self.current.clone();
        }

        let current = self.current.as_mut()?;
        for digit in (0..current.len()).rev() {
            current[digit] += 1;
            if current[digit] < self.lengths[digit] {
                return Some(current.clone());
            }
            current[digit] = 0;
        }
        self.current = None;
        None
    }
}

struct ProductSequence {
    odometer: Odometer,
    writes: Vec<Vec<Vec<DaqIntent>>>,
    reads: Vec<DaqIntent>,
    teardown: Option<Vec<DaqIntent>>,
    pending: VecDeque<SequenceEvent>,
}

impl Iterator for ProductSequence {
    type Item = SequenceEvent;

    fn next(&mut self) -> Option<SequenceEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }

        match self.odometer.next() {
            Some(location) => {
                let step: Vec<DaqIntent> = location
                    .iter()
                    .enumerate()
                    .flat_map(|(axis, &i)| self.writes[axis][i].iter().cloned())
                    .collect();
                self.pending.push_back(SequenceEvent::Step(step));
                if !self.reads.is_empty() {
                    self.pending.push_back(SequenceEvent::Step(self.reads.clone()));
                }
                self.pending.push_back(SequenceEvent::EndPoint);
                Some(SequenceEvent::BeginPoint)
            }
            None => self.teardown.take().map(SequenceEvent::Step),
        }
    }
}

type DirectProducer =
    Arc<dyn Fn(&ScanConfig, Arc<InstrumentRegistry>) -> AppResult<DirectSequence> + Send + Sync>;

/// Direct-control scan backed by a stream-producing closure.
pub struct DirectScan {
    name: String,
    fields: Vec<FieldSpec>,
    independent: Vec<(AxisPath, String)>,
    dependent: Vec<(AxisPath, String)>,
    producer: DirectProducer,
}

impl DirectScan {
    /// Scan whose data comes from `producer`.
    pub fn new(
        name: impl Into<String>,
        producer: impl Fn(&ScanConfig, Arc<InstrumentRegistry>) -> AppResult<DirectSequence>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            independent: Vec::new(),
            dependent: Vec::new(),
            producer: Arc::new(producer),
        }
    }

    /// Declare configuration fields.
    pub fn with_fields(mut self, fields: Vec<FieldSpec>) -> Self {
        self.fields = fields;
        self
    }

    /// Declare the collation for produced data.
    pub fn collate(
        mut self,
        independent: Vec<(AxisPath, String)>,
        dependent: Vec<(AxisPath, String)>,
    ) -> Self {
        self.independent = independent;
        self.dependent = dependent;
        self
    }
}

impl ScanMethod for DirectScan {
    fn name(&self) -> &str {
        &self.name
    }

    fn fields(&self) -> Vec<FieldSpec> {
        self.fields.clone()
    }

    fn build(&self, config: &ScanConfig, ctx: &mut SequenceContext) -> AppResult<Sequence> {
        if !self.independent.is_empty() || !self.dependent.is_empty() {
            ctx.collate(self.independent.clone(), self.dependent.clone());
        }
        Ok(Sequence::Direct((self.producer)(config, ctx.instruments())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{ScanAxis, StaircaseProduct};

    fn line() -> Scan {
        scan("line")
            .axis("x", ScanAxis::new("mc.stages[0]"))
            .read("power", "pm.device")
    }

    fn events(method: &dyn ScanMethod, config: &ScanConfig) -> (Vec<SequenceEvent>, SequenceContext) {
        let mut ctx = SequenceContext::new(Arc::new(InstrumentRegistry::new()));
        match method.build(config, &mut ctx).unwrap() {
            Sequence::Inverted(seq) => (seq.collect(), ctx),
            Sequence::Direct(_) => panic!("expected inverted sequence"),
        }
    }

    #[test]
    fn odometer_turns_last_digit_fastest() {
        let locations: Vec<Vec<usize>> = Odometer::new(vec![2, 3]).collect();
        assert_eq!(
            locations,
            vec![
                vec![0, 0],
                vec![0, 1],
                vec![0, 2],
                vec![1, 0],
                vec![1, 1],
                vec![1, 2]
            ]
        );
        assert_eq!(Odometer::new(vec![2, 0]).count(), 0);
        assert_eq!(Odometer::new(vec![]).count(), 1);
    }

    #[test]
    fn line_scan_brackets_each_point() {
        let method = line();
        let config = method.default_config().with("n_x", 2).with("stop_x", 1.0);
        assert_eq!(method.n_points(&config), Some(2));

        let (events, mut ctx) = events(&method, &config);
        assert_eq!(
            events,
            vec![
                SequenceEvent::BeginPoint,
                SequenceEvent::Step(vec![DaqIntent::write("mc.stages[0]", 0.0)]),
                SequenceEvent::Step(vec![DaqIntent::read("pm.device")]),
                SequenceEvent::EndPoint,
                SequenceEvent::BeginPoint,
                SequenceEvent::Step(vec![DaqIntent::write("mc.stages[0]", 1.0)]),
                SequenceEvent::Step(vec![DaqIntent::read("pm.device")]),
                SequenceEvent::EndPoint,
            ]
        );

        let collation = ctx.take_collation().unwrap();
        assert_eq!(collation.independent_names(), vec!["x"]);
        assert_eq!(collation.dependent_names(), vec!["power"]);
    }

    #[test]
    fn product_of_axes_and_setup_teardown() {
        let method = scan("grid")
            .axis("x", ScanAxis::new("mc.stages[0]"))
            .axis("y", ScanAxis::new("mc.stages[1]"))
            .setup(vec![DaqIntent::set("pm.range", 1)])
            .teardown(vec![DaqIntent::write("mc.stages[0]", 0.0)]);
        let config = method
            .default_config()
            .with("n_x", 2)
            .with("n_y", 3);
        assert_eq!(method.n_points(&config), Some(6));

        let (events, _) = events(&method, &config);
        assert_eq!(events.first(), Some(&SequenceEvent::Step(vec![DaqIntent::set("pm.range", 1)])));
        assert_eq!(
            events.last(),
            Some(&SequenceEvent::Step(vec![DaqIntent::write("mc.stages[0]", 0.0)]))
        );
        let points = events.iter().filter(|e| **e == SequenceEvent::BeginPoint).count();
        assert_eq!(points, 6);
    }

    #[test]
    fn staircase_axis_mounts_with_prefixed_fields() {
        let method = scan("stairs").axis(
            "xy",
            StaircaseProduct::new(ScanAxis::new("mc.stages[0]"), ScanAxis::new("mc.stages[1]")),
        );
        let names: Vec<String> = method.fields().into_iter().map(|f| f.name).collect();
        assert!(names.contains(&"n_outer_xy".to_string()));
        assert!(names.contains(&"stop_inner_xy".to_string()));

        let config = method
            .default_config()
            .with("n_outer_xy", 2)
            .with("n_inner_xy", 2);
        assert_eq!(method.n_points(&config), Some(4));
    }

    #[test]
    fn sequences_restart_per_build() {
        let method = line();
        let config = method.default_config().with("n_x", 3);
        let (first, _) = events(&method, &config);
        let (second, _) = events(&method, &config);
        assert_eq!(first, second);
    }
}
