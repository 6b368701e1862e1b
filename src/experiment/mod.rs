//! Experiment orchestrator.
//!
//! [`Experiment`] is an [`FsmBehavior`] driven by an [`FsmActor`]. It owns the
//! scan methods, their configurations and the run queue, and executes one
//! [`Run`] at a time against an [`InstrumentRegistry`].
//!
//! # Lifecycle
//!
//! - `Startup → Idle` on `Initialize`, posted at prepare time.
//! - `Idle → Running` on `Start`/`StartManual`: interlocks run first. A
//!   failure is logged and a `Stop` is posted. Otherwise the next queued scan
//!   (or the selected method's configuration) is built into a sequence.
//! - While `Running`, each tick takes one step of an inverted sequence and
//!   dispatches its intents concurrently, or drains a direct sequence. An
//!   exhausted sequence or a failed step posts `Stop`.
//! - `Running|Paused → Idle` persists the run and continues the queue when
//!   autoplay is engaged.
//! - `Shutdown` persists any active run on the orchestrator task, waits for
//!   background saves and stops the actor.
//!
//! Messages that match no transition are logged and ignored.
//!
//! [`FsmActor`]: crate::fsm::FsmActor

pub mod interlock;
pub mod registrar;
pub mod run;
pub mod save;
pub mod state;
pub mod ui;

pub use interlock::{AxisRangeInterlock, FnInterlock, Interlock};
pub use registrar::{MetadataEntry, MetadataRegistrar};
pub use run::{PointScope, Run, RunSummary, StepRecord, TimedComment};
pub use save::{JsonSaver, RunSaver};
pub use state::{ExperimentEvent, ExperimentMessage, ExperimentState, QueuedScan, Transition};
pub use ui::{ExperimentUi, HeadlessUi, LogUi, Progress};

use async_trait::async_trait;
use futures::future::try_join_all;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::actor::{Address, Flow};
use crate::collation::Collation;
use crate::config::{ExperimentConfig, Settings};
use crate::error::{AppResult, DaqError};
use crate::fsm::{FsmBehavior, HookFuture, Hooks, Rule, StateTable, TransitionContext};
use crate::instrument::InstrumentRegistry;
use crate::scan::{
    DaqIntent, DaqOp, DirectSequence, InvertedSequence, ScanConfig, ScanMethod, Sequence,
    SequenceContext, SequenceEvent,
};
use crate::value::{AxisPath, Value};

const EVENT_CAPACITY: usize = 1024;
const MANUAL_METHOD: &str = "manual";

type Ctx = TransitionContext<ExperimentState, ExperimentMessage>;
type ExperimentRule = Rule<ExperimentState, ExperimentMessage>;

/// Where the active run's steps come from.
enum Driver {
    Manual,
    Inverted(InvertedSequence),
    Direct(DirectSequence),
    Done,
}

struct ActiveRun {
    run: Run,
    driver: Driver,
    collation: Option<Collation>,
    total: Option<usize>,
}

/// Run-independent state kept across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ExperimentAtRest {
    selected: Option<String>,
    configs: BTreeMap<String, ScanConfig>,
    queue: Vec<QueuedScan>,
    history: Vec<QueuedScan>,
    run_number: u64,
}

/// The orchestrator behavior.
pub struct Experiment {
    name: String,
    config: ExperimentConfig,
    user: String,
    session: String,
    instruments: Arc<InstrumentRegistry>,
    methods: BTreeMap<String, Arc<dyn ScanMethod>>,
    selected: Option<String>,
    configs: BTreeMap<String, ScanConfig>,
    queue: VecDeque<QueuedScan>,
    history: Vec<QueuedScan>,
    autoplay: bool,
    run_number: u64,
    active: Option<ActiveRun>,
    remote: VecDeque<DaqIntent>,
    interlocks: Vec<Arc<dyn Interlock>>,
    ui: Arc<dyn ExperimentUi>,
    saver: Arc<dyn RunSaver>,
    registrar: MetadataRegistrar,
    events: broadcast::Sender<ExperimentEvent>,
    pending_saves: Vec<JoinHandle<()>>,
}

impl Experiment {
    /// Headless experiment saving JSON under the configured data directory.
    pub fn new(settings: &Settings, instruments: Arc<InstrumentRegistry>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            name: "experiment".to_string(),
            config: settings.experiment.clone(),
            user: settings.application.user.clone(),
            session: settings.application.session_name.clone(),
            instruments,
            methods: BTreeMap::new(),
            selected: None,
            configs: BTreeMap::new(),
            queue: VecDeque::new(),
            history: Vec::new(),
            autoplay: false,
            run_number: 0,
            active: None,
            remote: VecDeque::new(),
            interlocks: Vec::new(),
            ui: Arc::new(HeadlessUi),
            saver: Arc::new(JsonSaver::new()),
            registrar: MetadataRegistrar::new(),
            events,
            pending_saves: Vec::new(),
        }
    }

    /// Register a scan method. The first one registered is selected.
    pub fn with_method(mut self, method: impl ScanMethod + 'static) -> Self {
        let name = method.name().to_string();
        self.configs
            .entry(name.clone())
            .or_insert_with(|| method.default_config());
        if self.selected.is_none() {
            self.selected = Some(name.clone());
        }
        self.methods.insert(name, Arc::new(method));
        self
    }

    /// Add an interlock, checked in insertion order.
    pub fn with_interlock(mut self, interlock: impl Interlock + 'static) -> Self {
        self.interlocks.push(Arc::new(interlock));
        self
    }

    /// Attach a UI.
    pub fn with_ui(mut self, ui: Arc<dyn ExperimentUi>) -> Self {
        self.ui = ui;
        self
    }

    /// Replace the run saver.
    pub fn with_saver(mut self, saver: Arc<dyn RunSaver>) -> Self {
        self.saver = saver;
        self
    }

    /// Share a metadata registrar with instruments.
    pub fn with_registrar(mut self, registrar: MetadataRegistrar) -> Self {
        self.registrar = registrar;
        self
    }

    /// Metadata registrar drained into every run.
    pub fn registrar(&self) -> &MetadataRegistrar {
        &self.registrar
    }

    /// Live event feed.
    pub fn subscribe(&self) -> broadcast::Receiver<ExperimentEvent> {
        self.events.subscribe()
    }

    /// Registered scan method names.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// A registered scan method.
    pub fn method(&self, name: &str) -> Option<&Arc<dyn ScanMethod>> {
        self.methods.get(name)
    }

    /// Method used when the queue is empty.
    pub fn selected_method(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Select the method used when the queue is empty.
    pub fn select_method(&mut self, name: &str) -> AppResult<()> {
        self.known_method(name)?;
        self.selected = Some(name.to_string());
        Ok(())
    }

    /// Stored configuration of a method.
    pub fn scan_config(&self, method: &str) -> Option<&ScanConfig> {
        self.configs.get(method)
    }

    /// Replace the stored configuration of a method.
    pub fn set_config(&mut self, method: &str, config: ScanConfig) -> AppResult<()> {
        self.known_method(method)?;
        self.configs.insert(method.to_string(), config);
        Ok(())
    }

    /// Append a scan to the queue.
    pub fn enqueue(&mut self, method: &str, config: ScanConfig) -> AppResult<()> {
        self.known_method(method)?;
        self.queue.push_back(QueuedScan {
            method: method.to_string(),
            config,
        });
        Ok(())
    }

    /// Queued scans in order.
    pub fn queue(&self) -> impl Iterator<Item = &QueuedScan> {
        self.queue.iter()
    }

    /// Scans started so far, oldest first.
    pub fn history(&self) -> &[QueuedScan] {
        &self.history
    }

    /// Number of the latest run.
    pub fn run_number(&self) -> u64 {
        self.run_number
    }

    /// Whether the queue continues after each run.
    pub fn is_autoplaying(&self) -> bool {
        self.autoplay
    }

    /// The active run.
    pub fn current_run(&self) -> Option<&Run> {
        self.active.as_ref().map(|a| &a.run)
    }

    /// Point progress of the active run.
    pub fn current_progress(&self) -> Option<Progress> {
        self.active.as_ref().map(|a| progress(&a.run, a.total))
    }

    fn known_method(&self, name: &str) -> AppResult<()> {
        if self.methods.contains_key(name) {
            Ok(())
        } else {
            Err(DaqError::ScanMisconfigured(format!("unknown scan method '{name}'")))
        }
    }

    fn emit(&self, event: ExperimentEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn comment(&mut self, comment: &str) {
        if let Some(active) = self.active.as_mut() {
            active.run.comment(comment);
            let run = active.run.number;
            self.emit(ExperimentEvent::Comment {
                run,
                comment: comment.to_string(),
            });
        }
    }

    fn next_scan(&mut self) -> AppResult<QueuedScan> {
        if let Some(scan) = self.queue.pop_front() {
            self.autoplay = true;
            return Ok(scan);
        }
        self.autoplay = false;
        let method = self
            .selected
            .clone()
            .ok_or_else(|| DaqError::ScanMisconfigured("no scan method selected".into()))?;
        let config = self.configs.get(&method).cloned().unwrap_or_default();
        Ok(QueuedScan { method, config })
    }

    fn build_run(&mut self, scan: QueuedScan) -> AppResult<ActiveRun> {
        let method = self
            .methods
            .get(&scan.method)
            .cloned()
            .ok_or_else(|| DaqError::ScanMisconfigured(format!("unknown scan method '{}'", scan.method)))?;

        let mut ctx = SequenceContext::new(Arc::clone(&self.instruments));
        let sequence = method.build(&scan.config, &mut ctx)?;
        let mut run = Run::new(
            self.run_number,
            self.user.clone(),
            self.session.clone(),
            scan.method.clone(),
            scan.config.clone(),
            sequence.is_inverted(),
        );
        for comment in ctx.take_comments() {
            run.comment(comment);
        }
        let total = method.n_points(&scan.config);
        self.history.push(scan);

        Ok(ActiveRun {
            run,
            driver: match sequence {
                Sequence::Inverted(s) => Driver::Inverted(s),
                Sequence::Direct(s) => Driver::Direct(s),
            },
            collation: ctx.take_collation(),
            total,
        })
    }

    #[instrument(skip(self), fields(run = self.run_number + 1))]
    fn start_run(&mut self, manual: bool) -> AppResult<()> {
        self.run_number += 1;
        let active = if manual {
            self.autoplay = false;
            ActiveRun {
                run: Run::new(
                    self.run_number,
                    self.user.clone(),
                    self.session.clone(),
                    MANUAL_METHOD,
                    ScanConfig::default(),
                    true,
                ),
                driver: Driver::Manual,
                collation: None,
                total: None,
            }
        } else {
            let scan = self.next_scan()?;
            self.build_run(scan)?
        };

        info!(method = %active.run.method, total = ?active.total, "Run started");
        self.emit(ExperimentEvent::RunStarted {
            run: active.run.number,
            method: active.run.method.clone(),
            n_points: active.total,
        });
        if let Some(collation) = &active.collation {
            self.emit(ExperimentEvent::Collation {
                independent: collation.independent_names().iter().map(|s| s.to_string()).collect(),
                dependent: collation.dependent_names().iter().map(|s| s.to_string()).collect(),
            });
        }
        self.active = Some(active);
        Ok(())
    }

    /// One unit of work for the active run.
    async fn run_tick(&mut self, address: &Address<ExperimentMessage>) -> AppResult<()> {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        let ActiveRun {
            run,
            driver,
            collation,
            total,
        } = active;

        let exhausted: AppResult<bool> = match driver {
            Driver::Inverted(sequence) => match sequence.next() {
                Some(SequenceEvent::BeginPoint) => {
                    run.begin_point();
                    Ok(false)
                }
                Some(SequenceEvent::EndPoint) => {
                    run.end_point();
                    self.ui.soft_update(progress(run, *total));
                    Ok(false)
                }
                Some(SequenceEvent::Step(intents)) => {
                    take_step(&self.instruments, run, collation.as_mut(), &intents, &self.events)
                        .await
                        .map(|()| false)
                }
                Some(SequenceEvent::Comment(comment)) => {
                    let _ = self.events.send(ExperimentEvent::Comment {
                        run: run.number,
                        comment: comment.clone(),
                    });
                    run.comment(comment);
                    Ok(false)
                }
                None => Ok(true),
            },
            Driver::Direct(stream) => {
                drain_direct(stream, run, collation.as_mut(), self.ui.as_ref(), *total, &self.events)
                    .await
                    .map(|()| true)
            }
            Driver::Manual => match self.remote.pop_front() {
                Some(intent) => {
                    run.begin_point();
                    let result =
                        take_step(&self.instruments, run, None, &[intent], &self.events).await;
                    run.end_point();
                    self.ui.soft_update(progress(run, *total));
                    result.map(|()| false)
                }
                None => {
                    tokio::time::sleep(self.config.idle_tick()).await;
                    Ok(false)
                }
            },
            Driver::Done => return Ok(()),
        };

        match exhausted {
            Ok(false) => Ok(()),
            Ok(true) => {
                debug!(run = run.number, "Sequence exhausted");
                *driver = Driver::Done;
                address.put(Transition::Stop.into())
            }
            Err(e) => {
                error!(run = run.number, step = run.step, error = %e, "Step failed, stopping run");
                let comment = format!("Stopped after error: {e}");
                let _ = self.events.send(ExperimentEvent::Comment {
                    run: run.number,
                    comment: comment.clone(),
                });
                run.comment(comment);
                *driver = Driver::Done;
                address.put(Transition::Stop.into())
            }
        }
    }

    /// Close and persist the active run. Returns whether there was one.
    fn finish_run(&mut self, on_main: bool) -> bool {
        let Some(mut active) = self.active.take() else {
            return false;
        };
        active.run.metadata.extend(self.registrar.collect());
        active.run.finalize();
        info!(
            run = active.run.number,
            points = active.run.point,
            steps = active.run.step,
            "Run finished"
        );

        if self.config.discard_data {
            info!(run = active.run.number, "Discarding run data");
            return true;
        }

        let number = active.run.number;
        let job = SaveJob {
            run: active.run,
            collation: active.collation,
            saver: Arc::clone(&self.saver),
            template: self.config.save_format.clone(),
            base: self.config.data_directory.clone(),
        };
        let events = self.events.clone();

        if on_main || self.config.save_on_main {
            report_save(&events, number, job.execute());
        } else {
            self.pending_saves.push(tokio::spawn(async move {
                let result = tokio::task::spawn_blocking(move || job.execute())
                    .await
                    .unwrap_or_else(|e| Err(DaqError::Persistence(format!("save task failed: {e}"))));
                report_save(&events, number, result);
            }));
        }
        true
    }

    /// Queue continuation after a run ends.
    fn continue_queue(&mut self, finished: bool, address: &Address<ExperimentMessage>) -> AppResult<()> {
        if finished && self.autoplay && !self.queue.is_empty() {
            info!(remaining = self.queue.len(), "Starting next queued scan");
            return address.put(Transition::Start.into());
        }
        self.autoplay = false;
        if self.config.exit_after_finish && self.queue.is_empty() {
            info!("Queue finished, shutting down");
            return address.put(Transition::Shutdown.into());
        }
        Ok(())
    }

    fn reap_saves(&mut self) {
        self.pending_saves.retain(|handle| !handle.is_finished());
    }

    async fn drain_saves(&mut self) {
        let pending = std::mem::take(&mut self.pending_saves);
        if !pending.is_empty() {
            info!(count = pending.len(), "Waiting for background saves");
        }
        for handle in pending {
            if let Err(e) = handle.await {
                error!(error = %e, "Background save panicked");
            }
        }
    }

    async fn axis_command(&mut self, intent: DaqIntent) {
        match perform(&self.instruments, &intent).await {
            Ok(value) => {
                debug!(%intent, %value, "Axis command complete");
                self.emit(ExperimentEvent::AxisValue {
                    path: intent.path,
                    value,
                });
            }
            Err(e) => warn!(%intent, error = %e, "Axis command failed"),
        }
    }
}

struct SaveJob {
    run: Run,
    collation: Option<Collation>,
    saver: Arc<dyn RunSaver>,
    template: String,
    base: PathBuf,
}

impl SaveJob {
    fn execute(self) -> AppResult<PathBuf> {
        let directory = self.run.save_directory(&self.template, &self.base)?;
        let dataset = match &self.collation {
            Some(collation) => match collation.to_dataset(&self.run.daq_values) {
                Ok(dataset) => dataset,
                Err(e) => {
                    warn!(run = self.run.number, error = %e, "Collation failed, saving raw data only");
                    None
                }
            },
            None => None,
        };
        self.saver.save(&self.run, dataset.as_ref(), &directory)?;
        Ok(directory)
    }
}

fn report_save(
    events: &broadcast::Sender<ExperimentEvent>,
    run: u64,
    result: AppResult<PathBuf>,
) {
    let event = match result {
        Ok(directory) => {
            info!(run, directory = %directory.display(), "Run saved");
            ExperimentEvent::RunSaved { run, directory }
        }
        Err(e) => {
            error!(run, error = %e, "Failed to save run");
            ExperimentEvent::SaveFailed {
                run,
                error: e.to_string(),
            }
        }
    };
    let _ = events.send(event);
}

async fn check_interlocks(
    interlocks: &[Arc<dyn Interlock>],
    instruments: &InstrumentRegistry,
) -> AppResult<()> {
    for interlock in interlocks {
        interlock
            .check(instruments)
            .await
            .map_err(|e| DaqError::Interlock(format!("{}: {e}", interlock.name())))?;
    }
    Ok(())
}

/// Execute one intent, returning the value to record.
async fn perform(instruments: &InstrumentRegistry, intent: &DaqIntent) -> AppResult<Value> {
    match &intent.op {
        DaqOp::Read => instruments.axis(&intent.path)?.read().await,
        DaqOp::Write(value) => {
            instruments.axis(&intent.path)?.write(value.clone()).await?;
            Ok(value.clone())
        }
        DaqOp::Set(value) => {
            instruments.property(&intent.path)?.set(value.clone())?;
            Ok(value.clone())
        }
    }
}

/// Dispatch a step's intents concurrently and record the results.
async fn take_step(
    instruments: &InstrumentRegistry,
    run: &mut Run,
    mut collation: Option<&mut Collation>,
    intents: &[DaqIntent],
    events: &broadcast::Sender<ExperimentEvent>,
) -> AppResult<()> {
    let values = try_join_all(intents.iter().map(|intent| perform(instruments, intent))).await?;
    for (intent, value) in intents.iter().zip(values) {
        if !matches!(intent.op, DaqOp::Read) {
            if let Some(collation) = collation.as_deref_mut() {
                collation.receive(&intent.path, &value);
            }
        }
        record(run, &intent.path, value, events);
    }
    run.record_step(intents);
    Ok(())
}

/// Drain a direct-control stream; every item is one point.
async fn drain_direct(
    stream: &mut DirectSequence,
    run: &mut Run,
    mut collation: Option<&mut Collation>,
    ui: &dyn ExperimentUi,
    total: Option<usize>,
    events: &broadcast::Sender<ExperimentEvent>,
) -> AppResult<()> {
    while let Some(item) = stream.next().await {
        let values = item?;
        {
            let mut point = run.point();
            for (path, value) in values {
                if let Some(collation) = collation.as_deref_mut() {
                    collation.receive(&path, &value);
                }
                record(point.run(), &path, value, events);
            }
            point.run().record_step(&[]);
        }
        ui.soft_update(progress(run, total));
    }
    Ok(())
}

fn progress(run: &Run, total: Option<usize>) -> Progress {
    Progress {
        run: run.number,
        point: run.point,
        total,
    }
}

fn record(run: &mut Run, path: &AxisPath, value: Value, events: &broadcast::Sender<ExperimentEvent>) {
    let _ = events.send(ExperimentEvent::Data {
        run: run.number,
        path: path.clone(),
        value: value.clone(),
        step: run.step,
        point: run.point,
    });
    run.record_data(path, value);
}

fn is_message(message: &ExperimentMessage, transition: Transition) -> bool {
    match message {
        ExperimentMessage::Transition(t) => *t == transition,
        ExperimentMessage::StartRun => transition == Transition::Start,
        ExperimentMessage::PauseRun => transition == Transition::Pause,
        ExperimentMessage::StopRun => transition == Transition::Stop,
        ExperimentMessage::RequestShutdown => transition == Transition::Shutdown,
        _ => false,
    }
}

fn on(transition: Transition, to: ExperimentState) -> ExperimentRule {
    Rule::when(move |m| is_message(m, transition), to)
}

fn startup_to_idle<'a>(exp: &'a mut Experiment, ctx: &'a Ctx) -> HookFuture<'a> {
    Box::pin(async move {
        if exp.config.auto_start {
            info!("Auto-starting");
            ctx.address.put(Transition::Start.into())?;
        }
        Ok(())
    })
}

fn idle_to_running<'a>(exp: &'a mut Experiment, ctx: &'a Ctx) -> HookFuture<'a> {
    Box::pin(async move {
        if let Err(e) = check_interlocks(&exp.interlocks, &exp.instruments).await {
            warn!(error = %e, "Interlock failed, start aborted");
            return ctx.address.put(Transition::Stop.into());
        }
        let manual = ctx.trigger == ExperimentMessage::Transition(Transition::StartManual);
        if let Err(e) = exp.start_run(manual) {
            error!(error = %e, "Could not start run");
            return ctx.address.put(Transition::Stop.into());
        }
        Ok(())
    })
}

fn finish_to_idle<'a>(exp: &'a mut Experiment, ctx: &'a Ctx) -> HookFuture<'a> {
    Box::pin(async move {
        let finished = exp.finish_run(false);
        exp.ui.running_to_idle();
        exp.continue_queue(finished, &ctx.address)
    })
}

fn finish_to_shutdown<'a>(exp: &'a mut Experiment, _ctx: &'a Ctx) -> HookFuture<'a> {
    Box::pin(async move {
        exp.finish_run(true);
        Ok(())
    })
}

fn enter_idle<'a>(exp: &'a mut Experiment, _ctx: &'a Ctx) -> HookFuture<'a> {
    Box::pin(async move {
        exp.ui.enter_idle();
        Ok(())
    })
}

fn enter_running<'a>(exp: &'a mut Experiment, _ctx: &'a Ctx) -> HookFuture<'a> {
    Box::pin(async move {
        exp.ui.enter_running();
        Ok(())
    })
}

fn enter_paused<'a>(exp: &'a mut Experiment, _ctx: &'a Ctx) -> HookFuture<'a> {
    Box::pin(async move {
        exp.comment("Paused");
        exp.ui.enter_paused();
        Ok(())
    })
}

fn leave_paused<'a>(exp: &'a mut Experiment, _ctx: &'a Ctx) -> HookFuture<'a> {
    Box::pin(async move {
        exp.comment("Unpaused");
        Ok(())
    })
}

#[async_trait]
impl FsmBehavior for Experiment {
    type State = ExperimentState;
    type Message = ExperimentMessage;

    fn name(&self) -> &str {
        &self.name
    }

    fn starting_state(&self) -> ExperimentState {
        ExperimentState::Startup
    }

    fn state_table(&self) -> StateTable<ExperimentState, ExperimentMessage> {
        use ExperimentState::*;
        StateTable::new()
            .state(
                Startup,
                vec![on(Transition::Initialize, Idle), on(Transition::Shutdown, Shutdown)],
            )
            .state(
                Idle,
                vec![
                    on(Transition::Start, Running),
                    on(Transition::StartManual, Running),
                    on(Transition::Shutdown, Shutdown),
                ],
            )
            .state(
                Running,
                vec![
                    on(Transition::Pause, Paused),
                    on(Transition::Stop, Idle),
                    on(Transition::Shutdown, Shutdown),
                ],
            )
            .state(
                Paused,
                vec![
                    on(Transition::Start, Running),
                    on(Transition::Stop, Idle),
                    on(Transition::Shutdown, Shutdown),
                ],
            )
            .state(Shutdown, vec![])
    }

    fn hooks(&self) -> Hooks<Self> {
        use ExperimentState::*;
        Hooks::new()
            .on_transition(Startup, Idle, startup_to_idle)
            .on_transition(Idle, Running, idle_to_running)
            .on_transition(Running, Idle, finish_to_idle)
            .on_transition(Paused, Idle, finish_to_idle)
            .on_transition(Running, Shutdown, finish_to_shutdown)
            .on_transition(Paused, Shutdown, finish_to_shutdown)
            .on_enter(Idle, enter_idle)
            .on_enter(Running, enter_running)
            .on_enter(Paused, enter_paused)
            .on_leave(Paused, leave_paused)
    }

    async fn on_prepare(&mut self, address: &Address<ExperimentMessage>) -> AppResult<()> {
        address.put(Transition::Initialize.into())
    }

    async fn handle_message(
        &mut self,
        state: ExperimentState,
        message: ExperimentMessage,
        _address: &Address<ExperimentMessage>,
    ) -> AppResult<Flow> {
        match message {
            ExperimentMessage::SetScanConfig { method, config } => {
                if let Err(e) = self.set_config(&method, config) {
                    warn!(error = %e, "Ignoring scan configuration");
                }
            }
            ExperimentMessage::SelectMethod(name) => {
                if let Err(e) = self.select_method(&name) {
                    warn!(error = %e, "Ignoring method selection");
                }
            }
            ExperimentMessage::Enqueue { index } => {
                let scan = match index {
                    Some(i) => self.history.get(i).cloned(),
                    None => self.selected.clone().map(|method| QueuedScan {
                        config: self.configs.get(&method).cloned().unwrap_or_default(),
                        method,
                    }),
                };
                match scan {
                    Some(scan) => {
                        debug!(method = %scan.method, "Queued scan");
                        self.queue.push_back(scan);
                    }
                    None => warn!(?index, "Nothing to enqueue"),
                }
            }
            ExperimentMessage::ReadAxis { path } => {
                self.route_axis_command(state, DaqIntent::read(path)).await;
            }
            ExperimentMessage::WriteAxis { path, value } => {
                self.route_axis_command(state, DaqIntent::write(path, value)).await;
            }
            other => {
                warn!(%state, message = ?other, "Ignoring message with no transition from this state");
            }
        }
        Ok(Flow::Continue)
    }

    async fn run_state(
        &mut self,
        state: ExperimentState,
        address: &Address<ExperimentMessage>,
    ) -> AppResult<Flow> {
        match state {
            ExperimentState::Startup => Ok(Flow::Continue),
            ExperimentState::Idle | ExperimentState::Paused => {
                tokio::time::sleep(self.config.idle_tick()).await;
                self.reap_saves();
                self.ui.update_timing_ui(self.current_progress());
                Ok(Flow::Continue)
            }
            ExperimentState::Running => {
                self.run_tick(address).await?;
                Ok(Flow::Continue)
            }
            ExperimentState::Shutdown => {
                self.drain_saves().await;
                info!(runs = self.run_number, "Experiment shut down");
                Ok(Flow::Stop)
            }
        }
    }

    fn on_state_changed(&mut self, from: ExperimentState, to: ExperimentState) {
        info!(%from, %to, "Experiment state changed");
        self.emit(ExperimentEvent::StateChanged { from, to });
    }

    fn collect_state(&self) -> Option<serde_json::Value> {
        let state = ExperimentAtRest {
            selected: self.selected.clone(),
            configs: self.configs.clone(),
            queue: self.queue.iter().cloned().collect(),
            history: self.history.clone(),
            run_number: self.run_number,
        };
        match serde_json::to_value(state) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "Failed to collect experiment state");
                None
            }
        }
    }

    fn receive_state(&mut self, state: serde_json::Value) -> AppResult<()> {
        let state: ExperimentAtRest = serde_json::from_value(state)?;
        self.run_number = self.run_number.max(state.run_number);
        for (method, config) in state.configs {
            if self.methods.contains_key(&method) {
                self.configs.insert(method, config);
            } else {
                debug!(%method, "Dropping configuration for unknown method");
            }
        }
        if let Some(selected) = state.selected.filter(|m| self.methods.contains_key(m)) {
            self.selected = Some(selected);
        }
        let known: Vec<QueuedScan> = state
            .queue
            .into_iter()
            .filter(|scan| self.methods.contains_key(&scan.method))
            .collect();
        self.queue.extend(known);
        self.history = state.history;
        Ok(())
    }
}

impl Experiment {
    async fn route_axis_command(&mut self, state: ExperimentState, intent: DaqIntent) {
        let manual = state.has_run()
            && matches!(self.active.as_ref().map(|a| &a.driver), Some(Driver::Manual));
        if manual {
            self.remote.push_back(intent);
        } else {
            self.axis_command(intent).await;
        }
    }
}
