//! Integration tests for the experiment lifecycle against the mock bench.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tracing_test::traced_test;

use scan_daq::actor::Actor;
use scan_daq::app::DaqApp;
use scan_daq::collation::Dataset;
use scan_daq::config::Settings;
use scan_daq::experiment::{
    Experiment, ExperimentEvent, ExperimentMessage, ExperimentState, ExperimentUi, FnInterlock,
    Progress, Run, RunSaver, Transition,
};
use scan_daq::fsm::FsmActor;
use scan_daq::mock::{self, Driver};
use scan_daq::scan::{scan, ScanAxis, ScanConfig};
use scan_daq::value::{AxisPath, Value};
use scan_daq::AppResult;

/// Keeps every saved run in memory.
#[derive(Default)]
struct RecordingSaver {
    runs: Mutex<Vec<(Run, Option<Dataset>)>>,
}

impl RunSaver for RecordingSaver {
    fn name(&self) -> &str {
        "recording"
    }

    fn save(&self, run: &Run, dataset: Option<&Dataset>, _directory: &Path) -> AppResult<()> {
        self.runs.lock().push((run.clone(), dataset.cloned()));
        Ok(())
    }
}

/// Keeps every soft update.
#[derive(Default)]
struct RecordingUi {
    updates: Mutex<Vec<Progress>>,
}

impl ExperimentUi for RecordingUi {
    fn soft_update(&self, progress: Progress) {
        self.updates.lock().push(progress);
    }
}

impl RecordingUi {
    fn points(&self) -> Vec<u64> {
        self.updates.lock().iter().map(|p| p.point).collect()
    }
}

fn test_settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.application.user = "tester".into();
    settings.application.session_name = "bench".into();
    settings.experiment.idle_tick_ms = 1;
    settings.experiment.data_directory = dir.join("data");
    settings.experiment.state_directory = dir.join("state");
    settings
}

fn bench(settings: &Settings, saver: &Arc<RecordingSaver>) -> Experiment {
    let instruments = Arc::new(mock::mock_registry(Driver::Mock, &settings.axis).unwrap());
    let shared: Arc<dyn RunSaver> = saver.clone();
    mock::bench_experiment(settings, instruments).with_saver(shared)
}

async fn prepared(experiment: Experiment) -> FsmActor<Experiment> {
    let mut actor = FsmActor::new(experiment).unwrap();
    actor.prepare().await.unwrap();
    actor
}

async fn tick_until(actor: &mut FsmActor<Experiment>, state: ExperimentState) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while actor.state() != state {
            actor.tick().await.unwrap();
        }
    })
    .await
    .expect("experiment did not reach the expected state");
}

fn line_config(n: i64) -> ScanConfig {
    ScanConfig::default()
        .with("n_x", n)
        .with("start_x", 0.0)
        .with("stop_x", (n - 1) as f64)
}

#[tokio::test]
async fn queued_runs_autoplay_then_exit() {
    let dir = tempdir().unwrap();
    let mut settings = test_settings(dir.path());
    settings.experiment.auto_start = true;
    settings.experiment.exit_after_finish = true;

    let saver = Arc::new(RecordingSaver::default());
    let mut experiment = bench(&settings, &saver);
    experiment.enqueue("line", line_config(3)).unwrap();
    experiment.enqueue("line", line_config(5)).unwrap();
    let mut events = experiment.subscribe();

    let actor = FsmActor::new(experiment).unwrap();
    let instruments = Arc::new(mock::mock_registry(Driver::Mock, &settings.axis).unwrap());
    tokio::time::timeout(
        Duration::from_secs(10),
        DaqApp::new(settings, instruments).with_actor(actor).run(),
    )
    .await
    .unwrap()
    .unwrap();

    let mut runs = saver.runs.lock().clone();
    runs.sort_by_key(|(run, _)| run.number);
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].0.number, 1);
    assert_eq!(runs[1].0.number, 2);
    assert_eq!(runs[0].0.point, 3);
    assert_eq!(runs[1].0.point, 5);
    assert_eq!(runs[0].0.user, "tester");

    let dataset = runs[1].1.as_ref().unwrap();
    assert_eq!(dataset.coords["x"], vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    assert_eq!(dataset.data_vars["signal"].shape, vec![5]);

    let mut saved = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ExperimentEvent::RunSaved { run, .. } = event {
            saved.push(run);
        }
    }
    saved.sort_unstable();
    assert_eq!(saved, vec![1, 2]);
}

#[tokio::test]
#[traced_test]
async fn failing_interlock_aborts_start() {
    let dir = tempdir().unwrap();
    let settings = test_settings(dir.path());
    let saver = Arc::new(RecordingSaver::default());
    let mut experiment = bench(&settings, &saver).with_interlock(FnInterlock::new("door", || async {
        Err::<(), _>(anyhow::anyhow!("door open"))
    }));
    experiment.enqueue("line", line_config(3)).unwrap();

    let mut actor = prepared(experiment).await;
    tick_until(&mut actor, ExperimentState::Idle).await;
    actor.address().unwrap().put(Transition::Start.into()).unwrap();
    tick_until(&mut actor, ExperimentState::Running).await;
    tick_until(&mut actor, ExperimentState::Idle).await;

    assert_eq!(actor.behavior().run_number(), 0);
    assert_eq!(actor.behavior().queue().count(), 1);
    assert!(saver.runs.lock().is_empty());
    assert!(logs_contain("door open"));
}

#[tokio::test]
async fn every_step_lands_inside_a_point() {
    let dir = tempdir().unwrap();
    let mut settings = test_settings(dir.path());
    settings.experiment.save_on_main = true;
    let saver = Arc::new(RecordingSaver::default());
    let mut experiment = bench(&settings, &saver);
    let grid = experiment
        .scan_config("grid")
        .unwrap()
        .clone()
        .with("n_x", 2)
        .with("n_y", 3);
    experiment.set_config("grid", grid).unwrap();
    experiment.select_method("grid").unwrap();

    let mut actor = prepared(experiment).await;
    actor.address().unwrap().put(ExperimentMessage::StartRun).unwrap();
    tick_until(&mut actor, ExperimentState::Running).await;
    tick_until(&mut actor, ExperimentState::Idle).await;

    let runs = saver.runs.lock();
    let (run, dataset) = &runs[0];
    assert_eq!(run.point, 6);
    assert_eq!(run.point_started.len(), 6);
    assert_eq!(run.point_ended.len(), 6);
    // A write step and a read step per point
    assert_eq!(run.step, 12);
    assert!(run.steps_taken.iter().all(|s| s.point < 6));

    let signal = &run.daq_values[&AxisPath::parse("det.device")];
    let points: Vec<u64> = signal.iter().map(|r| r.point).collect();
    assert_eq!(points, vec![0, 1, 2, 3, 4, 5]);

    let dataset = dataset.as_ref().unwrap();
    assert_eq!(dataset.data_vars["signal"].shape, vec![2, 3]);
    assert_eq!(dataset.data_vars["signal"].dims, vec!["x", "y"]);
}

#[tokio::test]
#[traced_test]
async fn failed_step_stops_and_still_saves() {
    let dir = tempdir().unwrap();
    let mut settings = test_settings(dir.path());
    settings.experiment.save_on_main = true;
    let saver = Arc::new(RecordingSaver::default());
    let instruments = Arc::new(mock::mock_registry(Driver::Mock, &settings.axis).unwrap());
    let shared: Arc<dyn RunSaver> = saver.clone();
    let experiment = Experiment::new(&settings, instruments)
        .with_saver(shared)
        .with_method(scan("broken").axis("x", ScanAxis::new("det.device")));

    let mut actor = prepared(experiment).await;
    actor.address().unwrap().put(ExperimentMessage::StartRun).unwrap();
    tick_until(&mut actor, ExperimentState::Running).await;
    tick_until(&mut actor, ExperimentState::Idle).await;

    let runs = saver.runs.lock();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].0.comments.iter().any(|c| c.comment.starts_with("Stopped after error")));
    assert!(logs_contain("Step failed"));
}

#[tokio::test]
async fn manual_run_executes_remote_commands() {
    let dir = tempdir().unwrap();
    let mut settings = test_settings(dir.path());
    settings.experiment.save_on_main = true;
    let saver = Arc::new(RecordingSaver::default());
    let ui = Arc::new(RecordingUi::default());
    let shared: Arc<dyn ExperimentUi> = ui.clone();
    let mut actor = prepared(bench(&settings, &saver).with_ui(shared)).await;
    let address = actor.address().unwrap();
    let stage = AxisPath::parse("mc.stages[1]");

    address.put(Transition::StartManual.into()).unwrap();
    tick_until(&mut actor, ExperimentState::Running).await;
    address
        .put(ExperimentMessage::WriteAxis {
            path: stage.clone(),
            value: Value::Float(2.5),
        })
        .unwrap();
    address
        .put(ExperimentMessage::ReadAxis { path: stage.clone() })
        .unwrap();
    for _ in 0..5 {
        actor.tick().await.unwrap();
    }
    address.put(ExperimentMessage::StopRun).unwrap();
    tick_until(&mut actor, ExperimentState::Idle).await;

    let runs = saver.runs.lock();
    let run = &runs[0].0;
    assert_eq!(run.method, "manual");
    assert_eq!(run.point, 2);
    let values: Vec<Value> = run.daq_values[&stage].iter().map(|r| r.data.clone()).collect();
    assert_eq!(values, vec![Value::Float(2.5), Value::Float(2.5)]);
    assert_eq!(ui.points(), vec![1, 2]);
}

#[tokio::test]
async fn axis_commands_outside_a_run_broadcast_values() {
    let dir = tempdir().unwrap();
    let settings = test_settings(dir.path());
    let saver = Arc::new(RecordingSaver::default());
    let experiment = bench(&settings, &saver);
    let mut events = experiment.subscribe();
    let mut actor = prepared(experiment).await;
    let stage = AxisPath::parse("mc.stages[0]");

    actor
        .address()
        .unwrap()
        .put(ExperimentMessage::WriteAxis {
            path: stage.clone(),
            value: Value::Float(1.25),
        })
        .unwrap();
    actor.tick().await.unwrap();
    actor.tick().await.unwrap();

    let mut seen = None;
    while let Ok(event) = events.try_recv() {
        if let ExperimentEvent::AxisValue { path, value } = event {
            seen = Some((path, value));
        }
    }
    assert_eq!(seen, Some((stage, Value::Float(1.25))));
    assert_eq!(actor.behavior().run_number(), 0);
}

#[tokio::test]
async fn shutdown_persists_the_active_run() {
    let dir = tempdir().unwrap();
    let settings = test_settings(dir.path());
    let saver = Arc::new(RecordingSaver::default());
    let mut experiment = bench(&settings, &saver);
    experiment.set_config("line", line_config(1000)).unwrap();
    let mut actor = prepared(experiment).await;
    let address = actor.address().unwrap();

    address.put(ExperimentMessage::StartRun).unwrap();
    tick_until(&mut actor, ExperimentState::Running).await;
    for _ in 0..10 {
        actor.tick().await.unwrap();
    }
    address.put(ExperimentMessage::RequestShutdown).unwrap();

    tokio::time::timeout(Duration::from_secs(10), actor.run())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(actor.state(), ExperimentState::Shutdown);

    let runs = saver.runs.lock();
    assert_eq!(runs.len(), 1);
    assert!(runs[0].0.point < 1000);
    assert!(runs[0].0.end_time.is_some());
}

#[tokio::test]
async fn direct_scan_collates_samples() {
    let dir = tempdir().unwrap();
    let mut settings = test_settings(dir.path());
    settings.experiment.save_on_main = true;
    let saver = Arc::new(RecordingSaver::default());
    let ui = Arc::new(RecordingUi::default());
    let shared: Arc<dyn ExperimentUi> = ui.clone();
    let mut experiment = bench(&settings, &saver).with_ui(shared);
    experiment
        .set_config("drift", ScanConfig::default().with("n_samples", 4))
        .unwrap();
    experiment.select_method("drift").unwrap();

    let mut actor = prepared(experiment).await;
    actor.address().unwrap().put(ExperimentMessage::StartRun).unwrap();
    tick_until(&mut actor, ExperimentState::Running).await;
    tick_until(&mut actor, ExperimentState::Idle).await;

    let runs = saver.runs.lock();
    let (run, dataset) = &runs[0];
    assert!(!run.is_inverted);
    assert_eq!(run.point, 4);
    assert_eq!(ui.points(), vec![1, 2, 3, 4]);
    let dataset = dataset.as_ref().unwrap();
    assert_eq!(dataset.coords["sample"], vec![0.0, 1.0, 2.0, 3.0]);
    assert!(dataset.data_vars["signal"]
        .data
        .iter()
        .all(|v| (v - 5.0).abs() < 0.1));
}

#[tokio::test]
async fn discarded_runs_are_not_saved() {
    let dir = tempdir().unwrap();
    let mut settings = test_settings(dir.path());
    settings.experiment.discard_data = true;
    let saver = Arc::new(RecordingSaver::default());
    let mut experiment = bench(&settings, &saver);
    experiment.set_config("line", line_config(2)).unwrap();

    let mut actor = prepared(experiment).await;
    actor.address().unwrap().put(ExperimentMessage::StartRun).unwrap();
    tick_until(&mut actor, ExperimentState::Running).await;
    tick_until(&mut actor, ExperimentState::Idle).await;

    assert_eq!(actor.behavior().run_number(), 1);
    assert!(saver.runs.lock().is_empty());
}
