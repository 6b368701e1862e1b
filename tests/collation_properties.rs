//! Integration tests for collating recorded runs into datasets.

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use scan_daq::actor::Actor;
use scan_daq::axis::{Axis, SimulatedAxis};
use scan_daq::collation::{Collation, Dataset};
use scan_daq::config::Settings;
use scan_daq::experiment::{Experiment, ExperimentMessage, ExperimentState, Run};
use scan_daq::fsm::FsmActor;
use scan_daq::instrument::{Choice, Instrument, InstrumentRegistry, Property};
use scan_daq::scan::{scan, ScanAxis, ScanChoiceProperty, ScanConfig, ScanMethod, StaircaseProduct};
use scan_daq::value::{AxisPath, Value};

#[test]
fn shuffled_points_collate_in_ascending_order() {
    let x = AxisPath::parse("mc.stages[0]");
    let y = AxisPath::parse("pm.device");
    let mut order: Vec<i64> = (0..10).collect();
    order.shuffle(&mut rand::rngs::StdRng::seed_from_u64(7));

    let mut collation = Collation::new(vec![(x.clone(), "x".into())], vec![(y.clone(), "y".into())]);
    let mut run = Run::new(1, "u", "s", "line", ScanConfig::default(), true);
    for i in order {
        let mut point = run.point();
        point.record(&x, Value::Int(i));
        point.record(&y, Value::Int(i * i));
        collation.receive(&x, &Value::Int(i));
    }
    run.finalize();

    let dataset = collation.to_dataset(&run.daq_values).unwrap().unwrap();
    let expected: Vec<f64> = (0..10).map(|i| (i * i) as f64).collect();
    assert_eq!(dataset.coords["x"], (0..10).map(f64::from).collect::<Vec<_>>());
    assert_eq!(dataset.data_vars["y"].shape, vec![10]);
    assert_eq!(dataset.data_vars["y"].data, expected);
    assert_eq!(dataset.attrs["n_points"], 10);
}

/// Two stages and a detector reading `10 * outer + inner`.
fn plane() -> Arc<InstrumentRegistry> {
    let cells = Arc::new(Mutex::new([0.0f64; 2]));
    let stage = |name: &str, index: usize| -> Arc<dyn Axis> {
        let (read, write) = (Arc::clone(&cells), Arc::clone(&cells));
        Arc::new(SimulatedAxis::with_mocks(
            name,
            move || Value::Float(read.lock()[index]),
            move |v: &Value| write.lock()[index] = v.as_f64().unwrap_or(f64::NAN),
        ))
    };
    let stages = vec![stage("outer", 0), stage("inner", 1)];
    let detector = {
        let cells = Arc::clone(&cells);
        SimulatedAxis::read_only("det", move || {
            let [outer, inner] = *cells.lock();
            Value::Float(10.0 * outer + inner)
        })
    };
    Arc::new(
        InstrumentRegistry::new()
            .with(Instrument::new("mc").with_axis_list("stages", stages))
            .with(Instrument::new("det").with_axis("device", Arc::new(detector))),
    )
}

fn settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.experiment.idle_tick_ms = 1;
    settings.experiment.save_on_main = true;
    settings.experiment.data_directory = dir.to_path_buf();
    settings
}

/// Run the selected scan once and load its collated dataset.
async fn collate_one_run(experiment: Experiment, dir: &Path) -> Dataset {
    let mut actor = FsmActor::new(experiment).unwrap();
    actor.prepare().await.unwrap();
    actor.address().unwrap().put(ExperimentMessage::StartRun).unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while actor.state() != ExperimentState::Running {
            actor.tick().await.unwrap();
        }
        while actor.state() != ExperimentState::Idle {
            actor.tick().await.unwrap();
        }
    })
    .await
    .unwrap();

    serde_json::from_reader(
        std::fs::File::open(dir.join("global/default/1/collated.json")).unwrap(),
    )
    .unwrap()
}

#[tokio::test]
async fn staircase_run_rebuilds_the_grid() {
    let dir = tempfile::tempdir().unwrap();
    let method = scan("stairs")
        .axis(
            "xy",
            StaircaseProduct::new(ScanAxis::new("mc.stages[0]"), ScanAxis::new("mc.stages[1]")),
        )
        .read("signal", "det.device");
    let config = method
        .default_config()
        .with("n_outer_xy", 3)
        .with("start_outer_xy", 0.0)
        .with("stop_outer_xy", 2.0)
        .with("n_inner_xy", 4)
        .with("start_inner_xy", 0.0)
        .with("stop_inner_xy", 3.0);

    let mut experiment = Experiment::new(&settings(dir.path()), plane()).with_method(method);
    experiment.set_config("stairs", config).unwrap();
    let collated = collate_one_run(experiment, dir.path()).await;

    let signal = &collated.data_vars["signal"];
    assert_eq!(signal.dims, vec!["outer_xy", "inner_xy"]);
    assert_eq!(signal.shape, vec![3, 4]);
    for o in 0..3 {
        for i in 0..4 {
            assert_eq!(signal.get(&[o, i]), Some(10.0 * o as f64 + i as f64));
        }
    }
}

/// Filter wheel with text-valued positions and a detector behind it.
fn filter_wheel() -> (Arc<InstrumentRegistry>, Vec<Choice>) {
    let choices: Vec<Choice> = ["open", "blue", "red"]
        .into_iter()
        .map(|key| Choice {
            key: key.to_string(),
            value: Value::Text(key.to_uppercase()),
        })
        .collect();
    let filter = Arc::new(Property::choice("filter", choices.clone()).unwrap());
    let seen = Arc::clone(&filter);
    let detector = SimulatedAxis::read_only("det", move || match seen.get() {
        Value::Text(t) if t == "BLUE" => Value::Float(1.0),
        Value::Text(t) if t == "OPEN" => Value::Float(2.0),
        _ => Value::Float(3.0),
    });
    let registry = InstrumentRegistry::new().with(
        Instrument::new("wheel")
            .with_shared_property(filter)
            .with_axis("device", Arc::new(detector)),
    );
    (Arc::new(registry), choices)
}

#[tokio::test]
async fn text_choice_run_collates_on_labels() {
    let dir = tempfile::tempdir().unwrap();
    let (instruments, choices) = filter_wheel();
    let method = scan("filters")
        .axis("filter", ScanChoiceProperty::new("wheel.filter", choices))
        .read("signal", "wheel.device");

    let experiment = Experiment::new(&settings(dir.path()), instruments).with_method(method);
    let collated = collate_one_run(experiment, dir.path()).await;

    assert_eq!(collated.labels["filter"], vec!["BLUE", "OPEN", "RED"]);
    assert_eq!(collated.coords["filter"], vec![0.0, 1.0, 2.0]);
    let signal = &collated.data_vars["signal"];
    assert_eq!(signal.shape, vec![3]);
    assert_eq!(signal.data, vec![1.0, 2.0, 3.0]);
}
