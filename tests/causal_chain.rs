//! Causal chain tests.
//!
//! Drives causal graphs both programmatically and through scenario files,
//! checking verdicts and per-event labels.

use chainsim::causal::{CausalGraph, CausalGraphTraverser, Probe, Signal, Verdict};
use chainsim::engine::SimTime;
use chainsim::physics::{SphereWorld, SphereWorldFactory};
use chainsim::robustness::{compute_event_labels, compute_label, Label, SimulationSettings};
use chainsim::scene::{Scenario, ScenarioDescription};

const BOWLING: &str = r"
scene:
  - name: floor
    type: Ground
  - name: ball
    type: Ball
    args: {radius: 0.1, velocity: [1.0, 0.0, 0.0]}
    xform:
      value: [0, 0, 0.1, 0, 0, 0]
      range: [[-0.5, 0.0], [-0.3, 0.3], null, null, null, null]
  - name: pin
    type: Ball
    args: {radius: 0.1}
    xform:
      value: [0.5, 0, 0.1, 0, 0, 0]
causal_graph:
  - name: roll
    type: RollingOn
    args: {rolling: ball, support: floor}
    children: [hit]
  - name: hit
    type: Contact
    args: {first: ball, second: pin}
";

fn after(secs: f64) -> impl FnMut(&Probe<'_>) -> Signal {
    let t = SimTime::from_secs(secs);
    move |probe: &Probe<'_>| Signal::from(probe.time >= t)
}

fn never() -> impl FnMut(&Probe<'_>) -> Signal {
    |_: &Probe<'_>| Signal::Bool(false)
}

/// Update every half second until the traverser stops.
fn run(traverser: &mut CausalGraphTraverser) -> f64 {
    let world = SphereWorld::new();
    let mut t = 0.0;
    while traverser.update(SimTime::from_secs(t), &world) {
        t += 0.5;
        assert!(t < 100.0, "traverser did not terminate");
    }
    t
}

fn settings() -> SimulationSettings {
    SimulationSettings {
        duration: 3.0,
        timestep: 0.002,
    }
}

fn bowling() -> Scenario<SphereWorldFactory> {
    Scenario::new(
        ScenarioDescription::from_yaml(BOWLING).unwrap(),
        SphereWorldFactory::new(),
    )
    .unwrap()
}

#[test]
fn categorical_branch_only_wakes_matching_child() {
    let mut g = CausalGraph::new();
    let toss = g.add_event("toss", |probe: &Probe<'_>| {
        if probe.time >= SimTime::from_secs(1.0) {
            Signal::Category("heads".into())
        } else {
            Signal::Bool(false)
        }
    });
    let heads = g.add_event("heads", after(2.0));
    let tails = g.add_event("tails", never());
    g.connect_categorical(toss, heads, Signal::Category("heads".into()))
        .unwrap();
    g.connect_categorical(toss, tails, Signal::Category("tails".into()))
        .unwrap();

    let mut traverser = CausalGraphTraverser::new(g)
        .unwrap()
        .with_max_wait(SimTime::from_secs(5.0));
    let t = run(&mut traverser);

    assert_eq!(traverser.state(), Some(Verdict::Success));
    assert!((t - 2.0).abs() < 1e-12);
    let labels = traverser.event_labels();
    assert_eq!(labels["toss"], Some(true));
    assert_eq!(labels["heads"], Some(true));
    assert_eq!(labels["tails"], None);
}

#[test]
fn any_before_wakes_on_first_parent() {
    let build = |any_before: bool| {
        let mut g = CausalGraph::new();
        let root = g.add_event("root", after(0.0));
        let fast = g.add_event("fast", after(1.0));
        let stuck = g.add_event("stuck", never());
        let join = g.add_event("join", after(0.0));
        g.connect(root, fast).unwrap();
        g.connect(root, stuck).unwrap();
        g.connect(fast, join).unwrap();
        g.connect(stuck, join).unwrap();
        if any_before {
            g.set_any_before(join).unwrap();
        }
        CausalGraphTraverser::new(g)
            .unwrap()
            .with_max_wait(SimTime::from_secs(2.0))
    };

    let mut any = build(true);
    run(&mut any);
    assert_eq!(any.state(), Some(Verdict::Failure));
    assert_eq!(any.event_labels()["join"], Some(true));
    assert_eq!(any.event_labels()["stuck"], Some(false));

    let mut all = build(false);
    run(&mut all);
    assert_eq!(all.state(), Some(Verdict::Failure));
    assert_eq!(all.event_labels()["join"], None);
}

#[test]
fn graph_with_two_roots_is_rejected() {
    let mut g = CausalGraph::new();
    let a = g.add_event("a", after(0.0));
    let b = g.add_event("b", after(0.0));
    let c = g.add_event("c", after(0.0));
    g.connect(a, c).unwrap();
    g.connect(b, c).unwrap();
    assert!(CausalGraphTraverser::new(g).is_err());
}

#[test]
fn scenario_chain_labels_hit_and_miss() {
    let scenario = bowling();

    let (label, events) = compute_event_labels(&scenario, &[0.5, 0.5], &settings()).unwrap();
    assert_eq!(label, Label::Success);
    assert_eq!(events["roll"], Some(true));
    assert_eq!(events["hit"], Some(true));

    // y = 0.3 rolls beside the pin
    let (label, events) = compute_event_labels(&scenario, &[0.5, 1.0], &settings()).unwrap();
    assert_eq!(label, Label::Failure);
    assert_eq!(events["hit"], Some(false));
}

#[test]
fn scenario_without_graph_labels_failure() {
    let description = ScenarioDescription::from_yaml(
        "scene:\n  - name: floor\n    type: Ground\n  - name: ball\n    type: Ball\n    args: {radius: 0.1}\n    xform:\n      value: [0, 0, 0.5, 0, 0, 0]\n      range: [[0.0, 1.0], null, null, null, null, null]\n",
    )
    .unwrap();
    let scenario = Scenario::new(description, SphereWorldFactory::new()).unwrap();
    assert!(scenario.causal_graph().is_empty());

    let mut instance = scenario.instantiate_from_sample(&[0.5]).unwrap();
    assert_eq!(instance.simulate(0.5, 0.01).unwrap(), None);
    let short = SimulationSettings {
        duration: 0.5,
        timestep: 0.01,
    };
    assert_eq!(compute_label(&scenario, &[0.5], &short).unwrap(), Label::Failure);
}

#[test]
fn unknown_event_kind_is_a_load_error() {
    let yaml = BOWLING.replace("type: Contact", "type: Teleport");
    let description = ScenarioDescription::from_yaml(&yaml).unwrap();
    assert!(Scenario::new(description, SphereWorldFactory::new()).is_err());
}

#[test]
fn scenario_max_wait_bounds_event_timeout() {
    // the ball starts 0.8 m short of the pin and needs well over 0.1 s to reach it
    let scenario = bowling().with_max_wait(SimTime::from_secs(0.1));
    let (label, events) = compute_event_labels(&scenario, &[0.0, 0.5], &settings()).unwrap();
    assert_eq!(label, Label::Failure);
    assert_ne!(events["hit"], Some(true));
}
