use std::collections::BTreeMap;

use cable_cell::{
    CableCell, CvPolicy, Decor, MechanismDesc, Paintable, Placeable, ProbeAddress, Recipe,
    ThresholdDetector,
};
use cable_cellgroup::{CellGroup, SampleEvent};
use cable_core::{CellGid, CellKind, CellLid};
use cable_events::DeliverableEvent;
use cable_mechanisms::default_catalogue;
use cable_morphology::{cylinder_morphology, Locset, Mlocation, Region};

struct OneCell {
    with_synapse: bool,
}

impl Recipe for OneCell {
    fn num_cells(&self) -> usize {
        1
    }

    fn cell_kind(&self, _gid: CellGid) -> CellKind {
        CellKind::Cable
    }

    fn cell_description(&self, _gid: CellGid) -> CableCell {
        let mut decor = Decor::new()
            .set_default(Paintable::InitMembranePotential(-65.0))
            .set_default(Paintable::AxialResistivity(90.0))
            .set_default(Paintable::MembraneCapacitance(0.01))
            .set_discretization(CvPolicy::fixed_per_branch(4))
            .paint(
                Region::All,
                Paintable::Density(MechanismDesc::new("pas").set("g", 3e-4).set("e", -65.0)),
            )
            .place(
                Locset::Location(Mlocation::new(0, 0.0)),
                Placeable::Detector(ThresholdDetector { threshold_mv: -20.0 }),
                "det",
            );
        if self.with_synapse {
            decor = decor.place(
                Locset::Location(Mlocation::new(0, 0.5)),
                Placeable::Synapse(MechanismDesc::new("expsyn")),
                "syn",
            );
        }
        CableCell::new(cylinder_morphology(100.0, 1.0), decor)
    }

    fn probes(&self, _gid: CellGid) -> Vec<ProbeAddress> {
        if !self.with_synapse {
            return Vec::new();
        }
        vec![ProbeAddress::PointState {
            target: 0,
            mechanism: "expsyn".to_string(),
            state: "g".to_string(),
        }]
    }
}

fn build_group(with_synapse: bool) -> CellGroup {
    CellGroup::new(
        &OneCell { with_synapse },
        &default_catalogue(),
        0,
        vec![CellGid(0)],
        &[],
        &BTreeMap::new(),
    )
    .unwrap()
}

#[test]
fn advancing_to_the_current_time_is_a_no_op() {
    let mut group = build_group(false);
    let before = group.snapshot();
    let result = group
        .integrate(0.0, 0.025, Vec::new(), Vec::new(), None)
        .unwrap();
    assert!(result.spikes.is_empty());
    let after = group.snapshot();
    assert_eq!(before.state.snapshot_digest(), after.state.snapshot_digest());
}

#[test]
fn empty_event_stream_leaves_resting_cell_at_rest() {
    let mut group = build_group(true);
    group
        .integrate(5.0, 0.025, Vec::new(), Vec::new(), None)
        .unwrap();
    let snap = group.snapshot();
    for &v in &snap.state.voltage {
        assert!((v + 65.0).abs() < 1e-6, "cell drifted to {v} mV");
    }
    assert_eq!(snap.tmin, 5.0);
}

#[test]
fn step_size_never_exceeds_dt_max_or_tfinal() {
    let mut group = build_group(false);
    let dt_max = 0.1;
    let tfinal = 1.05;
    let result = group
        .integrate(tfinal, dt_max, Vec::new(), Vec::new(), None)
        .unwrap();
    assert_eq!(result.spikes.len(), 0);
    assert!((group.time() - tfinal).abs() < 1e-12);
}

#[test]
fn staged_event_is_delivered_exactly_once() {
    let mut group = build_group(true);
    let handle = group.target_handle(0, CellLid(0));
    assert_eq!(handle.mech_index, 0);

    let events = vec![DeliverableEvent {
        time: 0.5,
        weight: 0.25,
        handle,
    }];
    // Sample the synaptic conductance just after the event lands.
    let samples = vec![
        SampleEvent {
            probe_index: 0,
            time: 0.4,
        },
        SampleEvent {
            probe_index: 0,
            time: 0.525,
        },
    ];
    let result = group.integrate(1.0, 0.025, events, samples, None).unwrap();
    assert_eq!(result.samples.len(), 2);
    let before = result.samples[0].values[0];
    let after = result.samples[1].values[0];
    assert_eq!(before, 0.0);
    // One delivery of 0.25 µS, already decaying but well above half.
    assert!(after > 0.2 && after <= 0.25, "g after delivery: {after}");
}

#[test]
fn event_at_step_boundary_is_not_lost() {
    let mut group = build_group(true);
    let handle = group.target_handle(0, CellLid(0));
    // 0.5125 is not a step boundary for dt = 0.025 from 0: the step is
    // clamped so the event is delivered before the following solve.
    let events = vec![DeliverableEvent {
        time: 0.5125,
        weight: 0.1,
        handle,
    }];
    let samples = vec![SampleEvent {
        probe_index: 0,
        time: 0.6,
    }];
    let result = group.integrate(1.0, 0.025, events, samples, None).unwrap();
    assert!(result.samples[0].values[0] > 0.05);
}

#[test]
fn snapshot_restore_roundtrips_mid_run() {
    let mut group = build_group(true);
    let handle = group.target_handle(0, CellLid(0));
    let events = vec![DeliverableEvent {
        time: 0.25,
        weight: 0.5,
        handle,
    }];
    group
        .integrate(0.5, 0.025, events, Vec::new(), None)
        .unwrap();

    let snap = group.snapshot();
    group
        .integrate(1.0, 0.025, Vec::new(), Vec::new(), None)
        .unwrap();
    let digest_after_run = group.snapshot().state.snapshot_digest();

    group.restore(&snap).unwrap();
    assert_eq!(group.time(), 0.5);
    group
        .integrate(1.0, 0.025, Vec::new(), Vec::new(), None)
        .unwrap();
    assert_eq!(
        group.snapshot().state.snapshot_digest(),
        digest_after_run,
        "restored run diverged"
    );
}
