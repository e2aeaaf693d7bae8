mod common;

use cable_cell::{
    CableCell, CvPolicy, Decor, IClamp, MechanismDesc, Paintable, Placeable, ProbeAddress,
    ThresholdDetector,
};
use cable_core::CellMember;
use cable_events::{EventGenerator, Schedule};
use cable_morphology::{Locset, Mlocation, Region};
use common::{ball_and_stick, single_cell_simulation, SingleCellRecipe};
use settings::SimSettings;

fn hh_ball_and_stick_cell() -> CableCell {
    let decor = Decor::new()
        .set_default(Paintable::InitMembranePotential(-65.0))
        .set_default(Paintable::AxialResistivity(90.0))
        .set_default(Paintable::MembraneCapacitance(0.01))
        .set_discretization(CvPolicy::max_extent(10.0))
        .paint(Region::Tagged(1), Paintable::Density(MechanismDesc::new("hh")))
        .paint(
            Region::Tagged(3),
            Paintable::Density(MechanismDesc::new("pas").set("g", 3e-4).set("e", -65.0)),
        )
        .place(
            Locset::Location(Mlocation::new(0, 0.0)),
            Placeable::Detector(ThresholdDetector { threshold_mv: -10.0 }),
            "det",
        )
        .place(
            Locset::Location(Mlocation::new(0, 1.0)),
            Placeable::Stimulus(IClamp::box_pulse(5.0, 80.0, 0.3)),
            "stim",
        );
    CableCell::new(ball_and_stick(12.6, 200.0, 0.5), decor)
}

// Hodgkin–Huxley soma with passive dendrite, suprathreshold 0.3 nA clamp at
// the dendrite tip for 80 ms: at least three spikes, inter-spike intervals
// within [8, 20] ms, spike times monotonic.
#[test]
fn hh_ball_and_stick_fires_repetitively() {
    let recipe = SingleCellRecipe {
        build: hh_ball_and_stick_cell,
        probes: vec![],
    };
    let mut sim = single_cell_simulation(
        recipe,
        SimSettings {
            dt_max_ms: 0.025,
            check_voltage_mv: 500.0,
            ..Default::default()
        },
    );
    sim.run(90.0).unwrap();

    let times: Vec<f64> = sim.spikes().iter().map(|s| s.time).collect();
    assert!(
        times.len() >= 3,
        "expected at least three spikes, got {times:?}"
    );
    for w in times.windows(2) {
        assert!(w[1] > w[0], "spike times not monotonic: {times:?}");
        let isi = w[1] - w[0];
        assert!(
            (8.0..=20.0).contains(&isi),
            "inter-spike interval {isi} ms outside [8, 20]: {times:?}"
        );
    }
    // All spikes come from the single soma detector.
    for s in sim.spikes() {
        assert_eq!(s.source, CellMember::new(0, 0));
    }
}

fn coalesced_synapse_cell() -> CableCell {
    let mut decor = Decor::new()
        .set_default(Paintable::InitMembranePotential(-65.0))
        .set_default(Paintable::AxialResistivity(90.0))
        .set_default(Paintable::MembraneCapacitance(0.01))
        .paint(
            Region::All,
            Paintable::Density(MechanismDesc::new("pas").set("g", 3e-4).set("e", -65.0)),
        );
    for label in ["syn0", "syn1", "syn2", "syn3"] {
        decor = decor.place(
            Locset::Location(Mlocation::new(0, 0.5)),
            Placeable::Synapse(MechanismDesc::new("expsyn")),
            label,
        );
    }
    CableCell::new(common::soma_morphology(20.0), decor)
}

// Four identical synapses at one site coalesce into a single mechanism
// instance; events from a generator onto each target still all arrive, so
// the summed conductance depolarizes the cell.
#[test]
fn coalesced_synapses_accumulate_generator_events() {
    struct GenRecipe;
    impl cable_cell::Recipe for GenRecipe {
        fn num_cells(&self) -> usize {
            1
        }
        fn cell_kind(&self, _gid: cable_core::CellGid) -> cable_core::CellKind {
            cable_core::CellKind::Cable
        }
        fn cell_description(&self, _gid: cable_core::CellGid) -> CableCell {
            coalesced_synapse_cell()
        }
        fn probes(&self, _gid: cable_core::CellGid) -> Vec<ProbeAddress> {
            vec![ProbeAddress::MembraneVoltage(Mlocation::new(0, 0.5))]
        }
        fn event_generators(&self, _gid: cable_core::CellGid) -> Vec<EventGenerator> {
            (0..4)
                .map(|lid| EventGenerator {
                    target: cable_core::CellLid(lid),
                    weight: 0.005,
                    schedule: Schedule::Explicit { times: vec![2.0] },
                })
                .collect()
        }
    }

    let mut sim = engine::Simulation::new(
        std::sync::Arc::new(GenRecipe),
        std::sync::Arc::new(cable_mechanisms::default_catalogue()),
        std::sync::Arc::new(cable_comm::LocalContext),
        cable_core::GroupPartition {
            groups: vec![vec![cable_core::CellGid(0)]],
        },
        SimSettings::default(),
    )
    .unwrap();
    sim.add_sampler(
        CellMember::new(0, 0),
        Schedule::Explicit {
            times: vec![1.9, 2.5],
        },
    )
    .unwrap();
    sim.run(4.0).unwrap();

    let samples = sim.samples();
    assert_eq!(samples.len(), 2);
    let before = samples[0].values[0];
    let after = samples[1].values[0];
    assert!((before + 65.0).abs() < 1e-6);
    // Four weights of 0.005 µS summed on the coalesced instance.
    assert!(
        after > before + 1.0,
        "expected a compound EPSP, got {before} -> {after}"
    );
}
