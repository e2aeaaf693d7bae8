#![allow(dead_code)]

use std::sync::Arc;

use cable_cell::{
    CableCell, CableCellGlobalProperties, CvPolicy, Decor, IClamp, MechanismDesc, Paintable,
    Placeable, ProbeAddress, Recipe, ThresholdDetector,
};
use cable_comm::LocalContext;
use cable_core::{CellGid, CellKind, GroupPartition};
use cable_mechanisms::default_catalogue;
use cable_morphology::{Locset, Mlocation, Morphology, Mpoint, Region, Segment};
use engine::Simulation;
use settings::SimSettings;

/// Soma-only cell: a cylinder with equal length and diameter, the
/// conventional stand-in for a spherical soma of the same surface area.
pub fn soma_morphology(diameter_um: f64) -> Morphology {
    let r = diameter_um / 2.0;
    let seg = Segment {
        id: 0,
        prox: Mpoint::new(0.0, 0.0, 0.0, r),
        dist: Mpoint::new(diameter_um, 0.0, 0.0, r),
        tag: 1,
    };
    Morphology::from_segments(vec![seg], vec![u32::MAX]).unwrap()
}

pub fn ball_and_stick(
    soma_diameter_um: f64,
    dendrite_length_um: f64,
    dendrite_radius_um: f64,
) -> Morphology {
    let r = soma_diameter_um / 2.0;
    let segments = vec![
        Segment {
            id: 0,
            prox: Mpoint::new(0.0, 0.0, 0.0, r),
            dist: Mpoint::new(soma_diameter_um, 0.0, 0.0, r),
            tag: 1,
        },
        Segment {
            id: 1,
            prox: Mpoint::new(soma_diameter_um, 0.0, 0.0, dendrite_radius_um),
            dist: Mpoint::new(
                soma_diameter_um + dendrite_length_um,
                0.0,
                0.0,
                dendrite_radius_um,
            ),
            tag: 3,
        },
    ];
    Morphology::from_segments(segments, vec![u32::MAX, 0]).unwrap()
}

/// One-cell recipe built from a closure.
pub struct SingleCellRecipe<F: Fn() -> CableCell + Send + Sync> {
    pub build: F,
    pub probes: Vec<ProbeAddress>,
}

impl<F: Fn() -> CableCell + Send + Sync> Recipe for SingleCellRecipe<F> {
    fn num_cells(&self) -> usize {
        1
    }

    fn cell_kind(&self, _gid: CellGid) -> CellKind {
        CellKind::Cable
    }

    fn cell_description(&self, _gid: CellGid) -> CableCell {
        (self.build)()
    }

    fn probes(&self, _gid: CellGid) -> Vec<ProbeAddress> {
        self.probes.clone()
    }

    fn global_properties(&self) -> CableCellGlobalProperties {
        CableCellGlobalProperties {
            membrane_voltage_limit_mv: Some(1000.0),
            ..Default::default()
        }
    }
}

pub fn single_cell_simulation<F>(
    recipe: SingleCellRecipe<F>,
    settings: SimSettings,
) -> Simulation
where
    F: Fn() -> CableCell + Send + Sync + 'static,
{
    Simulation::new(
        Arc::new(recipe),
        Arc::new(default_catalogue()),
        Arc::new(LocalContext),
        GroupPartition {
            groups: vec![vec![CellGid(0)]],
        },
        settings,
    )
    .unwrap()
}

/// Passive cable of the reference scenario: 200 µm × 1 µm diameter,
/// R_a = 90 Ω·cm, C_m = 0.01 F/m², leak 3e-4 S/cm² at −65 mV.
pub fn passive_cable_cell() -> CableCell {
    let decor = Decor::new()
        .set_default(Paintable::InitMembranePotential(-65.0))
        .set_default(Paintable::AxialResistivity(90.0))
        .set_default(Paintable::MembraneCapacitance(0.01))
        .set_discretization(CvPolicy::fixed_per_branch(20))
        .paint(
            Region::All,
            Paintable::Density(MechanismDesc::new("pas").set("g", 3e-4).set("e", -65.0)),
        )
        .place(
            Locset::Location(Mlocation::new(0, 1.0)),
            Placeable::Stimulus(IClamp::box_pulse(5.0, 1000.0, 0.1)),
            "stim",
        );
    CableCell::new(cable_morphology::cylinder_morphology(200.0, 0.5), decor)
}

/// Soma cell with Hodgkin–Huxley membrane, a threshold detector and a
/// configurable current clamp.
pub fn hh_soma_cell(stim_na: f64, syn: bool) -> CableCell {
    let mut decor = Decor::new()
        .set_default(Paintable::InitMembranePotential(-65.0))
        .set_default(Paintable::AxialResistivity(90.0))
        .set_default(Paintable::MembraneCapacitance(0.01))
        .set_discretization(CvPolicy::fixed_per_branch(1))
        .paint(Region::All, Paintable::Density(MechanismDesc::new("hh")))
        .place(
            Locset::Location(Mlocation::new(0, 0.5)),
            Placeable::Detector(ThresholdDetector { threshold_mv: -10.0 }),
            "det",
        );
    if stim_na != 0.0 {
        decor = decor.place(
            Locset::Location(Mlocation::new(0, 0.5)),
            Placeable::Stimulus(IClamp::box_pulse(2.0, 1000.0, stim_na)),
            "stim",
        );
    }
    if syn {
        decor = decor.place(
            Locset::Location(Mlocation::new(0, 0.5)),
            Placeable::Synapse(MechanismDesc::new("expsyn")),
            "syn",
        );
    }
    CableCell::new(soma_morphology(12.6), decor)
}
