use cable_cell::{
    CableCell, CableCellGlobalProperties, CvPolicy, Decor, IClamp, MechanismDesc, Paintable,
    Placeable,
};
use cable_core::CellLid;
use cable_discretization::discretize;
use cable_layout::{build_mechanism_data, LayoutError, ResolvedGapJunction};
use cable_mechanisms::{default_catalogue, IonDep, MechanismInfo, MechanismKind};
use cable_morphology::{cylinder_morphology, Locset, Mcable, Mlocation, Region};

fn build(cell: &CableCell) -> Result<cable_layout::MechanismData, LayoutError> {
    let gprop = CableCellGlobalProperties::default();
    let d = discretize(cell, &gprop);
    build_mechanism_data(&gprop, &default_catalogue(), cell, &[], &d, 0)
}

fn syn_at(pos: f64, desc: MechanismDesc) -> Decor {
    Decor::new().place(
        Locset::Location(Mlocation::new(0, pos)),
        Placeable::Synapse(desc),
        "syn",
    )
}

#[test]
fn identical_synapses_coalesce_with_multiplicity() {
    let mut decor = Decor::new().set_discretization(CvPolicy::fixed_per_branch(2));
    for _ in 0..4 {
        decor = decor.place(
            Locset::Location(Mlocation::new(0, 0.25)),
            Placeable::Synapse(MechanismDesc::new("expsyn")),
            "syn",
        );
    }
    let cell = CableCell::new(cylinder_morphology(100.0, 1.0), decor);
    let m = build(&cell).unwrap();

    let config = &m.mechanisms["expsyn"];
    assert_eq!(config.cv.len(), 1);
    assert_eq!(config.multiplicity, vec![4]);
    assert_eq!(config.target, vec![0, 1, 2, 3]);
    let total: u32 = config.multiplicity.iter().sum();
    assert_eq!(total as usize, cell.num_synapses());
}

#[test]
fn differing_parameter_splits_coalesced_entries() {
    let mut decor = Decor::new().set_discretization(CvPolicy::fixed_per_branch(2));
    for _ in 0..4 {
        decor = decor.place(
            Locset::Location(Mlocation::new(0, 0.25)),
            Placeable::Synapse(MechanismDesc::new("expsyn")),
            "syn",
        );
    }
    decor = decor.place(
        Locset::Location(Mlocation::new(0, 0.25)),
        Placeable::Synapse(MechanismDesc::new("expsyn").set("tau", 3.0)),
        "odd",
    );
    let cell = CableCell::new(cylinder_morphology(100.0, 1.0), decor);
    let m = build(&cell).unwrap();

    let config = &m.mechanisms["expsyn"];
    assert_eq!(config.cv.len(), 2);
    assert_eq!(config.multiplicity.iter().sum::<u32>(), 5);
    // Entries on the same CV must differ in their parameter vectors.
    let tau = &config.param_values.iter().find(|(k, _)| k == "tau").unwrap().1;
    assert_ne!(tau[0], tau[1]);
}

#[test]
fn coalescing_disabled_keeps_every_instance() {
    let mut decor = Decor::new();
    for _ in 0..3 {
        decor = decor.place(
            Locset::Location(Mlocation::new(0, 0.5)),
            Placeable::Synapse(MechanismDesc::new("expsyn")),
            "syn",
        );
    }
    let cell = CableCell::new(cylinder_morphology(100.0, 1.0), decor);
    let gprop = CableCellGlobalProperties {
        coalesce_synapses: false,
        ..Default::default()
    };
    let d = discretize(&cell, &gprop);
    let m = build_mechanism_data(&gprop, &default_catalogue(), &cell, &[], &d, 0).unwrap();
    let config = &m.mechanisms["expsyn"];
    assert_eq!(config.cv.len(), 3);
    assert!(config.multiplicity.is_empty());
}

#[test]
fn density_norm_area_reflects_partial_coverage() {
    let decor = Decor::new()
        .set_discretization(CvPolicy::fixed_per_branch(1))
        .paint(
            Region::Cable(Mcable::new(0, 0.0, 0.5)),
            Paintable::Density(MechanismDesc::new("pas")),
        );
    let cell = CableCell::new(cylinder_morphology(100.0, 1.0), decor);
    let m = build(&cell).unwrap();
    let config = &m.mechanisms["pas"];
    assert_eq!(config.cv.len(), 1);
    assert!((config.norm_area[0] - 0.5).abs() < 1e-9);
}

#[test]
fn stimulus_amplitude_scaled_by_cv_area() {
    let decor = Decor::new()
        .set_discretization(CvPolicy::fixed_per_branch(1))
        .place(
            Locset::Location(Mlocation::new(0, 1.0)),
            Placeable::Stimulus(IClamp::box_pulse(5.0, 50.0, 0.1)),
            "stim",
        );
    let cell = CableCell::new(cylinder_morphology(200.0, 0.5), decor);
    let gprop = CableCellGlobalProperties::default();
    let d = discretize(&cell, &gprop);
    let m = build_mechanism_data(&gprop, &default_catalogue(), &cell, &[], &d, 0).unwrap();

    assert_eq!(m.stimuli.cv.len(), 1);
    let area = d.cv_area[m.stimuli.cv[0]];
    let expected = 0.1 * 1000.0 / area;
    assert!((m.stimuli.envelope_amplitude[0][0] - expected).abs() < 1e-12 * expected);
}

#[test]
fn hh_brings_na_and_k_support() {
    let decor = Decor::new()
        .set_discretization(CvPolicy::fixed_per_branch(2))
        .paint(Region::All, Paintable::Density(MechanismDesc::new("hh")));
    let cell = CableCell::new(cylinder_morphology(100.0, 1.0), decor);
    let m = build(&cell).unwrap();
    assert_eq!(m.ions["na"].cv, vec![0, 1]);
    assert_eq!(m.ions["k"].cv, vec![0, 1]);
    assert!(!m.ions["na"].iconc_written);
}

#[test]
fn unknown_parameter_is_rejected() {
    let decor = Decor::new().paint(
        Region::All,
        Paintable::Density(MechanismDesc::new("pas").set("gbar", 1.0)),
    );
    let cell = CableCell::new(cylinder_morphology(100.0, 1.0), decor);
    match build(&cell) {
        Err(LayoutError::NoSuchParameter { mech, param }) => {
            assert_eq!(mech, "pas");
            assert_eq!(param, "gbar");
        }
        other => panic!("expected NoSuchParameter, got {other:?}"),
    }
}

#[test]
fn out_of_range_parameter_is_rejected() {
    let cell = CableCell::new(
        cylinder_morphology(100.0, 1.0),
        syn_at(0.5, MechanismDesc::new("expsyn").set("tau", -1.0)),
    );
    assert!(matches!(
        build(&cell),
        Err(LayoutError::InvalidParameterValue { .. })
    ));
}

#[test]
fn unknown_mechanism_is_rejected() {
    let decor = Decor::new().paint(
        Region::All,
        Paintable::Density(MechanismDesc::new("kdr")),
    );
    let cell = CableCell::new(cylinder_morphology(100.0, 1.0), decor);
    assert_eq!(
        build(&cell),
        Err(LayoutError::UnknownMechanism("kdr".to_string()))
    );
}

#[test]
fn unregistered_ion_is_rejected() {
    let gprop = CableCellGlobalProperties {
        ion_species: [("k".to_string(), 1)].into_iter().collect(),
        ..Default::default()
    };
    let decor = Decor::new().paint(Region::All, Paintable::Density(MechanismDesc::new("hh")));
    let cell = CableCell::new(cylinder_morphology(100.0, 1.0), decor);
    let d = discretize(&cell, &gprop);
    let got = build_mechanism_data(&gprop, &default_catalogue(), &cell, &[], &d, 0);
    assert!(matches!(got, Err(LayoutError::IonUnknown { .. })));
}

#[test]
fn valence_mismatch_is_rejected() {
    let mut gprop = CableCellGlobalProperties::default();
    gprop.ion_species.insert("na".to_string(), 2);
    let decor = Decor::new().paint(Region::All, Paintable::Density(MechanismDesc::new("hh")));
    let cell = CableCell::new(cylinder_morphology(100.0, 1.0), decor);
    let d = discretize(&cell, &gprop);
    let got = build_mechanism_data(&gprop, &default_catalogue(), &cell, &[], &d, 0);
    assert!(matches!(got, Err(LayoutError::IonValenceMismatch { .. })));
}

#[test]
fn dual_revpot_and_concentration_writer_is_rejected() {
    let mut catalogue = default_catalogue();
    let mut info = MechanismInfo {
        kind: MechanismKind::Density,
        parameters: Default::default(),
        state_vars: vec![],
        ions: Default::default(),
        linear: false,
        post_events: false,
    };
    info.ions.insert(
        "ca".to_string(),
        IonDep {
            write_reversal_potential: true,
            write_int_concentration: true,
            ..Default::default()
        },
    );
    catalogue.register("bad_ca", info, cable_mechanisms::kernels::pas::Pas::boxed);

    let decor = Decor::new().paint(Region::All, Paintable::Density(MechanismDesc::new("bad_ca")));
    let cell = CableCell::new(cylinder_morphology(100.0, 1.0), decor);
    let gprop = CableCellGlobalProperties::default();
    let d = discretize(&cell, &gprop);
    let got = build_mechanism_data(&gprop, &catalogue, &cell, &[], &d, 0);
    assert!(matches!(
        got,
        Err(LayoutError::WritesRevpotAndConcentration { .. })
    ));
}

#[test]
fn nernst_method_configures_revpot_mechanism() {
    let decor = Decor::new()
        .set_discretization(CvPolicy::fixed_per_branch(2))
        .paint(Region::All, Paintable::Density(MechanismDesc::new("hh")))
        .set_revpot_method("na", MechanismDesc::new("nernst/na"));
    let cell = CableCell::new(cylinder_morphology(100.0, 1.0), decor);
    let m = build(&cell).unwrap();

    assert!(m.ions["na"].revpot_written);
    let config = &m.mechanisms["nernst/na"];
    assert_eq!(config.kind, Some(MechanismKind::ReversalPotential));
    assert_eq!(config.cv, m.ions["na"].cv);
    assert_eq!(config.norm_area, vec![1.0; config.cv.len()]);
}

#[test]
fn gap_junction_entries_follow_resolved_connections() {
    let decor = Decor::new()
        .set_discretization(CvPolicy::fixed_per_branch(2))
        .place(
            Locset::Location(Mlocation::new(0, 1.0)),
            Placeable::Junction(MechanismDesc::new("gj")),
            "jct",
        );
    let cell = CableCell::new(cylinder_morphology(100.0, 1.0), decor);
    let gprop = CableCellGlobalProperties::default();
    let d = discretize(&cell, &gprop);
    let conns = [ResolvedGapJunction {
        local_lid: CellLid(0),
        local_cv: 1,
        peer_cv: 17,
        weight: 0.5,
    }];
    let m = build_mechanism_data(&gprop, &default_catalogue(), &cell, &conns, &d, 0).unwrap();
    let config = &m.mechanisms["gj"];
    assert_eq!(config.cv, vec![1]);
    assert_eq!(config.peer_cv, vec![17]);
    assert_eq!(config.local_weight, vec![0.5]);
}

#[test]
fn junction_without_connections_is_dropped() {
    let decor = Decor::new().place(
        Locset::Location(Mlocation::new(0, 1.0)),
        Placeable::Junction(MechanismDesc::new("gj")),
        "jct",
    );
    let cell = CableCell::new(cylinder_morphology(100.0, 1.0), decor);
    let m = build(&cell).unwrap();
    assert!(!m.mechanisms.contains_key("gj"));
}
