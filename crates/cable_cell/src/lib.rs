#![forbid(unsafe_code)]

//! Cable cell description: a morphology decorated with painted membrane
//! properties, placed point items, and per-cell parameter defaults.

pub mod recipe;

pub use recipe::{CellConnection, GapJunctionConnection, ProbeAddress, Recipe};

use std::collections::BTreeMap;

use cable_core::CellLid;
use cable_morphology::{Embedding, Locset, Mcable, Mlocation, Morphology, Region};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MechanismDesc {
    pub name: String,
    pub values: BTreeMap<String, f64>,
}

impl MechanismDesc {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            values: BTreeMap::new(),
        }
    }

    pub fn set(mut self, key: &str, value: f64) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }
}

/// Current clamp: piecewise-linear envelope `(t [ms], amplitude [nA])`,
/// optionally modulated by a sinusoid of `frequency` [kHz] and `phase` [rad].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IClamp {
    pub envelope: Vec<(f64, f64)>,
    pub frequency: f64,
    pub phase: f64,
}

impl IClamp {
    /// Constant-amplitude box pulse.
    pub fn box_pulse(from: f64, duration: f64, amplitude: f64) -> Self {
        Self {
            envelope: vec![(from, amplitude), (from + duration, amplitude), (from + duration, 0.0)],
            frequency: 0.0,
            phase: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdDetector {
    pub threshold_mv: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct IonDefaults {
    pub init_int_concentration: Option<f64>,
    pub init_ext_concentration: Option<f64>,
    pub init_reversal_potential: Option<f64>,
}

/// Discretization policy: boundary points dividing each branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CvPolicy {
    /// At most `max_extent` µm of cable per CV.
    MaxExtent { max_extent_um: f64, interior_forks: bool },
    /// Fixed CV count per branch.
    FixedPerBranch { n: u32, interior_forks: bool },
    /// Explicit boundary locations, in addition to fork and terminal points.
    Explicit { locations: Vec<Mlocation>, interior_forks: bool },
}

impl CvPolicy {
    pub fn fixed_per_branch(n: u32) -> Self {
        CvPolicy::FixedPerBranch {
            n,
            interior_forks: false,
        }
    }

    pub fn max_extent(max_extent_um: f64) -> Self {
        CvPolicy::MaxExtent {
            max_extent_um,
            interior_forks: false,
        }
    }

    pub fn interior_forks(&self) -> bool {
        match self {
            CvPolicy::MaxExtent { interior_forks, .. }
            | CvPolicy::FixedPerBranch { interior_forks, .. }
            | CvPolicy::Explicit { interior_forks, .. } => *interior_forks,
        }
    }
}

pub fn default_cv_policy() -> CvPolicy {
    CvPolicy::fixed_per_branch(1)
}

/// Cell-level parameter defaults; unset fields fall back to the global set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CableParamSet {
    pub init_membrane_potential: Option<f64>, // [mV]
    pub temperature_k: Option<f64>,           // [K]
    pub axial_resistivity: Option<f64>,       // [Ω·cm]
    pub membrane_capacitance: Option<f64>,    // [F/m²]
    pub ion_data: BTreeMap<String, IonDefaults>,
    pub reversal_potential_method: BTreeMap<String, MechanismDesc>,
    pub discretization: Option<CvPolicy>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CableCellGlobalProperties {
    pub default_parameters: CableParamSet,
    /// Ion species name to valence.
    pub ion_species: BTreeMap<String, i32>,
    pub coalesce_synapses: bool,
    /// Abort when `|V|` exceeds this bound; `None` disables the check.
    pub membrane_voltage_limit_mv: Option<f64>,
}

impl Default for CableCellGlobalProperties {
    fn default() -> Self {
        let mut ion_species = BTreeMap::new();
        ion_species.insert("na".to_string(), 1);
        ion_species.insert("k".to_string(), 1);
        ion_species.insert("ca".to_string(), 2);

        let mut ion_data = BTreeMap::new();
        ion_data.insert(
            "na".to_string(),
            IonDefaults {
                init_int_concentration: Some(10.0),
                init_ext_concentration: Some(140.0),
                init_reversal_potential: Some(50.0),
            },
        );
        ion_data.insert(
            "k".to_string(),
            IonDefaults {
                init_int_concentration: Some(54.4),
                init_ext_concentration: Some(2.5),
                init_reversal_potential: Some(-77.0),
            },
        );
        ion_data.insert(
            "ca".to_string(),
            IonDefaults {
                init_int_concentration: Some(5e-5),
                init_ext_concentration: Some(2.0),
                init_reversal_potential: Some(132.458),
            },
        );

        Self {
            default_parameters: CableParamSet {
                init_membrane_potential: Some(-65.0),
                temperature_k: Some(279.45),
                axial_resistivity: Some(35.4),
                membrane_capacitance: Some(0.01),
                ion_data,
                reversal_potential_method: BTreeMap::new(),
                discretization: None,
            },
            ion_species,
            coalesce_synapses: true,
            membrane_voltage_limit_mv: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Paintable {
    InitMembranePotential(f64),
    TemperatureK(f64),
    AxialResistivity(f64),
    MembraneCapacitance(f64),
    InitIntConcentration(String, f64),
    InitExtConcentration(String, f64),
    InitReversalPotential(String, f64),
    Density(MechanismDesc),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Placeable {
    Synapse(MechanismDesc),
    Junction(MechanismDesc),
    Detector(ThresholdDetector),
    Stimulus(IClamp),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Placed<T> {
    pub lid: CellLid,
    pub loc: Mlocation,
    pub item: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LidRange {
    pub begin: u32,
    pub end: u32,
}

impl LidRange {
    pub fn len(&self) -> u32 {
        self.end - self.begin
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.begin
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Decor {
    pub defaults: CableParamSet,
    paintings: Vec<(Region, Paintable)>,
    placements: Vec<(Locset, Placeable, String)>,
}

impl Decor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_default(mut self, param: Paintable) -> Self {
        match param {
            Paintable::InitMembranePotential(v) => self.defaults.init_membrane_potential = Some(v),
            Paintable::TemperatureK(v) => self.defaults.temperature_k = Some(v),
            Paintable::AxialResistivity(v) => self.defaults.axial_resistivity = Some(v),
            Paintable::MembraneCapacitance(v) => self.defaults.membrane_capacitance = Some(v),
            Paintable::InitIntConcentration(ion, v) => {
                self.defaults.ion_data.entry(ion).or_default().init_int_concentration = Some(v);
            }
            Paintable::InitExtConcentration(ion, v) => {
                self.defaults.ion_data.entry(ion).or_default().init_ext_concentration = Some(v);
            }
            Paintable::InitReversalPotential(ion, v) => {
                self.defaults.ion_data.entry(ion).or_default().init_reversal_potential = Some(v);
            }
            Paintable::Density(_) => panic!("density mechanisms are painted, not defaulted"),
        }
        self
    }

    pub fn set_revpot_method(mut self, ion: &str, mech: MechanismDesc) -> Self {
        self.defaults
            .reversal_potential_method
            .insert(ion.to_string(), mech);
        self
    }

    pub fn set_discretization(mut self, policy: CvPolicy) -> Self {
        self.defaults.discretization = Some(policy);
        self
    }

    pub fn paint(mut self, region: Region, what: Paintable) -> Self {
        self.paintings.push((region, what));
        self
    }

    pub fn place(mut self, locset: Locset, what: Placeable, label: &str) -> Self {
        self.placements.push((locset, what, label.to_string()));
        self
    }
}

/// Painted value assignments per property, resolved to concrete cables.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegionAssignments {
    pub init_membrane_potential: Vec<(Mcable, f64)>,
    pub temperature_k: Vec<(Mcable, f64)>,
    pub axial_resistivity: Vec<(Mcable, f64)>,
    pub membrane_capacitance: Vec<(Mcable, f64)>,
    pub init_int_concentration: BTreeMap<String, Vec<(Mcable, f64)>>,
    pub init_ext_concentration: BTreeMap<String, Vec<(Mcable, f64)>>,
    pub init_reversal_potential: BTreeMap<String, Vec<(Mcable, f64)>>,
    /// Density mechanism name to its painted cables with descriptors.
    pub density: BTreeMap<String, Vec<(Mcable, MechanismDesc)>>,
}

fn push_assignment(list: &mut Vec<(Mcable, f64)>, cables: &[Mcable], value: f64) {
    for &c in cables {
        list.push((c, value));
    }
    list.sort_by(|a, b| a.0.cmp(&b.0));
}

/// A morphology and its decor with locsets and regions resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct CableCell {
    morphology: Morphology,
    embedding: Embedding,
    defaults: CableParamSet,
    assignments: RegionAssignments,
    synapses: BTreeMap<String, Vec<Placed<MechanismDesc>>>,
    junctions: BTreeMap<String, Vec<Placed<MechanismDesc>>>,
    detectors: Vec<Placed<ThresholdDetector>>,
    stimuli: Vec<Placed<IClamp>>,
    synapse_ranges: Vec<(String, LidRange)>,
    detector_ranges: Vec<(String, LidRange)>,
    junction_ranges: Vec<(String, LidRange)>,
}

impl CableCell {
    pub fn new(morphology: Morphology, decor: Decor) -> Self {
        let embedding = Embedding::new(&morphology);

        let mut assignments = RegionAssignments::default();
        for (region, what) in &decor.paintings {
            let extent = region.thingify(&morphology);
            let cables = extent.cables.as_slice();
            match what {
                Paintable::InitMembranePotential(v) => {
                    push_assignment(&mut assignments.init_membrane_potential, cables, *v)
                }
                Paintable::TemperatureK(v) => {
                    push_assignment(&mut assignments.temperature_k, cables, *v)
                }
                Paintable::AxialResistivity(v) => {
                    push_assignment(&mut assignments.axial_resistivity, cables, *v)
                }
                Paintable::MembraneCapacitance(v) => {
                    push_assignment(&mut assignments.membrane_capacitance, cables, *v)
                }
                Paintable::InitIntConcentration(ion, v) => push_assignment(
                    assignments.init_int_concentration.entry(ion.clone()).or_default(),
                    cables,
                    *v,
                ),
                Paintable::InitExtConcentration(ion, v) => push_assignment(
                    assignments.init_ext_concentration.entry(ion.clone()).or_default(),
                    cables,
                    *v,
                ),
                Paintable::InitReversalPotential(ion, v) => push_assignment(
                    assignments.init_reversal_potential.entry(ion.clone()).or_default(),
                    cables,
                    *v,
                ),
                Paintable::Density(desc) => {
                    let entry = assignments.density.entry(desc.name.clone()).or_default();
                    for &c in cables {
                        entry.push((c, desc.clone()));
                    }
                }
            }
        }

        let mut synapses: BTreeMap<String, Vec<Placed<MechanismDesc>>> = BTreeMap::new();
        let mut junctions: BTreeMap<String, Vec<Placed<MechanismDesc>>> = BTreeMap::new();
        let mut detectors = Vec::new();
        let mut stimuli = Vec::new();
        let mut synapse_ranges = Vec::new();
        let mut detector_ranges = Vec::new();
        let mut junction_ranges = Vec::new();
        let mut next_synapse = 0u32;
        let mut next_detector = 0u32;
        let mut next_junction = 0u32;

        for (locset, what, label) in &decor.placements {
            let locs = locset.thingify(&morphology);
            match what {
                Placeable::Synapse(desc) => {
                    let begin = next_synapse;
                    for loc in locs {
                        synapses.entry(desc.name.clone()).or_default().push(Placed {
                            lid: CellLid(next_synapse),
                            loc,
                            item: desc.clone(),
                        });
                        next_synapse += 1;
                    }
                    synapse_ranges.push((
                        label.clone(),
                        LidRange {
                            begin,
                            end: next_synapse,
                        },
                    ));
                }
                Placeable::Junction(desc) => {
                    let begin = next_junction;
                    for loc in locs {
                        junctions.entry(desc.name.clone()).or_default().push(Placed {
                            lid: CellLid(next_junction),
                            loc,
                            item: desc.clone(),
                        });
                        next_junction += 1;
                    }
                    junction_ranges.push((
                        label.clone(),
                        LidRange {
                            begin,
                            end: next_junction,
                        },
                    ));
                }
                Placeable::Detector(det) => {
                    let begin = next_detector;
                    for loc in locs {
                        detectors.push(Placed {
                            lid: CellLid(next_detector),
                            loc,
                            item: *det,
                        });
                        next_detector += 1;
                    }
                    detector_ranges.push((
                        label.clone(),
                        LidRange {
                            begin,
                            end: next_detector,
                        },
                    ));
                }
                Placeable::Stimulus(clamp) => {
                    for loc in locs {
                        stimuli.push(Placed {
                            lid: CellLid(stimuli.len() as u32),
                            loc,
                            item: clamp.clone(),
                        });
                    }
                }
            }
        }

        Self {
            morphology,
            embedding,
            defaults: decor.defaults,
            assignments,
            synapses,
            junctions,
            detectors,
            stimuli,
            synapse_ranges,
            detector_ranges,
            junction_ranges,
        }
    }

    pub fn morphology(&self) -> &Morphology {
        &self.morphology
    }

    pub fn embedding(&self) -> &Embedding {
        &self.embedding
    }

    pub fn default_parameters(&self) -> &CableParamSet {
        &self.defaults
    }

    pub fn region_assignments(&self) -> &RegionAssignments {
        &self.assignments
    }

    pub fn synapses(&self) -> &BTreeMap<String, Vec<Placed<MechanismDesc>>> {
        &self.synapses
    }

    pub fn junctions(&self) -> &BTreeMap<String, Vec<Placed<MechanismDesc>>> {
        &self.junctions
    }

    pub fn detectors(&self) -> &[Placed<ThresholdDetector>] {
        &self.detectors
    }

    pub fn stimuli(&self) -> &[Placed<IClamp>] {
        &self.stimuli
    }

    pub fn synapse_ranges(&self) -> &[(String, LidRange)] {
        &self.synapse_ranges
    }

    pub fn detector_ranges(&self) -> &[(String, LidRange)] {
        &self.detector_ranges
    }

    pub fn junction_ranges(&self) -> &[(String, LidRange)] {
        &self.junction_ranges
    }

    pub fn num_detectors(&self) -> usize {
        self.detectors.len()
    }

    pub fn num_synapses(&self) -> usize {
        self.synapses.values().map(|v| v.len()).sum()
    }

    pub fn num_junction_sites(&self) -> usize {
        self.junctions.values().map(|v| v.len()).sum()
    }

    /// Junction placement by cell-local lid.
    pub fn junction_site(&self, lid: CellLid) -> Option<(&str, &Placed<MechanismDesc>)> {
        for (name, placed) in &self.junctions {
            if let Some(p) = placed.iter().find(|p| p.lid == lid) {
                return Some((name.as_str(), p));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cable_morphology::cylinder_morphology;

    fn decorated_cell() -> CableCell {
        let decor = Decor::new()
            .set_default(Paintable::InitMembranePotential(-65.0))
            .paint(Region::All, Paintable::Density(MechanismDesc::new("pas")))
            .place(
                Locset::Location(Mlocation::new(0, 0.5)),
                Placeable::Synapse(MechanismDesc::new("expsyn")),
                "syn0",
            )
            .place(
                Locset::Location(Mlocation::new(0, 1.0)),
                Placeable::Detector(ThresholdDetector { threshold_mv: -10.0 }),
                "det",
            )
            .place(
                Locset::Location(Mlocation::new(0, 0.5)),
                Placeable::Synapse(MechanismDesc::new("expsyn").set("tau", 4.0)),
                "syn1",
            );
        CableCell::new(cylinder_morphology(100.0, 1.0), decor)
    }

    #[test]
    fn placements_assign_consecutive_lids() {
        let cell = decorated_cell();
        let syns = &cell.synapses()["expsyn"];
        assert_eq!(syns.len(), 2);
        assert_eq!(syns[0].lid, CellLid(0));
        assert_eq!(syns[1].lid, CellLid(1));
        assert_eq!(cell.num_detectors(), 1);
    }

    #[test]
    fn labels_map_to_lid_ranges() {
        let cell = decorated_cell();
        let ranges = cell.synapse_ranges();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].0, "syn0");
        assert_eq!(ranges[0].1, LidRange { begin: 0, end: 1 });
        assert_eq!(ranges[1].1, LidRange { begin: 1, end: 2 });
    }

    #[test]
    fn painted_density_lands_in_assignments() {
        let cell = decorated_cell();
        assert!(cell.region_assignments().density.contains_key("pas"));
        assert_eq!(cell.region_assignments().density["pas"].len(), 1);
    }
}
