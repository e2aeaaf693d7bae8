#![forbid(unsafe_code)]

//! Mechanism data builder: resolves painted density mechanisms, placed
//! synapses, gap-junction endpoints, stimuli and ion parameters against a CV
//! discretization into per-mechanism structure-of-arrays configuration.

use std::collections::{BTreeMap, BTreeSet};

use cable_cell::{CableCell, CableCellGlobalProperties, MechanismDesc};
use cable_core::CellLid;
use cable_discretization::{CvDiscretization, CvPrefer};
use cable_mechanisms::{MechanismCatalogue, MechanismInfo, MechanismKind};
use cable_morphology::{Mcable, Mextent, PwConst};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LayoutError {
    #[error("no mechanism {0} in catalogue")]
    UnknownMechanism(String),
    #[error("expected {expected} mechanism, got {name}")]
    WrongMechanismKind { name: String, expected: &'static str },
    #[error("mechanism {mech} has no parameter {param}")]
    NoSuchParameter { mech: String, param: String },
    #[error("parameter {param} of mechanism {mech} out of range: {value}")]
    InvalidParameterValue {
        mech: String,
        param: String,
        value: f64,
    },
    #[error("mechanism {mech} uses ion {ion} which is missing in global properties")]
    IonUnknown { mech: String, ion: String },
    #[error("mechanism {mech} uses ion {ion} expecting a different valence")]
    IonValenceMismatch { mech: String, ion: String },
    #[error("mechanism {mech} writes both reversal potential and concentration of ion {ion}")]
    WritesRevpotAndConcentration { mech: String, ion: String },
    #[error("overlapping {ion} concentration writing mechanism {mech}")]
    OverlappingConcentrationWriters { ion: String, mech: String },
    #[error("inconsistent reversal potential ion assignment for mechanism {0}")]
    InconsistentRevpotAssignment(String),
    #[error("reversal potential mechanism for ion {ion} does not write this reversal potential")]
    RevpotNotWritten { ion: String, mech: String },
    #[error("reversal potential mechanism {mech} also writes to ion {ion}")]
    RevpotUndeclaredIon { ion: String, mech: String },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MechConfig {
    pub kind: Option<MechanismKind>,
    pub cv: Vec<usize>,
    pub peer_cv: Vec<usize>,
    pub multiplicity: Vec<u32>,
    pub norm_area: Vec<f64>,
    pub local_weight: Vec<f64>,
    /// Cell-group target indices, in placement (target-handle) order.
    pub target: Vec<usize>,
    /// Parameter values keyed and sorted by name.
    pub param_values: Vec<(String, Vec<f64>)>,
}

impl MechConfig {
    pub fn width(&self) -> usize {
        self.cv.len()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct IonConfig {
    pub cv: Vec<usize>,
    pub init_iconc: Vec<f64>,
    pub init_econc: Vec<f64>,
    pub reset_iconc: Vec<f64>,
    pub reset_econc: Vec<f64>,
    pub init_revpot: Vec<f64>,
    pub iconc_written: bool,
    pub econc_written: bool,
    pub revpot_written: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StimulusConfig {
    pub cv: Vec<usize>,
    pub cv_unique: Vec<usize>,
    pub frequency: Vec<f64>, // [kHz]
    pub phase: Vec<f64>,     // [rad]
    pub envelope_time: Vec<Vec<f64>>,
    /// Envelope amplitudes scaled by `1000/A_CV` to A/m².
    pub envelope_amplitude: Vec<Vec<f64>>,
}

/// One resolved gap-junction connection at its local endpoint. `peer_cv` is
/// a global CV index (spanning cell groups); `local_cv` is group-local.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedGapJunction {
    pub local_lid: CellLid,
    pub local_cv: usize,
    pub peer_cv: usize,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MechanismData {
    pub mechanisms: BTreeMap<String, MechConfig>,
    pub ions: BTreeMap<String, IonConfig>,
    pub stimuli: StimulusConfig,
    pub n_target: usize,
    pub target_divs: Vec<usize>,
    pub post_events: bool,
}

fn verify_mechanism(
    gprop: &CableCellGlobalProperties,
    info: &MechanismInfo,
    desc: &MechanismDesc,
) -> Result<(), LayoutError> {
    for (param, value) in &desc.values {
        let spec = info
            .parameters
            .get(param)
            .ok_or_else(|| LayoutError::NoSuchParameter {
                mech: desc.name.clone(),
                param: param.clone(),
            })?;
        if !spec.valid(*value) {
            return Err(LayoutError::InvalidParameterValue {
                mech: desc.name.clone(),
                param: param.clone(),
                value: *value,
            });
        }
    }

    for (ion, dep) in &info.ions {
        let valence = gprop
            .ion_species
            .get(ion)
            .ok_or_else(|| LayoutError::IonUnknown {
                mech: desc.name.clone(),
                ion: ion.clone(),
            })?;
        if let Some(expected) = dep.expected_valence {
            if expected != *valence {
                return Err(LayoutError::IonValenceMismatch {
                    mech: desc.name.clone(),
                    ion: ion.clone(),
                });
            }
        }
        if dep.write_reversal_potential
            && (dep.write_int_concentration || dep.write_ext_concentration)
        {
            return Err(LayoutError::WritesRevpotAndConcentration {
                mech: desc.name.clone(),
                ion: ion.clone(),
            });
        }
    }
    Ok(())
}

fn unique_union(a: &[usize], b: &[usize]) -> Vec<usize> {
    let mut u: Vec<usize> = a.iter().chain(b.iter()).copied().collect();
    u.sort_unstable();
    u.dedup();
    u
}

fn assignments_on_branch(assignments: &[(Mcable, f64)], branch: usize) -> Vec<(f64, f64, f64)> {
    assignments
        .iter()
        .filter(|(c, _)| c.branch == branch)
        .map(|(c, v)| (c.prox_pos, c.dist_pos, *v))
        .collect()
}

/// Sorted per-branch support list with a value per cable.
#[derive(Debug, Clone, Default)]
struct CableMap {
    entries: Vec<(Mcable, f64)>,
}

impl CableMap {
    fn insert(&mut self, cable: Mcable, value: f64) {
        self.entries.push((cable, value));
        self.entries.sort_by(|a, b| a.0.cmp(&b.0));
    }

    fn extent(&self) -> Mextent {
        Mextent::from_cables(self.entries.iter().map(|(c, _)| *c).collect())
    }

    fn on_branch(&self, branch: usize) -> Vec<(f64, f64, f64)> {
        assignments_on_branch(&self.entries, branch)
    }
}

fn overlaps_materially(extent: &Mextent, cable: Mcable) -> bool {
    let probe = Mextent::from_cables(vec![cable]);
    extent
        .intersect(&probe)
        .cables
        .iter()
        .any(|c| !c.is_trivial())
}

/// Builds mechanism data for a single cell. Gap-junction connections must be
/// sorted by local CV; CV indices in the result are cell-relative until
/// appended into a group.
pub fn build_mechanism_data(
    gprop: &CableCellGlobalProperties,
    catalogue: &MechanismCatalogue,
    cell: &CableCell,
    gj_conns: &[ResolvedGapJunction],
    d: &CvDiscretization,
    cell_idx: usize,
) -> Result<MechanismData, LayoutError> {
    let em = cell.embedding();
    let mut m = MechanismData::default();

    let mut write_xi: BTreeSet<String> = BTreeSet::new();
    let mut write_xo: BTreeSet<String> = BTreeSet::new();
    let mut ion_support: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    let mut init_iconc_mask: BTreeMap<String, CableMap> = BTreeMap::new();
    let mut init_econc_mask: BTreeMap<String, CableMap> = BTreeMap::new();

    let lookup = |name: &str| -> Result<&MechanismInfo, LayoutError> {
        catalogue
            .info(name)
            .map_err(|e| LayoutError::UnknownMechanism(e.0))
    };

    // Density mechanisms.

    for (name, on_cables) in &cell.region_assignments().density {
        let info = lookup(name)?;
        if info.kind != MechanismKind::Density {
            return Err(LayoutError::WrongMechanismKind {
                name: name.clone(),
                expected: "density",
            });
        }

        let param_names: Vec<&String> = info.parameters.keys().collect();
        let n_param = param_names.len();

        let mut config = MechConfig {
            kind: Some(MechanismKind::Density),
            ..Default::default()
        };
        for p in &param_names {
            config.param_values.push(((*p).clone(), Vec::new()));
        }

        let mut support = CableMap::default();
        let mut param_maps: Vec<CableMap> = vec![CableMap::default(); n_param];

        for (cable, desc) in on_cables {
            verify_mechanism(gprop, info, desc)?;
            support.insert(*cable, 1.0);
            for (i, p) in param_names.iter().enumerate() {
                let value = desc
                    .get(p)
                    .unwrap_or_else(|| info.parameters[*p].default);
                param_maps[i].insert(*cable, value);
            }
        }

        for cv in d.geometry.cell_cvs(cell_idx) {
            let mut area = 0.0;
            let mut param_on_cv = vec![0.0; n_param];

            for &c in d.geometry.cables(cv) {
                let sup = PwConst::over_cable(&support.on_branch(c.branch), c.prox_pos, c.dist_pos, 0.0);
                let area_on_cable = em.integrate_area_weighted(c, &sup);
                if area_on_cable == 0.0 {
                    continue;
                }
                area += area_on_cable;
                for (i, map) in param_maps.iter().enumerate() {
                    let pw = PwConst::over_cable(&map.on_branch(c.branch), c.prox_pos, c.dist_pos, 0.0);
                    param_on_cv[i] += em.integrate_area_weighted(c, &pw);
                }
            }

            if area > 0.0 {
                config.cv.push(cv);
                config.norm_area.push(area / d.cv_area[cv]);
                for (i, total) in param_on_cv.iter().enumerate() {
                    config.param_values[i].1.push(total / area);
                }
            }
        }

        for (ion, dep) in &info.ions {
            if dep.write_int_concentration {
                write_xi.insert(ion.clone());
                let mask = init_iconc_mask.entry(ion.clone()).or_default();
                for (cable, _) in &support.entries {
                    if overlaps_materially(&mask.extent(), *cable) {
                        return Err(LayoutError::OverlappingConcentrationWriters {
                            ion: ion.clone(),
                            mech: name.clone(),
                        });
                    }
                    mask.insert(*cable, 0.0);
                }
            }
            if dep.write_ext_concentration {
                write_xo.insert(ion.clone());
                let mask = init_econc_mask.entry(ion.clone()).or_default();
                for (cable, _) in &support.entries {
                    if overlaps_materially(&mask.extent(), *cable) {
                        return Err(LayoutError::OverlappingConcentrationWriters {
                            ion: ion.clone(),
                            mech: name.clone(),
                        });
                    }
                    mask.insert(*cable, 0.0);
                }
            }
        }

        for ion in info.ions.keys() {
            let support_cvs = ion_support.entry(ion.clone()).or_default();
            *support_cvs = unique_union(support_cvs, &config.cv);
        }

        if !config.cv.is_empty() {
            m.mechanisms.insert(name.clone(), config);
        }
    }

    // Synapses.

    struct SynapseInstance {
        cv: usize,
        param_offset: usize,
        target_index: usize,
    }

    let mut post_events = false;

    for (name, placements) in cell.synapses() {
        let info = lookup(name)?;
        if info.kind != MechanismKind::Point {
            return Err(LayoutError::WrongMechanismKind {
                name: name.clone(),
                expected: "point",
            });
        }
        post_events |= info.post_events;

        let param_names: Vec<&String> = info.parameters.keys().collect();
        let n_param = param_names.len();
        let n_inst = placements.len();

        let default_param: Vec<f64> = param_names
            .iter()
            .map(|p| info.parameters[*p].default)
            .collect();

        let mut all_param_values = vec![0.0; n_param * n_inst];
        let mut inst_list: Vec<SynapseInstance> = Vec::with_capacity(n_inst);

        for (k, pm) in placements.iter().enumerate() {
            verify_mechanism(gprop, info, &pm.item)?;
            let offset = k * n_param;
            all_param_values[offset..offset + n_param].copy_from_slice(&default_param);
            for (param, value) in &pm.item.values {
                let idx = param_names
                    .iter()
                    .position(|p| *p == param)
                    .expect("verified parameter is known");
                all_param_values[offset + idx] = *value;
            }
            inst_list.push(SynapseInstance {
                cv: d.geometry.location_cv(cell_idx, pm.loc, CvPrefer::Nonempty),
                param_offset: offset,
                target_index: pm.lid.0 as usize,
            });
        }

        // Order instances lexicographically by CV, parameter values, target
        // so equal-parameter instances in one CV are adjacent.
        let cmp_param = |a: &SynapseInstance, b: &SynapseInstance| -> std::cmp::Ordering {
            let pa = &all_param_values[a.param_offset..a.param_offset + n_param];
            let pb = &all_param_values[b.param_offset..b.param_offset + n_param];
            for (x, y) in pa.iter().zip(pb) {
                let ord = x.total_cmp(y);
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            std::cmp::Ordering::Equal
        };

        let mut cv_order: Vec<usize> = (0..n_inst).collect();
        cv_order.sort_by(|&i, &j| {
            let a = &inst_list[i];
            let b = &inst_list[j];
            a.cv.cmp(&b.cv)
                .then_with(|| cmp_param(a, b))
                .then_with(|| a.target_index.cmp(&b.target_index))
        });

        let coalesce = info.linear && gprop.coalesce_synapses;

        let mut config = MechConfig {
            kind: Some(MechanismKind::Point),
            ..Default::default()
        };
        for p in &param_names {
            config.param_values.push(((*p).clone(), Vec::new()));
        }

        let mut prev: Option<usize> = None;
        for &i in &cv_order {
            let inst = &inst_list[i];
            let same = prev.map_or(false, |p| {
                inst_list[p].cv == inst.cv
                    && cmp_param(&inst_list[p], inst) == std::cmp::Ordering::Equal
            });
            if coalesce && same {
                *config.multiplicity.last_mut().expect("entry exists") += 1;
            } else {
                config.cv.push(inst.cv);
                if coalesce {
                    config.multiplicity.push(1);
                }
                for (j, _) in param_names.iter().enumerate() {
                    config.param_values[j]
                        .1
                        .push(all_param_values[inst.param_offset + j]);
                }
            }
            config.target.push(inst.target_index);
            prev = Some(i);
        }

        for ion in info.ions.keys() {
            let support_cvs = ion_support.entry(ion.clone()).or_default();
            *support_cvs = unique_union(support_cvs, &config.cv);
        }
        for (ion, dep) in &info.ions {
            if dep.write_int_concentration {
                write_xi.insert(ion.clone());
            }
            if dep.write_ext_concentration {
                write_xo.insert(ion.clone());
            }
        }

        m.n_target += config.target.len();
        if !config.cv.is_empty() {
            m.mechanisms.insert(name.clone(), config);
        }
    }
    m.post_events = post_events;

    // Gap junctions, in two phases: a per-mechanism skeleton with kind and
    // parameter defaults, then one entry per resolved connection using the
    // parameter values of its local endpoint.

    struct JunctionDesc {
        name: String,
        param_values: Vec<f64>,
    }

    let mut junction_configs: BTreeMap<String, MechConfig> = BTreeMap::new();
    let mut lid_junction_desc: BTreeMap<u32, JunctionDesc> = BTreeMap::new();

    for (name, placements) in cell.junctions() {
        let info = lookup(name)?;
        if info.kind != MechanismKind::GapJunction {
            return Err(LayoutError::WrongMechanismKind {
                name: name.clone(),
                expected: "gap_junction",
            });
        }

        let param_names: Vec<&String> = info.parameters.keys().collect();
        let mut config = MechConfig {
            kind: Some(MechanismKind::GapJunction),
            ..Default::default()
        };
        for p in &param_names {
            config.param_values.push(((*p).clone(), Vec::new()));
        }

        for pm in placements {
            verify_mechanism(gprop, info, &pm.item)?;
            let param_values = param_names
                .iter()
                .map(|p| pm.item.get(p).unwrap_or_else(|| info.parameters[*p].default))
                .collect();
            lid_junction_desc.insert(
                pm.lid.0,
                JunctionDesc {
                    name: name.clone(),
                    param_values,
                },
            );
        }

        for (ion, dep) in &info.ions {
            if dep.write_int_concentration {
                write_xi.insert(ion.clone());
            }
            if dep.write_ext_concentration {
                write_xo.insert(ion.clone());
            }
        }

        junction_configs.insert(name.clone(), config);
    }

    for conn in gj_conns {
        let desc = &lid_junction_desc[&conn.local_lid.0];
        let config = junction_configs
            .get_mut(&desc.name)
            .expect("junction skeleton exists");
        config.cv.push(conn.local_cv);
        config.peer_cv.push(conn.peer_cv);
        config.local_weight.push(conn.weight);
        for (j, v) in desc.param_values.iter().enumerate() {
            config.param_values[j].1.push(*v);
        }
    }

    for (name, config) in junction_configs {
        if !config.cv.is_empty() {
            m.mechanisms.insert(name, config);
        }
    }

    // Stimuli.

    if !cell.stimuli().is_empty() {
        let stimuli = cell.stimuli();
        let mut config = StimulusConfig::default();

        let stimuli_cv: Vec<usize> = stimuli
            .iter()
            .map(|p| d.geometry.location_cv(cell_idx, p.loc, CvPrefer::Nonempty))
            .collect();

        let mut cv_order: Vec<usize> = (0..stimuli.len()).collect();
        cv_order.sort_by_key(|&i| stimuli_cv[i]);

        for i in cv_order {
            let stim = &stimuli[i].item;
            let cv = stimuli_cv[i];
            let cv_area_scale = 1000.0 / d.cv_area[cv]; // nA on a CV to A/m².

            config.cv.push(cv);
            config.frequency.push(stim.frequency);
            config.phase.push(stim.phase);

            let mut envl_t = Vec::with_capacity(stim.envelope.len());
            let mut envl_a = Vec::with_capacity(stim.envelope.len());
            for &(t, a) in &stim.envelope {
                envl_t.push(t);
                envl_a.push(a * cv_area_scale);
            }
            config.envelope_time.push(envl_t);
            config.envelope_amplitude.push(envl_a);
        }

        config.cv_unique = config.cv.clone();
        config.cv_unique.dedup();
        m.stimuli = config;
    }

    // Ions: support is the union over CVs of mechanisms using the ion;
    // initial concentrations follow painted assignments masked by the writer
    // regions (writers zero the initial mask before the area-weighted sum).

    let gdflt = &gprop.default_parameters;
    let dflt = cell.default_parameters();
    let assignments = cell.region_assignments();

    for (ion, cvs) in &ion_support {
        let mut config = IonConfig {
            cv: cvs.clone(),
            ..Default::default()
        };
        let n_cv = config.cv.len();
        config.init_iconc = vec![0.0; n_cv];
        config.init_econc = vec![0.0; n_cv];
        config.reset_iconc = vec![0.0; n_cv];
        config.reset_econc = vec![0.0; n_cv];
        config.init_revpot = vec![0.0; n_cv];

        let global_ion = gdflt
            .ion_data
            .get(ion)
            .copied()
            .unwrap_or_default();
        let cell_ion = dflt.ion_data.get(ion).copied().unwrap_or_default();
        let dflt_iconc = cell_ion
            .init_int_concentration
            .or(global_ion.init_int_concentration)
            .unwrap_or(0.0);
        let dflt_econc = cell_ion
            .init_ext_concentration
            .or(global_ion.init_ext_concentration)
            .unwrap_or(0.0);
        let dflt_rvpot = cell_ion
            .init_reversal_potential
            .or(global_ion.init_reversal_potential)
            .unwrap_or(0.0);

        let iconc_on_cable = assignments
            .init_int_concentration
            .get(ion)
            .cloned()
            .unwrap_or_default();
        let econc_on_cable = assignments
            .init_ext_concentration
            .get(ion)
            .cloned()
            .unwrap_or_default();
        let rvpot_on_cable = assignments
            .init_reversal_potential
            .get(ion)
            .cloned()
            .unwrap_or_default();

        for i in 0..n_cv {
            let cv = config.cv[i];
            if d.cv_area[cv] == 0.0 {
                continue;
            }

            for &c in d.geometry.cables(cv) {
                let iconc = PwConst::over_cable(
                    &assignments_on_branch(&iconc_on_cable, c.branch),
                    c.prox_pos,
                    c.dist_pos,
                    dflt_iconc,
                );
                let econc = PwConst::over_cable(
                    &assignments_on_branch(&econc_on_cable, c.branch),
                    c.prox_pos,
                    c.dist_pos,
                    dflt_econc,
                );
                let rvpot = PwConst::over_cable(
                    &assignments_on_branch(&rvpot_on_cable, c.branch),
                    c.prox_pos,
                    c.dist_pos,
                    dflt_rvpot,
                );

                config.reset_iconc[i] += em.integrate_area_weighted(c, &iconc);
                config.reset_econc[i] += em.integrate_area_weighted(c, &econc);
                config.init_revpot[i] += em.integrate_area_weighted(c, &rvpot);

                let imask = init_iconc_mask
                    .get(ion)
                    .map(|m| m.on_branch(c.branch))
                    .unwrap_or_default();
                let emask = init_econc_mask
                    .get(ion)
                    .map(|m| m.on_branch(c.branch))
                    .unwrap_or_default();
                let iconc_masked =
                    PwConst::over_cable(&imask, c.prox_pos, c.dist_pos, 1.0).zip_mul(&iconc);
                let econc_masked =
                    PwConst::over_cable(&emask, c.prox_pos, c.dist_pos, 1.0).zip_mul(&econc);

                config.init_iconc[i] += em.integrate_area_weighted(c, &iconc_masked);
                config.init_econc[i] += em.integrate_area_weighted(c, &econc_masked);
            }

            let oo_area = 1.0 / d.cv_area[cv];
            config.reset_iconc[i] *= oo_area;
            config.reset_econc[i] *= oo_area;
            config.init_revpot[i] *= oo_area;
            config.init_iconc[i] *= oo_area;
            config.init_econc[i] *= oo_area;
        }

        config.iconc_written = write_xi.contains(ion);
        config.econc_written = write_xo.contains(ion);
        if !config.cv.is_empty() {
            m.ions.insert(ion.clone(), config);
        }
    }

    // Reversal potential methods.

    let mut revpot_tbl: BTreeMap<String, MechanismDesc> = BTreeMap::new();
    let mut revpot_specified: BTreeSet<String> = BTreeSet::new();

    for ion in gprop.ion_species.keys() {
        let maybe_revpot = dflt
            .reversal_potential_method
            .get(ion)
            .or_else(|| gdflt.reversal_potential_method.get(ion));
        let Some(revpot) = maybe_revpot else {
            continue;
        };

        let info = lookup(&revpot.name)?;
        if info.kind != MechanismKind::ReversalPotential {
            return Err(LayoutError::WrongMechanismKind {
                name: revpot.name.clone(),
                expected: "reversal_potential",
            });
        }
        verify_mechanism(gprop, info, revpot)?;
        revpot_specified.insert(ion.clone());

        let mut writes_this_revpot = false;
        for (dep_ion, dep) in &info.ions {
            if dep.write_reversal_potential {
                if let Some(existing) = revpot_tbl.get(dep_ion) {
                    if existing.name != revpot.name || existing.values != revpot.values {
                        return Err(LayoutError::InconsistentRevpotAssignment(
                            revpot.name.clone(),
                        ));
                    }
                } else {
                    revpot_tbl.insert(dep_ion.clone(), revpot.clone());
                }
                writes_this_revpot |= dep_ion == ion;
            }
        }

        if !writes_this_revpot {
            return Err(LayoutError::RevpotNotWritten {
                ion: ion.clone(),
                mech: revpot.name.clone(),
            });
        }

        m.ions.entry(ion.clone()).or_default().revpot_written = true;

        let ion_cvs = m.ions[ion].cv.clone();
        if ion_cvs.is_empty() {
            continue;
        }

        if let Some(config) = m.mechanisms.get_mut(&revpot.name) {
            config.cv = unique_union(&config.cv, &ion_cvs);
            config.norm_area = vec![1.0; config.cv.len()];
            for pv in &mut config.param_values {
                let front = pv.1.first().copied().unwrap_or(0.0);
                pv.1 = vec![front; config.cv.len()];
            }
        } else {
            let mut config = MechConfig {
                kind: Some(MechanismKind::ReversalPotential),
                cv: ion_cvs.clone(),
                ..Default::default()
            };
            config.norm_area = vec![1.0; config.cv.len()];
            for (param, spec) in &info.parameters {
                let value = revpot.get(param).unwrap_or(spec.default);
                config
                    .param_values
                    .push((param.clone(), vec![value; config.cv.len()]));
            }
            m.mechanisms.insert(revpot.name.clone(), config);
        }
    }

    for (ion, desc) in &revpot_tbl {
        if !revpot_specified.contains(ion) {
            return Err(LayoutError::RevpotUndeclaredIon {
                ion: ion.clone(),
                mech: desc.name.clone(),
            });
        }
    }

    m.target_divs = vec![0, m.n_target];
    Ok(m)
}

/// Appends mechanism data of the next cell; CV indices are already absolute
/// (from the combined discretization), only target numbers shift.
pub fn append_mechanism_data(left: &mut MechanismData, right: &MechanismData) {
    let target_offset = left.n_target;

    for (ion, r) in &right.ions {
        let l = left.ions.entry(ion.clone()).or_default();
        l.cv.extend_from_slice(&r.cv);
        l.init_iconc.extend_from_slice(&r.init_iconc);
        l.init_econc.extend_from_slice(&r.init_econc);
        l.reset_iconc.extend_from_slice(&r.reset_iconc);
        l.reset_econc.extend_from_slice(&r.reset_econc);
        l.init_revpot.extend_from_slice(&r.init_revpot);
        l.iconc_written |= r.iconc_written;
        l.econc_written |= r.econc_written;
        l.revpot_written |= r.revpot_written;
    }

    for (name, r) in &right.mechanisms {
        match left.mechanisms.get_mut(name) {
            None => {
                let mut config = r.clone();
                for t in &mut config.target {
                    *t += target_offset;
                }
                left.mechanisms.insert(name.clone(), config);
            }
            Some(l) => {
                assert_eq!(l.kind, r.kind, "mechanism kind mismatch on append");
                l.cv.extend_from_slice(&r.cv);
                l.peer_cv.extend_from_slice(&r.peer_cv);
                l.multiplicity.extend_from_slice(&r.multiplicity);
                l.norm_area.extend_from_slice(&r.norm_area);
                l.local_weight.extend_from_slice(&r.local_weight);
                for t in &r.target {
                    l.target.push(t + target_offset);
                }
                assert_eq!(
                    l.param_values.len(),
                    r.param_values.len(),
                    "parameter table mismatch on append"
                );
                for (lp, rp) in l.param_values.iter_mut().zip(&r.param_values) {
                    assert_eq!(lp.0, rp.0, "parameter name mismatch on append");
                    lp.1.extend_from_slice(&rp.1);
                }
            }
        }
    }

    left.stimuli.cv.extend_from_slice(&right.stimuli.cv);
    left.stimuli
        .cv_unique
        .extend_from_slice(&right.stimuli.cv_unique);
    left.stimuli
        .frequency
        .extend_from_slice(&right.stimuli.frequency);
    left.stimuli.phase.extend_from_slice(&right.stimuli.phase);
    left.stimuli
        .envelope_time
        .extend(right.stimuli.envelope_time.iter().cloned());
    left.stimuli
        .envelope_amplitude
        .extend(right.stimuli.envelope_amplitude.iter().cloned());

    left.n_target += right.n_target;
    left.post_events |= right.post_events;

    if left.target_divs.is_empty() {
        left.target_divs = right.target_divs.clone();
    } else if !right.target_divs.is_empty() {
        let tail = *left.target_divs.last().expect("non-empty divs");
        for t in &right.target_divs[1..] {
            left.target_divs.push(tail + t);
        }
    }
    debug_assert_eq!(left.n_target, *left.target_divs.last().unwrap_or(&0));
}
