//! Resolution of probe addresses into handles onto the shared state.

use std::collections::BTreeMap;

use cable_cell::{CableCell, ProbeAddress};
use cable_core::CellMember;
use cable_discretization::{
    axial_current_interpolant, voltage_interpolant, CvDiscretization, CvPrefer,
};
use cable_events::TargetHandle;
use cable_layout::MechanismData;
use cable_morphology::{Mcable, Mlocation};

use crate::CellGroupError;

/// Where a probe part reads from; indices are resolved at init.
#[derive(Debug, Clone, PartialEq)]
pub enum ArraySource {
    Voltage,
    CurrentDensity,
    StimCurrent,
    IonCurrent(String),
    IonIntConcentration(String),
    IonExtConcentration(String),
    MechState { mech_id: u32, var: String },
}

/// One sampled value: a weighted sum of array reads.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeTerm {
    pub parts: Vec<(ArraySource, usize, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeData {
    Scalar(ProbeTerm),
    Multi(Vec<ProbeTerm>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeMetadata {
    Location(Mlocation),
    Cables(Vec<Mcable>),
    PointTarget { target: u32, multiplicity: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProbe {
    pub id: CellMember,
    pub metadata: ProbeMetadata,
    pub data: ProbeData,
}

fn scalar(source: ArraySource, index: usize) -> ProbeData {
    ProbeData::Scalar(ProbeTerm {
        parts: vec![(source, index, 1.0)],
    })
}

fn nonempty_cables(d: &CvDiscretization, cv: usize) -> Vec<Mcable> {
    d.geometry
        .cables(cv)
        .iter()
        .copied()
        .filter(|c| !c.is_trivial())
        .collect()
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn resolve_probe(
    addr: &ProbeAddress,
    cell: &CableCell,
    cell_idx: usize,
    d: &CvDiscretization,
    m: &MechanismData,
    target_handles: &[TargetHandle],
    mech_slot_by_name: &BTreeMap<String, (u32, usize)>,
    id: CellMember,
) -> Result<Vec<ResolvedProbe>, CellGroupError> {
    let mut out = Vec::new();
    let em = cell.embedding();

    let mech_id = |name: &str| -> Option<u32> { mech_slot_by_name.get(name).map(|(id, _)| *id) };

    let check_state = |name: &str, state: &str| -> Result<(), CellGroupError> {
        let known = mech_slot_by_name.contains_key(name);
        if !known {
            return Err(CellGroupError::UnknownMechanismState {
                mechanism: name.to_string(),
                state: state.to_string(),
            });
        }
        Ok(())
    };

    let stim_slot = |cv: usize| -> Option<usize> { m.stimuli.cv_unique.binary_search(&cv).ok() };

    match addr {
        ProbeAddress::MembraneVoltage(loc) => {
            let vi = voltage_interpolant(cell, d, cell_idx, *loc);
            out.push(ResolvedProbe {
                id,
                metadata: ProbeMetadata::Location(*loc),
                data: ProbeData::Scalar(ProbeTerm {
                    parts: vec![
                        (ArraySource::Voltage, vi.proximal_cv, vi.proximal_coef),
                        (ArraySource::Voltage, vi.distal_cv, vi.distal_coef),
                    ],
                }),
            });
        }
        ProbeAddress::MembraneVoltageCell => {
            let mut terms = Vec::new();
            let mut cables = Vec::new();
            for cv in d.geometry.cell_cvs(cell_idx) {
                for cable in d.geometry.cables(cv) {
                    terms.push(ProbeTerm {
                        parts: vec![(ArraySource::Voltage, cv, 1.0)],
                    });
                    cables.push(*cable);
                }
            }
            out.push(ResolvedProbe {
                id,
                metadata: ProbeMetadata::Cables(cables),
                data: ProbeData::Multi(terms),
            });
        }
        ProbeAddress::AxialCurrent(loc) => {
            let vi = axial_current_interpolant(cell, d, cell_idx, *loc);
            out.push(ResolvedProbe {
                id,
                metadata: ProbeMetadata::Location(*loc),
                data: ProbeData::Scalar(ProbeTerm {
                    parts: vec![
                        (ArraySource::Voltage, vi.proximal_cv, vi.proximal_coef),
                        (ArraySource::Voltage, vi.distal_cv, vi.distal_coef),
                    ],
                }),
            });
        }
        ProbeAddress::TotalIonCurrentDensity(loc) => {
            let cv = d.geometry.location_cv(cell_idx, *loc, CvPrefer::Nonempty);
            let mut parts = vec![(ArraySource::CurrentDensity, cv, 1.0)];
            if let Some(slot) = stim_slot(cv) {
                parts.push((ArraySource::StimCurrent, slot, -1.0));
            }
            out.push(ResolvedProbe {
                id,
                metadata: ProbeMetadata::Location(*loc),
                data: ProbeData::Scalar(ProbeTerm { parts }),
            });
        }
        ProbeAddress::TotalIonCurrentCell => {
            let mut terms = Vec::new();
            let mut cables = Vec::new();
            for cv in d.geometry.cell_cvs(cell_idx) {
                for cable in nonempty_cables(d, cv) {
                    let area = em.integrate_area(cable); // [µm²]
                    if area > 0.0 {
                        // Scale from µm²·A/m² to nA.
                        let mut parts = vec![(ArraySource::CurrentDensity, cv, 0.001 * area)];
                        if let Some(slot) = stim_slot(cv) {
                            parts.push((ArraySource::StimCurrent, slot, -0.001 * area));
                        }
                        terms.push(ProbeTerm { parts });
                        cables.push(cable);
                    }
                }
            }
            out.push(ResolvedProbe {
                id,
                metadata: ProbeMetadata::Cables(cables),
                data: ProbeData::Multi(terms),
            });
        }
        ProbeAddress::TotalCurrentCell => {
            // Membrane current per cable: (total − stimulus)·area, in nA.
            let mut terms = Vec::new();
            let mut cables = Vec::new();
            for cv in d.geometry.cell_cvs(cell_idx) {
                let oo_cv_area = if d.cv_area[cv] > 0.0 {
                    1.0 / d.cv_area[cv]
                } else {
                    0.0
                };
                for cable in nonempty_cables(d, cv) {
                    let area = em.integrate_area(cable);
                    if area > 0.0 {
                        let w = 0.001 * d.cv_area[cv] * (area * oo_cv_area);
                        let mut parts = vec![(ArraySource::CurrentDensity, cv, w)];
                        if let Some(slot) = stim_slot(cv) {
                            parts.push((ArraySource::StimCurrent, slot, -w));
                        }
                        terms.push(ProbeTerm { parts });
                        cables.push(cable);
                    }
                }
            }
            out.push(ResolvedProbe {
                id,
                metadata: ProbeMetadata::Cables(cables),
                data: ProbeData::Multi(terms),
            });
        }
        ProbeAddress::StimulusCurrentCell => {
            let mut terms = Vec::new();
            let mut cables = Vec::new();
            for cv in d.geometry.cell_cvs(cell_idx) {
                let Some(slot) = stim_slot(cv) else { continue };
                for cable in nonempty_cables(d, cv) {
                    let area = em.integrate_area(cable);
                    if area > 0.0 {
                        terms.push(ProbeTerm {
                            parts: vec![(ArraySource::StimCurrent, slot, 0.001 * area)],
                        });
                        cables.push(cable);
                    }
                }
            }
            out.push(ResolvedProbe {
                id,
                metadata: ProbeMetadata::Cables(cables),
                data: ProbeData::Multi(terms),
            });
        }
        ProbeAddress::DensityState {
            mechanism,
            state,
            location,
        } => {
            check_state(mechanism, state)?;
            let Some(config) = m.mechanisms.get(mechanism) else {
                return Ok(out);
            };
            let cv = d.geometry.location_cv(cell_idx, *location, CvPrefer::Nonempty);
            if let Ok(index) = config.cv.binary_search(&cv) {
                out.push(ResolvedProbe {
                    id,
                    metadata: ProbeMetadata::Location(*location),
                    data: scalar(
                        ArraySource::MechState {
                            mech_id: mech_id(mechanism).expect("checked above"),
                            var: state.clone(),
                        },
                        index,
                    ),
                });
            }
        }
        ProbeAddress::DensityStateCell { mechanism, state } => {
            check_state(mechanism, state)?;
            let Some(config) = m.mechanisms.get(mechanism) else {
                return Ok(out);
            };
            let id_num = mech_id(mechanism).expect("checked above");
            let cell_range = d.geometry.cell_cvs(cell_idx);
            let mut terms = Vec::new();
            let mut cables = Vec::new();
            for (index, &cv) in config.cv.iter().enumerate() {
                if !cell_range.contains(&cv) {
                    continue;
                }
                for cable in nonempty_cables(d, cv) {
                    terms.push(ProbeTerm {
                        parts: vec![(
                            ArraySource::MechState {
                                mech_id: id_num,
                                var: state.clone(),
                            },
                            index,
                            1.0,
                        )],
                    });
                    cables.push(cable);
                }
            }
            out.push(ResolvedProbe {
                id,
                metadata: ProbeMetadata::Cables(cables),
                data: ProbeData::Multi(terms),
            });
        }
        ProbeAddress::PointState {
            target,
            mechanism,
            state,
        } => {
            check_state(mechanism, state)?;
            let Some(config) = m.mechanisms.get(mechanism) else {
                return Ok(out);
            };
            let cg_target = *target as usize + m.target_divs[cell_idx];
            if cg_target >= m.target_divs[cell_idx + 1] {
                return Ok(out);
            }
            let handle = target_handles[cg_target];
            let id_num = mech_id(mechanism).expect("checked above");
            if handle.mech_id != id_num {
                return Ok(out);
            }
            let multiplicity = if config.multiplicity.is_empty() {
                1
            } else {
                config.multiplicity[handle.mech_index as usize]
            };
            out.push(ResolvedProbe {
                id,
                metadata: ProbeMetadata::PointTarget {
                    target: *target,
                    multiplicity,
                },
                data: scalar(
                    ArraySource::MechState {
                        mech_id: id_num,
                        var: state.clone(),
                    },
                    handle.mech_index as usize,
                ),
            });
        }
        ProbeAddress::PointStateCell { mechanism, state } => {
            check_state(mechanism, state)?;
            if !m.mechanisms.contains_key(mechanism) {
                return Ok(out);
            }
            let id_num = mech_id(mechanism).expect("checked above");
            let base = m.target_divs[cell_idx];
            let end = m.target_divs[cell_idx + 1];
            let mut terms = Vec::new();
            for target in base..end {
                let handle = target_handles[target];
                if handle.mech_id != id_num {
                    continue;
                }
                terms.push(ProbeTerm {
                    parts: vec![(
                        ArraySource::MechState {
                            mech_id: id_num,
                            var: state.clone(),
                        },
                        handle.mech_index as usize,
                        1.0,
                    )],
                });
            }
            out.push(ResolvedProbe {
                id,
                metadata: ProbeMetadata::PointTarget {
                    target: 0,
                    multiplicity: terms.len() as u32,
                },
                data: ProbeData::Multi(terms),
            });
        }
        ProbeAddress::IonCurrentDensity { ion, location } => {
            if let Some(index) = ion_index(m, d, cell_idx, ion, *location) {
                out.push(ResolvedProbe {
                    id,
                    metadata: ProbeMetadata::Location(*location),
                    data: scalar(ArraySource::IonCurrent(ion.clone()), index),
                });
            }
        }
        ProbeAddress::IonCurrentCell { ion } => {
            let Some(config) = m.ions.get(ion) else {
                return Ok(out);
            };
            let cell_range = d.geometry.cell_cvs(cell_idx);
            let mut terms = Vec::new();
            let mut cables = Vec::new();
            for (index, &cv) in config.cv.iter().enumerate() {
                if !cell_range.contains(&cv) {
                    continue;
                }
                for cable in nonempty_cables(d, cv) {
                    let area = em.integrate_area(cable);
                    if area > 0.0 {
                        terms.push(ProbeTerm {
                            parts: vec![(ArraySource::IonCurrent(ion.clone()), index, 0.001 * area)],
                        });
                        cables.push(cable);
                    }
                }
            }
            out.push(ResolvedProbe {
                id,
                metadata: ProbeMetadata::Cables(cables),
                data: ProbeData::Multi(terms),
            });
        }
        ProbeAddress::IonIntConcentration { ion, location } => {
            if let Some(index) = ion_index(m, d, cell_idx, ion, *location) {
                out.push(ResolvedProbe {
                    id,
                    metadata: ProbeMetadata::Location(*location),
                    data: scalar(ArraySource::IonIntConcentration(ion.clone()), index),
                });
            }
        }
        ProbeAddress::IonIntConcentrationCell { ion } => {
            ion_conc_cell(&mut out, m, d, cell_idx, ion, id, false);
        }
        ProbeAddress::IonExtConcentration { ion, location } => {
            if let Some(index) = ion_index(m, d, cell_idx, ion, *location) {
                out.push(ResolvedProbe {
                    id,
                    metadata: ProbeMetadata::Location(*location),
                    data: scalar(ArraySource::IonExtConcentration(ion.clone()), index),
                });
            }
        }
        ProbeAddress::IonExtConcentrationCell { ion } => {
            ion_conc_cell(&mut out, m, d, cell_idx, ion, id, true);
        }
    }
    Ok(out)
}

fn ion_index(
    m: &MechanismData,
    d: &CvDiscretization,
    cell_idx: usize,
    ion: &str,
    loc: Mlocation,
) -> Option<usize> {
    let config = m.ions.get(ion)?;
    let cv = d.geometry.location_cv(cell_idx, loc, CvPrefer::Nonempty);
    config.cv.binary_search(&cv).ok()
}

fn ion_conc_cell(
    out: &mut Vec<ResolvedProbe>,
    m: &MechanismData,
    d: &CvDiscretization,
    cell_idx: usize,
    ion: &str,
    id: CellMember,
    external: bool,
) {
    let Some(config) = m.ions.get(ion) else {
        return;
    };
    let cell_range = d.geometry.cell_cvs(cell_idx);
    let mut terms = Vec::new();
    let mut cables = Vec::new();
    for (index, &cv) in config.cv.iter().enumerate() {
        if !cell_range.contains(&cv) {
            continue;
        }
        for cable in nonempty_cables(d, cv) {
            let source = if external {
                ArraySource::IonExtConcentration(ion.to_string())
            } else {
                ArraySource::IonIntConcentration(ion.to_string())
            };
            terms.push(ProbeTerm {
                parts: vec![(source, index, 1.0)],
            });
            cables.push(cable);
        }
    }
    out.push(ResolvedProbe {
        id,
        metadata: ProbeMetadata::Cables(cables),
        data: ProbeData::Multi(terms),
    });
}
