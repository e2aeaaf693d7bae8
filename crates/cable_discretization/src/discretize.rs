//! Per-CV electrical coefficients over a CV geometry.

use cable_cell::{default_cv_policy, CableCell, CableCellGlobalProperties};
use cable_morphology::{Mcable, PwConst, MNPOS};
use rayon::prelude::*;

use crate::{append_geometry, CvGeometry};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CvDiscretization {
    pub geometry: CvGeometry,
    /// Conductance to the parent CV [µS].
    pub face_conductance: Vec<f64>,
    /// Membrane area [µm²].
    pub cv_area: Vec<f64>,
    /// Membrane capacitance [pF].
    pub cv_capacitance: Vec<f64>,
    pub init_membrane_potential: Vec<f64>, // [mV]
    pub temperature_k: Vec<f64>,           // [K]
    pub diam_um: Vec<f64>,
    /// Axial resistivity per cell, per branch [Ω·cm].
    pub axial_resistivity: Vec<Vec<PwConst>>,
}

impl CvDiscretization {
    pub fn size(&self) -> usize {
        self.geometry.size()
    }

    pub fn n_cell(&self) -> usize {
        self.geometry.n_cell()
    }
}

fn assignments_on_branch(assignments: &[(Mcable, f64)], branch: usize) -> Vec<(f64, f64, f64)> {
    assignments
        .iter()
        .filter(|(c, _)| c.branch == branch)
        .map(|(c, v)| (c.prox_pos, c.dist_pos, *v))
        .collect()
}

/// Discretizes one cell against the resolved policy and defaults.
pub fn discretize(cell: &CableCell, global: &CableCellGlobalProperties) -> CvDiscretization {
    let dflt = cell.default_parameters();
    let gdflt = &global.default_parameters;

    let policy = dflt
        .discretization
        .clone()
        .or_else(|| gdflt.discretization.clone())
        .unwrap_or_else(default_cv_policy);

    let mut d = CvDiscretization {
        geometry: CvGeometry::new(cell, &policy),
        ..Default::default()
    };
    if d.geometry.is_empty() {
        return d;
    }

    let n_cv = d.geometry.size();
    d.face_conductance = vec![0.0; n_cv];
    d.cv_area = vec![0.0; n_cv];
    d.cv_capacitance = vec![0.0; n_cv];
    d.init_membrane_potential = vec![0.0; n_cv];
    d.temperature_k = vec![0.0; n_cv];
    d.diam_um = vec![0.0; n_cv];

    let dflt_resistivity = dflt
        .axial_resistivity
        .or(gdflt.axial_resistivity)
        .expect("global default axial resistivity is set");
    let dflt_capacitance = dflt
        .membrane_capacitance
        .or(gdflt.membrane_capacitance)
        .expect("global default membrane capacitance is set");
    let dflt_potential = dflt
        .init_membrane_potential
        .or(gdflt.init_membrane_potential)
        .expect("global default membrane potential is set");
    let dflt_temperature = dflt
        .temperature_k
        .or(gdflt.temperature_k)
        .expect("global default temperature is set");

    let assignments = cell.region_assignments();
    let em = cell.embedding();
    let n_branch = d.geometry.n_branch(0);

    let mut resistivity = Vec::with_capacity(n_branch);
    for b in 0..n_branch {
        resistivity.push(PwConst::over_cable(
            &assignments_on_branch(&assignments.axial_resistivity, b),
            0.0,
            1.0,
            dflt_resistivity,
        ));
    }

    for i in 0..n_cv {
        let cv_cables: Vec<Mcable> = d.geometry.cables(i).to_vec();

        // Flux between adjacent CVs is computed as if there were no membrane
        // currents, with voltages taken to be exact at a reference point per
        // CV: the midpoint for an unbranched CV, otherwise the branch point
        // shared with the neighbour.
        let p = d.geometry.cv_parent[i];
        if p != MNPOS {
            let parent_cables = d.geometry.cables(p);
            let bid = cv_cables[0].branch;
            let mut parent_refpt = 0.0;
            let mut cv_refpt = 1.0;

            if cv_cables.len() == 1 {
                cv_refpt = 0.5 * (cv_cables[0].prox_pos + cv_cables[0].dist_pos);
            }
            if parent_cables.len() == 1 {
                // A trivial parent CV with a zero-length cable might not be
                // on the same branch.
                if parent_cables[0].branch == bid {
                    parent_refpt = 0.5 * (parent_cables[0].prox_pos + parent_cables[0].dist_pos);
                }
            }

            let span = Mcable::new(bid, parent_refpt, cv_refpt);
            let resistance = em.integrate_ixa(span, &resistivity[bid]);
            d.face_conductance[i] = 100.0 / resistance; // 100 scales to µS.
        }

        let mut cv_length = 0.0;
        for &c in &cv_cables {
            d.cv_area[i] += em.integrate_area(c);

            let cap = PwConst::over_cable(
                &assignments_on_branch(&assignments.membrane_capacitance, c.branch),
                c.prox_pos,
                c.dist_pos,
                dflt_capacitance,
            );
            d.cv_capacitance[i] += em.integrate_area_weighted(c, &cap);

            let vin = PwConst::over_cable(
                &assignments_on_branch(&assignments.init_membrane_potential, c.branch),
                c.prox_pos,
                c.dist_pos,
                dflt_potential,
            );
            d.init_membrane_potential[i] += em.integrate_area_weighted(c, &vin);

            let temp = PwConst::over_cable(
                &assignments_on_branch(&assignments.temperature_k, c.branch),
                c.prox_pos,
                c.dist_pos,
                dflt_temperature,
            );
            d.temperature_k[i] += em.integrate_area_weighted(c, &temp);

            cv_length += em.integrate_length(c);
        }

        if d.cv_area[i] > 0.0 {
            d.init_membrane_potential[i] /= d.cv_area[i];
            d.temperature_k[i] /= d.cv_area[i];

            // A trivial parent with no grandparent takes its initial values
            // from this CV; trivial CVs elsewhere inherit from their parent
            // below.
            if p != MNPOS && d.geometry.cv_parent[p] == MNPOS && d.cv_area[p] == 0.0 {
                d.init_membrane_potential[p] = d.init_membrane_potential[i];
                d.temperature_k[p] = d.temperature_k[i];
            }
        } else if p != MNPOS {
            d.init_membrane_potential[i] = d.init_membrane_potential[p];
            d.temperature_k[i] = d.temperature_k[p];
        }

        if cv_length > 0.0 {
            d.diam_um[i] = d.cv_area[i] / (cv_length * std::f64::consts::PI);
        }
    }

    d.axial_resistivity.push(resistivity);
    d
}

/// Discretizes a group of cells in parallel and combines the results.
pub fn discretize_cells(
    cells: &[CableCell],
    global: &CableCellGlobalProperties,
) -> CvDiscretization {
    let per_cell: Vec<CvDiscretization> = cells
        .par_iter()
        .map(|cell| discretize(cell, global))
        .collect();

    let mut combined = CvDiscretization::default();
    for d in &per_cell {
        append_discretization(&mut combined, d);
    }
    combined
}

pub fn append_discretization(left: &mut CvDiscretization, right: &CvDiscretization) {
    append_geometry(&mut left.geometry, &right.geometry);
    left.face_conductance.extend_from_slice(&right.face_conductance);
    left.cv_area.extend_from_slice(&right.cv_area);
    left.cv_capacitance.extend_from_slice(&right.cv_capacitance);
    left.init_membrane_potential
        .extend_from_slice(&right.init_membrane_potential);
    left.temperature_k.extend_from_slice(&right.temperature_k);
    left.diam_um.extend_from_slice(&right.diam_um);
    left.axial_resistivity
        .extend(right.axial_resistivity.iter().cloned());
}

#[cfg(test)]
mod tests {
    use super::*;
    use cable_cell::{CvPolicy, Decor, Paintable};
    use cable_morphology::cylinder_morphology;

    fn passive_cylinder(policy: CvPolicy) -> CvDiscretization {
        let decor = Decor::new()
            .set_default(Paintable::InitMembranePotential(-65.0))
            .set_default(Paintable::AxialResistivity(90.0))
            .set_default(Paintable::MembraneCapacitance(0.01))
            .set_discretization(policy);
        let cell = CableCell::new(cylinder_morphology(200.0, 0.5), decor);
        discretize(&cell, &CableCellGlobalProperties::default())
    }

    #[test]
    fn areas_sum_to_embedded_surface() {
        let d = passive_cylinder(CvPolicy::fixed_per_branch(4));
        let total: f64 = d.cv_area.iter().sum();
        let expected = 2.0 * std::f64::consts::PI * 0.5 * 200.0;
        assert!((total - expected).abs() < 1e-9 * expected);
    }

    #[test]
    fn capacitance_scales_with_area() {
        let d = passive_cylinder(CvPolicy::fixed_per_branch(4));
        for i in 0..d.size() {
            // C = c_m·A: 0.01 F/m² × µm² = 0.01 pF/µm².
            let expected = 0.01 * d.cv_area[i];
            assert!((d.cv_capacitance[i] - expected).abs() < 1e-12 * expected.max(1.0));
        }
    }

    #[test]
    fn face_conductance_matches_cable_formula() {
        let d = passive_cylinder(CvPolicy::fixed_per_branch(2));
        // Reference points are the two CV midpoints: half the cable length.
        let r = std::f64::consts::PI * 0.25;
        let expected = 100.0 / (90.0 * 100.0 / r);
        assert!((d.face_conductance[1] - expected).abs() < 1e-9 * expected);
        assert_eq!(d.face_conductance[0], 0.0);
    }

    #[test]
    fn init_potential_is_area_weighted_mean() {
        let d = passive_cylinder(CvPolicy::fixed_per_branch(3));
        for &v in &d.init_membrane_potential {
            assert!((v + 65.0).abs() < 1e-9);
        }
    }

    #[test]
    fn diameter_recovers_cylinder() {
        let d = passive_cylinder(CvPolicy::fixed_per_branch(2));
        for &dm in &d.diam_um {
            assert!((dm - 1.0).abs() < 1e-9);
        }
    }
}
