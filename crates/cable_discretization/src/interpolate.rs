//! Voltage and axial-current interpolation at arbitrary sites.
//!
//! Interpolated values are determined from voltage references: a CV from
//! which the membrane voltage is taken, and a location within that CV where
//! the voltage is deemed accurate. An unbranched CV has one reference at its
//! centre; otherwise every fork in the CV is a reference location.

use cable_cell::CableCell;
use cable_morphology::{Mcable, Mlocation, Morphology, MNPOS};

use crate::{CvDiscretization, CvGeometry, CvPrefer};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoltageInterpolant {
    pub proximal_cv: usize,
    pub distal_cv: usize,
    /// For voltage interpolation the coefficients sum to 1; a site outside
    /// the reference span extrapolates with a negative proximal coefficient.
    pub proximal_coef: f64,
    pub distal_coef: f64,
}

#[derive(Debug, Clone, Copy)]
struct VoltageReference {
    cv: usize,
    loc: Mlocation,
}

/// Locations coincident with `x` under projection onto the morphology.
fn coincident_locations(m: &Morphology, x: Mlocation) -> Vec<Mlocation> {
    let mut result = Vec::new();
    if x.pos == 0.0 {
        let parent = m.branch_parent(x.branch);
        if parent != MNPOS {
            result.push(Mlocation::new(parent, 1.0));
            for &sibling in m.branch_children(parent) {
                if sibling != x.branch {
                    result.push(Mlocation::new(sibling, 0.0));
                }
            }
        }
    } else if x.pos == 1.0 {
        for &child in m.branch_children(x.branch) {
            result.push(Mlocation::new(child, 0.0));
        }
    }
    result
}

fn cables_intersect_location(cables: &[Mcable], x: Mlocation) -> bool {
    cables
        .iter()
        .any(|c| c.branch == x.branch && c.prox_pos <= x.pos && x.pos <= c.dist_pos)
}

fn cv_simple(geom: &CvGeometry, cv: usize) -> bool {
    geom.cables(cv).len() == 1
}

fn cv_midpoint(geom: &CvGeometry, cv: usize) -> Mlocation {
    let c = geom.cables(cv)[0];
    Mlocation::new(c.branch, 0.5 * (c.prox_pos + c.dist_pos))
}

fn reference_points(
    morph: &Morphology,
    geom: &CvGeometry,
    cell_idx: usize,
    site: Mlocation,
) -> (VoltageReference, VoltageReference) {
    let bid = site.branch;
    let mut check_parent = true;
    let mut check_child = true;

    let cv_contains_fork = |cv: usize, x: Mlocation| {
        if cv_simple(geom, cv) {
            return false;
        }
        coincident_locations(morph, x)
            .into_iter()
            .any(|y| cables_intersect_location(geom.cables(cv), y))
    };

    let site_cv = geom.location_cv(cell_idx, site, CvPrefer::Empty);
    let site_loc;
    if cv_simple(geom, site_cv) {
        site_loc = cv_midpoint(geom, site_cv);
    } else if cv_contains_fork(site_cv, Mlocation::new(bid, 0.0)) {
        site_loc = Mlocation::new(bid, 0.0);
        check_parent = false;
    } else {
        // Not simple and without the head of the branch as a fork point, so
        // the tail of the branch must be one.
        debug_assert!(cv_contains_fork(site_cv, Mlocation::new(bid, 1.0)));
        site_loc = Mlocation::new(bid, 1.0);
        check_child = false;
    }
    let site_ref = VoltageReference {
        cv: site_cv,
        loc: site_loc,
    };

    let mut parent_ref = None;
    if check_parent {
        let p = geom.cv_parent[site_cv];
        if p != MNPOS {
            let loc = if cv_simple(geom, p) {
                cv_midpoint(geom, p)
            } else {
                Mlocation::new(bid, 0.0)
            };
            if loc.branch == bid {
                parent_ref = Some(VoltageReference { cv: p, loc });
            }
        }
    }

    let mut child_ref = None;
    if check_child {
        for &child_cv in geom.children(site_cv) {
            let child_prox_cable = geom.cables(child_cv)[0];
            if child_prox_cable.branch == bid {
                let loc = if cv_simple(geom, child_cv) {
                    cv_midpoint(geom, child_cv)
                } else {
                    Mlocation::new(bid, 1.0)
                };
                child_ref = Some(VoltageReference { cv: child_cv, loc });
                break;
            }
        }
    }

    // If both references are possible, pick by distality with respect to the
    // site reference location.
    if child_ref.is_some() && parent_ref.is_some() {
        if site.pos < site_ref.loc.pos {
            child_ref = None;
        } else {
            parent_ref = None;
        }
    }

    if let Some(child) = child_ref {
        (site_ref, child)
    } else if let Some(parent) = parent_ref {
        (parent, site_ref)
    } else {
        (site_ref, site_ref)
    }
}

/// Membrane voltage at `site` as a linear combination of two CV voltages.
pub fn voltage_interpolant(
    cell: &CableCell,
    d: &CvDiscretization,
    cell_idx: usize,
    site: Mlocation,
) -> VoltageInterpolant {
    let em = cell.embedding();
    let (prox, dist) = reference_points(cell.morphology(), &d.geometry, cell_idx, site);

    if prox.cv == dist.cv {
        return VoltageInterpolant {
            proximal_cv: prox.cv,
            distal_cv: dist.cv,
            proximal_coef: 1.0,
            distal_coef: 0.0,
        };
    }

    let bid = site.branch;
    debug_assert!(prox.loc.pos < dist.loc.pos);
    let resistivity = &d.axial_resistivity[cell_idx][bid];
    let rr_span = Mcable::new(bid, prox.loc.pos, dist.loc.pos);
    let rr_resistance = em.integrate_ixa(rr_span, resistivity);

    // The site is not necessarily distal to the proximal reference point;
    // extrapolation is expressed with a negative span resistance.
    let flip_rs = prox.loc.pos > site.pos;
    let rs_span = if flip_rs {
        Mcable::new(bid, site.pos, prox.loc.pos)
    } else {
        Mcable::new(bid, prox.loc.pos, site.pos)
    };
    let mut rs_resistance = em.integrate_ixa(rs_span, resistivity);
    if flip_rs {
        rs_resistance = -rs_resistance;
    }

    let p = rs_resistance / rr_resistance;
    VoltageInterpolant {
        proximal_cv: prox.cv,
        distal_cv: dist.cv,
        proximal_coef: 1.0 - p,
        distal_coef: p,
    }
}

/// Axial current at `site` as `g·V_prox − g·V_dist` [nA] with `g` in µS.
pub fn axial_current_interpolant(
    cell: &CableCell,
    d: &CvDiscretization,
    cell_idx: usize,
    site: Mlocation,
) -> VoltageInterpolant {
    let em = cell.embedding();
    let (prox, dist) = reference_points(cell.morphology(), &d.geometry, cell_idx, site);

    if prox.cv == dist.cv {
        return VoltageInterpolant {
            proximal_cv: prox.cv,
            distal_cv: dist.cv,
            proximal_coef: 0.0,
            distal_coef: 0.0,
        };
    }

    let bid = site.branch;
    debug_assert!(prox.loc.pos < dist.loc.pos);
    let resistivity = &d.axial_resistivity[cell_idx][bid];
    let rr_span = Mcable::new(bid, prox.loc.pos, dist.loc.pos);
    let rr_conductance = 100.0 / em.integrate_ixa(rr_span, resistivity); // [µS]

    VoltageInterpolant {
        proximal_cv: prox.cv,
        distal_cv: dist.cv,
        proximal_coef: rr_conductance,
        distal_coef: -rr_conductance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretize;
    use cable_cell::{CableCellGlobalProperties, CvPolicy, Decor, Paintable};
    use cable_morphology::cylinder_morphology;

    fn cylinder_disc(n: u32) -> (CableCell, CvDiscretization) {
        let decor = Decor::new()
            .set_default(Paintable::AxialResistivity(90.0))
            .set_discretization(CvPolicy::fixed_per_branch(n));
        let cell = CableCell::new(cylinder_morphology(100.0, 1.0), decor);
        let d = discretize(&cell, &CableCellGlobalProperties::default());
        (cell, d)
    }

    #[test]
    fn coefficients_sum_to_one() {
        let (cell, d) = cylinder_disc(4);
        for pos in [0.1, 0.3, 0.5, 0.77, 0.95] {
            let vi = voltage_interpolant(&cell, &d, 0, Mlocation::new(0, pos));
            assert!((vi.proximal_coef + vi.distal_coef - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn midpoint_site_uses_single_reference() {
        let (cell, d) = cylinder_disc(2);
        // Site at the reference point of CV 0 (position 0.25).
        let vi = voltage_interpolant(&cell, &d, 0, Mlocation::new(0, 0.25));
        assert_eq!(vi.proximal_cv, 0);
        assert!((vi.proximal_coef - 1.0).abs() < 1e-12);
        assert!(vi.distal_coef.abs() < 1e-12);
    }

    #[test]
    fn interior_site_splits_between_neighbours() {
        let (cell, d) = cylinder_disc(2);
        // Halfway between the two CV midpoints (0.25, 0.75).
        let vi = voltage_interpolant(&cell, &d, 0, Mlocation::new(0, 0.5));
        assert_eq!((vi.proximal_cv, vi.distal_cv), (0, 1));
        assert!((vi.proximal_coef - 0.5).abs() < 1e-9);
        assert!((vi.distal_coef - 0.5).abs() < 1e-9);
    }

    #[test]
    fn proximal_extrapolation_has_negative_coefficient() {
        let (cell, d) = cylinder_disc(2);
        // Proximal of the first reference point: extrapolates.
        let vi = voltage_interpolant(&cell, &d, 0, Mlocation::new(0, 0.9));
        assert_eq!((vi.proximal_cv, vi.distal_cv), (0, 1));
        assert!(vi.distal_coef > 1.0);
        assert!(vi.proximal_coef < 0.0);
    }

    #[test]
    fn axial_current_coefficients_are_opposite() {
        let (cell, d) = cylinder_disc(2);
        let vi = axial_current_interpolant(&cell, &d, 0, Mlocation::new(0, 0.5));
        assert!((vi.proximal_coef + vi.distal_coef).abs() < 1e-12);
        // g = 100/(ρ·L/(πr²)) over the half-cable reference span.
        let expected = 100.0 / (90.0 * 50.0 / std::f64::consts::PI);
        assert!((vi.proximal_coef - expected).abs() < 1e-9 * expected);
    }
}
