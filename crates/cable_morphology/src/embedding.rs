//! Arclength embedding of a branched morphology.
//!
//! Branches are chains of conical frustum segments with linearly varying
//! radius; area and `∫dℓ/(πr²)` integrals have closed forms per frustum.

use crate::pw::PwConst;
use crate::{Mcable, Mlocation, Morphology};

#[derive(Debug, Clone, PartialEq)]
struct BranchGeometry {
    /// Cumulative arclength at each segment boundary [µm]; first entry 0.
    offsets: Vec<f64>,
    /// Frustum radii per segment; radii may jump between segments.
    radii: Vec<(f64, f64)>,
}

impl BranchGeometry {
    fn length(&self) -> f64 {
        *self.offsets.last().expect("branch has segments")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    branches: Vec<BranchGeometry>,
}

impl Embedding {
    pub fn new(morph: &Morphology) -> Self {
        let mut branches = Vec::with_capacity(morph.num_branches());
        for b in 0..morph.num_branches() {
            let segs = &morph.branch(b).segments;
            let mut offsets = Vec::with_capacity(segs.len() + 1);
            let mut radii = Vec::with_capacity(segs.len());
            let mut acc = 0.0;
            offsets.push(0.0);
            for (prox, dist) in segs {
                acc += prox.distance(dist);
                offsets.push(acc);
                radii.push((prox.radius, dist.radius));
            }
            branches.push(BranchGeometry { offsets, radii });
        }
        Self { branches }
    }

    pub fn branch_length(&self, branch: usize) -> f64 {
        self.branches[branch].length()
    }

    pub fn radius_at(&self, loc: Mlocation) -> f64 {
        let geo = &self.branches[loc.branch];
        let s = loc.pos * geo.length();
        let (i, t) = locate(&geo.offsets, s);
        let (r0, r1) = geo.radii[i];
        r0 + t * (r1 - r0)
    }

    pub fn integrate_length(&self, cable: Mcable) -> f64 {
        (cable.dist_pos - cable.prox_pos) * self.branch_length(cable.branch)
    }

    /// Lateral (membrane) surface area over a cable [µm²].
    pub fn integrate_area(&self, cable: Mcable) -> f64 {
        self.fold_frusta(cable, |l, r0, r1| frustum_area(l, r0, r1))
    }

    /// `∫ f dA` for a piecewise-constant `f` over branch positions.
    pub fn integrate_area_weighted(&self, cable: Mcable, f: &PwConst) -> f64 {
        let mut acc = 0.0;
        for i in 0..f.len() {
            let (lo, hi) = f.extent(i);
            let lo = lo.max(cable.prox_pos);
            let hi = hi.min(cable.dist_pos);
            if hi <= lo {
                continue;
            }
            acc += f.values[i] * self.integrate_area(Mcable::new(cable.branch, lo, hi));
        }
        acc
    }

    /// `∫ρ dℓ/(πr²)` with `ρ` a piecewise-constant axial resistivity in
    /// Ω·cm. The result is in Ω·cm/µm; `100/result` is a conductance in µS.
    pub fn integrate_ixa(&self, cable: Mcable, resistivity: &PwConst) -> f64 {
        let mut acc = 0.0;
        for i in 0..resistivity.len() {
            let (lo, hi) = resistivity.extent(i);
            let lo = lo.max(cable.prox_pos);
            let hi = hi.min(cable.dist_pos);
            if hi <= lo {
                continue;
            }
            acc += resistivity.values[i]
                * self.fold_frusta(Mcable::new(cable.branch, lo, hi), |l, r0, r1| {
                    frustum_ixa(l, r0, r1)
                });
        }
        acc
    }

    /// Total membrane area of the morphology [µm²].
    pub fn total_area(&self) -> f64 {
        (0..self.branches.len())
            .map(|b| self.integrate_area(Mcable::whole(b)))
            .sum()
    }

    fn fold_frusta(&self, cable: Mcable, mut f: impl FnMut(f64, f64, f64) -> f64) -> f64 {
        let geo = &self.branches[cable.branch];
        let len = geo.length();
        let s0 = cable.prox_pos * len;
        let s1 = cable.dist_pos * len;
        if s1 <= s0 {
            return 0.0;
        }

        let mut acc = 0.0;
        for i in 0..geo.radii.len() {
            let a = geo.offsets[i];
            let b = geo.offsets[i + 1];
            let lo = a.max(s0);
            let hi = b.min(s1);
            if hi <= lo || b <= a {
                continue;
            }
            let (ra, rb) = geo.radii[i];
            let t0 = (lo - a) / (b - a);
            let t1 = (hi - a) / (b - a);
            let r0 = ra + t0 * (rb - ra);
            let r1 = ra + t1 * (rb - ra);
            acc += f(hi - lo, r0, r1);
        }
        acc
    }
}

fn locate(offsets: &[f64], s: f64) -> (usize, f64) {
    let n = offsets.len() - 1;
    for i in 0..n {
        if s <= offsets[i + 1] || i == n - 1 {
            let span = offsets[i + 1] - offsets[i];
            let t = if span > 0.0 { (s - offsets[i]) / span } else { 0.0 };
            return (i, t.clamp(0.0, 1.0));
        }
    }
    (0, 0.0)
}

fn frustum_area(length: f64, r0: f64, r1: f64) -> f64 {
    let slant = (length * length + (r1 - r0) * (r1 - r0)).sqrt();
    std::f64::consts::PI * (r0 + r1) * slant
}

fn frustum_ixa(length: f64, r0: f64, r1: f64) -> f64 {
    // ∫ dl/(πr²) with r linear in l.
    length / (std::f64::consts::PI * r0.max(1e-9) * r1.max(1e-9))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cylinder_morphology;

    #[test]
    fn cylinder_area_matches_closed_form() {
        let m = cylinder_morphology(200.0, 0.5);
        let em = Embedding::new(&m);
        let area = em.integrate_area(Mcable::whole(0));
        let expected = 2.0 * std::f64::consts::PI * 0.5 * 200.0;
        assert!((area - expected).abs() < 1e-9 * expected);
        assert!((em.total_area() - expected).abs() < 1e-9 * expected);
    }

    #[test]
    fn cylinder_ixa_matches_closed_form() {
        let m = cylinder_morphology(100.0, 0.5);
        let em = Embedding::new(&m);
        let rho = PwConst::uniform(0.0, 1.0, 90.0);
        let ixa = em.integrate_ixa(Mcable::whole(0), &rho);
        let expected = 90.0 * 100.0 / (std::f64::consts::PI * 0.25);
        assert!((ixa - expected).abs() < 1e-9 * expected);
    }

    #[test]
    fn half_cable_has_half_area() {
        let m = cylinder_morphology(120.0, 1.0);
        let em = Embedding::new(&m);
        let whole = em.integrate_area(Mcable::whole(0));
        let half = em.integrate_area(Mcable::new(0, 0.25, 0.75));
        assert!((half - 0.5 * whole).abs() < 1e-9 * whole);
    }

    #[test]
    fn weighted_area_splits_on_piecewise_bounds() {
        let m = cylinder_morphology(100.0, 1.0);
        let em = Embedding::new(&m);
        let f = PwConst::over_cable(&[(0.0, 0.5, 2.0)], 0.0, 1.0, 0.0);
        let weighted = em.integrate_area_weighted(Mcable::whole(0), &f);
        let half_area = em.integrate_area(Mcable::new(0, 0.0, 0.5));
        assert!((weighted - 2.0 * half_area).abs() < 1e-9 * weighted.abs().max(1.0));
    }
}
