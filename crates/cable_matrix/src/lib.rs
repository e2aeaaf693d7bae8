#![forbid(unsafe_code)]

//! Hines-ordered symmetric tridiagonal-like system over the CV trees of a
//! cell group.
//!
//! Per step:
//!   `d_i   = s·(C_i/Δt_i + σ_i·A_i) + g_i + Σ_{j∈children(i)} g_j`
//!   `u_i   = −g_i`
//!   `rhs_i = s·(C_i/Δt_i·V_i − i_i·A_i)`
//! with the shared scale `s = 1e-3` putting the system in µS / nA / mV.
//! The solve is two-sweep over the tree, children before parents on the
//! elimination sweep; distinct cells are independent and solved in parallel.

use cable_core::units::ASSEMBLY_SCALE;
use cable_morphology::MNPOS;
use rayon::prelude::*;

#[derive(Debug, Clone, PartialEq)]
pub struct HinesMatrix {
    cv_parent: Vec<usize>,
    cell_cv_divs: Vec<usize>,
    cv_capacitance: Vec<f64>,   // [pF]
    face_conductance: Vec<f64>, // [µS]
    cv_area: Vec<f64>,          // [µm²]

    d: Vec<f64>,
    u: Vec<f64>,
    rhs: Vec<f64>,
}

impl HinesMatrix {
    pub fn new(
        cv_parent: Vec<usize>,
        cell_cv_divs: Vec<usize>,
        cv_capacitance: Vec<f64>,
        face_conductance: Vec<f64>,
        cv_area: Vec<f64>,
    ) -> Self {
        let n = cv_parent.len();
        assert_eq!(cv_capacitance.len(), n, "capacitance length mismatch");
        assert_eq!(face_conductance.len(), n, "conductance length mismatch");
        assert_eq!(cv_area.len(), n, "area length mismatch");
        assert!(
            cv_parent.iter().enumerate().all(|(i, &p)| p == MNPOS || p < i),
            "parent indices must precede children"
        );
        Self {
            cv_parent,
            cell_cv_divs,
            cv_capacitance,
            face_conductance,
            cv_area,
            d: vec![0.0; n],
            u: vec![0.0; n],
            rhs: vec![0.0; n],
        }
    }

    pub fn size(&self) -> usize {
        self.cv_parent.len()
    }

    pub fn assemble(
        &mut self,
        dt_cv: &[f64],
        voltage: &[f64],
        current_density: &[f64],
        conductivity: &[f64],
    ) {
        let n = self.size();
        assert_eq!(dt_cv.len(), n, "dt length mismatch");

        for i in 0..n {
            let dt = dt_cv[i];
            if dt > 0.0 {
                let oodt_c = ASSEMBLY_SCALE * self.cv_capacitance[i] / dt;
                self.d[i] = oodt_c + ASSEMBLY_SCALE * conductivity[i] * self.cv_area[i];
                self.rhs[i] =
                    oodt_c * voltage[i] - ASSEMBLY_SCALE * current_density[i] * self.cv_area[i];
            } else {
                // Zero step: the row passes the voltage through unchanged.
                self.d[i] = 0.0;
                self.rhs[i] = voltage[i];
            }
            self.u[i] = 0.0;
        }

        for i in 0..n {
            let p = self.cv_parent[i];
            if p == MNPOS || dt_cv[i] <= 0.0 {
                continue;
            }
            let g = self.face_conductance[i];
            self.d[i] += g;
            self.d[p] += g;
            self.u[i] = -g;
        }
    }

    /// Solves in place, writing the updated voltages.
    pub fn solve(&mut self, voltage: &mut [f64]) {
        assert_eq!(voltage.len(), self.size(), "voltage length mismatch");

        let divs = self.cell_cv_divs.clone();
        let ranges: Vec<(usize, usize)> = divs.windows(2).map(|w| (w[0], w[1])).collect();

        // Cells are contiguous index ranges and independent systems; split
        // the arrays along cell boundaries and solve in parallel.
        let mut d_chunks: Vec<&mut [f64]> = Vec::with_capacity(ranges.len());
        let mut u_chunks: Vec<&mut [f64]> = Vec::with_capacity(ranges.len());
        let mut rhs_chunks: Vec<&mut [f64]> = Vec::with_capacity(ranges.len());
        let mut v_chunks: Vec<&mut [f64]> = Vec::with_capacity(ranges.len());

        let mut d_rest: &mut [f64] = &mut self.d;
        let mut u_rest: &mut [f64] = &mut self.u;
        let mut rhs_rest: &mut [f64] = &mut self.rhs;
        let mut v_rest: &mut [f64] = voltage;
        for &(lo, hi) in &ranges {
            let len = hi - lo;
            let (d_head, d_tail) = d_rest.split_at_mut(len);
            let (u_head, u_tail) = u_rest.split_at_mut(len);
            let (rhs_head, rhs_tail) = rhs_rest.split_at_mut(len);
            let (v_head, v_tail) = v_rest.split_at_mut(len);
            d_chunks.push(d_head);
            u_chunks.push(u_head);
            rhs_chunks.push(rhs_head);
            v_chunks.push(v_head);
            d_rest = d_tail;
            u_rest = u_tail;
            rhs_rest = rhs_tail;
            v_rest = v_tail;
        }

        let parents = &self.cv_parent;
        ranges
            .into_par_iter()
            .zip(d_chunks)
            .zip(u_chunks)
            .zip(rhs_chunks)
            .zip(v_chunks)
            .for_each(|(((((lo, _hi), d), u), rhs), v)| {
                solve_cell(lo, parents, d, u, rhs, v);
            });
    }
}

fn solve_cell(
    offset: usize,
    parents: &[usize],
    d: &mut [f64],
    u: &mut [f64],
    rhs: &mut [f64],
    v: &mut [f64],
) {
    let n = d.len();

    // Elimination, children before parents.
    for i in (1..n).rev() {
        if d[i] == 0.0 {
            continue;
        }
        let p = parents[offset + i];
        if p == MNPOS {
            continue;
        }
        let pi = p - offset;
        let factor = u[i] / d[i];
        d[pi] -= factor * u[i];
        rhs[pi] -= factor * rhs[i];
    }

    // Substitution, parents before children.
    if n > 0 && d[0] != 0.0 {
        v[0] = rhs[0] / d[0];
    } else if n > 0 {
        v[0] = rhs[0];
    }
    for i in 1..n {
        if d[i] == 0.0 {
            v[i] = rhs[i];
            continue;
        }
        let p = parents[offset + i];
        if p == MNPOS {
            v[i] = rhs[i] / d[i];
        } else {
            v[i] = (rhs[i] - u[i] * v[p - offset]) / d[i];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_matrix(n: usize, c: f64, g: f64, area: f64) -> HinesMatrix {
        let mut parent = vec![MNPOS];
        for i in 1..n {
            parent.push(i - 1);
        }
        HinesMatrix::new(
            parent,
            vec![0, n],
            vec![c; n],
            vec![g; n],
            vec![area; n],
        )
    }

    #[test]
    fn uniform_state_stays_fixed_without_current() {
        let mut m = chain_matrix(4, 10.0, 0.05, 100.0);
        let mut v = vec![-65.0; 4];
        let dt = vec![0.025; 4];
        m.assemble(&dt, &v.clone(), &[0.0; 4], &[0.0; 4]);
        m.solve(&mut v);
        for &x in &v {
            assert!((x + 65.0).abs() < 1e-9);
        }
    }

    #[test]
    fn solve_matches_dense_elimination_on_branched_tree() {
        // Y tree: 0 ← 1, 0 ← 2 ← 3.
        let parent = vec![MNPOS, 0, 0, 2];
        let mut m = HinesMatrix::new(
            parent.clone(),
            vec![0, 4],
            vec![5.0, 3.0, 4.0, 2.0],
            vec![0.0, 0.02, 0.03, 0.01],
            vec![80.0, 50.0, 60.0, 40.0],
        );
        let v0 = vec![-65.0, -60.0, -70.0, -55.0];
        let i = vec![0.5, -0.2, 0.1, 0.0];
        let sigma = vec![0.01, 0.0, 0.02, 0.0];
        let dt = vec![0.1; 4];
        m.assemble(&dt, &v0, &i, &sigma);

        // Dense reference solve of the same symmetric system.
        let mut a = [[0.0f64; 4]; 4];
        let mut b = [0.0f64; 4];
        for k in 0..4 {
            let oodt_c = 1e-3 * m.cv_capacitance[k] / dt[k];
            a[k][k] += oodt_c + 1e-3 * sigma[k] * m.cv_area[k];
            b[k] += oodt_c * v0[k] - 1e-3 * i[k] * m.cv_area[k];
            let p = parent[k];
            if p != MNPOS {
                let g = m.face_conductance[k];
                a[k][k] += g;
                a[p][p] += g;
                a[k][p] -= g;
                a[p][k] -= g;
            }
        }
        // Gaussian elimination.
        let mut x = b;
        for col in 0..4 {
            let pivot = a[col][col];
            for row in col + 1..4 {
                let f = a[row][col] / pivot;
                for k in col..4 {
                    a[row][k] -= f * a[col][k];
                }
                x[row] -= f * x[col];
            }
        }
        for row in (0..4).rev() {
            for k in row + 1..4 {
                x[row] -= a[row][k] * x[k];
            }
            x[row] /= a[row][row];
        }

        let mut v = v0.clone();
        m.solve(&mut v);
        for k in 0..4 {
            assert!((v[k] - x[k]).abs() < 1e-9, "cv {k}: {} vs {}", v[k], x[k]);
        }
    }

    #[test]
    fn zero_dt_rows_pass_voltage_through() {
        let mut m = chain_matrix(3, 10.0, 0.05, 100.0);
        let mut v = vec![-65.0, -40.0, -80.0];
        m.assemble(&[0.0; 3], &v.clone(), &[1.0; 3], &[0.0; 3]);
        m.solve(&mut v);
        assert_eq!(v, vec![-65.0, -40.0, -80.0]);
    }

    #[test]
    fn independent_cells_solve_independently() {
        // Two 2-CV cells in one matrix.
        let parent = vec![MNPOS, 0, MNPOS, 2];
        let mut m = HinesMatrix::new(
            parent,
            vec![0, 2, 4],
            vec![10.0; 4],
            vec![0.0, 0.05, 0.0, 0.05],
            vec![100.0; 4],
        );
        let dt = vec![0.025; 4];
        let v0 = vec![-65.0, -65.0, -10.0, -90.0];
        m.assemble(&dt, &v0, &[0.0; 4], &[0.0; 4]);
        let mut v = v0.clone();
        m.solve(&mut v);
        // First cell is at rest and stays there; second cell relaxes
        // toward its mean, conserving charge.
        assert!((v[0] + 65.0).abs() < 1e-9);
        assert!((v[1] + 65.0).abs() < 1e-9);
        assert!(v[2] < -10.0 && v[3] > -90.0);
        let q0: f64 = 10.0 * (v0[2] + v0[3]);
        let q1: f64 = 10.0 * (v[2] + v[3]);
        assert!((q0 - q1).abs() < 1e-9 * q0.abs());
    }
}
