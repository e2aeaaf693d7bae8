//! Built-in mechanism kernels.
//!
//! Density kernels work in NMODL conventions (S/cm², mA/cm²) and convert to
//! A/m² / kS/m² with the factor 10 on write-out; point and junction kernels
//! produce nA and are scaled by their layout weight `1000/A` (junctions
//! additionally fold in the connection weight).

use crate::{Mechanism, MechanismKind, MechanismLayout, SharedView};

/// `x / (e^x - 1)`, stable near zero.
fn exprelr(x: f64) -> f64 {
    if x.abs() < 1e-9 {
        1.0 - x / 2.0
    } else {
        x / (x.exp() - 1.0)
    }
}

fn take_param(layout: &MechanismLayout, name: &str, mech: &str) -> Vec<f64> {
    layout
        .param(name)
        .unwrap_or_else(|| panic!("layout for {mech} is missing parameter {name}"))
        .to_vec()
}

pub mod pas {
    use super::*;

    /// Passive leak: `i = g·(v − e)` [mA/cm²].
    pub struct Pas {
        id: u32,
        node_index: Vec<usize>,
        weight: Vec<f64>,
        g: Vec<f64>,
        e: Vec<f64>,
    }

    impl Pas {
        pub fn boxed(id: u32, layout: MechanismLayout) -> Box<dyn Mechanism> {
            let g = take_param(&layout, "g", "pas");
            let e = take_param(&layout, "e", "pas");
            Box::new(Pas {
                id,
                node_index: layout.cv,
                weight: layout.weight,
                g,
                e,
            })
        }
    }

    impl Mechanism for Pas {
        fn name(&self) -> &str {
            "pas"
        }

        fn kind(&self) -> MechanismKind {
            MechanismKind::Density
        }

        fn mechanism_id(&self) -> u32 {
            self.id
        }

        fn width(&self) -> usize {
            self.node_index.len()
        }

        fn node_index(&self) -> &[usize] {
            &self.node_index
        }

        fn init(&mut self, _shared: &mut SharedView) {}

        fn update_current(&mut self, shared: &mut SharedView) {
            for i in 0..self.node_index.len() {
                let cv = self.node_index[i];
                let v = shared.voltage[cv];
                let i_m = self.g[i] * (v - self.e[i]);
                shared.current_density[cv] += self.weight[i] * 10.0 * i_m;
                shared.conductivity[cv] += self.weight[i] * 10.0 * self.g[i];
            }
        }

        fn update_state(&mut self, _shared: &mut SharedView) {}
    }
}

pub mod hh {
    use super::*;

    /// Hodgkin–Huxley sodium, potassium and leak currents with q10 rate
    /// scaling; gates advance by exponential Euler.
    pub struct Hh {
        id: u32,
        node_index: Vec<usize>,
        weight: Vec<f64>,
        na_index: Vec<usize>,
        k_index: Vec<usize>,
        gnabar: Vec<f64>,
        gkbar: Vec<f64>,
        gl: Vec<f64>,
        el: Vec<f64>,
        m: Vec<f64>,
        h: Vec<f64>,
        n: Vec<f64>,
    }

    struct Rates {
        m_inf: f64,
        m_tau: f64,
        h_inf: f64,
        h_tau: f64,
        n_inf: f64,
        n_tau: f64,
    }

    fn rates(v: f64, temperature_k: f64) -> Rates {
        let celsius = temperature_k - 273.15;
        let q10 = 3.0f64.powf((celsius - 6.3) / 10.0);

        let alpha_m = exprelr(-(v + 40.0) / 10.0);
        let beta_m = 4.0 * (-(v + 65.0) / 18.0).exp();
        let alpha_h = 0.07 * (-(v + 65.0) / 20.0).exp();
        let beta_h = 1.0 / ((-(v + 35.0) / 10.0).exp() + 1.0);
        let alpha_n = 0.1 * exprelr(-(v + 55.0) / 10.0);
        let beta_n = 0.125 * (-(v + 65.0) / 80.0).exp();

        let sum_m = alpha_m + beta_m;
        let sum_h = alpha_h + beta_h;
        let sum_n = alpha_n + beta_n;
        Rates {
            m_inf: alpha_m / sum_m,
            m_tau: 1.0 / (q10 * sum_m),
            h_inf: alpha_h / sum_h,
            h_tau: 1.0 / (q10 * sum_h),
            n_inf: alpha_n / sum_n,
            n_tau: 1.0 / (q10 * sum_n),
        }
    }

    impl Hh {
        pub fn boxed(id: u32, layout: MechanismLayout) -> Box<dyn Mechanism> {
            let width = layout.width();
            let gnabar = take_param(&layout, "gnabar", "hh");
            let gkbar = take_param(&layout, "gkbar", "hh");
            let gl = take_param(&layout, "gl", "hh");
            let el = take_param(&layout, "el", "hh");
            let na_index = layout.ion_index.get("na").cloned().unwrap_or_default();
            let k_index = layout.ion_index.get("k").cloned().unwrap_or_default();
            assert_eq!(na_index.len(), width, "hh needs an na index per instance");
            assert_eq!(k_index.len(), width, "hh needs a k index per instance");
            Box::new(Hh {
                id,
                node_index: layout.cv,
                weight: layout.weight,
                na_index,
                k_index,
                gnabar,
                gkbar,
                gl,
                el,
                m: vec![0.0; width],
                h: vec![0.0; width],
                n: vec![0.0; width],
            })
        }
    }

    impl Mechanism for Hh {
        fn name(&self) -> &str {
            "hh"
        }

        fn kind(&self) -> MechanismKind {
            MechanismKind::Density
        }

        fn mechanism_id(&self) -> u32 {
            self.id
        }

        fn width(&self) -> usize {
            self.node_index.len()
        }

        fn node_index(&self) -> &[usize] {
            &self.node_index
        }

        fn init(&mut self, shared: &mut SharedView) {
            for i in 0..self.node_index.len() {
                let cv = self.node_index[i];
                let r = rates(shared.voltage[cv], shared.temperature[cv]);
                self.m[i] = r.m_inf;
                self.h[i] = r.h_inf;
                self.n[i] = r.n_inf;
            }
        }

        fn update_current(&mut self, shared: &mut SharedView) {
            let mut split = shared.ions.iter_mut();
            let mut na = None;
            let mut k = None;
            for (name, view) in &mut split {
                match *name {
                    "na" => na = Some(view),
                    "k" => k = Some(view),
                    _ => {}
                }
            }
            let na = na.expect("hh requires the na ion");
            let k = k.expect("hh requires the k ion");

            for i in 0..self.node_index.len() {
                let cv = self.node_index[i];
                let v = shared.voltage[cv];
                let w10 = self.weight[i] * 10.0;

                let g_na = self.gnabar[i] * self.m[i].powi(3) * self.h[i];
                let g_k = self.gkbar[i] * self.n[i].powi(4);

                let ina = g_na * (v - na.reversal_potential[self.na_index[i]]);
                let ik = g_k * (v - k.reversal_potential[self.k_index[i]]);
                let il = self.gl[i] * (v - self.el[i]);

                na.current_density[self.na_index[i]] += w10 * ina;
                k.current_density[self.k_index[i]] += w10 * ik;
                shared.current_density[cv] += w10 * (ina + ik + il);
                shared.conductivity[cv] += w10 * (g_na + g_k + self.gl[i]);
            }
        }

        fn update_state(&mut self, shared: &mut SharedView) {
            for i in 0..self.node_index.len() {
                let cv = self.node_index[i];
                let dt = shared.dt_cv[cv];
                if dt <= 0.0 {
                    continue;
                }
                let r = rates(shared.voltage[cv], shared.temperature[cv]);
                self.m[i] += (1.0 - (-dt / r.m_tau).exp()) * (r.m_inf - self.m[i]);
                self.h[i] += (1.0 - (-dt / r.h_tau).exp()) * (r.h_inf - self.h[i]);
                self.n[i] += (1.0 - (-dt / r.n_tau).exp()) * (r.n_inf - self.n[i]);
            }
        }

        fn state_view(&self, var: &str) -> Option<&[f64]> {
            match var {
                "m" => Some(&self.m),
                "h" => Some(&self.h),
                "n" => Some(&self.n),
                _ => None,
            }
        }

        fn export_state(&self) -> Vec<(String, Vec<f64>)> {
            vec![
                ("m".to_string(), self.m.clone()),
                ("h".to_string(), self.h.clone()),
                ("n".to_string(), self.n.clone()),
            ]
        }

        fn import_state(&mut self, state: &[(String, Vec<f64>)]) -> Result<(), String> {
            for (name, values) in state {
                if values.len() != self.width() {
                    return Err(format!("hh state {name} has wrong width"));
                }
                match name.as_str() {
                    "m" => self.m.copy_from_slice(values),
                    "h" => self.h.copy_from_slice(values),
                    "n" => self.n.copy_from_slice(values),
                    other => return Err(format!("hh has no state {other}")),
                }
            }
            Ok(())
        }
    }
}

pub mod expsyn {
    use super::*;

    /// Single-exponential synapse; conductance in µS, linear in state so
    /// instances with identical parameters may be coalesced.
    pub struct ExpSyn {
        id: u32,
        node_index: Vec<usize>,
        weight: Vec<f64>,
        multiplicity: Vec<u32>,
        tau: Vec<f64>,
        e: Vec<f64>,
        g: Vec<f64>,
    }

    impl ExpSyn {
        pub fn boxed(id: u32, layout: MechanismLayout) -> Box<dyn Mechanism> {
            let width = layout.width();
            let tau = take_param(&layout, "tau", "expsyn");
            let e = take_param(&layout, "e", "expsyn");
            Box::new(ExpSyn {
                id,
                node_index: layout.cv,
                weight: layout.weight,
                multiplicity: layout.multiplicity,
                tau,
                e,
                g: vec![0.0; width],
            })
        }

        pub fn multiplicity(&self) -> &[u32] {
            &self.multiplicity
        }
    }

    impl Mechanism for ExpSyn {
        fn name(&self) -> &str {
            "expsyn"
        }

        fn kind(&self) -> MechanismKind {
            MechanismKind::Point
        }

        fn mechanism_id(&self) -> u32 {
            self.id
        }

        fn width(&self) -> usize {
            self.node_index.len()
        }

        fn node_index(&self) -> &[usize] {
            &self.node_index
        }

        fn init(&mut self, _shared: &mut SharedView) {
            self.g.iter_mut().for_each(|g| *g = 0.0);
        }

        fn update_current(&mut self, shared: &mut SharedView) {
            for i in 0..self.node_index.len() {
                let cv = self.node_index[i];
                let v = shared.voltage[cv];
                let current = self.g[i] * (v - self.e[i]); // [nA]
                shared.current_density[cv] += self.weight[i] * current;
                shared.conductivity[cv] += self.weight[i] * self.g[i];
            }
        }

        fn update_state(&mut self, shared: &mut SharedView) {
            for i in 0..self.node_index.len() {
                let dt = shared.dt_cv[self.node_index[i]];
                if dt > 0.0 {
                    self.g[i] *= (-dt / self.tau[i]).exp();
                }
            }
        }

        fn deliver_events(&mut self, events: &[(u32, f64)]) {
            for &(index, weight) in events {
                self.g[index as usize] += weight;
            }
        }

        fn state_view(&self, var: &str) -> Option<&[f64]> {
            (var == "g").then_some(self.g.as_slice())
        }

        fn export_state(&self) -> Vec<(String, Vec<f64>)> {
            vec![("g".to_string(), self.g.clone())]
        }

        fn import_state(&mut self, state: &[(String, Vec<f64>)]) -> Result<(), String> {
            for (name, values) in state {
                if name != "g" || values.len() != self.width() {
                    return Err(format!("bad expsyn state {name}"));
                }
                self.g.copy_from_slice(values);
            }
            Ok(())
        }
    }
}

pub mod expsyn_stdp {
    use super::*;

    /// Exponential synapse with spike-timing-dependent plasticity traces;
    /// the only built-in mechanism with the post-event capability.
    pub struct ExpSynStdp {
        id: u32,
        node_index: Vec<usize>,
        weight: Vec<f64>,
        tau: Vec<f64>,
        taupre: Vec<f64>,
        taupost: Vec<f64>,
        a_pre: Vec<f64>,
        a_post: Vec<f64>,
        e: Vec<f64>,
        max_weight: Vec<f64>,
        g: Vec<f64>,
        apre: Vec<f64>,
        apost: Vec<f64>,
        weight_plastic: Vec<f64>,
    }

    impl ExpSynStdp {
        pub fn boxed(id: u32, layout: MechanismLayout) -> Box<dyn Mechanism> {
            let width = layout.width();
            Box::new(ExpSynStdp {
                id,
                tau: take_param(&layout, "tau", "expsyn_stdp"),
                taupre: take_param(&layout, "taupre", "expsyn_stdp"),
                taupost: take_param(&layout, "taupost", "expsyn_stdp"),
                a_pre: take_param(&layout, "A_pre", "expsyn_stdp"),
                a_post: take_param(&layout, "A_post", "expsyn_stdp"),
                e: take_param(&layout, "e", "expsyn_stdp"),
                max_weight: take_param(&layout, "max_weight", "expsyn_stdp"),
                node_index: layout.cv,
                weight: layout.weight,
                g: vec![0.0; width],
                apre: vec![0.0; width],
                apost: vec![0.0; width],
                weight_plastic: vec![0.0; width],
            })
        }
    }

    impl Mechanism for ExpSynStdp {
        fn name(&self) -> &str {
            "expsyn_stdp"
        }

        fn kind(&self) -> MechanismKind {
            MechanismKind::Point
        }

        fn mechanism_id(&self) -> u32 {
            self.id
        }

        fn width(&self) -> usize {
            self.node_index.len()
        }

        fn node_index(&self) -> &[usize] {
            &self.node_index
        }

        fn init(&mut self, _shared: &mut SharedView) {
            for v in [
                &mut self.g,
                &mut self.apre,
                &mut self.apost,
                &mut self.weight_plastic,
            ] {
                v.iter_mut().for_each(|x| *x = 0.0);
            }
        }

        fn update_current(&mut self, shared: &mut SharedView) {
            for i in 0..self.node_index.len() {
                let cv = self.node_index[i];
                let current = self.g[i] * (shared.voltage[cv] - self.e[i]);
                shared.current_density[cv] += self.weight[i] * current;
                shared.conductivity[cv] += self.weight[i] * self.g[i];
            }
        }

        fn update_state(&mut self, shared: &mut SharedView) {
            for i in 0..self.node_index.len() {
                let dt = shared.dt_cv[self.node_index[i]];
                if dt <= 0.0 {
                    continue;
                }
                self.g[i] *= (-dt / self.tau[i]).exp();
                self.apre[i] *= (-dt / self.taupre[i]).exp();
                self.apost[i] *= (-dt / self.taupost[i]).exp();
            }
        }

        fn deliver_events(&mut self, events: &[(u32, f64)]) {
            for &(index, weight) in events {
                let i = index as usize;
                let effective = (weight + self.weight_plastic[i]).clamp(0.0, self.max_weight[i]);
                self.g[i] += effective;
                self.apre[i] += self.a_pre[i];
                self.weight_plastic[i] += self.apost[i];
            }
        }

        fn post_event(&mut self, shared: &SharedView) {
            for i in 0..self.node_index.len() {
                let cell = shared.cv_to_cell[self.node_index[i]];
                for d in 0..shared.n_detector {
                    let ts = shared.time_since_spike[cell * shared.n_detector + d];
                    if ts >= 0.0 {
                        self.apost[i] += self.a_post[i];
                        self.weight_plastic[i] += self.apre[i];
                    }
                }
            }
        }

        fn state_view(&self, var: &str) -> Option<&[f64]> {
            match var {
                "g" => Some(&self.g),
                "apre" => Some(&self.apre),
                "apost" => Some(&self.apost),
                "weight_plastic" => Some(&self.weight_plastic),
                _ => None,
            }
        }

        fn export_state(&self) -> Vec<(String, Vec<f64>)> {
            vec![
                ("g".to_string(), self.g.clone()),
                ("apre".to_string(), self.apre.clone()),
                ("apost".to_string(), self.apost.clone()),
                ("weight_plastic".to_string(), self.weight_plastic.clone()),
            ]
        }

        fn import_state(&mut self, state: &[(String, Vec<f64>)]) -> Result<(), String> {
            for (name, values) in state {
                if values.len() != self.width() {
                    return Err(format!("expsyn_stdp state {name} has wrong width"));
                }
                match name.as_str() {
                    "g" => self.g.copy_from_slice(values),
                    "apre" => self.apre.copy_from_slice(values),
                    "apost" => self.apost.copy_from_slice(values),
                    "weight_plastic" => self.weight_plastic.copy_from_slice(values),
                    other => return Err(format!("expsyn_stdp has no state {other}")),
                }
            }
            Ok(())
        }
    }
}

pub mod gj {
    use super::*;

    /// Linear ohmic gap junction. Current density is outward-positive, so
    /// the contribution at the local CV is `w·g·(V_local − V_peer)` with the
    /// connection weight folded into `w`.
    pub struct Gj {
        id: u32,
        node_index: Vec<usize>,
        peer_index: Vec<usize>,
        weight: Vec<f64>,
        g: Vec<f64>,
        peer_voltage: Vec<f64>,
    }

    impl Gj {
        pub fn boxed(id: u32, layout: MechanismLayout) -> Box<dyn Mechanism> {
            let width = layout.width();
            let g = take_param(&layout, "g", "gj");
            assert_eq!(layout.peer_cv.len(), width, "gj needs a peer per instance");
            Box::new(Gj {
                id,
                node_index: layout.cv,
                peer_index: layout.peer_cv,
                weight: layout.weight,
                g,
                peer_voltage: vec![0.0; width],
            })
        }
    }

    impl Mechanism for Gj {
        fn name(&self) -> &str {
            "gj"
        }

        fn kind(&self) -> MechanismKind {
            MechanismKind::GapJunction
        }

        fn mechanism_id(&self) -> u32 {
            self.id
        }

        fn width(&self) -> usize {
            self.node_index.len()
        }

        fn node_index(&self) -> &[usize] {
            &self.node_index
        }

        fn peer_index(&self) -> &[usize] {
            &self.peer_index
        }

        fn peer_voltage_buffer(&mut self) -> Option<&mut Vec<f64>> {
            Some(&mut self.peer_voltage)
        }

        fn init(&mut self, _shared: &mut SharedView) {}

        fn update_current(&mut self, shared: &mut SharedView) {
            assert_eq!(
                self.peer_voltage.len(),
                self.node_index.len(),
                "peer voltages not staged"
            );
            for i in 0..self.node_index.len() {
                let cv = self.node_index[i];
                let current = self.g[i] * (shared.voltage[cv] - self.peer_voltage[i]); // [nA]
                shared.current_density[cv] += self.weight[i] * current;
                shared.conductivity[cv] += self.weight[i] * self.g[i];
            }
        }

        fn update_state(&mut self, _shared: &mut SharedView) {}
    }
}

pub mod nernst {
    use super::*;
    use cable_core::units::{FARADAY, GAS_CONSTANT};

    /// Writes the ion reversal potential `E_X = RT/(zF)·ln(Xo/Xi)` [mV].
    pub struct Nernst {
        id: u32,
        node_index: Vec<usize>,
        ion: String,
        ion_index: Vec<usize>,
    }

    impl Nernst {
        pub fn boxed(id: u32, layout: MechanismLayout) -> Box<dyn Mechanism> {
            let mut ions = layout.ion_index.iter();
            let (ion, ion_index) = ions
                .next()
                .map(|(k, v)| (k.clone(), v.clone()))
                .expect("nernst layout names its ion");
            assert!(ions.next().is_none(), "nernst writes exactly one ion");
            Box::new(Nernst {
                id,
                node_index: layout.cv,
                ion,
                ion_index,
            })
        }

        fn write_revpot(&self, shared: &mut SharedView) {
            let ion = shared
                .ions
                .get_mut(self.ion.as_str())
                .expect("nernst ion is instantiated");
            let zf = ion.valence as f64 * FARADAY;
            for i in 0..self.node_index.len() {
                let t = shared.temperature[self.node_index[i]];
                let idx = self.ion_index[i];
                let xi = ion.internal_concentration[idx];
                let xo = ion.external_concentration[idx];
                ion.reversal_potential[idx] = GAS_CONSTANT * t / zf * (xo / xi).ln();
            }
        }
    }

    impl Mechanism for Nernst {
        fn name(&self) -> &str {
            "nernst"
        }

        fn kind(&self) -> MechanismKind {
            MechanismKind::ReversalPotential
        }

        fn mechanism_id(&self) -> u32 {
            self.id
        }

        fn width(&self) -> usize {
            self.node_index.len()
        }

        fn node_index(&self) -> &[usize] {
            &self.node_index
        }

        fn init(&mut self, shared: &mut SharedView) {
            self.write_revpot(shared);
        }

        fn update_current(&mut self, shared: &mut SharedView) {
            self.write_revpot(shared);
        }

        fn update_state(&mut self, _shared: &mut SharedView) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn shared_view<'a>(
        voltage: &'a [f64],
        current: &'a mut [f64],
        conductivity: &'a mut [f64],
        dt: &'a [f64],
        temperature: &'a [f64],
        diam: &'a [f64],
        cv_to_cell: &'a [usize],
    ) -> SharedView<'a> {
        SharedView {
            voltage,
            current_density: current,
            conductivity,
            dt_cv: dt,
            temperature,
            diam_um: diam,
            cv_to_cell,
            time_since_spike: &[],
            n_detector: 0,
            ions: BTreeMap::new(),
        }
    }

    fn one_cv_layout(params: Vec<(&str, f64)>, weight: f64) -> MechanismLayout {
        MechanismLayout {
            cv: vec![0],
            peer_cv: vec![],
            weight: vec![weight],
            multiplicity: vec![],
            param_values: params
                .into_iter()
                .map(|(k, v)| (k.to_string(), vec![v]))
                .collect(),
            ion_index: BTreeMap::new(),
        }
    }

    #[test]
    fn pas_writes_current_and_conductivity() {
        let layout = one_cv_layout(vec![("e", -65.0), ("g", 0.001)], 1.0);
        let mut pas = pas::Pas::boxed(0, layout);
        let voltage = [-55.0];
        let mut current = [0.0];
        let mut conductivity = [0.0];
        let mut view = shared_view(
            &voltage,
            &mut current,
            &mut conductivity,
            &[0.025],
            &[279.45],
            &[1.0],
            &[0],
        );
        pas.update_current(&mut view);
        // 10·g·(v−e) = 10·0.001·10 = 0.1 A/m².
        assert!((current[0] - 0.1).abs() < 1e-12);
        assert!((conductivity[0] - 0.01).abs() < 1e-12);
    }

    #[test]
    fn expsyn_decays_and_delivers() {
        let layout = MechanismLayout {
            cv: vec![0],
            peer_cv: vec![],
            weight: vec![2.0],
            multiplicity: vec![1],
            param_values: vec![("e".to_string(), vec![0.0]), ("tau".to_string(), vec![2.0])],
            ion_index: BTreeMap::new(),
        };
        let mut syn = expsyn::ExpSyn::boxed(1, layout);
        syn.deliver_events(&[(0, 0.5)]);
        assert_eq!(syn.state_view("g").unwrap(), &[0.5]);

        let voltage = [-60.0];
        let mut current = [0.0];
        let mut conductivity = [0.0];
        let mut view = shared_view(
            &voltage,
            &mut current,
            &mut conductivity,
            &[2.0],
            &[279.45],
            &[1.0],
            &[0],
        );
        syn.update_current(&mut view);
        // I = g·(v−e) = 0.5·(−60) = −30 nA, scaled by the weight.
        assert!((view.current_density[0] + 60.0).abs() < 1e-12);

        syn.update_state(&mut view);
        let g = syn.state_view("g").unwrap()[0];
        assert!((g - 0.5 * (-1.0f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn gj_current_is_antisymmetric() {
        let layout = MechanismLayout {
            cv: vec![0, 1],
            peer_cv: vec![1, 0],
            weight: vec![1.0, 1.0],
            multiplicity: vec![],
            param_values: vec![("g".to_string(), vec![1.0, 1.0])],
            ion_index: BTreeMap::new(),
        };
        let mut gj = gj::Gj::boxed(2, layout);
        let voltage = [-40.0, -80.0];
        if let Some(buf) = gj.peer_voltage_buffer() {
            buf.copy_from_slice(&[-80.0, -40.0]);
        }
        let mut current = [0.0, 0.0];
        let mut conductivity = [0.0, 0.0];
        let mut view = shared_view(
            &voltage,
            &mut current,
            &mut conductivity,
            &[0.025, 0.025],
            &[279.45, 279.45],
            &[1.0, 1.0],
            &[0, 1],
        );
        gj.update_current(&mut view);
        assert!((current[0] - 40.0).abs() < 1e-12);
        assert!((current[1] + 40.0).abs() < 1e-12);
    }

    #[test]
    fn hh_init_sets_steady_state_gates() {
        let mut layout = one_cv_layout(
            vec![
                ("el", -54.3),
                ("gkbar", 0.036),
                ("gl", 0.0003),
                ("gnabar", 0.12),
            ],
            1.0,
        );
        layout.ion_index.insert("na".to_string(), vec![0]);
        layout.ion_index.insert("k".to_string(), vec![0]);
        let mut hh = hh::Hh::boxed(3, layout);

        let voltage = [-65.0];
        let mut current = [0.0];
        let mut conductivity = [0.0];
        let mut view = shared_view(
            &voltage,
            &mut current,
            &mut conductivity,
            &[0.025],
            &[279.45],
            &[1.0],
            &[0],
        );
        hh.init(&mut view);
        let m = hh.state_view("m").unwrap()[0];
        let h = hh.state_view("h").unwrap()[0];
        let n = hh.state_view("n").unwrap()[0];
        // Classic resting-state gate values at −65 mV.
        assert!((m - 0.0529).abs() < 5e-3);
        assert!((h - 0.596).abs() < 5e-3);
        assert!((n - 0.3177).abs() < 5e-3);
    }

    #[test]
    fn nernst_reproduces_textbook_potential() {
        let mut layout = one_cv_layout(vec![], 1.0);
        layout.ion_index.insert("k".to_string(), vec![0]);
        let mut nernst = nernst::Nernst::boxed(4, layout);

        let voltage = [-65.0];
        let mut current = [0.0];
        let mut conductivity = [0.0];
        let mut ion_current = [0.0];
        let mut xi = [140.0];
        let mut xo = [5.0];
        let mut erev = [0.0];
        let mut view = shared_view(
            &voltage,
            &mut current,
            &mut conductivity,
            &[0.025],
            &[310.15],
            &[1.0],
            &[0],
        );
        view.ions.insert(
            "k",
            crate::IonView {
                current_density: &mut ion_current,
                internal_concentration: &mut xi,
                external_concentration: &mut xo,
                reversal_potential: &mut erev,
                valence: 1,
            },
        );
        nernst.update_current(&mut view);
        // ~−89 mV for K at 37 °C with 140/5 mM.
        assert!((erev[0] + 89.0).abs() < 1.0);
    }
}
