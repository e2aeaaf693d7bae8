#![forbid(unsafe_code)]

//! Shared per-cell-group state: voltage, currents, ion and stimulus state,
//! per-integration-domain clocks, and the threshold watcher.

use std::collections::BTreeMap;

use cable_layout::{IonConfig, StimulusConfig};
use cable_mechanisms::IonView;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IonState {
    pub cv: Vec<usize>,
    /// Ion current density per support CV [A/m²].
    pub current_density: Vec<f64>,
    pub internal_concentration: Vec<f64>,
    pub external_concentration: Vec<f64>,
    pub reversal_potential: Vec<f64>,
    pub init_iconc: Vec<f64>,
    pub init_econc: Vec<f64>,
    pub reset_iconc: Vec<f64>,
    pub reset_econc: Vec<f64>,
    pub init_revpot: Vec<f64>,
    pub charge: i32,
    pub iconc_written: bool,
    pub econc_written: bool,
    pub revpot_written: bool,
}

impl IonState {
    fn new(charge: i32, config: &IonConfig) -> Self {
        let n = config.cv.len();
        Self {
            cv: config.cv.clone(),
            current_density: vec![0.0; n],
            internal_concentration: config.init_iconc.clone(),
            external_concentration: config.init_econc.clone(),
            reversal_potential: config.init_revpot.clone(),
            init_iconc: config.init_iconc.clone(),
            init_econc: config.init_econc.clone(),
            reset_iconc: config.reset_iconc.clone(),
            reset_econc: config.reset_econc.clone(),
            init_revpot: config.init_revpot.clone(),
            charge,
            iconc_written: config.iconc_written,
            econc_written: config.econc_written,
            revpot_written: config.revpot_written,
        }
    }

    fn reset(&mut self) {
        self.current_density.iter_mut().for_each(|x| *x = 0.0);
        self.internal_concentration.copy_from_slice(&self.init_iconc);
        self.external_concentration.copy_from_slice(&self.init_econc);
        self.reversal_potential.copy_from_slice(&self.init_revpot);
    }

    /// Start-of-update reset to the unmasked painted concentrations; only
    /// written fields are touched, mechanisms then apply their deltas.
    fn init_concentration(&mut self) {
        if self.iconc_written {
            self.internal_concentration.copy_from_slice(&self.reset_iconc);
        }
        if self.econc_written {
            self.external_concentration.copy_from_slice(&self.reset_econc);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StimState {
    pub cv: Vec<usize>,
    pub cv_unique: Vec<usize>,
    pub frequency: Vec<f64>,
    pub phase: Vec<f64>,
    pub envelope_time: Vec<Vec<f64>>,
    pub envelope_amplitude: Vec<Vec<f64>>,
    /// Accumulated stimulus current density per unique CV [A/m²].
    pub accu_stim: Vec<f64>,
}

impl StimState {
    fn new(config: &StimulusConfig) -> Self {
        Self {
            cv: config.cv.clone(),
            cv_unique: config.cv_unique.clone(),
            frequency: config.frequency.clone(),
            phase: config.phase.clone(),
            envelope_time: config.envelope_time.clone(),
            envelope_amplitude: config.envelope_amplitude.clone(),
            accu_stim: vec![0.0; config.cv_unique.len()],
        }
    }

    fn envelope_at(&self, i: usize, t: f64) -> f64 {
        let times = &self.envelope_time[i];
        let amps = &self.envelope_amplitude[i];
        if times.is_empty() || t < times[0] {
            return 0.0;
        }
        let n = times.len();
        if t >= times[n - 1] {
            return amps[n - 1];
        }
        let mut k = 0;
        while k + 1 < n && times[k + 1] <= t {
            k += 1;
        }
        let span = times[k + 1] - times[k];
        if span <= 0.0 {
            return amps[k];
        }
        let frac = (t - times[k]) / span;
        amps[k] + frac * (amps[k + 1] - amps[k])
    }

    /// Adds stimulus contributions at time `t`. Stimulus current is inward,
    /// so it is subtracted from the outward-positive current density.
    fn add_current(&mut self, t: f64, current_density: &mut [f64]) {
        self.accu_stim.iter_mut().for_each(|x| *x = 0.0);
        for i in 0..self.cv.len() {
            let mut amplitude = self.envelope_at(i, t);
            if self.frequency[i] > 0.0 {
                amplitude *=
                    (2.0 * std::f64::consts::PI * self.frequency[i] * t + self.phase[i]).sin();
            }
            if amplitude == 0.0 {
                continue;
            }
            let cv = self.cv[i];
            let slot = self
                .cv_unique
                .binary_search(&cv)
                .expect("stimulus CV is in the unique table");
            self.accu_stim[slot] += amplitude;
            current_density[cv] -= amplitude;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Crossing {
    /// Source detector index within the cell group.
    pub index: u32,
    pub time: f64,
}

/// Detects rising voltage crossings with linear time interpolation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ThresholdWatcher {
    cv_index: Vec<usize>,
    intdom_index: Vec<usize>,
    threshold: Vec<f64>,
    is_above: Vec<bool>,
    v_prev: Vec<f64>,
    crossings: Vec<Crossing>,
}

impl ThresholdWatcher {
    pub fn new(cv_index: Vec<usize>, intdom_index: Vec<usize>, threshold: Vec<f64>) -> Self {
        assert_eq!(cv_index.len(), threshold.len(), "detector table mismatch");
        assert_eq!(cv_index.len(), intdom_index.len(), "detector table mismatch");
        let n = cv_index.len();
        Self {
            cv_index,
            intdom_index,
            threshold,
            is_above: vec![false; n],
            v_prev: vec![0.0; n],
            crossings: Vec::new(),
        }
    }

    pub fn num_detectors(&self) -> usize {
        self.cv_index.len()
    }

    pub fn crossings(&self) -> &[Crossing] {
        &self.crossings
    }

    pub fn clear_crossings(&mut self) {
        self.crossings.clear();
    }

    pub fn reset(&mut self, voltage: &[f64]) {
        self.clear_crossings();
        for i in 0..self.cv_index.len() {
            let v = voltage[self.cv_index[i]];
            self.v_prev[i] = v;
            self.is_above[i] = v >= self.threshold[i];
        }
    }

    /// Tests all detectors against the step `[time_before, time_after]`;
    /// rising crossings are recorded with interpolated times, and
    /// `time_since_spike` slots (one per detector) are updated for
    /// post-event mechanisms.
    pub fn test(
        &mut self,
        voltage: &[f64],
        time_before: &[f64],
        time_after: &[f64],
        time_since_spike: &mut [f64],
        src_to_spike: &[usize],
    ) {
        for i in 0..self.cv_index.len() {
            let v0 = self.v_prev[i];
            let v1 = voltage[self.cv_index[i]];
            let th = self.threshold[i];
            let intdom = self.intdom_index[i];
            let t0 = time_before[intdom];
            let t1 = time_after[intdom];

            if !self.is_above[i] && v0 < th && th <= v1 {
                let t = t0 + (t1 - t0) * (th - v0) / (v1 - v0);
                self.crossings.push(Crossing {
                    index: i as u32,
                    time: t,
                });
                if !time_since_spike.is_empty() {
                    time_since_spike[src_to_spike[i]] = t1 - t;
                }
            }
            self.is_above[i] = v1 >= th;
            self.v_prev[i] = v1;
        }
    }

    pub fn snapshot(&self) -> ThresholdWatcher {
        self.clone()
    }

    pub fn restore(&mut self, snapshot: &ThresholdWatcher) {
        *self = snapshot.clone();
    }
}

/// Back-end storage of the per-group simulation state. The multicore layout
/// keeps plain structure-of-arrays vectors; kernels take non-owning views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedState {
    pub n_intdom: usize,
    pub n_cell: usize,
    /// Detector slots per cell for post-event bookkeeping.
    pub n_detector: usize,
    pub cv_to_cell: Vec<usize>,
    pub cv_to_intdom: Vec<usize>,
    pub cell_to_intdom: Vec<usize>,

    /// Per-intdom time [ms]; `time_to` is the end of the current step.
    pub time: Vec<f64>,
    pub time_to: Vec<f64>,
    pub dt_intdom: Vec<f64>,
    pub dt_cv: Vec<f64>,

    pub voltage: Vec<f64>,          // [mV]
    pub init_voltage: Vec<f64>,     // [mV]
    pub current_density: Vec<f64>,  // [A/m²], outward positive
    pub conductivity: Vec<f64>,     // [kS/m²]
    pub temperature: Vec<f64>,      // [K]
    pub diam_um: Vec<f64>,

    pub time_since_spike: Vec<f64>,
    pub src_to_spike: Vec<usize>,

    pub ion_data: BTreeMap<String, IonState>,
    pub stim: StimState,
}

impl SharedState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        n_intdom: usize,
        n_cell: usize,
        n_detector: usize,
        cv_to_cell: Vec<usize>,
        cv_to_intdom: Vec<usize>,
        cell_to_intdom: Vec<usize>,
        init_voltage: Vec<f64>,
        temperature: Vec<f64>,
        diam_um: Vec<f64>,
        src_to_spike: Vec<usize>,
    ) -> Self {
        let n_cv = init_voltage.len();
        assert_eq!(cv_to_cell.len(), n_cv, "cv_to_cell length mismatch");
        assert_eq!(cv_to_intdom.len(), n_cv, "cv_to_intdom length mismatch");
        Self {
            n_intdom,
            n_cell,
            n_detector,
            cv_to_cell,
            cv_to_intdom,
            cell_to_intdom,
            time: vec![0.0; n_intdom],
            time_to: vec![0.0; n_intdom],
            dt_intdom: vec![0.0; n_intdom],
            dt_cv: vec![0.0; n_cv],
            voltage: init_voltage.clone(),
            init_voltage,
            current_density: vec![0.0; n_cv],
            conductivity: vec![0.0; n_cv],
            temperature,
            diam_um,
            time_since_spike: vec![-1.0; n_cell * n_detector],
            src_to_spike,
            ion_data: BTreeMap::new(),
            stim: StimState::default(),
        }
    }

    pub fn n_cv(&self) -> usize {
        self.voltage.len()
    }

    pub fn add_ion(&mut self, name: &str, charge: i32, config: &IonConfig) {
        self.ion_data
            .insert(name.to_string(), IonState::new(charge, config));
    }

    pub fn configure_stimulus(&mut self, config: &StimulusConfig) {
        self.stim = StimState::new(config);
    }

    pub fn reset(&mut self) {
        self.voltage.copy_from_slice(&self.init_voltage);
        self.current_density.iter_mut().for_each(|x| *x = 0.0);
        self.conductivity.iter_mut().for_each(|x| *x = 0.0);
        self.time.iter_mut().for_each(|x| *x = 0.0);
        self.time_to.iter_mut().for_each(|x| *x = 0.0);
        self.dt_intdom.iter_mut().for_each(|x| *x = 0.0);
        self.dt_cv.iter_mut().for_each(|x| *x = 0.0);
        self.time_since_spike.iter_mut().for_each(|x| *x = -1.0);
        for ion in self.ion_data.values_mut() {
            ion.reset();
        }
        self.stim.accu_stim.iter_mut().for_each(|x| *x = 0.0);
    }

    pub fn zero_currents(&mut self) {
        self.current_density.iter_mut().for_each(|x| *x = 0.0);
        self.conductivity.iter_mut().for_each(|x| *x = 0.0);
        for ion in self.ion_data.values_mut() {
            ion.current_density.iter_mut().for_each(|x| *x = 0.0);
        }
    }

    pub fn clear_time_since_spike(&mut self) {
        self.time_since_spike.iter_mut().for_each(|x| *x = -1.0);
    }

    pub fn ions_init_concentration(&mut self) {
        for ion in self.ion_data.values_mut() {
            ion.init_concentration();
        }
    }

    /// Sets `time_to = min(time + dt_max, tfinal)` per integration domain.
    pub fn update_time_to(&mut self, dt_max: f64, tfinal: f64) {
        for i in 0..self.n_intdom {
            self.time_to[i] = (self.time[i] + dt_max).min(tfinal);
        }
    }

    pub fn clamp_time_to(&mut self, t: f64) {
        for x in &mut self.time_to {
            if *x > t {
                *x = t;
            }
        }
    }

    pub fn set_dt(&mut self) {
        for i in 0..self.n_intdom {
            self.dt_intdom[i] = self.time_to[i] - self.time[i];
        }
        for cv in 0..self.dt_cv.len() {
            self.dt_cv[cv] = self.dt_intdom[self.cv_to_intdom[cv]];
        }
    }

    pub fn add_stimulus_current(&mut self) {
        if self.stim.cv.is_empty() {
            return;
        }
        // Stimuli are evaluated at the step start time of their intdom.
        let t = self.time[0];
        self.stim.add_current(t, &mut self.current_density);
    }

    pub fn swap_time(&mut self) {
        std::mem::swap(&mut self.time, &mut self.time_to);
    }

    pub fn time_bounds(&self) -> (f64, f64) {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for &t in &self.time {
            lo = lo.min(t);
            hi = hi.max(t);
        }
        (lo, hi)
    }

    pub fn voltage_bounds(&self) -> (f64, f64) {
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        for &v in &self.voltage {
            lo = lo.min(v);
            hi = hi.max(v);
        }
        (lo, hi)
    }

    /// Builds the kernel-facing view; field borrows are disjoint.
    pub fn shared_view(&mut self) -> cable_mechanisms::SharedView<'_> {
        let mut ions = BTreeMap::new();
        for (name, ion) in &mut self.ion_data {
            ions.insert(
                name.as_str(),
                IonView {
                    current_density: &mut ion.current_density,
                    internal_concentration: &mut ion.internal_concentration,
                    external_concentration: &mut ion.external_concentration,
                    reversal_potential: &mut ion.reversal_potential,
                    valence: ion.charge,
                },
            );
        }
        cable_mechanisms::SharedView {
            voltage: &self.voltage,
            current_density: &mut self.current_density,
            conductivity: &mut self.conductivity,
            dt_cv: &self.dt_cv,
            temperature: &self.temperature,
            diam_um: &self.diam_um,
            cv_to_cell: &self.cv_to_cell,
            time_since_spike: &self.time_since_spike,
            n_detector: self.n_detector,
            ions,
        }
    }

    pub fn snapshot_digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"CABLE:STATE:SNAP");
        update_f64s(&mut hasher, &self.time);
        update_f64s(&mut hasher, &self.voltage);
        update_f64s(&mut hasher, &self.current_density);
        for (name, ion) in &self.ion_data {
            hasher.update(name.as_bytes());
            update_f64s(&mut hasher, &ion.internal_concentration);
            update_f64s(&mut hasher, &ion.external_concentration);
            update_f64s(&mut hasher, &ion.reversal_potential);
        }
        *hasher.finalize().as_bytes()
    }
}

fn update_f64s(hasher: &mut blake3::Hasher, values: &[f64]) {
    for v in values {
        hasher.update(&v.to_bits().to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_cv_state() -> SharedState {
        SharedState::new(
            1,
            1,
            0,
            vec![0],
            vec![0],
            vec![0],
            vec![-65.0],
            vec![279.45],
            vec![1.0],
            vec![],
        )
    }

    #[test]
    fn watcher_interpolates_rising_crossing() {
        let mut w = ThresholdWatcher::new(vec![0], vec![0], vec![-10.0]);
        w.reset(&[-65.0]);
        let mut tss = vec![];
        w.test(&[10.0], &[0.0], &[1.0], &mut tss, &[]);
        assert_eq!(w.crossings().len(), 1);
        let c = w.crossings()[0];
        // (−10 − (−65)) / (10 − (−65)) of the step.
        assert!((c.time - 55.0 / 75.0).abs() < 1e-12);
    }

    #[test]
    fn watcher_ignores_falling_and_already_above() {
        let mut w = ThresholdWatcher::new(vec![0], vec![0], vec![-10.0]);
        w.reset(&[0.0]);
        let mut tss = vec![];
        // Already above: no crossing on a further rise.
        w.test(&[5.0], &[0.0], &[1.0], &mut tss, &[]);
        assert!(w.crossings().is_empty());
        // Falling crossing is not a spike, but re-arms the flag.
        w.test(&[-40.0], &[1.0], &[2.0], &mut tss, &[]);
        assert!(w.crossings().is_empty());
        w.test(&[0.0], &[2.0], &[3.0], &mut tss, &[]);
        assert_eq!(w.crossings().len(), 1);
    }

    #[test]
    fn clear_crossings_keeps_flags() {
        let mut w = ThresholdWatcher::new(vec![0], vec![0], vec![-10.0]);
        w.reset(&[-65.0]);
        let mut tss = vec![];
        w.test(&[0.0], &[0.0], &[1.0], &mut tss, &[]);
        assert_eq!(w.crossings().len(), 1);
        w.clear_crossings();
        assert!(w.crossings().is_empty());
        // Still above threshold: no new crossing without a fall first.
        w.test(&[5.0], &[1.0], &[2.0], &mut tss, &[]);
        assert!(w.crossings().is_empty());
    }

    #[test]
    fn stimulus_envelope_interpolates_linearly() {
        let config = StimulusConfig {
            cv: vec![0],
            cv_unique: vec![0],
            frequency: vec![0.0],
            phase: vec![0.0],
            envelope_time: vec![vec![1.0, 2.0, 2.0]],
            envelope_amplitude: vec![vec![0.0, 2.0, 0.0]],
        };
        let mut state = single_cv_state();
        state.configure_stimulus(&config);

        state.stim.add_current(0.5, &mut state.current_density);
        assert_eq!(state.current_density[0], 0.0);

        state.stim.add_current(1.5, &mut state.current_density);
        assert!((state.current_density[0] + 1.0).abs() < 1e-12);
        assert!((state.stim.accu_stim[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn update_time_to_respects_tfinal() {
        let mut state = single_cv_state();
        state.time[0] = 0.9;
        state.update_time_to(0.25, 1.0);
        assert!((state.time_to[0] - 1.0).abs() < 1e-12);
        state.set_dt();
        assert!((state.dt_intdom[0] - 0.1).abs() < 1e-12);
        assert!((state.dt_cv[0] - 0.1).abs() < 1e-12);
    }
}
