//! The per-step integration loop.
//!
//! One call to `integrate` advances the group from its current time to
//! `tfinal` in steps bounded by `dt_max`, recording per-step voltage traces
//! at every gap-junction CV. Waveform relaxation is an outer concern: the
//! driver snapshots the group, runs a sweep, replays peer traces from the
//! previous sweep and iterates until the traces converge.

use std::collections::BTreeMap;

use cable_core::{CellMember, Spike};
use cable_events::DeliverableEvent;
use serde::{Deserialize, Serialize};

use crate::{ArraySource, CellGroup, CellGroupError, ProbeData, ProbeTerm};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleEvent {
    /// Index into the group's resolved probe list.
    pub probe_index: usize,
    pub time: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub probe_id: CellMember,
    pub time: f64,
    pub values: Vec<f64>,
}

/// One site's recorded voltage trace: step start times and values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TraceSeries {
    pub times: Vec<f64>,
    pub values: Vec<f64>,
}

/// Per-step voltage traces at gap-junction sites, keyed by global site id.
/// Peer replay looks a value up by step start time, so traces recorded on
/// different step grids stay usable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GjTraces {
    pub series: BTreeMap<usize, TraceSeries>,
}

impl GjTraces {
    pub fn lookup(&self, site: usize, t: f64) -> Option<f64> {
        let series = self.series.get(&site)?;
        if series.times.is_empty() {
            return None;
        }
        let mut idx = 0;
        for (i, &t0) in series.times.iter().enumerate() {
            if t0 <= t + 1e-12 {
                idx = i;
            } else {
                break;
            }
        }
        series.values.get(idx).copied()
    }

    pub fn merge_from(&mut self, other: &GjTraces) {
        for (site, series) in &other.series {
            self.series.insert(*site, series.clone());
        }
    }

    /// Max-abs difference over sites common to both trace sets; successive
    /// relaxation sweeps share step grids per site.
    pub fn max_delta(&self, other: &GjTraces) -> f64 {
        let mut err: f64 = 0.0;
        for (site, series) in &self.series {
            if let Some(prev) = other.series.get(site) {
                for (a, b) in series.values.iter().zip(&prev.values) {
                    err = err.max((a - b).abs());
                }
            }
        }
        err
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationResult {
    pub spikes: Vec<Spike>,
    pub samples: Vec<SampleRecord>,
    pub traces: GjTraces,
}

impl CellGroup {
    /// Advances the group to `tfinal`. All staged events with
    /// `time <= step end` are delivered before the matrix solve of that
    /// step; spikes are produced in time order per detector.
    pub fn integrate(
        &mut self,
        tfinal: f64,
        dt_max: f64,
        staged_events: Vec<DeliverableEvent>,
        mut staged_samples: Vec<SampleEvent>,
        peer_traces: Option<&GjTraces>,
    ) -> Result<IntegrationResult, CellGroupError> {
        assert!(dt_max > 0.0, "dt_max must be positive");

        self.watcher.clear_crossings();
        self.events.init(staged_events);
        staged_samples.sort_by(|a, b| a.time.total_cmp(&b.time));
        let mut sample_cursor = 0usize;
        let mut samples = Vec::new();

        let mut traces = GjTraces::default();
        for &(site, _) in &self.local_sites {
            traces.series.insert(site, TraceSeries::default());
        }

        let t_eps = 1e-12 * tfinal.abs().max(1.0);
        self.assert_time_sync()?;

        while self.tmin < tfinal - t_eps {
            let t_now = self.tmin;

            // 1. Reversal potentials from ionic concentrations.
            {
                let mut view = self.state.shared_view();
                for m in &mut self.revpot_mechanisms {
                    m.update_current(&mut view);
                }
            }

            // 2. Mark due events, zero accumulators.
            self.events.mark_until_after(t_now);
            self.state.zero_currents();
            if self.post_events {
                self.state.clear_time_since_spike();
            }

            // 3. Stage peer voltages, deliver events, accumulate currents.
            self.stage_peer_voltages(t_now, peer_traces);
            {
                let state = &mut self.state;
                let events = &self.events;
                let mut view = state.shared_view();
                for m in &mut self.mechanisms {
                    let marked = events.marked_events(m.mechanism_id());
                    if !marked.is_empty() {
                        m.deliver_events(marked);
                    }
                    m.update_current(&mut view);
                }
            }

            // Record gap-junction CV voltages for the next relaxation sweep.
            for &(site, cv) in &self.local_sites {
                let series = traces.series.get_mut(&site).expect("trace slot exists");
                series.times.push(t_now);
                series.values.push(self.state.voltage[cv]);
            }

            // 4. Drop delivered events; bound the step by the next event.
            self.events.drop_marked_events();
            self.state.update_time_to(dt_max, tfinal);
            let min_time_to = self
                .state
                .time_to
                .iter()
                .copied()
                .fold(f64::INFINITY, f64::min);
            let clamped = self.events.event_time_if_before(min_time_to);
            self.state.clamp_time_to(clamped);
            self.state.set_dt();
            let t_to = self.state.time_to[0];

            // 5. Stimulus contributions.
            self.state.add_stimulus_current();

            // 6. Samples in [time, time_to).
            while sample_cursor < staged_samples.len()
                && staged_samples[sample_cursor].time < t_to
            {
                let ev = staged_samples[sample_cursor];
                if ev.time >= t_now {
                    samples.push(self.take_sample(ev));
                }
                sample_cursor += 1;
            }

            // 7. Matrix assembly and solve.
            self.matrix.assemble(
                &self.state.dt_cv,
                &self.state.voltage,
                &self.state.current_density,
                &self.state.conductivity,
            );
            self.matrix.solve(&mut self.state.voltage);

            // 8. Mechanism state integration.
            {
                let mut view = self.state.shared_view();
                for m in &mut self.mechanisms {
                    m.update_state(&mut view);
                }
            }

            // 9. Ion concentration update.
            self.state.ions_init_concentration();
            {
                let mut view = self.state.shared_view();
                for m in &mut self.mechanisms {
                    m.update_ions(&mut view);
                }
            }

            // 10. Threshold test over [time, time_to].
            self.watcher.test(
                &self.state.voltage,
                &self.state.time,
                &self.state.time_to,
                &mut self.state.time_since_spike,
                &self.state.src_to_spike,
            );

            // 11. Post-event capable mechanisms.
            if self.post_events {
                let state = &mut self.state;
                let view = state.shared_view();
                for m in &mut self.mechanisms {
                    m.post_event(&view);
                }
            }

            // 12. Advance the clock.
            self.state.swap_time();
            self.tmin = self.state.time_bounds().0;
            self.assert_time_sync()?;

            // 13. Voltage bounds check.
            if let Some(bound) = self.check_voltage_mv {
                let (lo, hi) = self.state.voltage_bounds();
                if lo < -bound || hi > bound {
                    return Err(CellGroupError::VoltageOutOfBounds {
                        t0: t_now,
                        t1: t_to,
                        value: if lo < -bound { lo } else { hi },
                    });
                }
            }
        }

        self.tmin = tfinal;

        let spikes = self
            .watcher
            .crossings()
            .iter()
            .map(|c| Spike {
                source: self.detector_meta[c.index as usize],
                time: c.time,
            })
            .collect();

        Ok(IntegrationResult {
            spikes,
            samples,
            traces,
        })
    }

    fn assert_time_sync(&self) -> Result<(), CellGroupError> {
        let (lo, hi) = self.state.time_bounds();
        if (hi - lo).abs() > 1e-9 {
            return Err(CellGroupError::TimeDesync);
        }
        Ok(())
    }

    /// Fills per-mechanism peer-voltage buffers: live reads for same-group
    /// peers, trace replay (or the local voltage on the first sweep) for
    /// peers in other groups.
    fn stage_peer_voltages(&mut self, t_now: f64, peer_traces: Option<&GjTraces>) {
        for gj in &self.gj_mechs {
            let mech = &mut self.mechanisms[gj.slot];
            let node_index = mech.node_index().to_vec();
            let Some(buffer) = mech.peer_voltage_buffer() else {
                continue;
            };
            buffer.resize(gj.peer_sites.len(), 0.0);
            for i in 0..gj.peer_sites.len() {
                buffer[i] = match gj.peer_local_cv[i] {
                    Some(cv) => self.state.voltage[cv],
                    None => peer_traces
                        .and_then(|tr| tr.lookup(gj.peer_sites[i], t_now))
                        // First sweep without a trace: assume zero
                        // differential across the junction.
                        .unwrap_or(self.state.voltage[node_index[i]]),
                };
            }
        }
    }

    fn take_sample(&self, ev: SampleEvent) -> SampleRecord {
        let probe = &self.probes[ev.probe_index];
        let values = match &probe.data {
            ProbeData::Scalar(term) => vec![self.eval_term(term)],
            ProbeData::Multi(terms) => terms.iter().map(|t| self.eval_term(t)).collect(),
        };
        SampleRecord {
            probe_id: probe.id,
            time: ev.time,
            values,
        }
    }

    fn eval_term(&self, term: &ProbeTerm) -> f64 {
        let mut acc = 0.0;
        for (source, index, coef) in &term.parts {
            let value = match source {
                ArraySource::Voltage => self.state.voltage[*index],
                ArraySource::CurrentDensity => self.state.current_density[*index],
                ArraySource::StimCurrent => {
                    self.state.stim.accu_stim.get(*index).copied().unwrap_or(0.0)
                }
                ArraySource::IonCurrent(ion) => self
                    .state
                    .ion_data
                    .get(ion)
                    .map_or(0.0, |s| s.current_density[*index]),
                ArraySource::IonIntConcentration(ion) => self
                    .state
                    .ion_data
                    .get(ion)
                    .map_or(0.0, |s| s.internal_concentration[*index]),
                ArraySource::IonExtConcentration(ion) => self
                    .state
                    .ion_data
                    .get(ion)
                    .map_or(0.0, |s| s.external_concentration[*index]),
                ArraySource::MechState { mech_id, var } => self
                    .mechanisms
                    .iter()
                    .chain(&self.revpot_mechanisms)
                    .find(|m| m.mechanism_id() == *mech_id)
                    .and_then(|m| m.state_view(var))
                    .map_or(0.0, |s| s[*index]),
            };
            acc += coef * value;
        }
        acc
    }
}
