#![forbid(unsafe_code)]

//! Simulation driver: builds cell groups from a recipe and a group
//! partition, negotiates the minimum-delay epoch length, and runs the
//! double-buffered epoch loop overlapping local advance with the spike
//! exchange of the previous epoch.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use cable_cell::Recipe;
use cable_cellgroup::{
    CellGroup, CellGroupError, GjSite, GjTraces, GroupBuilder, GroupGjConnection, GroupSnapshot,
    IntegrationResult, SampleEvent, SampleRecord,
};
use cable_comm::{
    all_gather_messages, CommError, Communicator, DistributedContext, DomainDecomposition,
    LabelResolutionMap,
};
use cable_core::{CellGid, CellLid, CellMember, Epoch, GroupPartition, Spike, SpikeEvent};
use cable_events::{merge_events, DeliverableEvent, EventGenerator, Schedule};
use cable_mechanisms::MechanismCatalogue;
use exchange::v1::{GjSiteRecord, LabelRecord};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use settings::{RelaxationSettings, SimSettings};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SimulationError {
    #[error(transparent)]
    Group(#[from] CellGroupError),
    #[error(transparent)]
    Comm(#[from] CommError),
    #[error("invalid group partition: {0}")]
    Partition(String),
    #[error("no gap junction labelled {label} on cell {gid:?}")]
    GjResolution { gid: CellGid, label: String },
    #[error("no probe {0:?} in this simulation")]
    UnknownProbe(CellMember),
    #[error("checkpoint rejected: {0}")]
    Checkpoint(String),
    #[error("checkpoint io: {0}")]
    CheckpointIo(String),
}

struct Sampler {
    group: usize,
    probe_index: usize,
    schedule: Schedule,
}

/// Persisted simulation state; configuration is rebuilt from the recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub time: f64,
    pub groups: Vec<GroupSnapshot>,
    pub pending: Vec<Vec<SpikeEvent>>,
}

pub struct Simulation {
    recipe: Arc<dyn Recipe>,
    ctx: Arc<dyn DistributedContext>,
    settings: SimSettings,

    groups: Vec<CellGroup>,
    /// For every local cell in domain order: owning group and index there.
    cell_locator: Vec<(usize, usize)>,
    generators: Vec<Vec<EventGenerator>>,
    comm: Communicator,
    decomposition: DomainDecomposition,
    min_delay: f64,
    needs_relaxation: bool,

    time: f64,
    epoch_counter: u64,
    /// Per local cell: network events not yet staged into an epoch.
    pending: Vec<Vec<SpikeEvent>>,
    /// Local spikes of the last advanced epoch, awaiting exchange.
    unexchanged_spikes: Vec<Spike>,

    samplers: Vec<Sampler>,
    sample_record: Vec<SampleRecord>,
    spike_record: Vec<Spike>,
}

impl Simulation {
    pub fn new(
        recipe: Arc<dyn Recipe>,
        catalogue: Arc<MechanismCatalogue>,
        ctx: Arc<dyn DistributedContext>,
        partition: GroupPartition,
        sim_settings: SimSettings,
    ) -> Result<Self, SimulationError> {
        partition.validate().map_err(SimulationError::Partition)?;

        let local_gids: Vec<CellGid> = partition.groups.iter().flatten().copied().collect();
        let mut cell_locator = Vec::with_capacity(local_gids.len());
        for (g, group) in partition.groups.iter().enumerate() {
            for (i, _) in group.iter().enumerate() {
                cell_locator.push((g, i));
            }
        }

        // Gather the global rank-of-cell map and this rank's group offset.
        let gid_records: Vec<LabelRecord> = local_gids
            .iter()
            .map(|g| LabelRecord {
                gid: g.0,
                label: String::new(),
                begin: 0,
                end: partition.groups.len() as u32,
            })
            .collect();
        let gathered = all_gather_messages(ctx.as_ref(), &gid_records);
        let mut rank_of = BTreeMap::new();
        let mut group_offset = 0usize;
        for (rank, records) in gathered.iter().enumerate() {
            for r in records {
                rank_of.insert(CellGid(r.gid), rank);
            }
            if rank < ctx.id() {
                group_offset += records.first().map_or(0, |r| r.end as usize);
            }
        }
        let decomposition = DomainDecomposition {
            num_ranks: ctx.size(),
            rank_of,
            local_gids: local_gids.clone(),
        };

        let mut builders = Vec::with_capacity(partition.groups.len());
        for (g, gids) in partition.groups.iter().enumerate() {
            builders.push(GroupBuilder::new(
                recipe.as_ref(),
                group_offset + g,
                gids.clone(),
            )?);
        }

        // Gather gap-junction sites into the global (gid, lid) → site table.
        let mut site_records: Vec<GjSiteRecord> = Vec::new();
        for b in &builders {
            for (site, label) in b.gj_sites() {
                site_records.push(GjSiteRecord {
                    gid: site.gid.0,
                    lid: site.lid.0,
                    label,
                    group: site.group as u32,
                    cv: site.cv as u64,
                });
            }
        }
        let mut all_sites: Vec<GjSiteRecord> = all_gather_messages(ctx.as_ref(), &site_records)
            .into_iter()
            .flatten()
            .collect();
        all_sites.sort_by_key(|s| (s.gid, s.lid));

        let gj_sites: Vec<GjSite> = all_sites
            .iter()
            .map(|s| GjSite {
                gid: CellGid(s.gid),
                lid: CellLid(s.lid),
                group: s.group as usize,
                cv: s.cv as usize,
            })
            .collect();

        let mut sites_by_label: BTreeMap<(u32, String), Vec<usize>> = BTreeMap::new();
        for (i, s) in all_sites.iter().enumerate() {
            sites_by_label
                .entry((s.gid, s.label.clone()))
                .or_default()
                .push(i);
        }

        // Resolve gap-junction connections per local cell; multivalent
        // labels cycle round-robin in connection order.
        let mut gj_conns: BTreeMap<CellGid, Vec<GroupGjConnection>> = BTreeMap::new();
        let mut cursor: BTreeMap<(u32, String), usize> = BTreeMap::new();
        let mut resolve_site = |gid: CellGid, label: &str| -> Result<usize, SimulationError> {
            let key = (gid.0, label.to_string());
            let sites = sites_by_label
                .get(&key)
                .ok_or_else(|| SimulationError::GjResolution {
                    gid,
                    label: label.to_string(),
                })?;
            let c = cursor.entry(key).or_insert(0);
            let site = sites[*c % sites.len()];
            *c += 1;
            Ok(site)
        };
        for &gid in &local_gids {
            for conn in recipe.gap_junctions_on(gid) {
                let local_site = resolve_site(gid, &conn.local_label)?;
                let peer_site = resolve_site(conn.peer_gid, &conn.peer_label)?;
                gj_conns.entry(gid).or_default().push(GroupGjConnection {
                    local_lid: gj_sites[local_site].lid,
                    peer_site,
                    weight: conn.weight,
                });
            }
        }

        // Source labels are needed globally, target labels locally.
        let mut source_records: Vec<LabelRecord> = Vec::new();
        let mut target_resolution = LabelResolutionMap::new();
        for b in &builders {
            for (gid, label, begin, end) in b.source_label_records() {
                source_records.push(LabelRecord {
                    gid: gid.0,
                    label,
                    begin,
                    end,
                });
            }
            for (gid, label, begin, end) in b.target_label_records() {
                target_resolution.add(gid, &label, begin, end);
            }
        }
        let mut source_resolution = LabelResolutionMap::new();
        for records in all_gather_messages(ctx.as_ref(), &source_records) {
            for r in records {
                source_resolution.add(CellGid(r.gid), &r.label, r.begin, r.end);
            }
        }

        let mut groups = Vec::with_capacity(builders.len());
        for b in builders {
            let mut group = b.build(recipe.as_ref(), &catalogue, &gj_sites, &gj_conns)?;
            if let Some(bound) = sim_settings.voltage_bound() {
                group.set_voltage_bound(Some(bound));
            }
            groups.push(group);
        }
        let needs_relaxation = groups.iter().any(|g| g.has_remote_peers());

        let mut comm = Communicator::new(ctx.clone());
        comm.update_connections(
            recipe.as_ref(),
            &decomposition,
            &mut source_resolution,
            &mut target_resolution,
        )?;
        let min_delay = comm.min_delay();

        let generators = local_gids
            .iter()
            .map(|&gid| recipe.event_generators(gid))
            .collect();

        let n_local = local_gids.len();
        info!(
            cells = n_local,
            groups = groups.len(),
            gj_sites = gj_sites.len(),
            min_delay,
            "simulation initialized"
        );

        Ok(Simulation {
            recipe,
            ctx,
            settings: sim_settings,
            groups,
            cell_locator,
            generators,
            comm,
            decomposition,
            min_delay,
            needs_relaxation,
            time: 0.0,
            epoch_counter: 0,
            pending: vec![Vec::new(); n_local],
            unexchanged_spikes: Vec::new(),
            samplers: Vec::new(),
            sample_record: Vec::new(),
            spike_record: Vec::new(),
        })
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn min_delay(&self) -> f64 {
        self.min_delay
    }

    pub fn spikes(&self) -> &[Spike] {
        &self.spike_record
    }

    pub fn samples(&self) -> &[SampleRecord] {
        &self.sample_record
    }

    pub fn num_exchanged_spikes(&self) -> u64 {
        self.comm.num_spikes()
    }

    /// Registers a sampler on a probe `(gid, probe index)`.
    pub fn add_sampler(
        &mut self,
        probe_id: CellMember,
        schedule: Schedule,
    ) -> Result<(), SimulationError> {
        for (g, group) in self.groups.iter().enumerate() {
            if let Some(probe_index) = group.probe_ids().iter().position(|&id| id == probe_id) {
                self.samplers.push(Sampler {
                    group: g,
                    probe_index,
                    schedule,
                });
                return Ok(());
            }
        }
        Err(SimulationError::UnknownProbe(probe_id))
    }

    /// Epoch length: at most half the global minimum delay, so spikes can
    /// be exchanged once per epoch without losing ordering.
    fn epoch_length(&self, tfinal: f64) -> f64 {
        let span = tfinal - self.time;
        let mut len = if self.min_delay.is_finite() {
            self.min_delay / 2.0
        } else {
            span
        };
        if let Some(override_len) = self.settings.epoch_length_ms {
            len = len.min(override_len);
        }
        len.min(span).max(f64::MIN_POSITIVE)
    }

    /// Advances the simulation to `tfinal`; returns the reached time.
    pub fn run(&mut self, tfinal: f64) -> Result<f64, SimulationError> {
        if tfinal <= self.time {
            return Ok(self.time);
        }
        let len = self.epoch_length(tfinal);
        let mut epoch = Epoch::new(self.epoch_counter, self.time, (self.time + len).min(tfinal));

        while epoch.t0 < tfinal {
            debug!(epoch = epoch.id, t0 = epoch.t0, t1 = epoch.t1, "epoch");
            let staged_events = self.stage_epoch_events(epoch.t1);
            let staged_samples = self.stage_epoch_samples(epoch.t0, epoch.t1);

            // Advance epoch k while the spikes of epoch k−1 are exchanged;
            // the exchange builds queues consumed from epoch k+1 on.
            let groups = &mut self.groups;
            let comm = &mut self.comm;
            let relax = self.settings.relaxation.clone();
            let needs_relaxation = self.needs_relaxation;
            let dt_max = self.settings.dt_max_ms;
            let prev_spikes = std::mem::take(&mut self.unexchanged_spikes);
            let n_local = self.decomposition.num_local_cells();
            let t1 = epoch.t1;

            let (advanced, exchanged) = rayon::join(
                move || {
                    advance_epoch(
                        groups,
                        t1,
                        dt_max,
                        staged_events,
                        staged_samples,
                        &relax,
                        needs_relaxation,
                    )
                },
                move || -> Result<Vec<Vec<SpikeEvent>>, CommError> {
                    let spikes = comm.exchange(prev_spikes)?;
                    let mut queues = vec![Vec::new(); n_local];
                    comm.make_event_queues(&spikes, &mut queues);
                    Ok(queues)
                },
            );
            let results = advanced?;
            let queues = exchanged?;

            let mut epoch_spikes = Vec::new();
            for r in results {
                epoch_spikes.extend_from_slice(&r.spikes);
                self.sample_record.extend(r.samples);
            }
            epoch_spikes.sort();
            self.spike_record.extend_from_slice(&epoch_spikes);
            self.unexchanged_spikes = epoch_spikes;

            self.merge_pending(queues);

            self.comm.remote_ctrl_send_continue(&epoch);
            self.time = epoch.t1;
            epoch.advance_to((epoch.t1 + len).min(tfinal));
            self.epoch_counter = epoch.id;
        }

        // Flush the final epoch's spikes so every rank completes the same
        // number of collectives and late events stay queued.
        let spikes = std::mem::take(&mut self.unexchanged_spikes);
        let flushed = self.comm.exchange(spikes)?;
        let mut queues = vec![Vec::new(); self.decomposition.num_local_cells()];
        self.comm.make_event_queues(&flushed, &mut queues);
        self.merge_pending(queues);
        self.comm.remote_ctrl_send_done();

        Ok(self.time)
    }

    fn merge_pending(&mut self, queues: Vec<Vec<SpikeEvent>>) {
        for (cell, events) in queues.into_iter().enumerate() {
            if events.is_empty() {
                continue;
            }
            let mut merged = Vec::new();
            merge_events(&[&self.pending[cell], &events], &mut merged);
            self.pending[cell] = merged;
        }
    }

    /// Splits pending network events due before `t_end`, generates
    /// generator events for the epoch window, and resolves both into
    /// per-group deliverable lists.
    fn stage_epoch_events(&mut self, t_end: f64) -> Vec<Vec<DeliverableEvent>> {
        let mut staged: Vec<Vec<DeliverableEvent>> = vec![Vec::new(); self.groups.len()];
        for (cell, (group_idx, cell_in_group)) in self.cell_locator.iter().enumerate() {
            let pending = &mut self.pending[cell];
            let split = pending.partition_point(|e| e.time < t_end);
            let due: Vec<SpikeEvent> = pending.drain(..split).collect();

            let generated: Vec<SpikeEvent> = self.generators[cell]
                .iter()
                .flat_map(|g| g.events(self.time, t_end))
                .collect();

            let group = &self.groups[*group_idx];
            for ev in due.into_iter().chain(generated) {
                let handle = group.target_handle(*cell_in_group, ev.target);
                staged[*group_idx].push(DeliverableEvent {
                    time: ev.time,
                    weight: ev.weight as f64,
                    handle,
                });
            }
        }
        staged
    }

    fn stage_epoch_samples(&self, t0: f64, t1: f64) -> Vec<Vec<SampleEvent>> {
        let mut staged: Vec<Vec<SampleEvent>> = vec![Vec::new(); self.groups.len()];
        for s in &self.samplers {
            for time in s.schedule.events(t0, t1) {
                staged[s.group].push(SampleEvent {
                    probe_index: s.probe_index,
                    time,
                });
            }
        }
        staged
    }

    /// Rebuilds the connection table from the recipe; must run outside any
    /// active epoch.
    pub fn update_connections(&mut self) -> Result<(), SimulationError> {
        let mut source_records = Vec::new();
        let mut target_resolution = LabelResolutionMap::new();
        for group in &self.groups {
            let builder = GroupBuilder::new(
                self.recipe.as_ref(),
                group.group_index(),
                group.gids().to_vec(),
            )?;
            for (gid, label, begin, end) in builder.source_label_records() {
                source_records.push(LabelRecord {
                    gid: gid.0,
                    label,
                    begin,
                    end,
                });
            }
            for (gid, label, begin, end) in builder.target_label_records() {
                target_resolution.add(gid, &label, begin, end);
            }
        }
        let mut source_resolution = LabelResolutionMap::new();
        for records in all_gather_messages(self.ctx.as_ref(), &source_records) {
            for r in records {
                source_resolution.add(CellGid(r.gid), &r.label, r.begin, r.end);
            }
        }
        self.comm.update_connections(
            self.recipe.as_ref(),
            &self.decomposition,
            &mut source_resolution,
            &mut target_resolution,
        )?;
        self.min_delay = self.comm.min_delay();
        info!(min_delay = self.min_delay, "connections updated");
        Ok(())
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            time: self.time,
            groups: self.groups.iter().map(|g| g.snapshot()).collect(),
            pending: self.pending.clone(),
        }
    }

    pub fn restore(&mut self, checkpoint: &Checkpoint) -> Result<(), SimulationError> {
        if checkpoint.groups.len() != self.groups.len() {
            return Err(SimulationError::Checkpoint(format!(
                "expected {} groups, checkpoint has {}",
                self.groups.len(),
                checkpoint.groups.len()
            )));
        }
        if checkpoint.pending.len() != self.pending.len() {
            return Err(SimulationError::Checkpoint(
                "pending queue count differs".to_string(),
            ));
        }
        for (group, snap) in self.groups.iter_mut().zip(&checkpoint.groups) {
            group.restore(snap)?;
        }
        self.pending = checkpoint.pending.clone();
        self.time = checkpoint.time;
        self.unexchanged_spikes.clear();
        Ok(())
    }

    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<(), SimulationError> {
        let file = std::fs::File::create(path.as_ref())
            .map_err(|e| SimulationError::CheckpointIo(e.to_string()))?;
        serde_json::to_writer(file, &self.checkpoint())
            .map_err(|e| SimulationError::CheckpointIo(e.to_string()))?;
        Ok(())
    }

    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<(), SimulationError> {
        let file = std::fs::File::open(path.as_ref())
            .map_err(|e| SimulationError::CheckpointIo(e.to_string()))?;
        let checkpoint: Checkpoint = serde_json::from_reader(file)
            .map_err(|e| SimulationError::CheckpointIo(e.to_string()))?;
        self.restore(&checkpoint)
    }

    pub fn reset(&mut self) {
        for g in &mut self.groups {
            g.reset();
        }
        self.time = 0.0;
        self.epoch_counter = 0;
        for q in &mut self.pending {
            q.clear();
        }
        self.unexchanged_spikes.clear();
        self.sample_record.clear();
        self.spike_record.clear();
        self.comm.reset();
    }

    /// Digest over the per-group configuration digests, for determinism
    /// checks and logging.
    pub fn config_digest_hex(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"CABLE:SIM:CFG");
        for g in &self.groups {
            hasher.update(&g.config_digest());
        }
        hex::encode(hasher.finalize().as_bytes())
    }
}

/// Advances all groups over one epoch. With remote gap-junction peers the
/// sweep iterates: each sweep records per-step junction voltages, replays
/// the previous sweep's peer traces, and stops once the max-abs voltage
/// delta falls below tolerance or the iteration cap is hit.
fn advance_epoch(
    groups: &mut [CellGroup],
    t_end: f64,
    dt_max: f64,
    staged_events: Vec<Vec<DeliverableEvent>>,
    staged_samples: Vec<Vec<SampleEvent>>,
    relax: &RelaxationSettings,
    needs_relaxation: bool,
) -> Result<Vec<IntegrationResult>, CellGroupError> {
    if !needs_relaxation {
        let sweep: Vec<Result<IntegrationResult, CellGroupError>> = groups
            .par_iter_mut()
            .zip(staged_events)
            .zip(staged_samples)
            .map(|((g, events), samples)| g.integrate(t_end, dt_max, events, samples, None))
            .collect();
        let mut out = Vec::with_capacity(sweep.len());
        for r in sweep {
            out.push(r?);
        }
        return Ok(out);
    }

    let snapshots: Vec<GroupSnapshot> = groups.iter().map(|g| g.snapshot()).collect();
    let mut prev_traces = GjTraces::default();
    let mut iteration = 0u32;

    loop {
        let sweep: Vec<Result<IntegrationResult, CellGroupError>> = groups
            .par_iter_mut()
            .zip(staged_events.clone())
            .zip(staged_samples.clone())
            .map(|((g, events), samples)| {
                g.integrate(t_end, dt_max, events, samples, Some(&prev_traces))
            })
            .collect();
        let mut results = Vec::with_capacity(sweep.len());
        for r in sweep {
            results.push(r?);
        }

        let mut merged = GjTraces::default();
        for r in &results {
            merged.merge_from(&r.traces);
        }

        let err = merged.max_delta(&prev_traces);
        let converged = iteration > 0 && err < relax.tolerance_mv;
        if converged || iteration + 1 >= relax.max_iterations {
            debug!(iteration, err, "waveform relaxation finished");
            return Ok(results);
        }

        prev_traces = merged;
        iteration += 1;
        for (g, snap) in groups.iter_mut().zip(&snapshots) {
            g.restore(snap)?;
        }
    }
}
