#![forbid(unsafe_code)]

//! Spike exchange and connection tables.
//!
//! One communicator per process: it maintains the partitioned connection
//! table, performs the all-gather spike exchange once per epoch, and turns
//! the gathered global spike set into per-cell event queues.

pub mod context;
pub mod labels;

use std::collections::BTreeMap;
use std::sync::Arc;

use cable_cell::Recipe;
use cable_core::{CellGid, CellLid, CellMember, Epoch, Spike, SpikeEvent};
use exchange::v1::{Control, ControlKind, SpikeBatch, SpikeRecord};
use thiserror::Error;
use tracing::debug;

pub use context::{DistributedContext, GatheredVector, InProcessExchange, LocalContext};
pub use labels::LabelResolutionMap;

#[derive(Debug, Error)]
pub enum CommError {
    #[error("no source labelled {label} on cell {gid:?}")]
    UnknownSourceLabel { gid: CellGid, label: String },
    #[error("no target labelled {label} on cell {gid:?}")]
    UnknownTargetLabel { gid: CellGid, label: String },
    #[error("connection {source_gid:?} -> {target:?} has non-positive delay {delay}")]
    NonPositiveDelay {
        source_gid: CellGid,
        target: CellGid,
        delay: f32,
    },
    #[error("spike exchange failed: {0}")]
    Transport(String),
}

/// Connection resolved to `(source detector id, destination lid)`; sorted by
/// source id within each source-rank partition for bisection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Connection {
    pub source: CellMember,
    pub destination: CellLid,
    pub weight: f32,
    pub delay: f32,
    /// Index of the owning cell on this rank.
    pub index_on_domain: usize,
}

pub fn make_event(c: &Connection, s: &Spike) -> SpikeEvent {
    SpikeEvent {
        target: c.destination,
        time: s.time + c.delay as f64,
        weight: c.weight,
    }
}

#[derive(Debug, Clone, Default)]
struct ConnectionSoa {
    idx_on_domain: Vec<usize>,
    srcs: Vec<CellMember>,
    dests: Vec<CellLid>,
    weights: Vec<f32>,
    delays: Vec<f32>,
}

impl ConnectionSoa {
    fn make(cons: &[Connection]) -> Self {
        let mut soa = ConnectionSoa::default();
        for c in cons {
            soa.idx_on_domain.push(c.index_on_domain);
            soa.srcs.push(c.source);
            soa.dests.push(c.destination);
            soa.weights.push(c.weight);
            soa.delays.push(c.delay);
        }
        soa
    }

    fn len(&self) -> usize {
        self.srcs.len()
    }
}

/// Assignment of cells to ranks, with this rank's cells in local order.
#[derive(Debug, Clone, Default)]
pub struct DomainDecomposition {
    pub num_ranks: usize,
    pub rank_of: BTreeMap<CellGid, usize>,
    /// This rank's cells in local-cell-index order.
    pub local_gids: Vec<CellGid>,
}

impl DomainDecomposition {
    pub fn num_local_cells(&self) -> usize {
        self.local_gids.len()
    }
}

/// Spikes from one exchange: the gathered global set with per-rank origin
/// offsets, plus spikes received from an externally coupled simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangedSpikes {
    pub from_local: GatheredVector<Spike>,
    pub from_remote: Vec<Spike>,
}

/// Interface toward an externally coupled simulator; only the contract is
/// specified here.
pub trait RemoteCoupling: Send + Sync {
    fn send_control(&self, msg: Control);
    fn receive_spikes(&self) -> Vec<Spike>;
}

pub type SpikePredicate = Box<dyn Fn(&Spike) -> bool + Send + Sync>;

pub struct Communicator {
    ctx: Arc<dyn DistributedContext>,
    num_local_cells: usize,
    connections: ConnectionSoa,
    /// Partition of connections over source ranks; `num_ranks + 1` offsets.
    connection_part: Vec<usize>,
    ext_connections: ConnectionSoa,
    remote: Option<Box<dyn RemoteCoupling>>,
    remote_spike_filter: Option<SpikePredicate>,
    num_spikes: u64,
    num_local_events: u64,
}

impl Communicator {
    pub fn new(ctx: Arc<dyn DistributedContext>) -> Self {
        Self {
            ctx,
            num_local_cells: 0,
            connections: ConnectionSoa::default(),
            connection_part: Vec::new(),
            ext_connections: ConnectionSoa::default(),
            remote: None,
            remote_spike_filter: None,
            num_spikes: 0,
            num_local_events: 0,
        }
    }

    pub fn num_local_cells(&self) -> usize {
        self.num_local_cells
    }

    pub fn num_spikes(&self) -> u64 {
        self.num_spikes
    }

    pub fn num_local_events(&self) -> u64 {
        self.num_local_events
    }

    pub fn reset(&mut self) {
        self.num_spikes = 0;
        self.num_local_events = 0;
    }

    pub fn set_remote_coupling(&mut self, remote: Box<dyn RemoteCoupling>) {
        self.remote = Some(remote);
    }

    pub fn set_remote_spike_filter(&mut self, predicate: SpikePredicate) {
        self.remote_spike_filter = Some(predicate);
    }

    /// Rebuilds the partitioned connection table from the recipe. Must run
    /// outside of any active epoch.
    pub fn update_connections(
        &mut self,
        recipe: &dyn Recipe,
        dec: &DomainDecomposition,
        source_resolution: &mut LabelResolutionMap,
        target_resolution: &mut LabelResolutionMap,
    ) -> Result<(), CommError> {
        self.num_local_cells = dec.num_local_cells();

        let mut by_rank: Vec<Vec<Connection>> = vec![Vec::new(); dec.num_ranks];
        for (index_on_domain, &gid) in dec.local_gids.iter().enumerate() {
            for conn in recipe.connections_on(gid) {
                if conn.delay <= 0.0 {
                    return Err(CommError::NonPositiveDelay {
                        source_gid: conn.source_gid,
                        target: gid,
                        delay: conn.delay,
                    });
                }
                let source_lid = source_resolution
                    .resolve(conn.source_gid, &conn.source_label)
                    .ok_or_else(|| CommError::UnknownSourceLabel {
                        gid: conn.source_gid,
                        label: conn.source_label.clone(),
                    })?;
                let target_lid = target_resolution
                    .resolve(gid, &conn.target_label)
                    .ok_or_else(|| CommError::UnknownTargetLabel {
                        gid,
                        label: conn.target_label.clone(),
                    })?;
                let src_rank = *dec.rank_of.get(&conn.source_gid).unwrap_or(&0);
                by_rank[src_rank].push(Connection {
                    source: CellMember {
                        gid: conn.source_gid,
                        lid: source_lid,
                    },
                    destination: target_lid,
                    weight: conn.weight,
                    delay: conn.delay,
                    index_on_domain,
                });
            }
        }

        let mut flat = Vec::new();
        let mut part = vec![0usize];
        for rank_cons in &mut by_rank {
            rank_cons.sort_by(|a, b| a.source.cmp(&b.source));
            flat.extend_from_slice(rank_cons);
            part.push(flat.len());
        }

        self.connections = ConnectionSoa::make(&flat);
        self.connection_part = part;
        debug!(
            connections = self.connections.len(),
            ranks = dec.num_ranks,
            "connection table rebuilt"
        );
        Ok(())
    }

    /// Minimum connection delay across all ranks [ms].
    pub fn min_delay(&self) -> f64 {
        let mut local: f64 = f64::INFINITY;
        for &d in self.connections.delays.iter().chain(&self.ext_connections.delays) {
            local = local.min(d as f64);
        }
        self.ctx.min(local)
    }

    /// One all-gather-v of packed spikes; the origin partition is recovered
    /// from the per-rank counts.
    pub fn exchange(&mut self, mut local_spikes: Vec<Spike>) -> Result<ExchangedSpikes, CommError> {
        local_spikes.sort();

        let batch = SpikeBatch {
            count: local_spikes.len() as u32,
            spikes: local_spikes
                .iter()
                .map(|s| SpikeRecord {
                    source_gid: s.source.gid.0,
                    source_lid: s.source.lid.0,
                    time: s.time,
                })
                .collect(),
        };
        let gathered = self.ctx.gather(prost::Message::encode_to_vec(&batch));

        let mut values = Vec::new();
        let mut partition = vec![0usize];
        for payload in &gathered {
            let batch = <SpikeBatch as prost::Message>::decode(payload.as_slice())
                .map_err(|e| CommError::Transport(e.to_string()))?;
            if batch.count as usize != batch.spikes.len() {
                return Err(CommError::Transport(
                    "spike batch count disagrees with payload".to_string(),
                ));
            }
            for rec in &batch.spikes {
                values.push(Spike {
                    source: CellMember::new(rec.source_gid, rec.source_lid),
                    time: rec.time,
                });
            }
            partition.push(values.len());
        }
        self.num_spikes += values.len() as u64;

        let from_remote = match &self.remote {
            None => Vec::new(),
            Some(remote) => {
                let mut spikes = remote.receive_spikes();
                if let Some(filter) = &self.remote_spike_filter {
                    spikes.retain(|s| filter(s));
                }
                spikes.sort();
                spikes
            }
        };

        debug!(
            global = values.len(),
            remote = from_remote.len(),
            "spike exchange complete"
        );
        Ok(ExchangedSpikes {
            from_local: GatheredVector { values, partition },
            from_remote,
        })
    }

    /// Checks each global spike against the local connection table and
    /// appends matching events to the owning cell's queue, time-sorted with
    /// ties broken by target then weight.
    pub fn make_event_queues(
        &mut self,
        global: &ExchangedSpikes,
        queues: &mut [Vec<SpikeEvent>],
    ) {
        assert_eq!(queues.len(), self.num_local_cells, "queue per local cell");

        let spikes = &global.from_local;
        let n_rank = spikes.partition.len().saturating_sub(1);
        for rank in 0..n_rank {
            let spike_range = &spikes.values[spikes.partition[rank]..spikes.partition[rank + 1]];
            let (clo, chi) = if rank + 1 < self.connection_part.len() {
                (self.connection_part[rank], self.connection_part[rank + 1])
            } else {
                (0, 0)
            };
            self.num_local_events +=
                enqueue_partition(&self.connections, clo, chi, spike_range, queues);
        }

        if !global.from_remote.is_empty() && self.ext_connections.len() > 0 {
            // External connections form a single unpartitioned table.
            let n = self.ext_connections.len();
            self.num_local_events +=
                enqueue_partition(&self.ext_connections, 0, n, &global.from_remote, queues);
        }

        for q in queues.iter_mut() {
            q.sort();
        }
    }

    pub fn remote_ctrl_send_continue(&self, epoch: &Epoch) {
        if let Some(remote) = &self.remote {
            remote.send_control(Control {
                kind: ControlKind::Continue as i32,
                epoch_id: epoch.id,
                t0: epoch.t0,
                t1: epoch.t1,
            });
        }
    }

    pub fn remote_ctrl_send_done(&self) {
        if let Some(remote) = &self.remote {
            remote.send_control(Control {
                kind: ControlKind::Done as i32,
                epoch_id: 0,
                t0: 0.0,
                t1: 0.0,
            });
        }
    }
}

/// Bisects the sorted spike range per connection source and appends the
/// matching events to the owning cell's queue.
fn enqueue_partition(
    cons: &ConnectionSoa,
    clo: usize,
    chi: usize,
    spikes: &[Spike],
    queues: &mut [Vec<SpikeEvent>],
) -> u64 {
    let mut n_events = 0u64;
    for ci in clo..chi {
        let src = cons.srcs[ci];
        let lo = spikes.partition_point(|s| s.source < src);
        let hi = spikes.partition_point(|s| s.source <= src);
        for s in &spikes[lo..hi] {
            queues[cons.idx_on_domain[ci]].push(SpikeEvent {
                target: cons.dests[ci],
                time: s.time + cons.delays[ci] as f64,
                weight: cons.weights[ci],
            });
            n_events += 1;
        }
    }
    n_events
}

/// All-gather of length-delimited prost messages; result is indexed by rank.
pub fn all_gather_messages<M: prost::Message + Default>(
    ctx: &dyn DistributedContext,
    local: &[M],
) -> Vec<Vec<M>> {
    let mut buf = Vec::new();
    for m in local {
        m.encode_length_delimited(&mut buf).expect("vec write");
    }
    ctx.gather(buf)
        .into_iter()
        .map(|payload| {
            let mut out = Vec::new();
            let mut slice = payload.as_slice();
            while !slice.is_empty() {
                let m = M::decode_length_delimited(&mut slice).expect("gathered message decodes");
                out.push(m);
            }
            out
        })
        .collect()
}
