#![forbid(unsafe_code)]

//! Lowered cell group: a batch of cable cells discretized, instantiated and
//! advanced together. One group owns its shared state exclusively; kernels
//! hold non-owning views for the duration of a step.

pub mod integrate;
pub mod probes;

use std::collections::BTreeMap;

use cable_cell::{CableCell, CableCellGlobalProperties, Recipe};
use cable_core::{CellGid, CellKind, CellLid, CellMember};
use cable_discretization::{discretize_cells, CvDiscretization, CvPrefer};
use cable_events::{DeliverableEvent, EventStreams, TargetHandle};
use cable_layout::{
    append_mechanism_data, build_mechanism_data, LayoutError, MechanismData, ResolvedGapJunction,
};
use cable_matrix::HinesMatrix;
use cable_mechanisms::{MechanismCatalogue, MechanismKind, MechanismLayout, MechanismPtr};
use cable_state::{SharedState, ThresholdWatcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use integrate::{GjTraces, IntegrationResult, SampleEvent, SampleRecord, TraceSeries};
pub use probes::{ArraySource, ProbeData, ProbeMetadata, ProbeTerm, ResolvedProbe};

#[derive(Debug, Error)]
pub enum CellGroupError {
    #[error("cell {0:?} is not a cable cell")]
    NotACableCell(CellGid),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("unrecognized ion '{0}' in mechanism data")]
    UnknownIon(String),
    #[error("global default parameter {0} is unset")]
    IncompleteGlobalProperties(&'static str),
    #[error("recipe reports {reported} {what} on cell {gid:?}, cell has {actual}")]
    RecipeViolation {
        gid: CellGid,
        what: &'static str,
        reported: usize,
        actual: usize,
    },
    #[error("gap junction endpoint ({gid:?}, {lid:?}) has no site in this group")]
    BadGapJunctionEndpoint { gid: CellGid, lid: CellLid },
    #[error("voltage solution out of bounds for t in [{t0}, {t1}]: {value} mV")]
    VoltageOutOfBounds { t0: f64, t1: f64, value: f64 },
    #[error("cell group: inconsistent times across integration domains")]
    TimeDesync,
    #[error("no state variable '{state}' in mechanism '{mechanism}'")]
    UnknownMechanismState { mechanism: String, state: String },
    #[error("snapshot does not match group configuration: {0}")]
    SnapshotMismatch(String),
}

/// One gap-junction site in the global bijection table, ordered by
/// `(gid, lid)`; the index in the table is the site id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GjSite {
    pub gid: CellGid,
    pub lid: CellLid,
    /// Owning cell group (global group index).
    pub group: usize,
    /// CV index within the owning group's state.
    pub cv: usize,
}

/// A resolved gap-junction connection for a cell of this group; the peer is
/// identified by its global site id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupGjConnection {
    pub local_lid: CellLid,
    pub peer_site: usize,
    pub weight: f64,
}

/// Discovers integration domains within a group: cells coupled by gap
/// junctions (directly or transitively, restricted to the group) share a
/// timestep.
pub fn compute_intdoms(recipe: &dyn Recipe, gids: &[CellGid]) -> (usize, Vec<usize>) {
    let gid_to_loc: BTreeMap<CellGid, usize> =
        gids.iter().enumerate().map(|(i, &g)| (g, i)).collect();
    let mut cell_to_intdom = vec![usize::MAX; gids.len()];
    let mut n_intdom = 0;

    for &gid in gids {
        if cell_to_intdom[gid_to_loc[&gid]] != usize::MAX {
            continue;
        }
        let mut queue = vec![gid];
        while let Some(g) = queue.pop() {
            let loc = gid_to_loc[&g];
            if cell_to_intdom[loc] != usize::MAX {
                continue;
            }
            cell_to_intdom[loc] = n_intdom;
            for gj in recipe.gap_junctions_on(g) {
                if let Some(&peer_loc) = gid_to_loc.get(&gj.peer_gid) {
                    if cell_to_intdom[peer_loc] == usize::MAX {
                        queue.push(gids[peer_loc]);
                    }
                }
            }
        }
        n_intdom += 1;
    }
    (n_intdom, cell_to_intdom)
}

/// Gap-junction sites of the cells in one group, with their labels and the
/// CV each site resolves to (`Nonempty` preference).
pub fn local_gj_sites(
    gids: &[CellGid],
    cells: &[CableCell],
    d: &CvDiscretization,
    group: usize,
) -> Vec<(GjSite, String)> {
    let mut out = Vec::new();
    for (cell_idx, (&gid, cell)) in gids.iter().zip(cells).enumerate() {
        for placed in cell.junctions().values().flatten() {
            let cv = d
                .geometry
                .location_cv(cell_idx, placed.loc, CvPrefer::Nonempty);
            let label = cell
                .junction_ranges()
                .iter()
                .find(|(_, r)| r.begin <= placed.lid.0 && placed.lid.0 < r.end)
                .map(|(l, _)| l.clone())
                .unwrap_or_default();
            out.push((
                GjSite {
                    gid,
                    lid: placed.lid,
                    group,
                    cv,
                },
                label,
            ));
        }
    }
    out.sort_by_key(|(s, _)| (s.gid, s.lid));
    out
}

struct GjMechInfo {
    /// Slot in `mechanisms`.
    slot: usize,
    /// Global site id per instance.
    peer_sites: Vec<usize>,
    /// Group-local CV for same-group peers, read live each step.
    peer_local_cv: Vec<Option<usize>>,
}

pub struct CellGroup {
    group_index: usize,
    gids: Vec<CellGid>,
    d: CvDiscretization,
    state: SharedState,
    matrix: HinesMatrix,
    mechanisms: Vec<MechanismPtr>,
    revpot_mechanisms: Vec<MechanismPtr>,
    mech_slot_by_name: BTreeMap<String, (u32, usize)>,
    target_handles: Vec<TargetHandle>,
    target_divs: Vec<usize>,
    watcher: ThresholdWatcher,
    detector_meta: Vec<CellMember>,
    events: EventStreams,
    probes: Vec<ResolvedProbe>,
    gj_mechs: Vec<GjMechInfo>,
    /// This group's sites as `(site id, local CV)`, in site-id order.
    local_sites: Vec<(usize, usize)>,
    tmin: f64,
    post_events: bool,
    check_voltage_mv: Option<f64>,
}

/// Per-group snapshot: shared-state arrays, mechanism state vectors by
/// mechanism id, watcher flags and crossings, pending events and the current
/// time. Configuration is rebuilt from the recipe on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub tmin: f64,
    pub state: SharedState,
    pub watcher: ThresholdWatcher,
    pub mech_state: Vec<(u32, Vec<(String, Vec<f64>)>)>,
    pub pending_events: Vec<DeliverableEvent>,
    pub config_digest: [u8; 32],
}

/// First construction phase: cells fetched and discretized, before the
/// cross-rank gap-junction site gather completes the group.
pub struct GroupBuilder {
    group_index: usize,
    gids: Vec<CellGid>,
    cells: Vec<CableCell>,
    gprop: CableCellGlobalProperties,
    n_intdom: usize,
    cell_to_intdom: Vec<usize>,
    d: CvDiscretization,
}

impl GroupBuilder {
    pub fn new(
        recipe: &dyn Recipe,
        group_index: usize,
        gids: Vec<CellGid>,
    ) -> Result<Self, CellGroupError> {
        let gprop = recipe.global_properties();
        check_global_properties(&gprop)?;

        let mut cells = Vec::with_capacity(gids.len());
        for &gid in &gids {
            if recipe.cell_kind(gid) != CellKind::Cable {
                return Err(CellGroupError::NotACableCell(gid));
            }
            let cell = recipe.cell_description(gid);
            if let Some(n) = recipe.num_sources(gid) {
                if n != cell.num_detectors() {
                    return Err(CellGroupError::RecipeViolation {
                        gid,
                        what: "sources",
                        reported: n,
                        actual: cell.num_detectors(),
                    });
                }
            }
            if let Some(n) = recipe.num_targets(gid) {
                if n != cell.num_synapses() {
                    return Err(CellGroupError::RecipeViolation {
                        gid,
                        what: "targets",
                        reported: n,
                        actual: cell.num_synapses(),
                    });
                }
            }
            cells.push(cell);
        }

        let (n_intdom, cell_to_intdom) = compute_intdoms(recipe, &gids);
        let d = discretize_cells(&cells, &gprop);

        Ok(GroupBuilder {
            group_index,
            gids,
            cells,
            gprop,
            n_intdom,
            cell_to_intdom,
            d,
        })
    }

    pub fn gids(&self) -> &[CellGid] {
        &self.gids
    }

    pub fn gj_sites(&self) -> Vec<(GjSite, String)> {
        local_gj_sites(&self.gids, &self.cells, &self.d, self.group_index)
    }

    /// Labelled detector ranges `(gid, label, begin, end)` for source
    /// resolution.
    pub fn source_label_records(&self) -> Vec<(CellGid, String, u32, u32)> {
        self.label_records(|cell| cell.detector_ranges())
    }

    /// Labelled synapse ranges for target resolution.
    pub fn target_label_records(&self) -> Vec<(CellGid, String, u32, u32)> {
        self.label_records(|cell| cell.synapse_ranges())
    }

    fn label_records(
        &self,
        ranges: impl Fn(&CableCell) -> &[(String, cable_cell::LidRange)],
    ) -> Vec<(CellGid, String, u32, u32)> {
        let mut out = Vec::new();
        for (&gid, cell) in self.gids.iter().zip(&self.cells) {
            for (label, range) in ranges(cell) {
                out.push((gid, label.clone(), range.begin, range.end));
            }
        }
        out
    }

    pub fn build(
        self,
        recipe: &dyn Recipe,
        catalogue: &MechanismCatalogue,
        gj_sites: &[GjSite],
        gj_conns: &BTreeMap<CellGid, Vec<GroupGjConnection>>,
    ) -> Result<CellGroup, CellGroupError> {
        let GroupBuilder {
            group_index,
            gids,
            cells,
            gprop,
            n_intdom,
            cell_to_intdom,
            d,
        } = self;
        let n_cv = d.size();

        let cv_to_intdom: Vec<usize> = d
            .geometry
            .cv_to_cell
            .iter()
            .map(|&c| cell_to_intdom[c])
            .collect();

        let matrix = HinesMatrix::new(
            d.geometry.cv_parent.clone(),
            d.geometry.cell_cv_divs.clone(),
            d.cv_capacitance.clone(),
            d.face_conductance.clone(),
            d.cv_area.clone(),
        );

        // Resolve this group's gap-junction connections against the global
        // site table.
        let mut per_cell_gj: Vec<Vec<ResolvedGapJunction>> = vec![Vec::new(); gids.len()];
        for (cell_idx, &gid) in gids.iter().enumerate() {
            let Some(conns) = gj_conns.get(&gid) else {
                continue;
            };
            let mut resolved = Vec::with_capacity(conns.len());
            for conn in conns {
                let local_cv = gj_sites
                    .iter()
                    .find(|s| s.gid == gid && s.lid == conn.local_lid && s.group == group_index)
                    .map(|s| s.cv)
                    .ok_or(CellGroupError::BadGapJunctionEndpoint {
                        gid,
                        lid: conn.local_lid,
                    })?;
                resolved.push(ResolvedGapJunction {
                    local_lid: conn.local_lid,
                    local_cv,
                    peer_cv: conn.peer_site,
                    weight: conn.weight,
                });
            }
            resolved.sort_by_key(|c| c.local_cv);
            per_cell_gj[cell_idx] = resolved;
        }

        let mut mech_data = MechanismData::default();
        for (cell_idx, cell) in cells.iter().enumerate() {
            let cell_data = build_mechanism_data(
                &gprop,
                catalogue,
                cell,
                &per_cell_gj[cell_idx],
                &d,
                cell_idx,
            )?;
            append_mechanism_data(&mut mech_data, &cell_data);
        }

        // Detector bookkeeping for post-event mechanisms.
        let post_events = mech_data.post_events;
        let max_detector = if post_events {
            cells.iter().map(|c| c.num_detectors()).max().unwrap_or(0)
        } else {
            0
        };
        let mut src_to_spike = Vec::new();
        if post_events {
            for (cell_idx, cell) in cells.iter().enumerate() {
                for lid in 0..cell.num_detectors() {
                    src_to_spike.push(cell_idx * max_detector + lid);
                }
            }
        }

        let mut state = SharedState::new(
            n_intdom,
            gids.len(),
            max_detector,
            d.geometry.cv_to_cell.clone(),
            cv_to_intdom.clone(),
            cell_to_intdom.clone(),
            d.init_membrane_potential.clone(),
            d.temperature_k.clone(),
            d.diam_um.clone(),
            src_to_spike,
        );

        for (ion, config) in &mech_data.ions {
            let charge = gprop
                .ion_species
                .get(ion)
                .ok_or_else(|| CellGroupError::UnknownIon(ion.clone()))?;
            state.add_ion(ion, *charge, config);
        }
        if !mech_data.stimuli.cv.is_empty() {
            state.configure_stimulus(&mech_data.stimuli);
        }

        // Instantiate mechanisms; weights are F·α converting mechanism
        // contribution units to A/m².
        let mut mechanisms = Vec::new();
        let mut revpot_mechanisms = Vec::new();
        let mut mech_slot_by_name = BTreeMap::new();
        let mut target_handles = vec![
            TargetHandle {
                mech_id: 0,
                mech_index: 0
            };
            mech_data.n_target
        ];
        let mut gj_mechs = Vec::new();

        let mut mech_id = 0u32;
        for (name, config) in &mech_data.mechanisms {
            let info = catalogue
                .info(name)
                .map_err(|e| LayoutError::UnknownMechanism(e.0))?;
            let width = config.width();
            let mut layout = MechanismLayout {
                cv: config.cv.clone(),
                peer_cv: config.peer_cv.clone(),
                weight: vec![0.0; width],
                multiplicity: config.multiplicity.clone(),
                param_values: config.param_values.clone(),
                ion_index: BTreeMap::new(),
            };

            match config.kind {
                Some(MechanismKind::Point) => {
                    // Point contributions are nA; F = 1000/A.
                    let mut target_cursor = 0usize;
                    for i in 0..width {
                        let cv = config.cv[i];
                        layout.weight[i] = 1000.0 / d.cv_area[cv];
                        let handle = TargetHandle {
                            mech_id,
                            mech_index: i as u32,
                        };
                        let copies = if config.multiplicity.is_empty() {
                            1
                        } else {
                            config.multiplicity[i] as usize
                        };
                        for _ in 0..copies {
                            target_handles[config.target[target_cursor]] = handle;
                            target_cursor += 1;
                        }
                    }
                }
                Some(MechanismKind::GapJunction) => {
                    for i in 0..width {
                        let cv = config.cv[i];
                        layout.weight[i] = config.local_weight[i] * 1000.0 / d.cv_area[cv];
                    }
                }
                Some(MechanismKind::Density) => {
                    layout.weight.copy_from_slice(&config.norm_area);
                }
                Some(MechanismKind::ReversalPotential) | None => {}
            }

            for ion in info.ions.keys() {
                let ion_state = state
                    .ion_data
                    .get(ion)
                    .ok_or_else(|| CellGroupError::UnknownIon(ion.clone()))?;
                let index = config
                    .cv
                    .iter()
                    .map(|cv| {
                        ion_state
                            .cv
                            .binary_search(cv)
                            .expect("mechanism CV is in ion support")
                    })
                    .collect();
                layout.ion_index.insert(ion.clone(), index);
            }

            let instance = catalogue
                .instance(name, mech_id, layout)
                .map_err(|e| LayoutError::UnknownMechanism(e.0))?;

            if config.kind == Some(MechanismKind::ReversalPotential) {
                mech_slot_by_name.insert(name.clone(), (mech_id, revpot_mechanisms.len()));
                revpot_mechanisms.push(instance);
            } else {
                if config.kind == Some(MechanismKind::GapJunction) {
                    let peer_local_cv = config
                        .peer_cv
                        .iter()
                        .map(|&site| {
                            (gj_sites[site].group == group_index).then(|| gj_sites[site].cv)
                        })
                        .collect();
                    gj_mechs.push(GjMechInfo {
                        slot: mechanisms.len(),
                        peer_sites: config.peer_cv.clone(),
                        peer_local_cv,
                    });
                }
                mech_slot_by_name.insert(name.clone(), (mech_id, mechanisms.len()));
                mechanisms.push(instance);
            }
            mech_id += 1;
        }

        // Detectors and probes.
        let mut detector_cv = Vec::new();
        let mut detector_intdom = Vec::new();
        let mut detector_threshold = Vec::new();
        let mut detector_meta = Vec::new();
        for (cell_idx, (&gid, cell)) in gids.iter().zip(&cells).enumerate() {
            for det in cell.detectors() {
                detector_cv.push(d.geometry.location_cv(cell_idx, det.loc, CvPrefer::Empty));
                detector_intdom.push(cell_to_intdom[cell_idx]);
                detector_threshold.push(det.item.threshold_mv);
                detector_meta.push(CellMember { gid, lid: det.lid });
            }
        }
        let watcher = ThresholdWatcher::new(detector_cv, detector_intdom, detector_threshold);

        let mut probes = Vec::new();
        for (cell_idx, (&gid, cell)) in gids.iter().zip(&cells).enumerate() {
            for (probe_idx, addr) in recipe.probes(gid).iter().enumerate() {
                let resolved = probes::resolve_probe(
                    addr,
                    cell,
                    cell_idx,
                    &d,
                    &mech_data,
                    &target_handles,
                    &mech_slot_by_name,
                    CellMember {
                        gid,
                        lid: CellLid(probe_idx as u32),
                    },
                )?;
                probes.extend(resolved);
            }
        }

        let local_sites: Vec<(usize, usize)> = gj_sites
            .iter()
            .enumerate()
            .filter(|(_, s)| s.group == group_index)
            .map(|(i, s)| (i, s.cv))
            .collect();

        let mut group = CellGroup {
            group_index,
            gids,
            d,
            state,
            matrix,
            mechanisms,
            revpot_mechanisms,
            mech_slot_by_name,
            target_handles,
            target_divs: mech_data.target_divs.clone(),
            watcher,
            detector_meta,
            events: EventStreams::default(),
            probes,
            gj_mechs,
            local_sites,
            tmin: 0.0,
            post_events,
            check_voltage_mv: gprop.membrane_voltage_limit_mv,
        };
        assert_eq!(group.state.n_cv(), n_cv);
        group.reset();
        Ok(group)
    }
}

impl CellGroup {
    /// Builds a group in one step; suits single-rank construction where no
    /// cross-rank site gather is needed.
    pub fn new(
        recipe: &dyn Recipe,
        catalogue: &MechanismCatalogue,
        group_index: usize,
        gids: Vec<CellGid>,
        gj_sites: &[GjSite],
        gj_conns: &BTreeMap<CellGid, Vec<GroupGjConnection>>,
    ) -> Result<Self, CellGroupError> {
        GroupBuilder::new(recipe, group_index, gids)?.build(recipe, catalogue, gj_sites, gj_conns)
    }

    pub fn group_index(&self) -> usize {
        self.group_index
    }

    pub fn gids(&self) -> &[CellGid] {
        &self.gids
    }

    pub fn discretization(&self) -> &CvDiscretization {
        &self.d
    }

    pub fn num_probes(&self) -> usize {
        self.probes.len()
    }

    pub fn probe_ids(&self) -> Vec<CellMember> {
        self.probes.iter().map(|p| p.id).collect()
    }

    pub fn time(&self) -> f64 {
        self.tmin
    }

    pub fn local_sites(&self) -> &[(usize, usize)] {
        &self.local_sites
    }

    /// Overrides the non-physical voltage check; `None` disables it.
    pub fn set_voltage_bound(&mut self, bound_mv: Option<f64>) {
        self.check_voltage_mv = bound_mv;
    }

    pub fn has_remote_peers(&self) -> bool {
        self.gj_mechs
            .iter()
            .any(|gj| gj.peer_local_cv.iter().any(|cv| cv.is_none()))
    }

    /// Group-relative target handle for a cell-local target lid.
    pub fn target_handle(&self, cell_idx: usize, lid: CellLid) -> TargetHandle {
        self.target_handles[self.target_divs[cell_idx] + lid.0 as usize]
    }

    pub fn cell_index(&self, gid: CellGid) -> Option<usize> {
        self.gids.iter().position(|&g| g == gid)
    }

    pub fn reset(&mut self) {
        self.state.reset();
        self.tmin = 0.0;

        let mut view = self.state.shared_view();
        for m in &mut self.revpot_mechanisms {
            m.init(&mut view);
        }
        for m in &mut self.mechanisms {
            m.init(&mut view);
        }
        drop(view);

        self.state.ions_init_concentration();
        let mut view = self.state.shared_view();
        for m in &mut self.mechanisms {
            m.update_ions(&mut view);
        }
        drop(view);

        self.state.zero_currents();

        // Mechanisms are initialized again after the ion state settles, as
        // they may read the ion state within init.
        let mut view = self.state.shared_view();
        for m in &mut self.revpot_mechanisms {
            m.init(&mut view);
        }
        for m in &mut self.mechanisms {
            m.init(&mut view);
        }
        drop(view);

        self.watcher.reset(&self.state.voltage);
        self.events = EventStreams::default();
    }

    pub fn config_digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"CABLE:GROUP:CFG");
        hasher.update(&(self.group_index as u64).to_le_bytes());
        hasher.update(&(self.state.n_cv() as u64).to_le_bytes());
        for gid in &self.gids {
            hasher.update(&gid.0.to_le_bytes());
        }
        for (name, (mech_id, _)) in &self.mech_slot_by_name {
            hasher.update(name.as_bytes());
            hasher.update(&mech_id.to_le_bytes());
        }
        for h in &self.target_handles {
            hasher.update(&h.mech_id.to_le_bytes());
            hasher.update(&h.mech_index.to_le_bytes());
        }
        *hasher.finalize().as_bytes()
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        let mut mech_state = Vec::new();
        for m in self.mechanisms.iter().chain(&self.revpot_mechanisms) {
            mech_state.push((m.mechanism_id(), m.export_state()));
        }
        GroupSnapshot {
            tmin: self.tmin,
            state: self.state.clone(),
            watcher: self.watcher.snapshot(),
            mech_state,
            pending_events: self.events.pending(),
            config_digest: self.config_digest(),
        }
    }

    pub fn restore(&mut self, snapshot: &GroupSnapshot) -> Result<(), CellGroupError> {
        if snapshot.config_digest != self.config_digest() {
            return Err(CellGroupError::SnapshotMismatch(
                "configuration digest differs".to_string(),
            ));
        }
        if snapshot.state.n_cv() != self.state.n_cv() {
            return Err(CellGroupError::SnapshotMismatch(
                "CV count differs".to_string(),
            ));
        }
        self.tmin = snapshot.tmin;
        self.state = snapshot.state.clone();
        self.watcher.restore(&snapshot.watcher);
        for m in self
            .mechanisms
            .iter_mut()
            .chain(self.revpot_mechanisms.iter_mut())
        {
            let id = m.mechanism_id();
            if let Some((_, state)) = snapshot.mech_state.iter().find(|(mid, _)| *mid == id) {
                m.import_state(state)
                    .map_err(CellGroupError::SnapshotMismatch)?;
            }
        }
        self.events = EventStreams::default();
        self.events.init(snapshot.pending_events.clone());
        Ok(())
    }
}

fn check_global_properties(gprop: &CableCellGlobalProperties) -> Result<(), CellGroupError> {
    let d = &gprop.default_parameters;
    if d.init_membrane_potential.is_none() {
        return Err(CellGroupError::IncompleteGlobalProperties(
            "init_membrane_potential",
        ));
    }
    if d.temperature_k.is_none() {
        return Err(CellGroupError::IncompleteGlobalProperties("temperature_k"));
    }
    if d.axial_resistivity.is_none() {
        return Err(CellGroupError::IncompleteGlobalProperties(
            "axial_resistivity",
        ));
    }
    if d.membrane_capacitance.is_none() {
        return Err(CellGroupError::IncompleteGlobalProperties(
            "membrane_capacitance",
        ));
    }
    Ok(())
}

impl std::fmt::Debug for CellGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellGroup")
            .field("group_index", &self.group_index)
            .field("n_cell", &self.gids.len())
            .field("n_cv", &self.state.n_cv())
            .field("n_mechanism", &self.mechanisms.len())
            .finish()
    }
}
