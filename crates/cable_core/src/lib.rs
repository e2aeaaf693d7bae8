#![forbid(unsafe_code)]

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct CellGid(pub u32);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct CellLid(pub u32);

/// A detector, synapse or junction site addressed by cell and local index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct CellMember {
    pub gid: CellGid,
    pub lid: CellLid,
}

impl CellMember {
    pub fn new(gid: u32, lid: u32) -> Self {
        Self {
            gid: CellGid(gid),
            lid: CellLid(lid),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellKind {
    Cable,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spike {
    pub source: CellMember,
    pub time: f64,
}

impl Spike {
    pub fn new(source: CellMember, time: f64) -> Self {
        Self { source, time }
    }
}

impl Eq for Spike {}

impl Ord for Spike {
    fn cmp(&self, other: &Self) -> Ordering {
        self.source
            .cmp(&other.source)
            .then_with(|| self.time.total_cmp(&other.time))
    }
}

impl PartialOrd for Spike {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An event staged for delivery to a cell-local target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpikeEvent {
    pub target: CellLid,
    pub time: f64,
    pub weight: f32,
}

impl Eq for SpikeEvent {}

impl Ord for SpikeEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .total_cmp(&other.time)
            .then_with(|| self.target.cmp(&other.target))
            .then_with(|| self.weight.total_cmp(&other.weight))
    }
}

impl PartialOrd for SpikeEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Simulated interval over which spikes are gathered exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Epoch {
    pub id: u64,
    pub t0: f64,
    pub t1: f64,
}

impl Epoch {
    pub fn new(id: u64, t0: f64, t1: f64) -> Self {
        Self { id, t0, t1 }
    }

    pub fn advance_to(&mut self, t_next: f64) {
        self.id += 1;
        self.t0 = self.t1;
        self.t1 = t_next;
    }

    pub fn is_empty(&self) -> bool {
        self.t1 <= self.t0
    }
}

/// Assignment of cells to the cell groups owned by one rank.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupPartition {
    pub groups: Vec<Vec<CellGid>>,
}

impl GroupPartition {
    pub fn num_cells(&self) -> usize {
        self.groups.iter().map(|g| g.len()).sum()
    }

    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for (idx, group) in self.groups.iter().enumerate() {
            if group.is_empty() {
                return Err(format!("cell group {idx} is empty"));
            }
            for gid in group {
                if !seen.insert(*gid) {
                    return Err(format!("cell {} assigned to more than one group", gid.0));
                }
            }
        }
        Ok(())
    }
}

pub mod units {
    //! Unit conventions shared across the workspace.
    //!
    //! Time ms, voltage mV, conductance µS, point current nA, current density
    //! A/m², area µm², per-CV capacitance pF, axial resistivity Ω·cm,
    //! temperature K, concentration mmol/L.

    /// Scales `∫ρ·dℓ/(πr²)` in Ω·cm/µm to a face conductance in µS.
    pub const FACE_CONDUCTANCE_SCALE: f64 = 100.0;

    /// Converts nA on a CV of area A [µm²] to A/m²: multiply by `1000/A`.
    pub const POINT_CURRENT_TO_DENSITY: f64 = 1000.0;

    /// Shared scale applied to C/Δt, σ·A and i·A terms in matrix assembly so
    /// the system is consistently in µS / nA / mV.
    pub const ASSEMBLY_SCALE: f64 = 1e-3;

    /// NMODL-convention densities (mA/cm², S/cm²) to A/m², kS/m².
    pub const NMODL_TO_SI: f64 = 10.0;

    /// Gas constant R in mJ/(K·mol).
    pub const GAS_CONSTANT: f64 = 8314.462_618;

    /// Faraday constant in C/mol.
    pub const FARADAY: f64 = 96_485.332_12;
}
