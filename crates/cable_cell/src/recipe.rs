//! Cell-oriented lazy description of the whole simulation, queried during
//! initialization so that model building can be distributed.

use cable_core::{CellGid, CellKind};
use cable_events::EventGenerator;
use cable_morphology::Mlocation;

use crate::{CableCell, CableCellGlobalProperties};

/// Connection endpoint addressed by a cell-local placement label.
#[derive(Debug, Clone, PartialEq)]
pub struct CellConnection {
    pub source_gid: CellGid,
    pub source_label: String,
    pub target_label: String,
    pub weight: f32,
    pub delay: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GapJunctionConnection {
    pub peer_gid: CellGid,
    pub peer_label: String,
    pub local_label: String,
    /// Junction conductance weight [µS].
    pub weight: f64,
}

/// Probe addresses understood by cable cells. Scalar variants sample one
/// value; `*Cell` variants sample across the whole cell with metadata.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeAddress {
    MembraneVoltage(Mlocation),
    MembraneVoltageCell,
    AxialCurrent(Mlocation),
    TotalIonCurrentDensity(Mlocation),
    TotalIonCurrentCell,
    TotalCurrentCell,
    StimulusCurrentCell,
    DensityState {
        mechanism: String,
        state: String,
        location: Mlocation,
    },
    DensityStateCell {
        mechanism: String,
        state: String,
    },
    PointState {
        target: u32,
        mechanism: String,
        state: String,
    },
    PointStateCell {
        mechanism: String,
        state: String,
    },
    IonCurrentDensity {
        ion: String,
        location: Mlocation,
    },
    IonCurrentCell {
        ion: String,
    },
    IonIntConcentration {
        ion: String,
        location: Mlocation,
    },
    IonIntConcentrationCell {
        ion: String,
    },
    IonExtConcentration {
        ion: String,
        location: Mlocation,
    },
    IonExtConcentrationCell {
        ion: String,
    },
}

pub trait Recipe: Send + Sync {
    fn num_cells(&self) -> usize;

    fn cell_kind(&self, gid: CellGid) -> CellKind;

    fn cell_description(&self, gid: CellGid) -> CableCell;

    fn connections_on(&self, _gid: CellGid) -> Vec<CellConnection> {
        Vec::new()
    }

    fn gap_junctions_on(&self, _gid: CellGid) -> Vec<GapJunctionConnection> {
        Vec::new()
    }

    fn probes(&self, _gid: CellGid) -> Vec<ProbeAddress> {
        Vec::new()
    }

    fn event_generators(&self, _gid: CellGid) -> Vec<EventGenerator> {
        Vec::new()
    }

    /// Detector count the recipe believes the cell has; checked against the
    /// built cell when given.
    fn num_sources(&self, _gid: CellGid) -> Option<usize> {
        None
    }

    /// Synapse count the recipe believes the cell has; checked against the
    /// built cell when given.
    fn num_targets(&self, _gid: CellGid) -> Option<usize> {
        None
    }

    fn global_properties(&self) -> CableCellGlobalProperties {
        CableCellGlobalProperties::default()
    }
}
