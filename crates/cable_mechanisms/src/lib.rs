#![forbid(unsafe_code)]

//! Mechanism ABI and the built-in catalogue.
//!
//! Mechanisms expose the fixed capability set `{init, update_current,
//! update_state, update_ions, deliver_events, post_event, data_alignment,
//! mechanism_id}` and operate on non-owning views of the shared cell state
//! for the duration of a step.

pub mod kernels;

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MechanismKind {
    Density,
    Point,
    GapJunction,
    ReversalPotential,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamSpec {
    pub default: f64,
    pub min: f64,
    pub max: f64,
}

impl ParamSpec {
    pub fn new(default: f64, min: f64, max: f64) -> Self {
        Self { default, min, max }
    }

    pub fn positive(default: f64) -> Self {
        Self::new(default, 0.0, f64::INFINITY)
    }

    pub fn any(default: f64) -> Self {
        Self::new(default, f64::NEG_INFINITY, f64::INFINITY)
    }

    pub fn valid(&self, value: f64) -> bool {
        value.is_finite() && value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IonDep {
    pub write_int_concentration: bool,
    pub write_ext_concentration: bool,
    pub write_reversal_potential: bool,
    pub read_reversal_potential: bool,
    pub expected_valence: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MechanismInfo {
    pub kind: MechanismKind,
    pub parameters: BTreeMap<String, ParamSpec>,
    pub state_vars: Vec<String>,
    pub ions: BTreeMap<String, IonDep>,
    /// Point mechanisms linear in their state may be coalesced.
    pub linear: bool,
    pub post_events: bool,
}

impl MechanismInfo {
    fn new(kind: MechanismKind) -> Self {
        Self {
            kind,
            parameters: BTreeMap::new(),
            state_vars: Vec::new(),
            ions: BTreeMap::new(),
            linear: false,
            post_events: false,
        }
    }
}

/// Instance placement and parameter data handed to `instance()`.
///
/// Parameter value vectors are keyed and sorted by name; per-ion index
/// vectors map each instance to its slot in that ion's CV table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MechanismLayout {
    pub cv: Vec<usize>,
    pub peer_cv: Vec<usize>,
    pub weight: Vec<f64>,
    pub multiplicity: Vec<u32>,
    pub param_values: Vec<(String, Vec<f64>)>,
    pub ion_index: BTreeMap<String, Vec<usize>>,
}

impl MechanismLayout {
    pub fn width(&self) -> usize {
        self.cv.len()
    }

    pub fn param(&self, name: &str) -> Option<&[f64]> {
        self.param_values
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Parameter vector, falling back to the spec default where absent.
    pub fn param_or_default(&self, name: &str, spec: &ParamSpec) -> Vec<f64> {
        match self.param(name) {
            Some(v) => v.to_vec(),
            None => vec![spec.default; self.width()],
        }
    }
}

/// Mutable view of one ion's shared state, restricted to the ion's CVs.
pub struct IonView<'a> {
    pub current_density: &'a mut [f64],        // [A/m²]
    pub internal_concentration: &'a mut [f64], // [mmol/L]
    pub external_concentration: &'a mut [f64], // [mmol/L]
    pub reversal_potential: &'a mut [f64],     // [mV]
    pub valence: i32,
}

/// Non-owning view of the shared cell state for one kernel invocation.
pub struct SharedView<'a> {
    pub voltage: &'a [f64],
    pub current_density: &'a mut [f64],
    pub conductivity: &'a mut [f64],
    pub dt_cv: &'a [f64],
    pub temperature: &'a [f64],
    pub diam_um: &'a [f64],
    pub cv_to_cell: &'a [usize],
    /// Per `cell × max_detector` time since the detector's last crossing in
    /// the current step, negative when it has not fired.
    pub time_since_spike: &'a [f64],
    pub n_detector: usize,
    pub ions: BTreeMap<&'a str, IonView<'a>>,
}

pub trait Mechanism: Send {
    fn name(&self) -> &str;
    fn kind(&self) -> MechanismKind;
    fn mechanism_id(&self) -> u32;
    fn width(&self) -> usize;
    fn node_index(&self) -> &[usize];

    fn peer_index(&self) -> &[usize] {
        &[]
    }

    /// Peer-voltage buffer filled by the integrator before `update_current`;
    /// only junction mechanisms expose one.
    fn peer_voltage_buffer(&mut self) -> Option<&mut Vec<f64>> {
        None
    }

    fn data_alignment(&self) -> usize {
        1
    }

    fn init(&mut self, shared: &mut SharedView);
    fn update_current(&mut self, shared: &mut SharedView);
    fn update_state(&mut self, shared: &mut SharedView);

    fn update_ions(&mut self, _shared: &mut SharedView) {}

    /// Applies marked `(mech_index, weight)` events in order.
    fn deliver_events(&mut self, _events: &[(u32, f64)]) {}

    fn post_event(&mut self, _shared: &SharedView) {}

    fn state_view(&self, _var: &str) -> Option<&[f64]> {
        None
    }

    fn export_state(&self) -> Vec<(String, Vec<f64>)> {
        Vec::new()
    }

    fn import_state(&mut self, state: &[(String, Vec<f64>)]) -> Result<(), String> {
        if state.is_empty() {
            Ok(())
        } else {
            Err(format!("mechanism {} holds no state", self.name()))
        }
    }
}

pub type MechanismPtr = Box<dyn Mechanism>;

type Ctor = fn(u32, MechanismLayout) -> MechanismPtr;

pub struct MechanismCatalogue {
    entries: BTreeMap<String, (MechanismInfo, Ctor)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownMechanism(pub String);

impl MechanismCatalogue {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, info: MechanismInfo, ctor: Ctor) {
        self.entries.insert(name.to_string(), (info, ctor));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn info(&self, name: &str) -> Result<&MechanismInfo, UnknownMechanism> {
        self.entries
            .get(name)
            .map(|(info, _)| info)
            .ok_or_else(|| UnknownMechanism(name.to_string()))
    }

    pub fn instance(
        &self,
        name: &str,
        mech_id: u32,
        layout: MechanismLayout,
    ) -> Result<MechanismPtr, UnknownMechanism> {
        let (_, ctor) = self
            .entries
            .get(name)
            .ok_or_else(|| UnknownMechanism(name.to_string()))?;
        Ok(ctor(mech_id, layout))
    }
}

impl Default for MechanismCatalogue {
    fn default() -> Self {
        default_catalogue()
    }
}

/// The built-in catalogue: `pas`, `hh`, `expsyn`, `expsyn_stdp`, `gj` and
/// `nernst/<ion>` reversal-potential mechanisms for na, k and ca.
pub fn default_catalogue() -> MechanismCatalogue {
    let mut cat = MechanismCatalogue::empty();

    let mut pas = MechanismInfo::new(MechanismKind::Density);
    pas.parameters
        .insert("g".to_string(), ParamSpec::positive(0.001)); // [S/cm²]
    pas.parameters.insert("e".to_string(), ParamSpec::any(-70.0)); // [mV]
    cat.register("pas", pas, kernels::pas::Pas::boxed);

    let mut hh = MechanismInfo::new(MechanismKind::Density);
    hh.parameters
        .insert("gnabar".to_string(), ParamSpec::positive(0.12));
    hh.parameters
        .insert("gkbar".to_string(), ParamSpec::positive(0.036));
    hh.parameters
        .insert("gl".to_string(), ParamSpec::positive(0.0003));
    hh.parameters.insert("el".to_string(), ParamSpec::any(-54.3));
    hh.state_vars = vec!["m".to_string(), "h".to_string(), "n".to_string()];
    hh.ions.insert(
        "na".to_string(),
        IonDep {
            read_reversal_potential: true,
            expected_valence: Some(1),
            ..Default::default()
        },
    );
    hh.ions.insert(
        "k".to_string(),
        IonDep {
            read_reversal_potential: true,
            expected_valence: Some(1),
            ..Default::default()
        },
    );
    cat.register("hh", hh, kernels::hh::Hh::boxed);

    let mut expsyn = MechanismInfo::new(MechanismKind::Point);
    expsyn
        .parameters
        .insert("tau".to_string(), ParamSpec::new(2.0, 1e-9, f64::INFINITY));
    expsyn.parameters.insert("e".to_string(), ParamSpec::any(0.0));
    expsyn.state_vars = vec!["g".to_string()];
    expsyn.linear = true;
    cat.register("expsyn", expsyn, kernels::expsyn::ExpSyn::boxed);

    let mut stdp = MechanismInfo::new(MechanismKind::Point);
    stdp.parameters
        .insert("tau".to_string(), ParamSpec::new(2.0, 1e-9, f64::INFINITY));
    stdp.parameters
        .insert("taupre".to_string(), ParamSpec::new(10.0, 1e-9, f64::INFINITY));
    stdp.parameters.insert(
        "taupost".to_string(),
        ParamSpec::new(10.0, 1e-9, f64::INFINITY),
    );
    stdp.parameters
        .insert("A_pre".to_string(), ParamSpec::any(0.01));
    stdp.parameters
        .insert("A_post".to_string(), ParamSpec::any(-0.01));
    stdp.parameters.insert("e".to_string(), ParamSpec::any(0.0));
    stdp.parameters
        .insert("max_weight".to_string(), ParamSpec::positive(10.0));
    stdp.state_vars = vec![
        "g".to_string(),
        "apre".to_string(),
        "apost".to_string(),
        "weight_plastic".to_string(),
    ];
    stdp.post_events = true;
    cat.register("expsyn_stdp", stdp, kernels::expsyn_stdp::ExpSynStdp::boxed);

    let mut gj = MechanismInfo::new(MechanismKind::GapJunction);
    gj.parameters.insert("g".to_string(), ParamSpec::positive(1.0));
    cat.register("gj", gj, kernels::gj::Gj::boxed);

    for ion in ["na", "k", "ca"] {
        let mut nernst = MechanismInfo::new(MechanismKind::ReversalPotential);
        nernst.ions.insert(
            ion.to_string(),
            IonDep {
                write_reversal_potential: true,
                ..Default::default()
            },
        );
        cat.register(
            &format!("nernst/{ion}"),
            nernst,
            kernels::nernst::Nernst::boxed,
        );
    }

    cat
}
