#![forbid(unsafe_code)]

//! Finite-volume discretization: partitioning a cell morphology into control
//! volumes and computing the per-CV electrical coefficients.

pub mod discretize;
pub mod interpolate;

use cable_cell::{CableCell, CvPolicy};
use cable_morphology::{Mcable, Mlocation, Morphology, MNPOS};

pub use discretize::{discretize, discretize_cells, CvDiscretization};
pub use interpolate::{axial_current_interpolant, voltage_interpolant, VoltageInterpolant};

/// Resolution of a location that falls exactly on a CV boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvPrefer {
    Distal,
    Proximal,
    Nonempty,
    Empty,
}

/// Per-branch piecewise map from branch position to CV index; elements may
/// have zero extent (trivial CVs at fork points).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PwMap {
    extents: Vec<(f64, f64)>,
    values: Vec<usize>,
}

impl PwMap {
    pub fn push(&mut self, lo: f64, hi: f64, value: usize) {
        if let Some(&(_, prev_hi)) = self.extents.last() {
            assert!(lo >= prev_hi, "branch map elements must be ordered");
        }
        self.extents.push((lo, hi));
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn extent(&self, i: usize) -> (f64, f64) {
        self.extents[i]
    }

    pub fn value(&self, i: usize) -> usize {
        self.values[i]
    }

    /// Right-most element whose extent starts at or before `pos`.
    pub fn index_of(&self, pos: f64) -> usize {
        let mut i = 0;
        for (j, &(lo, _)) in self.extents.iter().enumerate() {
            if lo <= pos {
                i = j;
            } else {
                break;
            }
        }
        i
    }

    fn zero_extent(&self, i: usize) -> bool {
        let (lo, hi) = self.extents[i];
        lo == hi
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CvGeometry {
    /// Cables of all CVs, partitioned by `cv_cables_divs`.
    pub cv_cables: Vec<Mcable>,
    pub cv_cables_divs: Vec<usize>,
    /// Parent CV index, `MNPOS` for a root CV.
    pub cv_parent: Vec<usize>,
    pub cv_children: Vec<usize>,
    pub cv_children_divs: Vec<usize>,
    pub cv_to_cell: Vec<usize>,
    pub cell_cv_divs: Vec<usize>,
    /// Per cell, per branch location map.
    pub branch_cv_map: Vec<Vec<PwMap>>,
}

impl CvGeometry {
    pub fn size(&self) -> usize {
        self.cv_parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cv_parent.is_empty()
    }

    pub fn n_cell(&self) -> usize {
        self.cell_cv_divs.len().saturating_sub(1)
    }

    pub fn n_branch(&self, cell_idx: usize) -> usize {
        self.branch_cv_map[cell_idx].len()
    }

    pub fn cables(&self, cv: usize) -> &[Mcable] {
        &self.cv_cables[self.cv_cables_divs[cv]..self.cv_cables_divs[cv + 1]]
    }

    pub fn children(&self, cv: usize) -> &[usize] {
        &self.cv_children[self.cv_children_divs[cv]..self.cv_children_divs[cv + 1]]
    }

    pub fn cell_cvs(&self, cell_idx: usize) -> std::ops::Range<usize> {
        self.cell_cv_divs[cell_idx]..self.cell_cv_divs[cell_idx + 1]
    }

    /// CV containing `loc`, disambiguated by `prefer` at boundaries.
    pub fn location_cv(&self, cell_idx: usize, loc: Mlocation, prefer: CvPrefer) -> usize {
        let bmap = &self.branch_cv_map[cell_idx][loc.branch];
        let i_max = bmap.len() - 1;
        let mut i = bmap.index_of(loc.pos);
        let cv_prox = bmap.extent(i).0;

        match prefer {
            CvPrefer::Distal => {}
            CvPrefer::Proximal => {
                if loc.pos == cv_prox && i > 0 {
                    i -= 1;
                }
            }
            CvPrefer::Nonempty => {
                if bmap.zero_extent(i) {
                    if i > 0 && !bmap.zero_extent(i - 1) {
                        i -= 1;
                    } else if i < i_max && !bmap.zero_extent(i + 1) {
                        i += 1;
                    }
                }
            }
            CvPrefer::Empty => {
                if loc.pos == cv_prox && i > 0 && bmap.zero_extent(i - 1) {
                    i -= 1;
                }
            }
        }

        self.cell_cv_divs[cell_idx] + bmap.value(i)
    }

    /// Builds the single-cell geometry from the cell's discretization policy.
    pub fn new(cell: &CableCell, policy: &CvPolicy) -> Self {
        let morph = cell.morphology();
        let boundaries = cv_boundary_points(cell, policy);
        let builder = CvBuilder::build(morph, &boundaries, policy.interior_forks());

        let n_cv = builder.cv_cables.len();
        let mut geom = CvGeometry {
            cv_cables: Vec::new(),
            cv_cables_divs: vec![0],
            cv_parent: builder.cv_parent,
            cv_children: Vec::new(),
            cv_children_divs: vec![0],
            cv_to_cell: vec![0; n_cv],
            cell_cv_divs: vec![0, n_cv],
            branch_cv_map: Vec::new(),
        };

        for cables in &builder.cv_cables {
            geom.cv_cables.extend_from_slice(cables);
            geom.cv_cables_divs.push(geom.cv_cables.len());
        }

        let mut children = vec![Vec::new(); n_cv];
        for (cv, &p) in geom.cv_parent.iter().enumerate() {
            if p != MNPOS {
                children[p].push(cv);
            }
        }
        for ch in children {
            geom.cv_children.extend_from_slice(&ch);
            geom.cv_children_divs.push(geom.cv_children.len());
        }

        // Ordering of CVs ensures CV cables on any given branch are found
        // sequentially.
        let mut bmap = vec![PwMap::default(); morph.num_branches()];
        for cv in 0..n_cv {
            for cable in geom.cables(cv) {
                bmap[cable.branch].push(cable.prox_pos, cable.dist_pos, cv);
            }
        }
        geom.branch_cv_map.push(bmap);
        geom
    }
}

/// Boundary positions per branch implied by the policy; fork and terminal
/// points are always boundaries of the per-branch interval subdivision.
pub fn cv_boundary_points(cell: &CableCell, policy: &CvPolicy) -> Vec<Vec<f64>> {
    let morph = cell.morphology();
    let em = cell.embedding();
    let n = morph.num_branches();
    let mut out = vec![Vec::new(); n];

    for b in 0..n {
        let positions = &mut out[b];
        positions.push(0.0);
        positions.push(1.0);
        match policy {
            CvPolicy::MaxExtent { max_extent_um, .. } => {
                let len = em.branch_length(b);
                if *max_extent_um > 0.0 && len > *max_extent_um {
                    let pieces = (len / max_extent_um).ceil() as usize;
                    for k in 1..pieces {
                        positions.push(k as f64 / pieces as f64);
                    }
                }
            }
            CvPolicy::FixedPerBranch { n: per, .. } => {
                for k in 1..*per {
                    positions.push(k as f64 / *per as f64);
                }
            }
            CvPolicy::Explicit { locations, .. } => {
                for loc in locations {
                    if loc.branch == b {
                        positions.push(loc.pos);
                    }
                }
            }
        }
        positions.sort_by(f64::total_cmp);
        positions.dedup();
    }
    out
}

struct CvBuilder {
    cv_cables: Vec<Vec<Mcable>>,
    cv_parent: Vec<usize>,
}

impl CvBuilder {
    fn build(morph: &Morphology, boundaries: &[Vec<f64>], interior_forks: bool) -> Self {
        // Interval cables per branch plus, without interior forks, a trivial
        // joining cable group at every fork.
        let n_branch = morph.num_branches();

        // Assign a node id to every cable; nodes are merged with union-find
        // into CVs.
        let mut cables: Vec<Mcable> = Vec::new();
        let mut branch_intervals: Vec<Vec<usize>> = vec![Vec::new(); n_branch];
        for b in 0..n_branch {
            let pos = &boundaries[b];
            for w in pos.windows(2) {
                branch_intervals[b].push(cables.len());
                cables.push(Mcable::new(b, w[0], w[1]));
            }
        }

        let mut uf = UnionFind::new(cables.len());
        // Joining cables are appended after interval cables.
        let mut join_members: Vec<(usize, Vec<usize>)> = Vec::new();

        for b in 0..n_branch {
            let kids = morph.branch_children(b);
            if kids.is_empty() {
                continue;
            }
            if interior_forks {
                let tail = *branch_intervals[b].last().expect("branch has intervals");
                for &c in kids {
                    let head = branch_intervals[c][0];
                    uf.union(tail, head);
                }
            } else {
                let mut members = vec![cables.len()];
                cables.push(Mcable::new(b, 1.0, 1.0));
                for &c in kids {
                    members.push(cables.len());
                    cables.push(Mcable::new(c, 0.0, 0.0));
                }
                join_members.push((b, members));
            }
        }
        if !interior_forks {
            uf.grow(cables.len());
            for (_, members) in &join_members {
                for w in members.windows(2) {
                    uf.union(w[0], w[1]);
                }
            }
        }

        // Group cables into components and order CVs so that every parent
        // precedes its children: sort by the depth-first rank of the first
        // cable.
        let preorder = morph.branch_preorder();
        let mut branch_rank = vec![0usize; n_branch];
        for (rank, &b) in preorder.iter().enumerate() {
            branch_rank[b] = rank;
        }

        let mut comp_cables: std::collections::BTreeMap<usize, Vec<usize>> = Default::default();
        for i in 0..cables.len() {
            comp_cables.entry(uf.find(i)).or_default().push(i);
        }

        let mut comps: Vec<Vec<usize>> = comp_cables.into_values().collect();
        for comp in &mut comps {
            comp.sort_by(|&a, &b| {
                branch_rank[cables[a].branch]
                    .cmp(&branch_rank[cables[b].branch])
                    .then(cables[a].prox_pos.total_cmp(&cables[b].prox_pos))
            });
        }
        comps.sort_by(|x, y| {
            let a = cables[x[0]];
            let b = cables[y[0]];
            branch_rank[a.branch]
                .cmp(&branch_rank[b.branch])
                .then(a.prox_pos.total_cmp(&b.prox_pos))
                .then(a.dist_pos.total_cmp(&b.dist_pos))
        });

        let mut cable_to_cv = vec![MNPOS; cables.len()];
        for (cv, comp) in comps.iter().enumerate() {
            for &i in comp {
                cable_to_cv[i] = cv;
            }
        }

        // Parent of the first interval CV on a branch is the CV holding the
        // fork point on the parent side; within a branch CVs chain linearly.
        let mut cv_parent = vec![MNPOS; comps.len()];
        let mut set_parent = |child: usize, parent: usize| {
            if child != parent && cv_parent[child] == MNPOS {
                cv_parent[child] = parent;
            }
        };

        for b in 0..n_branch {
            let ivals = &branch_intervals[b];
            for w in ivals.windows(2) {
                set_parent(cable_to_cv[w[1]], cable_to_cv[w[0]]);
            }
        }
        if !interior_forks {
            for (b, members) in &join_members {
                let join_cv = cable_to_cv[members[0]];
                let tail = *branch_intervals[*b].last().expect("branch has intervals");
                set_parent(join_cv, cable_to_cv[tail]);
                for &c in morph.branch_children(*b) {
                    let head = branch_intervals[c][0];
                    set_parent(cable_to_cv[head], join_cv);
                }
            }
        } else {
            for b in 0..n_branch {
                for &c in morph.branch_children(b) {
                    let tail = *branch_intervals[b].last().expect("branch has intervals");
                    let head = branch_intervals[c][0];
                    set_parent(cable_to_cv[head], cable_to_cv[tail]);
                }
            }
        }

        let cv_cables = comps
            .iter()
            .map(|comp| comp.iter().map(|&i| cables[i]).collect())
            .collect();

        let built = CvBuilder {
            cv_cables,
            cv_parent,
        };
        debug_assert!(built
            .cv_parent
            .iter()
            .enumerate()
            .all(|(i, &p)| p == MNPOS || p < i));
        built
    }
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn grow(&mut self, n: usize) {
        while self.parent.len() < n {
            self.parent.push(self.parent.len());
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

/// Merge CV geometry lists in place, offsetting indices; `MNPOS` parents are
/// preserved.
pub fn append_geometry(geom: &mut CvGeometry, right: &CvGeometry) {
    if right.n_cell() == 0 {
        return;
    }
    if geom.n_cell() == 0 {
        *geom = right.clone();
        return;
    }

    let cv_offset = geom.size();
    let cell_offset = geom.n_cell();

    geom.cv_cables.extend_from_slice(&right.cv_cables);
    append_divs(&mut geom.cv_cables_divs, &right.cv_cables_divs);

    append_offset(&mut geom.cv_parent, cv_offset, &right.cv_parent);
    append_offset(&mut geom.cv_children, cv_offset, &right.cv_children);
    append_divs(&mut geom.cv_children_divs, &right.cv_children_divs);

    append_offset(&mut geom.cv_to_cell, cell_offset, &right.cv_to_cell);
    append_divs(&mut geom.cell_cv_divs, &right.cell_cv_divs);

    geom.branch_cv_map.extend(right.branch_cv_map.iter().cloned());
}

pub(crate) fn append_offset(dst: &mut Vec<usize>, offset: usize, rhs: &[usize]) {
    for &x in rhs {
        dst.push(if x == MNPOS { x } else { offset + x });
    }
}

pub(crate) fn append_divs(dst: &mut Vec<usize>, rhs: &[usize]) {
    if dst.is_empty() {
        dst.extend_from_slice(rhs);
    } else if !rhs.is_empty() {
        let tail = *dst.last().expect("non-empty divs");
        for &x in &rhs[1..] {
            dst.push(tail + x);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cable_cell::{CableCell, Decor};
    use cable_morphology::{cylinder_morphology, Mpoint, Segment};

    fn cylinder_cell() -> CableCell {
        CableCell::new(cylinder_morphology(100.0, 1.0), Decor::new())
    }

    fn y_cell() -> CableCell {
        let p = |x: f64, y: f64| Mpoint::new(x, y, 0.0, 1.0);
        let segments = vec![
            Segment {
                id: 0,
                prox: p(0.0, 0.0),
                dist: p(100.0, 0.0),
                tag: 1,
            },
            Segment {
                id: 1,
                prox: p(100.0, 0.0),
                dist: p(200.0, 80.0),
                tag: 3,
            },
            Segment {
                id: 2,
                prox: p(100.0, 0.0),
                dist: p(200.0, -80.0),
                tag: 3,
            },
        ];
        let m = cable_morphology::Morphology::from_segments(segments, vec![u32::MAX, 0, 0]).unwrap();
        CableCell::new(m, Decor::new())
    }

    #[test]
    fn cylinder_fixed_two_gives_two_cvs() {
        let cell = cylinder_cell();
        let geom = CvGeometry::new(&cell, &CvPolicy::fixed_per_branch(2));
        assert_eq!(geom.size(), 2);
        assert_eq!(geom.cv_parent, vec![MNPOS, 0]);
        assert_eq!(geom.cables(0), &[Mcable::new(0, 0.0, 0.5)]);
        assert_eq!(geom.cables(1), &[Mcable::new(0, 0.5, 1.0)]);
    }

    #[test]
    fn fork_gets_trivial_joining_cv() {
        let cell = y_cell();
        let geom = CvGeometry::new(&cell, &CvPolicy::fixed_per_branch(1));
        // One CV per branch plus the trivial CV at the fork.
        assert_eq!(geom.size(), 4);
        let joining = 1;
        assert_eq!(
            geom.cables(joining),
            &[
                Mcable::new(0, 1.0, 1.0),
                Mcable::new(1, 0.0, 0.0),
                Mcable::new(2, 0.0, 0.0)
            ]
        );
        assert_eq!(geom.cv_parent[joining], 0);
        assert_eq!(geom.cv_parent[2], joining);
        assert_eq!(geom.cv_parent[3], joining);
    }

    #[test]
    fn interior_forks_span_the_fork() {
        let cell = y_cell();
        let geom = CvGeometry::new(
            &cell,
            &CvPolicy::FixedPerBranch {
                n: 2,
                interior_forks: true,
            },
        );
        // Six interval cables; the fork CV merges three of them.
        assert_eq!(geom.size(), 4);
        let fork_cv = 1;
        assert_eq!(
            geom.cables(fork_cv),
            &[
                Mcable::new(0, 0.5, 1.0),
                Mcable::new(1, 0.0, 0.5),
                Mcable::new(2, 0.0, 0.5)
            ]
        );
    }

    #[test]
    fn parent_index_is_always_lower() {
        let cell = y_cell();
        for policy in [
            CvPolicy::fixed_per_branch(3),
            CvPolicy::max_extent(40.0),
            CvPolicy::FixedPerBranch {
                n: 3,
                interior_forks: true,
            },
        ] {
            let geom = CvGeometry::new(&cell, &policy);
            for (i, &p) in geom.cv_parent.iter().enumerate() {
                assert!(p == MNPOS || p < i);
            }
        }
    }

    #[test]
    fn location_cv_prefer_policies() {
        let cell = cylinder_cell();
        let geom = CvGeometry::new(&cell, &CvPolicy::fixed_per_branch(2));
        let mid = Mlocation::new(0, 0.5);
        assert_eq!(geom.location_cv(0, mid, CvPrefer::Distal), 1);
        assert_eq!(geom.location_cv(0, mid, CvPrefer::Proximal), 0);
        assert_eq!(geom.location_cv(0, mid, CvPrefer::Nonempty), 1);
    }

    #[test]
    fn location_cv_prefers_empty_fork_cv() {
        let cell = y_cell();
        let geom = CvGeometry::new(&cell, &CvPolicy::fixed_per_branch(1));
        let fork_on_child = Mlocation::new(1, 0.0);
        // The trivial fork CV is index 1; nonempty resolution skips it.
        assert_eq!(geom.location_cv(0, fork_on_child, CvPrefer::Empty), 1);
        assert_eq!(geom.location_cv(0, fork_on_child, CvPrefer::Nonempty), 2);
    }

    #[test]
    fn append_offsets_cell_and_cv_indices() {
        let a = CvGeometry::new(&cylinder_cell(), &CvPolicy::fixed_per_branch(2));
        let b = CvGeometry::new(&cylinder_cell(), &CvPolicy::fixed_per_branch(3));
        let mut combined = a.clone();
        append_geometry(&mut combined, &b);
        assert_eq!(combined.size(), 5);
        assert_eq!(combined.n_cell(), 2);
        assert_eq!(combined.cv_parent, vec![MNPOS, 0, MNPOS, 2, 3]);
        assert_eq!(combined.cv_to_cell, vec![0, 0, 1, 1, 1]);
        assert_eq!(combined.cell_cvs(1), 2..5);
    }

    #[test]
    fn append_is_associative() {
        let g1 = CvGeometry::new(&cylinder_cell(), &CvPolicy::fixed_per_branch(1));
        let g2 = CvGeometry::new(&y_cell(), &CvPolicy::fixed_per_branch(1));
        let g3 = CvGeometry::new(&cylinder_cell(), &CvPolicy::fixed_per_branch(4));

        let mut left = g1.clone();
        append_geometry(&mut left, &g2);
        append_geometry(&mut left, &g3);

        let mut right_tail = g2.clone();
        append_geometry(&mut right_tail, &g3);
        let mut right = g1.clone();
        append_geometry(&mut right, &right_tail);

        assert_eq!(left, right);
    }
}
