#![forbid(unsafe_code)]

pub mod embedding;
pub mod expr;
pub mod pw;

use serde::{Deserialize, Serialize};

pub use embedding::Embedding;
pub use expr::{Locset, Region};
pub use pw::PwConst;

pub const MNPOS: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mpoint {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub radius: f64,
}

impl Mpoint {
    pub fn new(x: f64, y: f64, z: f64, radius: f64) -> Self {
        Self { x, y, z, radius }
    }

    pub fn distance(&self, other: &Mpoint) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: u32,
    pub prox: Mpoint,
    pub dist: Mpoint,
    pub tag: i32,
}

/// Location on a branch, `pos` in `[0, 1]` proximal to distal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mlocation {
    pub branch: usize,
    pub pos: f64,
}

impl Mlocation {
    pub fn new(branch: usize, pos: f64) -> Self {
        Self { branch, pos }
    }
}

impl Eq for Mlocation {}

impl Ord for Mlocation {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.branch
            .cmp(&other.branch)
            .then_with(|| self.pos.total_cmp(&other.pos))
    }
}

impl PartialOrd for Mlocation {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Closed cable fragment on a single branch with `prox_pos <= dist_pos`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Mcable {
    pub branch: usize,
    pub prox_pos: f64,
    pub dist_pos: f64,
}

impl Mcable {
    pub fn new(branch: usize, prox_pos: f64, dist_pos: f64) -> Self {
        assert!(prox_pos <= dist_pos, "cable must be proximal-to-distal");
        Self {
            branch,
            prox_pos,
            dist_pos,
        }
    }

    pub fn whole(branch: usize) -> Self {
        Self::new(branch, 0.0, 1.0)
    }

    pub fn is_trivial(&self) -> bool {
        self.prox_pos == self.dist_pos
    }

    pub fn contains(&self, loc: Mlocation) -> bool {
        loc.branch == self.branch && self.prox_pos <= loc.pos && loc.pos <= self.dist_pos
    }
}

impl Eq for Mcable {}

impl Ord for Mcable {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.branch
            .cmp(&other.branch)
            .then_with(|| self.prox_pos.total_cmp(&other.prox_pos))
            .then_with(|| self.dist_pos.total_cmp(&other.dist_pos))
    }
}

impl PartialOrd for Mcable {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Sorted, non-overlapping cable list.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Mextent {
    pub cables: Vec<Mcable>,
}

impl Mextent {
    pub fn from_cables(mut cables: Vec<Mcable>) -> Self {
        cables.sort();
        let mut merged: Vec<Mcable> = Vec::with_capacity(cables.len());
        for c in cables {
            match merged.last_mut() {
                Some(last) if last.branch == c.branch && c.prox_pos <= last.dist_pos => {
                    last.dist_pos = last.dist_pos.max(c.dist_pos);
                }
                _ => merged.push(c),
            }
        }
        Self { cables: merged }
    }

    pub fn is_empty(&self) -> bool {
        self.cables.is_empty()
    }

    pub fn intersects(&self, loc: Mlocation) -> bool {
        self.cables.iter().any(|c| c.contains(loc))
    }

    pub fn intersect(&self, other: &Mextent) -> Mextent {
        let mut out = Vec::new();
        for a in &self.cables {
            for b in &other.cables {
                if a.branch != b.branch {
                    continue;
                }
                let lo = a.prox_pos.max(b.prox_pos);
                let hi = a.dist_pos.min(b.dist_pos);
                if lo <= hi {
                    out.push(Mcable::new(a.branch, lo, hi));
                }
            }
        }
        Mextent::from_cables(out)
    }

    pub fn union(&self, other: &Mextent) -> Mextent {
        let mut cables = self.cables.clone();
        cables.extend_from_slice(&other.cables);
        Mextent::from_cables(cables)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MorphologyError {
    Empty,
    DuplicateSegmentId(u32),
    MissingParent { child: u32, parent: u32 },
    CyclicSegments(u32),
    MultipleRoots(u32),
}

/// Unbranched run of segments, each a conical frustum with its own proximal
/// and distal endpoints; radii may be discontinuous between segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub segments: Vec<(Mpoint, Mpoint)>,
    pub segment_ids: Vec<u32>,
    pub segment_tags: Vec<i32>,
}

impl Branch {
    /// Arclength fraction of each segment boundary along the branch;
    /// `segments.len() + 1` entries starting at 0 and ending at 1.
    pub fn point_fractions(&self) -> Vec<f64> {
        let mut offsets = Vec::with_capacity(self.segments.len() + 1);
        let mut acc = 0.0;
        offsets.push(0.0);
        for (prox, dist) in &self.segments {
            acc += prox.distance(dist);
            offsets.push(acc);
        }
        let total = acc.max(f64::MIN_POSITIVE);
        offsets.iter().map(|&s| s / total).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Morphology {
    branches: Vec<Branch>,
    branch_parent: Vec<usize>,
    branch_children: Vec<Vec<usize>>,
}

impl Morphology {
    /// Builds branches from a flat segment list. Segments with parent id
    /// `u32::MAX` attach to the root; branches split at multi-child points.
    /// Child branches are listed in segment-id order, which fixes branch
    /// numbering for a given segment list.
    pub fn from_segments(
        segments: Vec<Segment>,
        parents: Vec<u32>,
    ) -> Result<Self, MorphologyError> {
        if segments.is_empty() {
            return Err(MorphologyError::Empty);
        }
        assert_eq!(segments.len(), parents.len(), "segment/parent mismatch");

        let mut order: Vec<usize> = (0..segments.len()).collect();
        order.sort_by_key(|&i| segments[i].id);
        for w in order.windows(2) {
            if segments[w[0]].id == segments[w[1]].id {
                return Err(MorphologyError::DuplicateSegmentId(segments[w[0]].id));
            }
        }

        let mut id_to_index = std::collections::BTreeMap::new();
        for (index, seg) in segments.iter().enumerate() {
            id_to_index.insert(seg.id, index);
        }

        let mut parent_index = vec![MNPOS; segments.len()];
        let mut root = None;
        for (index, &pid) in parents.iter().enumerate() {
            if pid == u32::MAX {
                if root.is_some() {
                    return Err(MorphologyError::MultipleRoots(segments[index].id));
                }
                root = Some(index);
            } else {
                parent_index[index] =
                    *id_to_index
                        .get(&pid)
                        .ok_or(MorphologyError::MissingParent {
                            child: segments[index].id,
                            parent: pid,
                        })?;
            }
        }
        let root = root.ok_or(MorphologyError::Empty)?;

        // Cycle check by walking every segment up to the root.
        for start in 0..segments.len() {
            let mut hops = 0usize;
            let mut cur = start;
            while parent_index[cur] != MNPOS {
                cur = parent_index[cur];
                hops += 1;
                if hops > segments.len() {
                    return Err(MorphologyError::CyclicSegments(segments[start].id));
                }
            }
        }

        let mut children = vec![Vec::new(); segments.len()];
        for (index, &p) in parent_index.iter().enumerate() {
            if p != MNPOS {
                children[p].push(index);
            }
        }
        for ch in &mut children {
            ch.sort_by_key(|&i| segments[i].id);
        }

        // Branch heads: the root and every child of a multi-child segment.
        let mut branches = Vec::new();
        let mut branch_parent_seg = Vec::new();
        let mut seg_to_branch = vec![MNPOS; segments.len()];

        let mut heads = vec![root];
        while let Some(head) = heads.pop() {
            let branch_id = branches.len();
            let mut segs = Vec::new();
            let mut ids = Vec::new();
            let mut tags = Vec::new();
            let mut cur = head;
            loop {
                seg_to_branch[cur] = branch_id;
                segs.push((segments[cur].prox, segments[cur].dist));
                ids.push(segments[cur].id);
                tags.push(segments[cur].tag);
                match children[cur].as_slice() {
                    [only] => cur = *only,
                    kids => {
                        for &k in kids.iter().rev() {
                            heads.push(k);
                        }
                        break;
                    }
                }
            }
            branches.push(Branch {
                segments: segs,
                segment_ids: ids,
                segment_tags: tags,
            });
            branch_parent_seg.push(parent_index[head]);
        }

        // Renumber branches so parents precede children (pre-order by head
        // discovery already guarantees it, as heads inherit from processed
        // segments), then derive parent/children tables.
        let branch_parent: Vec<usize> = branch_parent_seg
            .iter()
            .map(|&p| if p == MNPOS { MNPOS } else { seg_to_branch[p] })
            .collect();

        let mut branch_children = vec![Vec::new(); branches.len()];
        for (b, &p) in branch_parent.iter().enumerate() {
            if p != MNPOS {
                branch_children[p].push(b);
            }
        }
        for ch in &mut branch_children {
            ch.sort_unstable();
        }

        Ok(Self {
            branches,
            branch_parent,
            branch_children,
        })
    }

    pub fn num_branches(&self) -> usize {
        self.branches.len()
    }

    pub fn branch(&self, b: usize) -> &Branch {
        &self.branches[b]
    }

    pub fn branch_parent(&self, b: usize) -> usize {
        self.branch_parent[b]
    }

    pub fn branch_children(&self, b: usize) -> &[usize] {
        &self.branch_children[b]
    }

    pub fn is_root_branch(&self, b: usize) -> bool {
        self.branch_parent[b] == MNPOS
    }

    pub fn terminal_branches(&self) -> Vec<usize> {
        (0..self.branches.len())
            .filter(|&b| self.branch_children[b].is_empty())
            .collect()
    }

    /// Depth-first pre-order over branches, children in fixed order.
    pub fn branch_preorder(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.branches.len());
        let mut stack: Vec<usize> = (0..self.branches.len())
            .filter(|&b| self.is_root_branch(b))
            .rev()
            .collect();
        while let Some(b) = stack.pop() {
            out.push(b);
            for &c in self.branch_children[b].iter().rev() {
                stack.push(c);
            }
        }
        out
    }
}

/// Convenience builder: a single unbranched cylinder along x.
pub fn cylinder_morphology(length_um: f64, radius_um: f64) -> Morphology {
    let seg = Segment {
        id: 0,
        prox: Mpoint::new(0.0, 0.0, 0.0, radius_um),
        dist: Mpoint::new(length_um, 0.0, 0.0, radius_um),
        tag: 3,
    };
    Morphology::from_segments(vec![seg], vec![u32::MAX]).expect("cylinder is a valid morphology")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn y_morphology() -> Morphology {
        // Root segment with two children: three branches.
        let p = |x: f64| Mpoint::new(x, 0.0, 0.0, 1.0);
        let segments = vec![
            Segment {
                id: 0,
                prox: p(0.0),
                dist: p(100.0),
                tag: 1,
            },
            Segment {
                id: 1,
                prox: p(100.0),
                dist: Mpoint::new(200.0, 50.0, 0.0, 0.5),
                tag: 3,
            },
            Segment {
                id: 2,
                prox: p(100.0),
                dist: Mpoint::new(200.0, -50.0, 0.0, 0.5),
                tag: 3,
            },
        ];
        Morphology::from_segments(segments, vec![u32::MAX, 0, 0]).unwrap()
    }

    #[test]
    fn y_shape_has_three_branches() {
        let m = y_morphology();
        assert_eq!(m.num_branches(), 3);
        assert!(m.is_root_branch(0));
        assert_eq!(m.branch_children(0), &[1, 2]);
        assert_eq!(m.branch_parent(1), 0);
        assert_eq!(m.branch_parent(2), 0);
    }

    #[test]
    fn preorder_visits_parents_first() {
        let m = y_morphology();
        let order = m.branch_preorder();
        for (rank, &b) in order.iter().enumerate() {
            let p = m.branch_parent(b);
            if p != MNPOS {
                assert!(order.iter().position(|&x| x == p).unwrap() < rank);
            }
        }
    }

    #[test]
    fn duplicate_ids_rejected() {
        let p = Mpoint::new(0.0, 0.0, 0.0, 1.0);
        let segs = vec![
            Segment {
                id: 4,
                prox: p,
                dist: p,
                tag: 1,
            },
            Segment {
                id: 4,
                prox: p,
                dist: p,
                tag: 1,
            },
        ];
        assert_eq!(
            Morphology::from_segments(segs, vec![u32::MAX, 4]),
            Err(MorphologyError::DuplicateSegmentId(4))
        );
    }

    #[test]
    fn missing_parent_rejected() {
        let p = Mpoint::new(0.0, 0.0, 0.0, 1.0);
        let segs = vec![
            Segment {
                id: 0,
                prox: p,
                dist: p,
                tag: 1,
            },
            Segment {
                id: 1,
                prox: p,
                dist: p,
                tag: 1,
            },
        ];
        assert_eq!(
            Morphology::from_segments(segs, vec![u32::MAX, 9]),
            Err(MorphologyError::MissingParent { child: 1, parent: 9 })
        );
    }

    #[test]
    fn extent_merges_overlapping_cables() {
        let ext = Mextent::from_cables(vec![
            Mcable::new(0, 0.5, 1.0),
            Mcable::new(0, 0.0, 0.6),
            Mcable::new(1, 0.2, 0.3),
        ]);
        assert_eq!(
            ext.cables,
            vec![Mcable::new(0, 0.0, 1.0), Mcable::new(1, 0.2, 0.3)]
        );
    }
}
