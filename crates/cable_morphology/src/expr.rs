//! Locset and region expression trees.
//!
//! Regions evaluate to a sorted non-overlapping cable extent, locsets to an
//! ordered location list.

use crate::{Mcable, Mextent, Mlocation, Morphology, MNPOS};

#[derive(Debug, Clone, PartialEq)]
pub enum Region {
    All,
    Branch(usize),
    Cable(Mcable),
    Tagged(i32),
    Union(Box<Region>, Box<Region>),
    Intersect(Box<Region>, Box<Region>),
}

impl Region {
    pub fn union(self, other: Region) -> Region {
        Region::Union(Box::new(self), Box::new(other))
    }

    pub fn intersect(self, other: Region) -> Region {
        Region::Intersect(Box::new(self), Box::new(other))
    }

    pub fn thingify(&self, morph: &Morphology) -> Mextent {
        match self {
            Region::All => Mextent::from_cables(
                (0..morph.num_branches()).map(Mcable::whole).collect(),
            ),
            Region::Branch(b) => {
                assert!(*b < morph.num_branches(), "region names unknown branch");
                Mextent::from_cables(vec![Mcable::whole(*b)])
            }
            Region::Cable(c) => {
                assert!(c.branch < morph.num_branches(), "region names unknown branch");
                Mextent::from_cables(vec![*c])
            }
            Region::Tagged(tag) => {
                let mut cables = Vec::new();
                for b in 0..morph.num_branches() {
                    let branch = morph.branch(b);
                    let fractions = branch.point_fractions();
                    for (k, &seg_tag) in branch.segment_tags.iter().enumerate() {
                        if seg_tag == *tag {
                            cables.push(Mcable::new(b, fractions[k], fractions[k + 1]));
                        }
                    }
                }
                Mextent::from_cables(cables)
            }
            Region::Union(a, b) => a.thingify(morph).union(&b.thingify(morph)),
            Region::Intersect(a, b) => a.thingify(morph).intersect(&b.thingify(morph)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Locset {
    Root,
    Terminal,
    Location(Mlocation),
    MidBranch(usize),
    Sum(Box<Locset>, Box<Locset>),
}

impl Locset {
    pub fn sum(self, other: Locset) -> Locset {
        Locset::Sum(Box::new(self), Box::new(other))
    }

    pub fn thingify(&self, morph: &Morphology) -> Vec<Mlocation> {
        let mut locs = self.collect(morph);
        locs.sort();
        locs
    }

    fn collect(&self, morph: &Morphology) -> Vec<Mlocation> {
        match self {
            Locset::Root => {
                let root = (0..morph.num_branches())
                    .find(|&b| morph.branch_parent(b) == MNPOS)
                    .expect("morphology has a root branch");
                vec![Mlocation::new(root, 0.0)]
            }
            Locset::Terminal => morph
                .terminal_branches()
                .into_iter()
                .map(|b| Mlocation::new(b, 1.0))
                .collect(),
            Locset::Location(loc) => {
                assert!(loc.branch < morph.num_branches(), "locset names unknown branch");
                assert!(
                    (0.0..=1.0).contains(&loc.pos),
                    "locset position outside [0, 1]"
                );
                vec![*loc]
            }
            Locset::MidBranch(b) => vec![Mlocation::new(*b, 0.5)],
            Locset::Sum(a, b) => {
                let mut locs = a.collect(morph);
                locs.extend(b.collect(morph));
                locs
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cylinder_morphology, Mpoint, Segment};

    fn forked() -> Morphology {
        let p = |x: f64, y: f64| Mpoint::new(x, y, 0.0, 1.0);
        let segments = vec![
            Segment {
                id: 0,
                prox: p(0.0, 0.0),
                dist: p(10.0, 0.0),
                tag: 1,
            },
            Segment {
                id: 1,
                prox: p(10.0, 0.0),
                dist: p(20.0, 5.0),
                tag: 3,
            },
            Segment {
                id: 2,
                prox: p(10.0, 0.0),
                dist: p(20.0, -5.0),
                tag: 3,
            },
        ];
        Morphology::from_segments(segments, vec![u32::MAX, 0, 0]).unwrap()
    }

    #[test]
    fn all_region_covers_every_branch() {
        let m = forked();
        let ext = Region::All.thingify(&m);
        assert_eq!(ext.cables.len(), 3);
    }

    #[test]
    fn tagged_region_selects_dendrites() {
        let m = forked();
        let ext = Region::Tagged(3).thingify(&m);
        assert_eq!(
            ext.cables,
            vec![Mcable::whole(1), Mcable::whole(2)]
        );
    }

    #[test]
    fn terminal_locset_orders_by_branch() {
        let m = forked();
        let locs = Locset::Terminal.thingify(&m);
        assert_eq!(
            locs,
            vec![Mlocation::new(1, 1.0), Mlocation::new(2, 1.0)]
        );
    }

    #[test]
    fn root_of_cylinder_is_branch_zero() {
        let m = cylinder_morphology(10.0, 1.0);
        assert_eq!(Locset::Root.thingify(&m), vec![Mlocation::new(0, 0.0)]);
    }

    #[test]
    fn intersection_clips_cables() {
        let m = forked();
        let ext = Region::Branch(1)
            .intersect(Region::Cable(Mcable::new(1, 0.25, 1.0)))
            .thingify(&m);
        assert_eq!(ext.cables, vec![Mcable::new(1, 0.25, 1.0)]);
    }
}
