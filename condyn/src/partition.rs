//! Domain decomposition of the contact set.
//!
//! Bodies are balanced greedily across a fixed number of domains by a cost
//! combining degrees of freedom and contact incidence. Every contact is owned
//! by its master body's domain (or the slave's when the master is an
//! obstacle), and the assembled blocks are reordered so each domain owns a
//! contiguous range. Cross-domain couplings must mirror each other exactly;
//! a missing or inconsistent mirror fails the partition.

use std::ops::Range;

use ahash::AHashMap;

use crate::assembly::LocalDynamics;
use crate::objects::{BodyId, BodyRegistry};
use crate::Error;

pub struct DomainSet {
    ranges: Vec<Range<usize>>,
    costs: Vec<f64>,
    body_domain: AHashMap<BodyId, usize>,
}

impl DomainSet {
    /// Balances the contact set over `count` domains and reorders the blocks
    /// of `ldy` so each domain's blocks are contiguous.
    pub fn partition(
        registry: &BodyRegistry,
        ldy: &mut LocalDynamics,
        count: usize,
    ) -> Result<Self, Error> {
        Self::partition_weighted(registry, ldy, count, &AHashMap::new())
    }

    /// Like [`partition`](Self::partition), with per-body cost multipliers
    /// from measured load; absent bodies weigh 1.0.
    pub fn partition_weighted(
        registry: &BodyRegistry,
        ldy: &mut LocalDynamics,
        count: usize,
        weights: &AHashMap<BodyId, f64>,
    ) -> Result<Self, Error> {
        if count == 0 {
            return Err(Error::InvalidParameter {
                name: "domain count".into(),
            });
        }

        let mut incidence: AHashMap<BodyId, usize> = AHashMap::new();
        for dia in &ldy.blocks {
            *incidence.entry(dia.contact.master).or_default() += 1;
            *incidence.entry(dia.contact.slave).or_default() += 1;
        }

        // Longest-processing-time assignment of bodies to domains.
        let mut bodies: Vec<(BodyId, f64)> = registry
            .iter()
            .filter(|(_, b)| !b.is_obstacle())
            .map(|(id, b)| {
                let base =
                    b.dofs() as f64 + 3.0 * incidence.get(&id).copied().unwrap_or(0) as f64;
                (id, base * weights.get(&id).copied().unwrap_or(1.0))
            })
            .collect();
        bodies.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut costs: Vec<f64> = vec![0.0; count];
        let mut body_domain: AHashMap<BodyId, usize> = AHashMap::new();
        for (id, cost) in bodies {
            let target = (0..count)
                .min_by(|&a, &b| costs[a].total_cmp(&costs[b]))
                .unwrap_or(0);
            costs[target] += cost;
            body_domain.insert(id, target);
        }

        // Contact ownership follows the master body.
        let owner = |dia: &crate::assembly::DiagBlock| -> usize {
            body_domain
                .get(&dia.contact.master)
                .or_else(|| body_domain.get(&dia.contact.slave))
                .copied()
                .unwrap_or(0)
        };

        // Stable reorder: (domain, original index).
        let mut order: Vec<usize> = (0..ldy.blocks.len()).collect();
        let domains: Vec<usize> = ldy.blocks.iter().map(owner).collect();
        order.sort_by_key(|&i| (domains[i], i));

        let mut new_of_old = vec![0usize; order.len()];
        for (new, &old) in order.iter().enumerate() {
            new_of_old[old] = new;
        }

        let old_blocks = std::mem::take(&mut ldy.blocks);
        let mut slots: Vec<Option<crate::assembly::DiagBlock>> =
            old_blocks.into_iter().map(Some).collect();
        for &old in &order {
            let mut blk = slots[old].take().ok_or(Error::CommunicationMismatch {
                detail: "duplicate block in partition order".into(),
            })?;
            for adj in blk.adj.iter_mut() {
                adj.block = new_of_old[adj.block];
            }
            blk.adj.sort_by_key(|o| o.block);
            ldy.blocks.push(blk);
        }

        let mut ranges = Vec::with_capacity(count);
        let mut start = 0;
        for d in 0..count {
            let len = domains.iter().filter(|&&x| x == d).count();
            ranges.push(start..start + len);
            start += len;
        }

        let set = DomainSet {
            ranges,
            costs,
            body_domain,
        };
        set.verify(ldy)?;
        log::debug!(
            "partitioned {} blocks over {} domains, imbalance {:.2}",
            ldy.blocks.len(),
            count,
            set.imbalance()
        );
        Ok(set)
    }

    /// Checks that every coupling has an exact transposed mirror; the
    /// parallel sweeps rely on both sides seeing the same operator.
    fn verify(&self, ldy: &LocalDynamics) -> Result<(), Error> {
        for (i, dia) in ldy.blocks.iter().enumerate() {
            for adj in &dia.adj {
                let back = ldy.blocks[adj.block]
                    .adj
                    .iter()
                    .find(|o| o.block == i)
                    .ok_or_else(|| Error::CommunicationMismatch {
                        detail: format!("coupling {} -> {} has no mirror", i, adj.block),
                    })?;
                if (back.w - adj.w.transpose()).abs().max() > 1e-12 * (1.0 + adj.w.abs().max()) {
                    return Err(Error::CommunicationMismatch {
                        detail: format!("coupling {} -> {} mirrors inconsistently", i, adj.block),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn num_domains(&self) -> usize {
        self.ranges.len()
    }

    /// Contiguous block range owned by each domain.
    pub(crate) fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }

    /// Domain assignment per body; feeds the measured-load cost model.
    pub(crate) fn body_domains(&self) -> &AHashMap<BodyId, usize> {
        &self.body_domain
    }

    /// Ratio of the heaviest domain cost to the average; 1.0 is perfect.
    pub fn imbalance(&self) -> f64 {
        let max = self.costs.iter().copied().fold(0.0, f64::max);
        let avg = self.costs.iter().sum::<f64>() / self.costs.len() as f64;
        if avg > 0.0 {
            max / avg
        } else {
            1.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembly::assemble;
    use crate::detect;
    use crate::material::{BulkMaterial, SurfaceMaterialSet};
    use crate::objects::{Body, RigidScheme};
    use crate::shape::ConvexPolyhedron;
    use crate::Vec3;

    fn row_of_cubes(n: usize) -> (BodyRegistry, SurfaceMaterialSet) {
        let mut reg = BodyRegistry::new();
        let bulk = BulkMaterial::new(1.0e9, 0.25, 1.0e3).validated().unwrap();
        reg.add(Body::obstacle(
            "floor",
            ConvexPolyhedron::cuboid(Vec3::new(-50.0, -5.0, -1.0), Vec3::new(50.0, 5.0, 0.0)),
            0,
        ));
        for i in 0..n {
            let x = 2.0 * i as f64;
            reg.add(
                Body::rigid(
                    format!("cube-{i}"),
                    ConvexPolyhedron::cuboid(
                        Vec3::new(x - 0.5, -0.5, 0.0),
                        Vec3::new(x + 0.5, 0.5, 1.0),
                    ),
                    bulk.clone(),
                    0,
                    RigidScheme::Stabilized,
                )
                .unwrap(),
            );
        }
        (reg, SurfaceMaterialSet::default())
    }

    fn assembled(n: usize) -> (BodyRegistry, LocalDynamics) {
        let (reg, surf) = row_of_cubes(n);
        let found = detect::detect(&reg, &surf, 1e-3).unwrap();
        let ldy = assemble(&reg, found.contacts, 1e-3, true).unwrap();
        (reg, ldy)
    }

    #[test]
    fn ranges_cover_all_blocks_disjointly() {
        let (reg, mut ldy) = assembled(6);
        let total = ldy.blocks.len();
        let set = DomainSet::partition(&reg, &mut ldy, 3).unwrap();
        let mut covered = 0;
        for r in set.ranges() {
            covered += r.len();
        }
        assert_eq!(covered, total);
        assert_eq!(set.num_domains(), 3);
    }

    #[test]
    fn reorder_preserves_couplings() {
        let (reg, mut ldy) = assembled(4);
        let before: usize = ldy.blocks.iter().map(|d| d.adj.len()).sum();
        DomainSet::partition(&reg, &mut ldy, 2).unwrap();
        let after: usize = ldy.blocks.iter().map(|d| d.adj.len()).sum();
        assert_eq!(before, after);
        // Mirror verification ran inside partition; re-run it explicitly.
        let set = DomainSet::partition(&reg, &mut ldy, 2).unwrap();
        set.verify(&ldy).unwrap();
    }

    #[test]
    fn zero_domains_is_rejected() {
        let (reg, mut ldy) = assembled(2);
        assert!(matches!(
            DomainSet::partition(&reg, &mut ldy, 0),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn load_weights_steer_the_assignment() {
        // Four identical cubes split 2+2 when unweighted; a heavy measured
        // load on the first one leaves it alone in its domain.
        let (reg, mut ldy) = assembled(4);
        let even = DomainSet::partition(&reg, &mut ldy, 2).unwrap();
        let mut lens: Vec<usize> = even.ranges().iter().map(|r| r.len()).collect();
        lens.sort();
        assert_eq!(lens, [8, 8]);

        let (reg, mut ldy) = assembled(4);
        let mut weights = AHashMap::new();
        weights.insert(BodyId(1), 5.0);
        let skewed = DomainSet::partition_weighted(&reg, &mut ldy, 2, &weights).unwrap();
        let mut lens: Vec<usize> = skewed.ranges().iter().map(|r| r.len()).collect();
        lens.sort();
        assert_eq!(lens, [4, 12]);
        assert!(skewed.imbalance() > even.imbalance());
    }

    #[test]
    fn single_domain_owns_everything() {
        let (reg, mut ldy) = assembled(3);
        let set = DomainSet::partition(&reg, &mut ldy, 1).unwrap();
        assert_eq!(set.ranges()[0], 0..ldy.blocks.len());
        assert!((set.imbalance() - 1.0).abs() < 1e-12);
    }
}
