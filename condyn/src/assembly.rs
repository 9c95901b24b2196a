//! Local dynamics assembly.
//!
//! For every contact the assembler condenses the body-level dynamics onto the
//! three local degrees of freedom of the contact frame. The result is a block
//! system `U = B + W R` where `W` holds 3x3 blocks `h · H M⁻¹ Hᵀ` contracted
//! between contact anchors, `B` is the local free velocity and `R` the average
//! reaction force over the step. Off-diagonal blocks couple contacts sharing a
//! body; obstacles contribute nothing.

use ahash::AHashMap;

use crate::detect::Contact;
use crate::objects::{BodyId, BodyRegistry, ContactAnchor};
use crate::{Error, Mat3, Vec3};

/// Coupling of one contact to another through a shared body.
pub(crate) struct OffDiag {
    /// Index of the coupled block in `LocalDynamics::blocks`.
    pub block: usize,
    pub w: Mat3,
}

/// Diagonal block of the local dynamics: one contact, its 3x3 operator and
/// its local vectors, all expressed in the contact frame.
pub struct DiagBlock {
    pub contact: Contact,
    /// Diagonal operator `W_ii`.
    pub w: Mat3,
    /// Inverse of `w`, used by the merit function.
    pub(crate) a_inv: Mat3,
    /// Spectral step `1 / λ_max(sym w)` for the fixed-point diagonal solvers.
    pub(crate) rho: f64,
    /// Relative velocity at the previous step, slave minus master.
    pub v: Vec3,
    /// Local free velocity.
    pub b: Vec3,
    /// Average reaction force.
    pub r: Vec3,
    /// Local velocity under the current reactions.
    pub u: Vec3,
    pub(crate) adj: Vec<OffDiag>,
}

impl DiagBlock {
    pub fn friction(&self) -> f64 {
        self.contact.surf.friction
    }

    pub fn restitution(&self) -> f64 {
        self.contact.surf.restitution
    }

    pub fn gap(&self) -> f64 {
        self.contact.gap
    }
}

pub struct LocalDynamics {
    pub blocks: Vec<DiagBlock>,
    pub h: f64,
    /// Dynamic or quasi-static contact law.
    pub dynamic: bool,
    /// Free-motion energy `½ Σ B·(W⁻¹B)`, floored at one; normalizes the
    /// merit function.
    pub free_energy: f64,
}

/// Anchor of body `b` inside contact `c`, with the role sign: `+1` when the
/// body is the slave, `-1` when it is the master.
fn role(c: &Contact, b: BodyId) -> (&ContactAnchor, f64) {
    if c.slave == b {
        (&c.sanchor, 1.0)
    } else {
        (&c.manchor, -1.0)
    }
}

/// Condenses body dynamics onto the contact set. Fails if a diagonal block
/// turns out singular or non-finite.
pub fn assemble(
    registry: &BodyRegistry,
    contacts: Vec<Contact>,
    h: f64,
    dynamic: bool,
) -> Result<LocalDynamics, Error> {
    // Contacts incident to each non-obstacle body.
    let mut incident: AHashMap<BodyId, Vec<usize>> = AHashMap::new();
    for (i, c) in contacts.iter().enumerate() {
        for id in [c.master, c.slave] {
            if !registry.get(id).is_obstacle() {
                incident.entry(id).or_default().push(i);
            }
        }
    }

    let mut blocks = Vec::with_capacity(contacts.len());
    for c in contacts {
        let master = registry.get(c.master);
        let slave = registry.get(c.slave);

        let w = h
            * c.base.transpose()
            * (master.inv_inertia_contraction(&c.manchor, &c.manchor)
                + slave.inv_inertia_contraction(&c.sanchor, &c.sanchor))
            * c.base;

        let sym = 0.5 * (w + w.transpose());
        let lmax = na::SymmetricEigen::new(sym).eigenvalues.max();
        let a_inv = w.try_inverse().filter(|_| lmax.is_finite() && lmax > 0.0);
        let Some(a_inv) = a_inv else {
            return Err(Error::SingularLocalOperator {
                master: c.master,
                slave: c.slave,
            });
        };

        let v = c.base.transpose()
            * (slave.prev_point_velocity(&c.sanchor) - master.prev_point_velocity(&c.manchor));
        let b = c.base.transpose()
            * (slave.point_velocity(&c.sanchor) - master.point_velocity(&c.manchor));

        blocks.push(DiagBlock {
            contact: c,
            w,
            a_inv,
            rho: 1.0 / lmax,
            v,
            b,
            r: Vec3::zeros(),
            u: b,
            adj: Vec::new(),
        });
    }

    // Off-diagonal coupling: contacts i and j sharing body `b` couple through
    // `σ_i σ_j h · base_iᵀ C_b(anchor_i, anchor_j) base_j`, where the sign is
    // positive when `b` plays the same role in both contacts. A pair of
    // contacts can share both bodies; the contributions add up.
    let mut coupling: AHashMap<(usize, usize), Mat3> = AHashMap::new();
    for (&id, incidents) in &incident {
        let body = registry.get(id);
        for (k, &i) in incidents.iter().enumerate() {
            for &j in &incidents[k + 1..] {
                let (ai, si) = role(&blocks[i].contact, id);
                let (aj, sj) = role(&blocks[j].contact, id);
                let c = body.inv_inertia_contraction(ai, aj);
                let w_ij = si * sj * h * blocks[i].contact.base.transpose()
                    * c
                    * blocks[j].contact.base;
                *coupling.entry((i, j)).or_insert_with(Mat3::zeros) += w_ij;
                *coupling.entry((j, i)).or_insert_with(Mat3::zeros) += w_ij.transpose();
            }
        }
    }
    for ((i, j), w) in coupling {
        blocks[i].adj.push(OffDiag { block: j, w });
    }
    for blk in &mut blocks {
        blk.adj.sort_by_key(|o| o.block);
    }

    let free_energy = blocks
        .iter()
        .map(|d| 0.5 * d.b.dot(&(d.a_inv * d.b)))
        .sum::<f64>()
        .max(1.0);

    log::debug!(
        "assembled {} local blocks, free energy {:.3e}",
        blocks.len(),
        free_energy
    );
    Ok(LocalDynamics {
        blocks,
        h,
        dynamic,
        free_energy,
    })
}

impl LocalDynamics {
    /// Refreshes `U = B + W R` over all blocks.
    pub fn update_velocities(&mut self) {
        let r: Vec<Vec3> = self.blocks.iter().map(|d| d.r).collect();
        for (i, dia) in self.blocks.iter_mut().enumerate() {
            let mut u = dia.b + dia.w * r[i];
            for o in &dia.adj {
                u += o.w * r[o.block];
            }
            dia.u = u;
        }
    }

    /// Pushes the solved reactions back onto the bodies as average forces:
    /// the slave side receives `base R`, the master side its opposite.
    pub fn apply_reactions(&self, registry: &mut BodyRegistry) {
        for dia in &self.blocks {
            let f = dia.contact.base * dia.r;
            registry
                .get_mut(dia.contact.slave)
                .apply_contact_force(&dia.contact.sanchor, f);
            registry
                .get_mut(dia.contact.master)
                .apply_contact_force(&dia.contact.manchor, -f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect;
    use crate::material::{BulkMaterial, SurfaceMaterialSet};
    use crate::objects::{Body, Kinematics, RigidScheme};
    use crate::shape::ConvexPolyhedron;
    use approx::assert_relative_eq;

    fn cube_on_floor() -> (BodyRegistry, SurfaceMaterialSet) {
        let mut reg = BodyRegistry::new();
        let bulk = BulkMaterial::new(1.0e9, 0.25, 1.0e3).validated().unwrap();
        reg.add(Body::obstacle(
            "floor",
            ConvexPolyhedron::cuboid(na::Vector3::new(-5.0, -5.0, -1.0), na::Vector3::new(5.0, 5.0, 0.0)),
            0,
        ));
        reg.add(
            Body::rigid(
                "cube",
                ConvexPolyhedron::cuboid(na::Vector3::new(-0.5, -0.5, 0.0), na::Vector3::new(0.5, 0.5, 1.0)),
                bulk,
                0,
                RigidScheme::Stabilized,
            )
            .unwrap(),
        );
        (reg, SurfaceMaterialSet::default())
    }

    fn assembled(h: f64) -> LocalDynamics {
        let (mut reg, surf) = cube_on_floor();
        let g = Vec3::new(0.0, 0.0, -10.0);
        for (_, body) in reg.iter_mut() {
            body.step_begin(h, g, false);
        }
        let found = detect::detect(&reg, &surf, 1e-3).unwrap();
        assemble(&reg, found.contacts, h, true).unwrap()
    }

    #[test]
    fn diagonal_blocks_are_positive_definite() {
        let ldy = assembled(1e-3);
        assert_eq!(ldy.blocks.len(), 4);
        for dia in &ldy.blocks {
            let sym = 0.5 * (dia.w + dia.w.transpose());
            let eig = na::SymmetricEigen::new(sym).eigenvalues;
            assert!(eig.min() > 0.0);
            assert!(dia.rho > 0.0 && dia.rho.is_finite());
            assert_relative_eq!(dia.a_inv * dia.w, Mat3::identity(), epsilon = 1e-9);
        }
    }

    #[test]
    fn corner_contacts_couple_through_the_cube() {
        let ldy = assembled(1e-3);
        for dia in &ldy.blocks {
            // The floor is an obstacle, so only the cube couples: 3 others.
            assert_eq!(dia.adj.len(), 3);
        }
    }

    #[test]
    fn free_velocity_reflects_gravity() {
        let h = 1e-3;
        let ldy = assembled(h);
        for dia in &ldy.blocks {
            // The cube falls: normal free velocity is h·g downwards.
            assert_relative_eq!(dia.b.z, -10.0 * h, max_relative = 1e-9);
        }
    }

    #[test]
    fn zero_reactions_leave_u_at_b() {
        let mut ldy = assembled(1e-3);
        ldy.update_velocities();
        for dia in &ldy.blocks {
            assert_relative_eq!(dia.u, dia.b, epsilon = 1e-14);
        }
    }
}
