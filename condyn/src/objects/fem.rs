//! Finite-element body on a tetrahedral mesh.
//!
//! Linear tetrahedra with lumped mass and a small-strain elastic stiffness.
//! The `Full` formulation integrates the nodal equations explicitly; the
//! `Reduced` formulation integrates externally supplied modal coordinates
//! (mass-normalized eigenpairs plus a stiffness-proportional damping ratio).

use super::{ContactAnchor, PointForce};
use crate::material::BulkMaterial;
use crate::shape::TetMesh;
use crate::solvers::linsolve::BiCgStab;
use crate::{Mat3, Vec3};

/// Modal data computed outside the engine and consumed read-only.
#[derive(Clone, Debug)]
pub struct ReducedModel {
    pub eigenvalues: Vec<f64>,
    /// Mode-major flattened mode shapes: `modes[m * 3n + 3i + c]`.
    pub modes: Vec<f64>,
    pub damping: f64,
}

pub enum FemFormulation {
    Full,
    Reduced(ReducedModel),
}

#[derive(Debug)]
pub(crate) enum FemBuildError {
    Degenerate,
    ModelMismatch { expected: usize, got: usize },
}

struct Element {
    nodes: [usize; 4],
    /// Shape-function gradients in the reference configuration.
    grads: [Vec3; 4],
    volume: f64,
}

enum FemState {
    Full,
    Reduced {
        model: ReducedModel,
        z: Vec<f64>,
        zdot: Vec<f64>,
    },
}

pub struct FemBody {
    pub mesh: TetMesh,
    elements: Vec<Element>,
    lumped_mass: Vec<f64>,
    inv_mass: Vec<f64>,
    lambda: f64,
    mu: f64,
    ref_positions: Vec<Vec3>,
    pub positions: Vec<Vec3>,
    pub velocities: Vec<Vec3>,
    velocities0: Vec<Vec3>,
    con_nodal: Vec<Vec3>,
    state: FemState,
    surface_tris: Vec<[u32; 3]>,
    surface_nodes: Vec<u32>,
}

impl FemBody {
    pub(crate) fn new(
        mesh: TetMesh,
        bulk: &BulkMaterial,
        formulation: FemFormulation,
    ) -> Result<Self, FemBuildError> {
        let n = mesh.vertices().len();
        let mut elements = Vec::with_capacity(mesh.tets().len());
        let mut lumped_mass = vec![0.0; n];

        for tet in mesh.tets() {
            let p: Vec<Vec3> = tet.iter().map(|&i| mesh.vertices()[i as usize]).collect();
            let dm = Mat3::from_columns(&[p[1] - p[0], p[2] - p[0], p[3] - p[0]]);
            let volume = dm.determinant() / 6.0;
            if !(volume > 1e-15) {
                return Err(FemBuildError::Degenerate);
            }
            let inv = dm.try_inverse().ok_or(FemBuildError::Degenerate)?;
            // Rows of Dm⁻¹ are the gradients of shape functions 1..3.
            let g1 = inv.row(0).transpose();
            let g2 = inv.row(1).transpose();
            let g3 = inv.row(2).transpose();
            let g0 = -(g1 + g2 + g3);
            elements.push(Element {
                nodes: [
                    tet[0] as usize,
                    tet[1] as usize,
                    tet[2] as usize,
                    tet[3] as usize,
                ],
                grads: [g0, g1, g2, g3],
                volume,
            });
            for &i in tet {
                lumped_mass[i as usize] += bulk.density * volume / 4.0;
            }
        }

        let state = match formulation {
            FemFormulation::Full => FemState::Full,
            FemFormulation::Reduced(model) => {
                let expected = model.eigenvalues.len() * 3 * n;
                if model.modes.len() != expected {
                    return Err(FemBuildError::ModelMismatch {
                        expected,
                        got: model.modes.len(),
                    });
                }
                let m = model.eigenvalues.len();
                FemState::Reduced {
                    model,
                    z: vec![0.0; m],
                    zdot: vec![0.0; m],
                }
            }
        };

        let ref_positions = mesh.vertices().to_vec();
        let surface_tris = mesh.surface_triangles();
        let surface_nodes = mesh.surface_nodes();
        Ok(FemBody {
            inv_mass: lumped_mass.iter().map(|&m| 1.0 / m).collect(),
            lumped_mass,
            lambda: bulk.lambda(),
            mu: bulk.mu(),
            positions: ref_positions.clone(),
            velocities: vec![Vec3::zeros(); n],
            velocities0: vec![Vec3::zeros(); n],
            con_nodal: vec![Vec3::zeros(); n],
            ref_positions,
            elements,
            state,
            surface_tris,
            surface_nodes,
            mesh,
        })
    }

    pub fn mass(&self) -> f64 {
        self.lumped_mass.iter().sum()
    }

    pub fn dofs(&self) -> usize {
        match &self.state {
            FemState::Full => 3 * self.positions.len(),
            FemState::Reduced { model, .. } => model.eigenvalues.len(),
        }
    }

    pub(crate) fn surface_tris(&self) -> &[[u32; 3]] {
        &self.surface_tris
    }

    pub(crate) fn surface_nodes(&self) -> &[u32] {
        &self.surface_nodes
    }

    pub fn set_velocity(&mut self, v: Vec3) {
        match &mut self.state {
            FemState::Full => {
                for vel in self.velocities.iter_mut() {
                    *vel = v;
                }
            }
            FemState::Reduced { model, zdot, .. } => {
                // Project the uniform field onto the modes: ż = Φᵀ M v.
                let n = self.positions.len();
                for (m, zd) in zdot.iter_mut().enumerate() {
                    let mut s = 0.0;
                    for i in 0..n {
                        let phi = mode_at(model, n, m, i);
                        s += self.lumped_mass[i] * phi.dot(&v);
                    }
                    *zd = s;
                }
                self.sync_nodal_state();
            }
        }
    }

    /// `out = K d` with the small-strain element stiffness
    /// `K_ij = V (λ gᵢ gⱼᵀ + μ gⱼ gᵢᵀ + μ (gᵢ·gⱼ) I)`.
    fn apply_stiffness(&self, disp: &[Vec3], out: &mut [Vec3]) {
        for o in out.iter_mut() {
            *o = Vec3::zeros();
        }
        for el in &self.elements {
            for (i, &ni) in el.nodes.iter().enumerate() {
                let gi = el.grads[i];
                let mut f = Vec3::zeros();
                for (j, &nj) in el.nodes.iter().enumerate() {
                    let gj = el.grads[j];
                    let d = disp[nj];
                    f += el.volume
                        * (self.lambda * gi * gj.dot(&d)
                            + self.mu * gj * gi.dot(&d)
                            + self.mu * gi.dot(&gj) * d);
                }
                out[ni] += f;
            }
        }
    }

    /// External minus internal nodal force at the current configuration.
    fn nodal_force(&self, gravity: Vec3, forces: &[PointForce]) -> Vec<Vec3> {
        let n = self.positions.len();
        let disp: Vec<Vec3> = (0..n)
            .map(|i| self.positions[i] - self.ref_positions[i])
            .collect();
        let mut f = vec![Vec3::zeros(); n];
        self.apply_stiffness(&disp, &mut f);
        for (i, fi) in f.iter_mut().enumerate() {
            *fi = self.lumped_mass[i] * gravity - *fi;
        }
        for frc in forces {
            if let Some(i) = self.nearest_node(frc.point) {
                f[i] += frc.force;
            }
        }
        f
    }

    fn nearest_node(&self, point: Vec3) -> Option<usize> {
        self.ref_positions
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                let da = (*a - point).norm_squared();
                let db = (*b - point).norm_squared();
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
    }

    /// Solves `(M + h² K) u = rhs` for the quasi-static velocity update.
    fn static_solve(&self, h: f64, rhs: &[Vec3]) -> Vec<Vec3> {
        let n = self.positions.len();
        let mut b: Vec<f64> = rhs.iter().flat_map(|v| [v.x, v.y, v.z]).collect();
        let mut x = vec![0.0; 3 * n];
        let mut solver = BiCgStab::new(3 * n, 500, 1e-10);
        let mut kin = vec![Vec3::zeros(); n];
        let mut kout = vec![Vec3::zeros(); n];
        solver.solve(
            |v, out| {
                for i in 0..n {
                    kin[i] = Vec3::new(v[3 * i], v[3 * i + 1], v[3 * i + 2]);
                }
                self.apply_stiffness(&kin, &mut kout);
                for i in 0..n {
                    let r = self.lumped_mass[i] * kin[i] + h * h * kout[i];
                    out[3 * i] = r.x;
                    out[3 * i + 1] = r.y;
                    out[3 * i + 2] = r.z;
                }
            },
            &mut x,
            &mut b,
        );
        (0..n)
            .map(|i| Vec3::new(x[3 * i], x[3 * i + 1], x[3 * i + 2]))
            .collect()
    }

    /// Rebuilds nodal positions/velocities from the modal coordinates.
    fn sync_nodal_state(&mut self) {
        if let FemState::Reduced { model, z, zdot } = &self.state {
            let n = self.positions.len();
            for i in 0..n {
                let mut d = Vec3::zeros();
                let mut v = Vec3::zeros();
                for m in 0..model.eigenvalues.len() {
                    let phi = mode_at(model, n, m, i);
                    d += z[m] * phi;
                    v += zdot[m] * phi;
                }
                self.positions[i] = self.ref_positions[i] + d;
                self.velocities[i] = v;
            }
        }
    }

    pub(crate) fn step_begin(
        &mut self,
        h: f64,
        gravity: Vec3,
        forces: &[PointForce],
        quasistatic: bool,
    ) {
        for c in self.con_nodal.iter_mut() {
            *c = Vec3::zeros();
        }
        self.velocities0.copy_from_slice(&self.velocities);

        match &mut self.state {
            FemState::Full => {
                if quasistatic {
                    let mut f = self.nodal_force(gravity, forces);
                    for fi in f.iter_mut() {
                        *fi *= h;
                    }
                    self.velocities = self.static_solve(h, &f);
                    return;
                }
                let half = 0.5 * h;
                for (p, v) in self.positions.iter_mut().zip(&self.velocities) {
                    *p += half * v;
                }
                let f = self.nodal_force(gravity, forces);
                for i in 0..self.velocities.len() {
                    self.velocities[i] += h * self.inv_mass[i] * f[i];
                }
            }
            FemState::Reduced { .. } => {
                if !quasistatic {
                    let half = 0.5 * h;
                    if let FemState::Reduced { z, zdot, .. } = &mut self.state {
                        for (zi, zd) in z.iter_mut().zip(zdot.iter()) {
                            *zi += half * zd;
                        }
                    }
                    self.sync_nodal_state();
                }
                // Modal force: Φᵀ f_ext - Λ z - η Λ ż.
                let n = self.positions.len();
                let mut ext = vec![Vec3::zeros(); n];
                for (i, e) in ext.iter_mut().enumerate() {
                    *e = self.lumped_mass[i] * gravity;
                }
                for frc in forces {
                    if let Some(i) = self.nearest_node(frc.point) {
                        ext[i] += frc.force;
                    }
                }
                if let FemState::Reduced { model, z, zdot } = &mut self.state {
                    for m in 0..model.eigenvalues.len() {
                        let lam = model.eigenvalues[m];
                        let mut fm = 0.0;
                        for (i, e) in ext.iter().enumerate() {
                            fm += mode_at(model, n, m, i).dot(e);
                        }
                        fm -= lam * (z[m] + model.damping * zdot[m]);
                        if quasistatic {
                            zdot[m] = h * fm / (1.0 + h * h * lam);
                        } else {
                            zdot[m] += h * fm;
                        }
                    }
                }
                self.sync_nodal_state();
            }
        }
    }

    pub(crate) fn step_end(&mut self, h: f64, quasistatic: bool) {
        match &mut self.state {
            FemState::Full => {
                if quasistatic {
                    let mut rhs = self.con_nodal.clone();
                    for r in rhs.iter_mut() {
                        *r *= h;
                    }
                    let du = self.static_solve(h, &rhs);
                    for (v, d) in self.velocities.iter_mut().zip(&du) {
                        *v += d;
                    }
                    for (p, v) in self.positions.iter_mut().zip(&self.velocities) {
                        *p += h * v;
                    }
                    return;
                }
                let half = 0.5 * h;
                for i in 0..self.velocities.len() {
                    self.velocities[i] += h * self.inv_mass[i] * self.con_nodal[i];
                }
                for (p, v) in self.positions.iter_mut().zip(&self.velocities) {
                    *p += half * v;
                }
            }
            FemState::Reduced { .. } => {
                let n = self.positions.len();
                let con = self.con_nodal.clone();
                if let FemState::Reduced { model, z, zdot } = &mut self.state {
                    for m in 0..model.eigenvalues.len() {
                        let mut gm = 0.0;
                        for (i, c) in con.iter().enumerate() {
                            gm += mode_at(model, n, m, i).dot(c);
                        }
                        if quasistatic {
                            zdot[m] += h * gm / (1.0 + h * h * model.eigenvalues[m]);
                        } else {
                            zdot[m] += h * gm;
                        }
                    }
                    let adv = if quasistatic { h } else { 0.5 * h };
                    for (zi, zd) in z.iter_mut().zip(zdot.iter()) {
                        *zi += adv * zd;
                    }
                }
                self.sync_nodal_state();
            }
        }
    }

    pub(crate) fn point_velocity(&self, anchor: &ContactAnchor, prev: bool) -> Vec3 {
        let vel = if prev {
            &self.velocities0
        } else {
            &self.velocities
        };
        let mut v = Vec3::zeros();
        for &(i, w) in anchor.nodes() {
            v += w * vel[i];
        }
        v
    }

    pub(crate) fn inv_inertia_contraction(&self, a: &ContactAnchor, b: &ContactAnchor) -> Mat3 {
        match &self.state {
            FemState::Full => {
                let mut s = 0.0;
                for &(ia, wa) in a.nodes() {
                    for &(ib, wb) in b.nodes() {
                        if ia == ib {
                            s += wa * wb * self.inv_mass[ia];
                        }
                    }
                }
                s * Mat3::identity()
            }
            FemState::Reduced { model, .. } => {
                let n = self.positions.len();
                let mut c = Mat3::zeros();
                for m in 0..model.eigenvalues.len() {
                    let mut pa = Vec3::zeros();
                    let mut pb = Vec3::zeros();
                    for &(i, w) in a.nodes() {
                        pa += w * mode_at(model, n, m, i);
                    }
                    for &(i, w) in b.nodes() {
                        pb += w * mode_at(model, n, m, i);
                    }
                    c += pa * pb.transpose();
                }
                c
            }
        }
    }

    pub(crate) fn apply_contact_force(&mut self, anchor: &ContactAnchor, force: Vec3) {
        for &(i, w) in anchor.nodes() {
            self.con_nodal[i] += w * force;
        }
    }

    pub fn kinetic_energy(&self) -> f64 {
        match &self.state {
            FemState::Full => self
                .velocities
                .iter()
                .zip(&self.lumped_mass)
                .map(|(v, m)| 0.5 * m * v.norm_squared())
                .sum(),
            FemState::Reduced { zdot, .. } => zdot.iter().map(|zd| 0.5 * zd * zd).sum(),
        }
    }

    pub fn internal_energy(&self) -> f64 {
        match &self.state {
            FemState::Full => {
                let n = self.positions.len();
                let disp: Vec<Vec3> = (0..n)
                    .map(|i| self.positions[i] - self.ref_positions[i])
                    .collect();
                let mut kd = vec![Vec3::zeros(); n];
                self.apply_stiffness(&disp, &mut kd);
                0.5 * disp.iter().zip(&kd).map(|(d, f)| d.dot(f)).sum::<f64>()
            }
            FemState::Reduced { model, z, .. } => z
                .iter()
                .zip(&model.eigenvalues)
                .map(|(zi, lam)| 0.5 * lam * zi * zi)
                .sum(),
        }
    }

    /// Snapshot layout: flattened nodal positions/velocities for the full
    /// formulation, modal coordinates for the reduced one.
    pub(crate) fn capture(&self) -> (Vec<f64>, Vec<f64>) {
        match &self.state {
            FemState::Full => (
                self.positions.iter().flat_map(|p| [p.x, p.y, p.z]).collect(),
                self.velocities
                    .iter()
                    .flat_map(|v| [v.x, v.y, v.z])
                    .collect(),
            ),
            FemState::Reduced { z, zdot, .. } => (z.clone(), zdot.clone()),
        }
    }

    pub(crate) fn restore(&mut self, conf: &[f64], velo: &[f64]) -> bool {
        let ok = match &mut self.state {
            FemState::Full => {
                let n = self.positions.len();
                if conf.len() != 3 * n || velo.len() != 3 * n {
                    return false;
                }
                for i in 0..n {
                    self.positions[i] = Vec3::new(conf[3 * i], conf[3 * i + 1], conf[3 * i + 2]);
                    self.velocities[i] = Vec3::new(velo[3 * i], velo[3 * i + 1], velo[3 * i + 2]);
                }
                true
            }
            FemState::Reduced { z, zdot, .. } => {
                if conf.len() != z.len() || velo.len() != zdot.len() {
                    return false;
                }
                z.copy_from_slice(conf);
                zdot.copy_from_slice(velo);
                true
            }
        };
        if ok {
            self.sync_nodal_state();
        }
        ok
    }

    pub fn critical_time_step(&self) -> f64 {
        match &self.state {
            FemState::Reduced { model, .. } => {
                let eigmax = model.eigenvalues.iter().cloned().fold(0.0, f64::max);
                if eigmax > 0.0 {
                    2.0 / eigmax.sqrt()
                } else {
                    f64::MAX
                }
            }
            FemState::Full => {
                // Power iteration on M⁻¹ K over nodal fields.
                let n = self.positions.len();
                let mut x = vec![Vec3::repeat(1.0); n];
                let mut kx = vec![Vec3::zeros(); n];
                let mut eig = 0.0;
                for _ in 0..40 {
                    self.apply_stiffness(&x, &mut kx);
                    let mut norm2 = 0.0;
                    for i in 0..n {
                        kx[i] *= self.inv_mass[i];
                        norm2 += kx[i].norm_squared();
                    }
                    let norm = norm2.sqrt();
                    if !(norm > 0.0) || !norm.is_finite() {
                        return f64::MAX;
                    }
                    let xnorm = x.iter().map(|v| v.norm_squared()).sum::<f64>().sqrt();
                    eig = norm / xnorm;
                    for i in 0..n {
                        x[i] = kx[i] / norm;
                    }
                }
                if eig > 0.0 {
                    2.0 / eig.sqrt()
                } else {
                    f64::MAX
                }
            }
        }
    }
}

fn mode_at(model: &ReducedModel, n: usize, mode: usize, node: usize) -> Vec3 {
    let off = mode * 3 * n + 3 * node;
    Vec3::new(
        model.modes[off],
        model.modes[off + 1],
        model.modes[off + 2],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn bar(formulation: FemFormulation) -> FemBody {
        let bulk = BulkMaterial::new(1.0e7, 0.25, 1.0e3);
        let mesh = TetMesh::box_mesh(Vec3::zeros(), Vec3::new(2.0, 1.0, 1.0), 2, 1, 1);
        FemBody::new(mesh, &bulk, formulation).unwrap()
    }

    #[test]
    fn lumped_mass_totals_density_times_volume() {
        let body = bar(FemFormulation::Full);
        assert_relative_eq!(body.mass(), 2.0 * 1.0e3, max_relative = 1e-10);
    }

    #[test]
    fn stiffness_annihilates_rigid_translation() {
        let body = bar(FemFormulation::Full);
        let n = body.positions.len();
        let disp = vec![Vec3::new(0.1, -0.2, 0.3); n];
        let mut out = vec![Vec3::zeros(); n];
        body.apply_stiffness(&disp, &mut out);
        for f in &out {
            assert!(f.norm() < 1e-6, "translation produced force {f:?}");
        }
    }

    #[test]
    fn reference_state_is_in_equilibrium() {
        let mut body = bar(FemFormulation::Full);
        body.step_begin(1e-4, Vec3::zeros(), &[], false);
        body.step_end(1e-4, false);
        for v in &body.velocities {
            assert!(v.norm() < 1e-12);
        }
        assert_eq!(body.internal_energy(), 0.0);
    }

    #[test]
    fn reduced_model_dimension_checked() {
        let bulk = BulkMaterial::new(1.0e7, 0.25, 1.0e3);
        let mesh = TetMesh::box_mesh(Vec3::zeros(), Vec3::new(1.0, 1.0, 1.0), 1, 1, 1);
        let model = ReducedModel {
            eigenvalues: vec![1.0, 2.0],
            modes: vec![0.0; 5],
            damping: 0.0,
        };
        assert!(FemBody::new(mesh, &bulk, FemFormulation::Reduced(model)).is_err());
    }

    #[test]
    fn critical_step_scales_with_stiffness() {
        let soft = bar(FemFormulation::Full);
        let stiff_bulk = BulkMaterial::new(1.0e9, 0.25, 1.0e3);
        let mesh = TetMesh::box_mesh(Vec3::zeros(), Vec3::new(2.0, 1.0, 1.0), 2, 1, 1);
        let stiff = FemBody::new(mesh, &stiff_bulk, FemFormulation::Full).unwrap();
        assert!(stiff.critical_time_step() < soft.critical_time_step());
    }
}
