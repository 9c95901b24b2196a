mod test_utils;

use condyn::assembly::assemble;
use condyn::{BodyRegistry, ContactSolver, GaussSeidel, GaussSeidelParams, Kinematics, NullMonitor};
use test_utils::*;

const H: f64 = 1e-3;

/// Kinetic plus gravitational potential energy of the cube.
fn total_energy(reg: &BodyRegistry) -> f64 {
    reg.iter()
        .map(|(_, b)| {
            let potential = match &b.kinematics {
                Kinematics::Rigid(r) => r.mass * 10.0 * r.center.z,
                _ => 0.0,
            };
            b.kinetic_energy() + potential
        })
        .sum()
}

/// A cube sliding on the floor under gravity with friction and no
/// restitution: frictional dissipation must drain the kinetic energy
/// monotonically until stick.
#[test]
fn frictional_sliding_dissipates_monotonically() {
    init_logger();
    let mut reg = cube_on_floor();
    if let Kinematics::Rigid(b) = &mut reg.get_mut(condyn::BodyId(1)).kinematics {
        b.set_velocity(Vec3::new(1.0, 0.0, 0.0), Vec3::zeros());
    }
    let surf = surfaces(0.6, 0.0);
    let gravity = Vec3::new(0.0, 0.0, -10.0);
    let mut solver = GaussSeidel::new(GaussSeidelParams::default().with_epsilon(1e-8));

    let e0 = total_energy(&reg);
    let kin0: f64 = reg.iter().map(|(_, b)| b.kinetic_energy()).sum();
    let mut prev = e0;
    for _ in 0..100 {
        for (_, body) in reg.iter_mut() {
            body.step_begin(H, gravity, false);
        }
        let found = condyn::detect::detect(&reg, &surf, 1e-3).unwrap();
        let mut ldy = assemble(&reg, found.contacts, H, true).unwrap();
        solver.solve(&mut ldy, None, &mut NullMonitor).unwrap();
        ldy.apply_reactions(&mut reg);
        for (_, body) in reg.iter_mut() {
            body.step_end(H, false);
        }

        let e = total_energy(&reg);
        assert!(
            e <= prev * (1.0 + 1e-9) + 1e-9,
            "total energy grew: {e} after {prev}"
        );
        prev = e;
    }

    // mu g t of deceleration over 0.1 s takes most of the initial speed.
    let kinetic: f64 = reg.iter().map(|(_, b)| b.kinetic_energy()).sum();
    assert!(
        kinetic < 0.25 * kin0,
        "too little dissipation: {kinetic} of {kin0}"
    );
}
