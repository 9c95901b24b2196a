mod test_utils;

use ahash::AHashMap;
use approx::assert_relative_eq;
use condyn::assembly::assemble;
use condyn::{
    Body, BodyId, BodyRegistry, ContactSolver, ConvexPolyhedron, DomainSet, GaussSeidel,
    GaussSeidelParams, LocalDynamics, NullMonitor, RigidScheme,
};
use test_utils::*;

const H: f64 = 1e-3;

fn cube(label: &str, min: Vec3, size: f64) -> Body {
    Body::rigid(
        label,
        ConvexPolyhedron::cuboid(min, min + Vec3::repeat(size)),
        bulk(),
        0,
        RigidScheme::Stabilized,
    )
    .unwrap()
}

/// A shrinking three-cube stack plus a lone cube. The middle cube's two
/// contact groups end up owned by different domains, so the partitioned
/// sweeps have to communicate across the cut.
fn stack_scene() -> BodyRegistry {
    let mut reg = BodyRegistry::new();
    reg.add(floor());
    reg.add(cube("base", Vec3::new(-0.5, -0.5, 0.0), 1.0));
    reg.add(cube("middle", Vec3::new(-0.4, -0.4, 1.0), 0.8));
    reg.add(cube("top", Vec3::new(-0.3, -0.3, 1.8), 0.6));
    reg.add(cube("lone", Vec3::new(2.5, -0.5, 0.0), 1.0));
    reg
}

fn stack_dynamics(reg: &mut BodyRegistry) -> LocalDynamics {
    for (_, body) in reg.iter_mut() {
        body.step_begin(H, Vec3::new(0.0, 0.0, -10.0), false);
    }
    let found = condyn::detect::detect(reg, &surfaces(0.4, 0.0), 1e-3).unwrap();
    assemble(reg, found.contacts, H, true).unwrap()
}

struct Solved {
    /// Normal reaction summed per slave body; unique by force balance even
    /// where the corner-wise split is indeterminate.
    support: AHashMap<BodyId, f64>,
    /// Local velocity per contact feature; the primal solution is unique.
    velocities: AHashMap<(BodyId, BodyId, u32, u32), na::Vector3<f64>>,
}

fn solve_with_domains(domains: usize) -> Solved {
    let mut reg = stack_scene();
    let mut ldy = stack_dynamics(&mut reg);
    let set = if domains > 1 {
        Some(DomainSet::partition(&reg, &mut ldy, domains).unwrap())
    } else {
        None
    };
    let mut solver = GaussSeidel::new(GaussSeidelParams::default().with_epsilon(1e-10));
    solver
        .solve(&mut ldy, set.as_ref(), &mut NullMonitor)
        .unwrap();

    let mut support: AHashMap<BodyId, f64> = AHashMap::new();
    let mut velocities = AHashMap::new();
    for d in &ldy.blocks {
        *support.entry(d.contact.slave).or_default() += d.r.z;
        velocities.insert(
            (d.contact.master, d.contact.slave, d.contact.mfeat, d.contact.sfeat),
            d.u,
        );
    }
    Solved {
        support,
        velocities,
    }
}

#[test]
fn solution_is_invariant_under_partitioning() {
    init_logger();
    let serial = solve_with_domains(1);
    assert!(!serial.velocities.is_empty());

    // Each body's support carries everything stacked above it.
    let expected = [
        (BodyId(1), (1000.0 + 512.0 + 216.0) * 10.0),
        (BodyId(2), (512.0 + 216.0) * 10.0),
        (BodyId(3), 216.0 * 10.0),
        (BodyId(4), 1000.0 * 10.0),
    ];
    for (body, weight) in expected {
        assert_relative_eq!(
            serial.support[&body],
            weight,
            max_relative = 1e-6
        );
    }

    for domains in [2, 4] {
        let split = solve_with_domains(domains);
        assert_eq!(
            split.velocities.len(),
            serial.velocities.len(),
            "{domains} domains changed the contact set"
        );
        for (body, total) in &serial.support {
            let other = split.support.get(body).copied().unwrap_or(0.0);
            assert_relative_eq!(*total, other, epsilon = 1e-3, max_relative = 1e-5);
        }
        for (key, u) in &serial.velocities {
            let other = split
                .velocities
                .get(key)
                .unwrap_or_else(|| panic!("{domains} domains dropped contact {key:?}"));
            assert_relative_eq!(u, other, epsilon = 1e-6);
        }
    }
}
