mod test_utils;

use condyn::BodyRegistry;
use rand::{Rng, SeedableRng};
use test_utils::*;

fn assert_same_contacts(a: &[condyn::Contact], b: &[condyn::Contact]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert_eq!(x.master, y.master);
        assert_eq!(x.slave, y.slave);
        assert_eq!(x.mfeat, y.mfeat);
        assert_eq!(x.sfeat, y.sfeat);
        assert_eq!(x.gap, y.gap);
        assert_eq!(x.point, y.point);
        assert_eq!(x.base, y.base);
    }
}

#[test]
fn detection_is_idempotent() {
    init_logger();
    let reg = cube_on_floor();
    let surf = surfaces(0.3, 0.0);
    let first = condyn::detect::detect(&reg, &surf, 1e-3).unwrap();
    let second = condyn::detect::detect(&reg, &surf, 1e-3).unwrap();
    assert!(!first.contacts.is_empty());
    assert_same_contacts(&first.contacts, &second.contacts);
}

#[test]
fn detection_output_is_sorted_and_deduplicated() {
    init_logger();
    let reg = cube_on_floor();
    let surf = surfaces(0.3, 0.0);
    let found = condyn::detect::detect(&reg, &surf, 1e-3).unwrap();
    let keys: Vec<_> = found
        .contacts
        .iter()
        .map(|c| (c.master, c.slave, c.sfeat))
        .collect();
    let mut sorted = keys.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(keys, sorted);
}

/// Scatter cubes at random over the floor; every run over the same scene
/// must produce the identical contact set, and every kept contact must
/// respect the sparsification margin.
#[test]
fn randomized_scenes_detect_deterministically() {
    init_logger();
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    for _ in 0..5 {
        let mut reg = BodyRegistry::new();
        reg.add(floor());
        for i in 0..12 {
            let x = rng.gen_range(-8.0..8.0);
            let y = rng.gen_range(-8.0..8.0);
            let z = rng.gen_range(-0.002..0.01);
            reg.add(unit_cube(&format!("cube-{i}"), Vec3::new(x, y, z)));
        }
        let surf = surfaces(0.3, 0.0);
        let margin = 1e-3;
        let first = condyn::detect::detect(&reg, &surf, margin).unwrap();
        let second = condyn::detect::detect(&reg, &surf, margin).unwrap();
        assert_same_contacts(&first.contacts, &second.contacts);
        for c in &first.contacts {
            assert!(c.gap <= margin + 1e-12, "kept contact above margin: {}", c.gap);
        }
    }
}
