use std::sync::Arc;

use condyn::{
    Body, BodyRegistry, BulkMaterial, ConvexPolyhedron, RigidScheme, SurfaceMaterial,
    SurfaceMaterialSet,
};

pub type Vec3 = na::Vector3<f64>;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[allow(dead_code)]
pub fn bulk() -> Arc<BulkMaterial> {
    BulkMaterial::new(1.0e9, 0.25, 1.0e3).validated().unwrap()
}

pub fn floor() -> Body {
    Body::obstacle(
        "floor",
        ConvexPolyhedron::cuboid(Vec3::new(-20.0, -20.0, -1.0), Vec3::new(20.0, 20.0, 0.0)),
        0,
    )
}

/// Unit cube (mass 1000 kg) with its minimum corner at `min`.
#[allow(dead_code)]
pub fn unit_cube(label: &str, min: Vec3) -> Body {
    Body::rigid(
        label,
        ConvexPolyhedron::cuboid(min, min + Vec3::repeat(1.0)),
        bulk(),
        0,
        RigidScheme::Stabilized,
    )
    .unwrap()
}

/// Floor plus one unit cube resting on it at the origin.
#[allow(dead_code)]
pub fn cube_on_floor() -> BodyRegistry {
    let mut reg = BodyRegistry::new();
    reg.add(floor());
    reg.add(unit_cube("cube", Vec3::new(-0.5, -0.5, 0.0)));
    reg
}

#[allow(dead_code)]
pub fn surfaces(friction: f64, restitution: f64) -> SurfaceMaterialSet {
    SurfaceMaterialSet::new(SurfaceMaterial::new(friction, restitution))
}
