//! Bulk and surface material definitions.
//!
//! Bulk materials parameterize the constitutive response of deformable body
//! kinds and the inertia of every kind; surface materials parameterize the
//! contact law between pairs of surfaces.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstitutiveModel {
    Kirchhoff,
}

/// Volumetric material shared by bodies through an `Arc`.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BulkMaterial {
    pub model: ConstitutiveModel,
    pub young: f64,
    pub poisson: f64,
    pub density: f64,
}

impl BulkMaterial {
    pub fn new(young: f64, poisson: f64, density: f64) -> Self {
        BulkMaterial {
            model: ConstitutiveModel::Kirchhoff,
            young,
            poisson,
            density,
        }
    }

    pub fn validated(self) -> Result<Arc<Self>, Error> {
        if !(self.young > 0.0) {
            return Err(Error::InvalidParameter {
                name: "young".to_string(),
            });
        }
        if !(self.poisson > -1.0 && self.poisson < 0.5) {
            return Err(Error::InvalidParameter {
                name: "poisson".to_string(),
            });
        }
        if !(self.density > 0.0) {
            return Err(Error::InvalidParameter {
                name: "density".to_string(),
            });
        }
        Ok(Arc::new(self))
    }

    /// First Lamé constant.
    pub fn lambda(&self) -> f64 {
        self.young * self.poisson / ((1.0 + self.poisson) * (1.0 - 2.0 * self.poisson))
    }

    /// Shear modulus.
    pub fn mu(&self) -> f64 {
        self.young / (2.0 * (1.0 + self.poisson))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactModel {
    SignoriniCoulomb,
}

/// Contact-law parameters for a pair of surfaces.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SurfaceMaterial {
    pub model: ContactModel,
    pub friction: f64,
    pub restitution: f64,
}

impl Default for SurfaceMaterial {
    fn default() -> Self {
        SurfaceMaterial {
            model: ContactModel::SignoriniCoulomb,
            friction: 0.0,
            restitution: 0.0,
        }
    }
}

impl SurfaceMaterial {
    pub fn new(friction: f64, restitution: f64) -> Self {
        SurfaceMaterial {
            model: ContactModel::SignoriniCoulomb,
            friction,
            restitution,
        }
    }

    pub fn with_friction(mut self, friction: f64) -> Self {
        self.friction = friction;
        self
    }

    pub fn with_restitution(mut self, restitution: f64) -> Self {
        self.restitution = restitution;
        self
    }
}

/// Default surface material plus symmetric per-pair overrides.
#[derive(Clone, Debug, Default)]
pub struct SurfaceMaterialSet {
    default: SurfaceMaterial,
    pairs: ahash::AHashMap<(u32, u32), SurfaceMaterial>,
}

impl SurfaceMaterialSet {
    pub fn new(default: SurfaceMaterial) -> Self {
        SurfaceMaterialSet {
            default,
            pairs: ahash::AHashMap::new(),
        }
    }

    /// Registers a material for the unordered pair of surface tags.
    pub fn insert_pair(&mut self, a: u32, b: u32, mat: SurfaceMaterial) {
        self.pairs.insert((a.min(b), a.max(b)), mat);
    }

    pub fn lookup(&self, a: u32, b: u32) -> SurfaceMaterial {
        self.pairs
            .get(&(a.min(b), a.max(b)))
            .copied()
            .unwrap_or(self.default)
    }
}
