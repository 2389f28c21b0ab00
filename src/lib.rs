#![doc = include_str!("../README.md")]

/// The bread-and-butter, shrink-wrapped and ready to use
pub mod prelude {
    pub use crate::Error;
    pub use crate::authority::AuthorityCache;
    pub use crate::cs::{Axis, AxisDirection, CoordinateSystem, Unit};
    pub use crate::ellipsoid::Ellipsoid;
    pub use crate::fit::{Fit, Fitter};
    pub use crate::grid::{GridCache, ShiftGrid};
    pub use crate::matrix::Matrix;
    pub use crate::pipeline::PipelineBuilder;
    pub use crate::transform::{LinearTransform, Transform};
}

/// Extended prelude for authoring transforms, kernels and back-ends
pub mod authoring {
    pub use crate::prelude::*;

    pub use crate::authority::{AccessSession, FinderConfig, ObjectKind, SessionProvider};
    pub use crate::authority::{SearchDomain, SearchTarget, SharedObject};
    pub use crate::authority::{SessionLease, SessionPool, TIMEOUT_RESOLUTION};
    pub use crate::transform::{Concatenated, PassThrough};
    pub use crate::diagnostic::{Diagnostic, Severity, Warnings};
    pub use crate::fit::Linearizer;
    pub use crate::grid::{GridData, GridGeometry, GridKey, GridShift};
    pub use crate::math::angular;
    pub use crate::math::rational::Rational;
    pub use crate::matrix::Coefficient;
    pub use crate::pipeline::{GeocentricRadius, ParameterDescriptor, ParameterGroup};
    pub use crate::pipeline::{ParameterValue, ELLIPSOID_PARAMETERS};
    pub use crate::transform::factory;

    // External material
    pub use log::debug;
    pub use log::error;
    pub use log::info;
    pub use log::trace;
    pub use log::warn;
    pub use std::collections::BTreeMap;
    pub use std::sync::Arc;
}

use thiserror::Error;
/// The *graticule* error messaging enumeration
#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o error")]
    Io(#[from] std::io::Error),

    #[error("General error: '{0}'")]
    General(&'static str),

    #[error("Invalid: {0}")]
    Invalid(String),

    #[error("'{0}' cannot be modified")]
    Unmodifiable(&'static str),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Missing data: {0}")]
    MissingData(String),

    #[error("Resource '{0}' not found")]
    MissingResource(String),

    #[error("Linearization failed: all {} candidates raised errors", .0.len())]
    CannotLinearize(Vec<Error>),

    #[error("Temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("{message}")]
    Factory {
        message: String,
        warnings: Vec<crate::diagnostic::Diagnostic>,
    },

    #[error("Attempt to invert a non-invertible item: '{0}'")]
    NonInvertible(String),

    #[error("Internal invariant violated: {0}")]
    Internal(&'static str),
}

mod authority;
mod cs;
mod diagnostic;
mod ellipsoid;
mod fit;
mod grid;
mod math;
mod matrix;
mod pipeline;
mod transform;

/// Some generic material for test composition
#[cfg(test)]
mod test_data {
    use crate::matrix::Matrix;
    use crate::transform::Transform;
    use crate::Error;
    use std::sync::Arc;

    /// A spherical Mercator kernel: (λ, φ) in radians to unit-sphere (x, y).
    /// Nonlinear in the second coordinate, which makes it a usable stand-in
    /// for testing linearizer selection and pipeline assembly.
    #[derive(Debug)]
    pub struct SphericalMercator;

    impl Transform for SphericalMercator {
        fn source_dimensions(&self) -> usize {
            2
        }

        fn target_dimensions(&self) -> usize {
            2
        }

        fn transform_slice(&self, src: &[f64], dst: &mut [f64]) -> Result<usize, Error> {
            let n = src.len() / 2;
            for i in 0..n {
                dst[2 * i] = src[2 * i];
                dst[2 * i + 1] = src[2 * i + 1].tan().asinh();
            }
            Ok(n)
        }

        fn derivative(&self, at: &[f64]) -> Result<Matrix, Error> {
            let mut d = Matrix::zero(2, 2);
            d.set(0, 0, 1.);
            d.set(1, 1, 1. / at[1].cos());
            Ok(d)
        }

        fn inverted(&self) -> Result<Arc<dyn Transform>, Error> {
            Ok(Arc::new(SphericalMercatorInverse))
        }
    }

    #[derive(Debug)]
    pub struct SphericalMercatorInverse;

    impl Transform for SphericalMercatorInverse {
        fn source_dimensions(&self) -> usize {
            2
        }

        fn target_dimensions(&self) -> usize {
            2
        }

        fn transform_slice(&self, src: &[f64], dst: &mut [f64]) -> Result<usize, Error> {
            let n = src.len() / 2;
            for i in 0..n {
                dst[2 * i] = src[2 * i];
                dst[2 * i + 1] = src[2 * i + 1].sinh().atan();
            }
            Ok(n)
        }

        fn derivative(&self, at: &[f64]) -> Result<Matrix, Error> {
            let mut d = Matrix::zero(2, 2);
            d.set(0, 0, 1.);
            d.set(1, 1, 1. / at[1].cosh());
            Ok(d)
        }

        fn inverted(&self) -> Result<Arc<dyn Transform>, Error> {
            Ok(Arc::new(SphericalMercator))
        }
    }
}
