//! Transform representation: the `Transform` trait implemented by every
//! coordinate operation in the crate, the linear/projective workhorse
//! with its specialized fast paths, and the factory functions used to
//! compose transforms into pipelines.

mod concat;
mod linear;

pub use concat::{Concatenated, PassThrough};
pub use linear::{IterationStrategy, LinearTransform};

use crate::matrix::Matrix;
use crate::Error;
use std::fmt::Debug;
use std::sync::Arc;

// ----- T H E   T R A N S F O R M   T R A I T -----------------------------------------

/// A coordinate operation from `source_dimensions()`-tuples to
/// `target_dimensions()`-tuples, applied to packed slices of points.
/// Implementations are immutable and thread-safe once published.
pub trait Transform: Debug + Send + Sync {
    fn source_dimensions(&self) -> usize;
    fn target_dimensions(&self) -> usize;

    /// Transform all points in `src` (packed, fastest-varying dimension
    /// first) into `dst`. Returns the number of points transformed.
    fn transform_slice(&self, src: &[f64], dst: &mut [f64]) -> Result<usize, Error>;

    /// Single-precision variant. The default widens to double, transforms,
    /// and narrows once, so results agree with the double-precision path
    /// to within one ULP of the single-precision value.
    fn transform_slice_f32(&self, src: &[f32], dst: &mut [f32]) -> Result<usize, Error> {
        let wide: Vec<f64> = src.iter().map(|v| *v as f64).collect();
        let mut out = vec![0.; dst.len()];
        let n = self.transform_slice(&wide, &mut out)?;
        for (d, v) in dst.iter_mut().zip(out) {
            *d = v as f32;
        }
        Ok(n)
    }

    /// Mixed-precision variant: single-precision input, double-precision
    /// output.
    fn transform_f32_to_f64(&self, src: &[f32], dst: &mut [f64]) -> Result<usize, Error> {
        let wide: Vec<f64> = src.iter().map(|v| *v as f64).collect();
        self.transform_slice(&wide, dst)
    }

    /// Mixed-precision variant: double-precision input, single-precision
    /// output.
    fn transform_f64_to_f32(&self, src: &[f64], dst: &mut [f32]) -> Result<usize, Error> {
        let mut out = vec![0.; dst.len()];
        let n = self.transform_slice(src, &mut out)?;
        for (d, v) in dst.iter_mut().zip(out) {
            *d = v as f32;
        }
        Ok(n)
    }

    /// The Jacobian at `at`, as a `target_dimensions() × source_dimensions()`
    /// matrix. Constant for affine transforms, point-dependent for
    /// projective and nonlinear ones.
    fn derivative(&self, at: &[f64]) -> Result<Matrix, Error>;

    /// The inverse operation, where one exists.
    fn inverted(&self) -> Result<Arc<dyn Transform>, Error> {
        Err(Error::NonInvertible(format!("{self:?}")))
    }

    /// True for transforms known to be the identity.
    fn is_identity(&self) -> bool {
        false
    }

    /// The homogeneous matrix of this transform, if it is linear.
    /// Composition uses this to merge adjacent linear steps into one.
    fn linear_matrix(&self) -> Option<&Matrix> {
        None
    }
}

// ----- T H E   T R A N S F O R M   F A C T O R Y -------------------------------------

/// Constructors for the transform types of this crate. Every constructor
/// returns the narrowest representation it can: concatenating two linear
/// steps yields a single linear step, a pass-through around a linear
/// step is itself linear, and identity factors are elided.
pub mod factory {
    use super::*;

    /// An affine or projective transform for a homogeneous
    /// `(target+1) × (source+1)` matrix.
    pub fn affine(matrix: Matrix) -> Result<Arc<dyn Transform>, Error> {
        Ok(Arc::new(LinearTransform::new(matrix)?))
    }

    /// A transform adding a constant vector.
    pub fn translation(offsets: &[f64]) -> Result<Arc<dyn Transform>, Error> {
        let n = offsets.len();
        let mut matrix = Matrix::identity(n + 1);
        for (i, t) in offsets.iter().enumerate() {
            matrix.set(i, n, *t);
        }
        affine(matrix)
    }

    /// A transform scaling each coordinate by a constant factor.
    pub fn scale(factors: &[f64]) -> Result<Arc<dyn Transform>, Error> {
        let n = factors.len();
        let mut matrix = Matrix::identity(n + 1);
        for (i, f) in factors.iter().enumerate() {
            matrix.set(i, i, *f);
        }
        affine(matrix)
    }

    /// The concatenation `second ∘ first`: apply `first`, then `second`.
    pub fn concatenate(
        first: Arc<dyn Transform>,
        second: Arc<dyn Transform>,
    ) -> Result<Arc<dyn Transform>, Error> {
        if first.target_dimensions() != second.source_dimensions() {
            return Err(Error::DimensionMismatch(format!(
                "cannot concatenate {}D output with {}D input",
                first.target_dimensions(),
                second.source_dimensions()
            )));
        }
        if first.is_identity() {
            return Ok(second);
        }
        if second.is_identity() {
            return Ok(first);
        }
        // Two linear steps merge into their matrix product
        if let (Some(a), Some(b)) = (first.linear_matrix(), second.linear_matrix()) {
            return affine(b.multiply(a)?);
        }
        Ok(Arc::new(Concatenated::new(first, second)))
    }

    /// A transform applying `sub` to the dimensions
    /// `[lead, lead + sub.source_dimensions())` and passing the `lead`
    /// leading and `trail` trailing dimensions through unchanged.
    pub fn pass_through(
        lead: usize,
        sub: Arc<dyn Transform>,
        trail: usize,
    ) -> Result<Arc<dyn Transform>, Error> {
        if lead == 0 && trail == 0 {
            return Ok(sub);
        }
        // An affine sub-transform embeds as a block of the larger matrix
        if let Some(m) = sub.linear_matrix().filter(|m| m.is_affine()) {
            let src = lead + sub.source_dimensions() + trail;
            let dst = lead + sub.target_dimensions() + trail;
            let mut embedded = Matrix::zero(dst + 1, src + 1);
            for i in 0..lead {
                embedded.set(i, i, 1.);
            }
            for i in 0..sub.target_dimensions() {
                for j in 0..sub.source_dimensions() {
                    embedded.set_coefficient(lead + i, lead + j, m.get_or_null(i, j));
                }
                embedded.set_coefficient(
                    lead + i,
                    src,
                    m.get_or_null(i, sub.source_dimensions()),
                );
            }
            for i in 0..trail {
                embedded.set(lead + sub.target_dimensions() + i, lead + sub.source_dimensions() + i, 1.);
            }
            embedded.set(dst, src, 1.);
            return affine(embedded);
        }
        Ok(Arc::new(PassThrough::new(lead, sub, trail)))
    }
}

// ----- T E S T S ------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factory_merges_linear_steps() -> Result<(), Error> {
        let a = factory::translation(&[1., 2.])?;
        let b = factory::scale(&[2., 2.])?;
        let c = factory::concatenate(a, b)?;

        // The merge produced a single linear step
        assert!(c.linear_matrix().is_some());

        let mut out = [0.; 2];
        c.transform_slice(&[1., 1.], &mut out)?;
        assert_eq!(out, [4., 6.]);
        Ok(())
    }

    #[test]
    fn factory_elides_identities() -> Result<(), Error> {
        let id = factory::affine(Matrix::identity(3))?;
        assert!(id.is_identity());
        let t = factory::translation(&[1., 1.])?;
        let c = factory::concatenate(id, t.clone())?;
        assert!(Arc::ptr_eq(&c, &t));
        Ok(())
    }

    #[test]
    fn pass_through_embeds_linear_blocks() -> Result<(), Error> {
        let sub = factory::scale(&[3.])?;
        let wrapped = factory::pass_through(1, sub, 1)?;
        assert!(wrapped.linear_matrix().is_some());
        assert_eq!(wrapped.source_dimensions(), 3);

        let mut out = [0.; 3];
        wrapped.transform_slice(&[5., 7., 11.], &mut out)?;
        assert_eq!(out, [5., 21., 11.]);
        Ok(())
    }

    #[test]
    fn mixed_precision_defaults() -> Result<(), Error> {
        let t = factory::scale(&[2., 0.5])?;
        let mut narrow = [0_f32; 2];
        t.transform_slice_f32(&[1.5, 8.], &mut narrow)?;
        assert_eq!(narrow, [3., 4.]);

        let mut wide = [0_f64; 2];
        t.transform_f32_to_f64(&[1.5, 8.], &mut wide)?;
        assert_eq!(wide, [3., 4.]);
        Ok(())
    }
}
