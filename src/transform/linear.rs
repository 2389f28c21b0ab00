//! Linear and projective transforms, with specialized fast paths picked
//! at construction time from the structure of the homogeneous matrix.

use super::Transform;
use crate::matrix::Matrix;
use crate::Error;
use std::sync::Arc;

// ----- I T E R A T I O N   S T R A T E G Y -------------------------------------------

/// How to iterate when source and destination share one buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationStrategy {
    /// Forward iteration never overwrites unread source values.
    Ascending,
    /// Backward iteration never overwrites unread source values.
    Descending,
    /// Overlap is unresolvable by ordering; copy the source region first.
    BufferSource,
}

impl IterationStrategy {
    /// Pick a strategy for transforming `n` points of `src_dim`
    /// coordinates starting at `src_off` into points of `dst_dim`
    /// coordinates starting at `dst_off`, all within one buffer.
    pub fn suggest(
        src_off: usize,
        src_dim: usize,
        dst_off: usize,
        dst_dim: usize,
        n: usize,
    ) -> IterationStrategy {
        let src_end = src_off + n * src_dim;
        let dst_end = dst_off + n * dst_dim;
        if dst_end <= src_off || src_end <= dst_off {
            return IterationStrategy::Ascending;
        }
        if dst_off <= src_off && dst_dim <= src_dim {
            return IterationStrategy::Ascending;
        }
        if dst_off >= src_off && dst_dim >= src_dim {
            return IterationStrategy::Descending;
        }
        IterationStrategy::BufferSource
    }
}

// ----- T H E   L I N E A R   T R A N S F O R M ---------------------------------------

// The shape-specialized evaluation paths. The translation, scale and
// denominator vectors are precomputed at construction time.
#[derive(Debug, Clone)]
enum Kind {
    Identity,
    Translation(Vec<f64>),
    Scale(Vec<f64>),
    Projective {
        // Row-major scaled elements of the full homogeneous matrix
        elements: Vec<f64>,
        // One denominator per row: the extra column of the fast layout
        denominators: Vec<f64>,
        affine: bool,
    },
}

/// A transform defined by a homogeneous `(target+1) × (source+1)` matrix
/// of extended-precision coefficients.
#[derive(Debug, Clone)]
pub struct LinearTransform {
    matrix: Matrix,
    kind: Kind,
    src_dim: usize,
    dst_dim: usize,
}

impl LinearTransform {
    pub fn new(matrix: Matrix) -> Result<LinearTransform, Error> {
        if matrix.rows() < 2 || matrix.cols() < 2 {
            return Err(Error::Invalid(format!(
                "a homogeneous matrix needs at least 2 rows and columns, got {}x{}",
                matrix.rows(),
                matrix.cols()
            )));
        }
        Ok(Self::classified(matrix))
    }

    /// Re-derive the narrowest evaluation path for the current matrix.
    /// Idempotent: the constructor already picks the narrowest path.
    pub fn optimize(self) -> LinearTransform {
        Self::classified(self.matrix)
    }

    pub fn matrix(&self) -> &Matrix {
        &self.matrix
    }

    fn classified(matrix: Matrix) -> LinearTransform {
        let dst_dim = matrix.rows() - 1;
        let src_dim = matrix.cols() - 1;
        let kind = Self::classify(&matrix, src_dim, dst_dim);
        LinearTransform {
            matrix,
            kind,
            src_dim,
            dst_dim,
        }
    }

    fn classify(matrix: &Matrix, src_dim: usize, dst_dim: usize) -> Kind {
        if matrix.is_identity() {
            return Kind::Identity;
        }
        if matrix.is_affine() {
            if matrix.is_square() && Self::has_unit_diagonal_block(matrix, dst_dim) {
                let translation = (0..dst_dim).map(|i| matrix.get(i, src_dim)).collect();
                return Kind::Translation(translation);
            }
            if Self::is_diagonal_block(matrix, src_dim, dst_dim)
                && (0..dst_dim).all(|i| matrix.get_or_null(i, src_dim).is_none())
            {
                let factors = (0..dst_dim)
                    .map(|i| if i < src_dim { matrix.get(i, i) } else { 0. })
                    .collect();
                return Kind::Scale(factors);
            }
        }
        let (elements, denominators) = matrix.scaled_rows();
        Kind::Projective {
            elements,
            denominators,
            affine: matrix.is_affine(),
        }
    }

    // Unit diagonal, zeros everywhere else but the last column
    fn has_unit_diagonal_block(matrix: &Matrix, dim: usize) -> bool {
        for i in 0..dim {
            for j in 0..dim {
                let expected = if i == j { 1. } else { 0. };
                if matrix.get(i, j) != expected {
                    return false;
                }
            }
        }
        true
    }

    // Zeros everywhere in the linear block except on the diagonal
    fn is_diagonal_block(matrix: &Matrix, src_dim: usize, dst_dim: usize) -> bool {
        for i in 0..dst_dim {
            for j in 0..src_dim {
                if i != j && matrix.get_or_null(i, j).is_some() {
                    return false;
                }
            }
        }
        true
    }

    // The per-point work horse. `src` and `dst` must not overlap.
    fn apply_one(&self, src: &[f64], dst: &mut [f64]) {
        match &self.kind {
            Kind::Identity => dst.copy_from_slice(src),
            Kind::Translation(t) => {
                for i in 0..self.dst_dim {
                    dst[i] = src[i] + t[i];
                }
            }
            Kind::Scale(s) => {
                for i in 0..self.dst_dim {
                    dst[i] = if i < self.src_dim { src[i] * s[i] } else { 0. };
                }
            }
            Kind::Projective {
                elements,
                denominators,
                affine,
            } => {
                let cols = self.src_dim + 1;
                let w = if *affine {
                    1.
                } else {
                    let row = self.dst_dim;
                    let mut sum = elements[row * cols + self.src_dim];
                    for j in 0..self.src_dim {
                        let e = elements[row * cols + j];
                        // Skipping exact zeros keeps NaN in excluded input
                        // dimensions from contaminating the output
                        if e != 0. {
                            sum += e * src[j];
                        }
                    }
                    sum / denominators[row]
                };
                for i in 0..self.dst_dim {
                    let mut sum = elements[i * cols + self.src_dim];
                    for j in 0..self.src_dim {
                        let e = elements[i * cols + j];
                        if e != 0. {
                            sum += e * src[j];
                        }
                    }
                    dst[i] = sum / (w * denominators[i]);
                }
            }
        }
    }

    /// Transform `n` points within a single buffer, reading packed
    /// `src_dim`-tuples at `src_off` and writing packed `dst_dim`-tuples
    /// at `dst_off`. The iteration order is chosen so that no source
    /// value is overwritten before it has been read.
    pub fn transform_within(
        &self,
        buf: &mut [f64],
        src_off: usize,
        dst_off: usize,
        n: usize,
    ) -> Result<usize, Error> {
        let (sd, td) = (self.src_dim, self.dst_dim);
        if src_off + n * sd > buf.len() || dst_off + n * td > buf.len() {
            return Err(Error::DimensionMismatch(format!(
                "buffer of {} values cannot hold {n} points at offsets {src_off}/{dst_off}",
                buf.len()
            )));
        }
        let mut point = vec![0.; sd];
        match IterationStrategy::suggest(src_off, sd, dst_off, td, n) {
            IterationStrategy::Ascending => {
                for i in 0..n {
                    point.copy_from_slice(&buf[src_off + i * sd..src_off + (i + 1) * sd]);
                    self.apply_one(&point, &mut buf[dst_off + i * td..dst_off + (i + 1) * td]);
                }
            }
            IterationStrategy::Descending => {
                for i in (0..n).rev() {
                    point.copy_from_slice(&buf[src_off + i * sd..src_off + (i + 1) * sd]);
                    self.apply_one(&point, &mut buf[dst_off + i * td..dst_off + (i + 1) * td]);
                }
            }
            IterationStrategy::BufferSource => {
                let source = buf[src_off..src_off + n * sd].to_vec();
                for i in 0..n {
                    self.apply_one(
                        &source[i * sd..(i + 1) * sd],
                        &mut buf[dst_off + i * td..dst_off + (i + 1) * td],
                    );
                }
            }
        }
        Ok(n)
    }
}

impl Transform for LinearTransform {
    fn source_dimensions(&self) -> usize {
        self.src_dim
    }

    fn target_dimensions(&self) -> usize {
        self.dst_dim
    }

    fn transform_slice(&self, src: &[f64], dst: &mut [f64]) -> Result<usize, Error> {
        if src.len() % self.src_dim != 0 {
            return Err(Error::DimensionMismatch(format!(
                "{} values do not pack into {}D points",
                src.len(),
                self.src_dim
            )));
        }
        let n = src.len() / self.src_dim;
        if dst.len() != n * self.dst_dim {
            return Err(Error::DimensionMismatch(format!(
                "{n} points need {} output values, got {}",
                n * self.dst_dim,
                dst.len()
            )));
        }
        for i in 0..n {
            self.apply_one(
                &src[i * self.src_dim..(i + 1) * self.src_dim],
                &mut dst[i * self.dst_dim..(i + 1) * self.dst_dim],
            );
        }
        Ok(n)
    }

    fn derivative(&self, at: &[f64]) -> Result<Matrix, Error> {
        let mut d = Matrix::zero(self.dst_dim, self.src_dim);
        match &self.kind {
            Kind::Identity | Kind::Translation(_) => {
                for i in 0..self.dst_dim {
                    d.set(i, i, 1.);
                }
            }
            Kind::Scale(s) => {
                for i in 0..self.dst_dim.min(self.src_dim) {
                    d.set(i, i, s[i]);
                }
            }
            Kind::Projective {
                elements,
                denominators,
                affine,
            } => {
                let cols = self.src_dim + 1;
                if *affine {
                    for i in 0..self.dst_dim {
                        for j in 0..self.src_dim {
                            d.set_coefficient(i, j, self.matrix.get_or_null(i, j));
                        }
                    }
                } else {
                    if at.len() < self.src_dim {
                        return Err(Error::DimensionMismatch(format!(
                            "derivative needs a {}D point, got {} values",
                            self.src_dim,
                            at.len()
                        )));
                    }
                    // Quotient rule: y_i = u_i/w, so
                    // ∂y_i/∂x_k = (e_ik·w − u_i·m_k) / w²
                    let row = self.dst_dim;
                    let m = |j: usize| elements[row * cols + j] / denominators[row];
                    let mut w = m(self.src_dim);
                    for j in 0..self.src_dim {
                        w += m(j) * at[j];
                    }
                    for i in 0..self.dst_dim {
                        let e = |j: usize| elements[i * cols + j] / denominators[i];
                        let mut u = e(self.src_dim);
                        for j in 0..self.src_dim {
                            u += e(j) * at[j];
                        }
                        for k in 0..self.src_dim {
                            d.set(i, k, (e(k) * w - u * m(k)) / (w * w));
                        }
                    }
                }
            }
        }
        Ok(d)
    }

    fn inverted(&self) -> Result<Arc<dyn Transform>, Error> {
        Ok(Arc::new(Self::classified(self.matrix.inverted()?)))
    }

    fn is_identity(&self) -> bool {
        matches!(self.kind, Kind::Identity)
    }

    fn linear_matrix(&self) -> Option<&Matrix> {
        Some(&self.matrix)
    }
}

// ----- T E S T S ------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use float_eq::assert_float_eq;

    fn affine_2d(elements: &[f64; 9]) -> LinearTransform {
        LinearTransform::new(Matrix::from_elements(3, 3, elements).unwrap()).unwrap()
    }

    #[test]
    fn specialization() -> Result<(), Error> {
        let id = affine_2d(&[1., 0., 0., 0., 1., 0., 0., 0., 1.]);
        assert!(id.is_identity());

        let t = affine_2d(&[1., 0., 5., 0., 1., -2., 0., 0., 1.]);
        assert!(matches!(t.kind, Kind::Translation(_)));

        let s = affine_2d(&[2., 0., 0., 0., 3., 0., 0., 0., 1.]);
        assert!(matches!(s.kind, Kind::Scale(_)));

        let g = affine_2d(&[2., 0., 3., 0., 1., 1., 0., 0., 1.]);
        assert!(matches!(g.kind, Kind::Projective { affine: true, .. }));

        let p = affine_2d(&[1., 0., 0., 0., 1., 0., 0., 0.5, 1.]);
        assert!(matches!(p.kind, Kind::Projective { affine: false, .. }));
        Ok(())
    }

    #[test]
    fn optimize_is_idempotent() {
        let t = affine_2d(&[2., 0., 3., 0., 1., 1., 0., 0., 1.]);
        let once = t.clone().optimize();
        let twice = once.clone().optimize();
        assert_eq!(format!("{once:?}"), format!("{twice:?}"));
    }

    #[test]
    fn fast_paths_agree_with_the_matrix() -> Result<(), Error> {
        let transforms = [
            affine_2d(&[1., 0., 0., 0., 1., 0., 0., 0., 1.]),
            affine_2d(&[1., 0., 5., 0., 1., -2., 0., 0., 1.]),
            affine_2d(&[2., 0., 0., 0., 3., 0., 0., 0., 1.]),
            affine_2d(&[2., 0.5, 3., -1., 1., 1., 0., 0., 1.]),
        ];
        let src = [1.5, -2., 0.25, 8., 55., 12.];
        for t in &transforms {
            let mut fast = [0.; 6];
            t.transform_slice(&src, &mut fast)?;
            for p in 0..3 {
                for i in 0..2 {
                    let expected = t.matrix.get(i, 0) * src[2 * p]
                        + t.matrix.get(i, 1) * src[2 * p + 1]
                        + t.matrix.get(i, 2);
                    assert_float_eq!(fast[2 * p + i], expected, ulps <= 1);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn projective_divide() -> Result<(), Error> {
        // A projective matrix halving w for y = 2
        let p = affine_2d(&[1., 0., 0., 0., 1., 0., 0., 0.5, 1.]);
        let mut out = [0.; 2];
        p.transform_slice(&[4., 2.], &mut out)?;
        assert_eq!(out, [2., 1.]);
        Ok(())
    }

    #[test]
    fn rational_rows_divide_exactly() -> Result<(), Error> {
        // A row of thirds: evaluation at (1, 1, 1) must yield exactly 1
        let mut m = Matrix::zero(2, 4);
        m.set_rational(0, 0, 1, 3)?;
        m.set_rational(0, 1, 1, 3)?;
        m.set_rational(0, 2, 1, 3)?;
        m.set(1, 3, 1.);
        let t = LinearTransform::new(m)?;
        let mut out = [0.; 1];
        t.transform_slice(&[1., 1., 1.], &mut out)?;
        assert_eq!(out[0], 1.0);
        Ok(())
    }

    #[test]
    fn zero_elements_mask_nan() -> Result<(), Error> {
        // The second input dimension is excluded from both outputs, so a
        // NaN there must not propagate
        let t = affine_2d(&[2., 0., 1., 0., 0., 5., 0., 0., 1.]);
        let mut out = [0.; 2];
        t.transform_slice(&[3., f64::NAN], &mut out)?;
        assert_eq!(out, [7., 5.]);
        Ok(())
    }

    #[test]
    fn in_place_strategies() -> Result<(), Error> {
        let t = affine_2d(&[2., 0., 0., 0., 2., 0., 0., 0., 1.]);

        // Same offsets: ascending, in place
        let mut buf = [1., 2., 3., 4.];
        t.transform_within(&mut buf, 0, 0, 2)?;
        assert_eq!(buf, [2., 4., 6., 8.]);

        // Destination after source: descending
        let mut buf = [1., 2., 3., 4., 0., 0.];
        assert_eq!(
            IterationStrategy::suggest(0, 2, 2, 2, 2),
            IterationStrategy::Descending
        );
        t.transform_within(&mut buf, 0, 2, 2)?;
        assert_eq!(&buf[2..], &[2., 4., 6., 8.]);

        // Destination before source: ascending
        let mut buf = [0., 0., 1., 2., 3., 4.];
        t.transform_within(&mut buf, 2, 0, 2)?;
        assert_eq!(&buf[..4], &[2., 4., 6., 8.]);
        Ok(())
    }

    #[test]
    fn dimension_reducing_overlap_buffers_the_source() {
        // 1D → 2D starting at the same offset: neither order is safe
        assert_eq!(
            IterationStrategy::suggest(1, 1, 0, 2, 3),
            IterationStrategy::BufferSource
        );
    }

    #[test]
    fn derivative_shapes() -> Result<(), Error> {
        let g = affine_2d(&[2., 0., 3., 0., 1., 1., 0., 0., 1.]);
        let d = g.derivative(&[0., 0.])?;
        assert_eq!(d.get(0, 0), 2.);
        assert_eq!(d.get(1, 1), 1.);
        assert_eq!(d.get(0, 1), 0.);

        // Projective: derivative depends on the evaluation point
        let p = affine_2d(&[1., 0., 0., 0., 1., 0., 0., 0.5, 1.]);
        let d0 = p.derivative(&[0., 0.])?;
        let d2 = p.derivative(&[0., 2.])?;
        assert_eq!(d0.get(0, 0), 1.);
        assert_eq!(d2.get(0, 0), 0.5);
        Ok(())
    }

    #[test]
    fn inversion_round_trip() -> Result<(), Error> {
        let t = affine_2d(&[2., 0., 3., 0., 1., 1., 0., 0., 1.]);
        let inverse = Transform::inverted(&t)?;
        let mut mid = [0.; 2];
        let mut back = [0.; 2];
        t.transform_slice(&[55., 12.], &mut mid)?;
        inverse.transform_slice(&mid, &mut back)?;
        assert_float_eq!(back[0], 55., abs <= 1e-12);
        assert_float_eq!(back[1], 12., abs <= 1e-12);
        Ok(())
    }
}
