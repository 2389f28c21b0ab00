//! Composite transforms: sequential concatenation, and pass-through
//! embedding of a transform into a higher-dimensional space.

use super::{factory, Transform};
use crate::matrix::Matrix;
use crate::Error;
use std::sync::Arc;

// ----- C O N C A T E N A T I O N -----------------------------------------------------

/// The composition `second ∘ first`. Built by [factory::concatenate],
/// which first tries to merge the operands into a single linear step.
#[derive(Debug)]
pub struct Concatenated {
    first: Arc<dyn Transform>,
    second: Arc<dyn Transform>,
}

impl Concatenated {
    pub fn new(first: Arc<dyn Transform>, second: Arc<dyn Transform>) -> Concatenated {
        Concatenated { first, second }
    }
}

impl Transform for Concatenated {
    fn source_dimensions(&self) -> usize {
        self.first.source_dimensions()
    }

    fn target_dimensions(&self) -> usize {
        self.second.target_dimensions()
    }

    fn transform_slice(&self, src: &[f64], dst: &mut [f64]) -> Result<usize, Error> {
        let sd = self.first.source_dimensions();
        if sd == 0 || src.len() % sd != 0 {
            return Err(Error::DimensionMismatch(format!(
                "{} values do not pack into {sd}D points",
                src.len()
            )));
        }
        let n = src.len() / sd;
        let mut mid = vec![0.; n * self.first.target_dimensions()];
        self.first.transform_slice(src, &mut mid)?;
        self.second.transform_slice(&mid, dst)
    }

    fn derivative(&self, at: &[f64]) -> Result<Matrix, Error> {
        // Chain rule, evaluated at the intermediate point
        let d1 = self.first.derivative(at)?;
        let mut mid = vec![0.; self.first.target_dimensions()];
        self.first.transform_slice(at, &mut mid)?;
        let d2 = self.second.derivative(&mid)?;
        d2.multiply(&d1)
    }

    fn inverted(&self) -> Result<Arc<dyn Transform>, Error> {
        factory::concatenate(self.second.inverted()?, self.first.inverted()?)
    }
}

// ----- P A S S - T H R O U G H -------------------------------------------------------

/// A transform applying `sub` to a contiguous block of coordinates and
/// leaving `lead` leading and `trail` trailing coordinates untouched.
/// Built by [factory::pass_through], which embeds linear sub-transforms
/// directly into a matrix instead.
#[derive(Debug)]
pub struct PassThrough {
    lead: usize,
    sub: Arc<dyn Transform>,
    trail: usize,
}

impl PassThrough {
    pub fn new(lead: usize, sub: Arc<dyn Transform>, trail: usize) -> PassThrough {
        PassThrough { lead, sub, trail }
    }
}

impl Transform for PassThrough {
    fn source_dimensions(&self) -> usize {
        self.lead + self.sub.source_dimensions() + self.trail
    }

    fn target_dimensions(&self) -> usize {
        self.lead + self.sub.target_dimensions() + self.trail
    }

    fn transform_slice(&self, src: &[f64], dst: &mut [f64]) -> Result<usize, Error> {
        let sd = self.source_dimensions();
        let td = self.target_dimensions();
        if src.len() % sd != 0 {
            return Err(Error::DimensionMismatch(format!(
                "{} values do not pack into {sd}D points",
                src.len()
            )));
        }
        let n = src.len() / sd;
        if dst.len() != n * td {
            return Err(Error::DimensionMismatch(format!(
                "{n} points need {} output values, got {}",
                n * td,
                dst.len()
            )));
        }
        let sub_src = self.sub.source_dimensions();
        let sub_dst = self.sub.target_dimensions();
        for i in 0..n {
            let s = &src[i * sd..(i + 1) * sd];
            let d = &mut dst[i * td..(i + 1) * td];
            d[..self.lead].copy_from_slice(&s[..self.lead]);
            self.sub.transform_slice(
                &s[self.lead..self.lead + sub_src],
                &mut d[self.lead..self.lead + sub_dst],
            )?;
            d[self.lead + sub_dst..].copy_from_slice(&s[self.lead + sub_src..]);
        }
        Ok(n)
    }

    fn derivative(&self, at: &[f64]) -> Result<Matrix, Error> {
        let sub_src = self.sub.source_dimensions();
        let sub_d = self
            .sub
            .derivative(&at[self.lead..self.lead + sub_src])?;
        let mut d = Matrix::zero(self.target_dimensions(), self.source_dimensions());
        for i in 0..self.lead {
            d.set(i, i, 1.);
        }
        for i in 0..sub_d.rows() {
            for j in 0..sub_d.cols() {
                d.set_coefficient(self.lead + i, self.lead + j, sub_d.get_or_null(i, j));
            }
        }
        for i in 0..self.trail {
            d.set(
                self.lead + self.sub.target_dimensions() + i,
                self.lead + sub_src + i,
                1.,
            );
        }
        Ok(d)
    }

    fn inverted(&self) -> Result<Arc<dyn Transform>, Error> {
        factory::pass_through(self.lead, self.sub.inverted()?, self.trail)
    }
}

// ----- T E S T S ------------------------------------------------------------------
