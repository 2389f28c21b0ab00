//! Matrices with extended-precision coefficients.
//!
//! Each element is either absent (an exact zero), an exact rational, or
//! a plain double. Keeping rationals through concatenation preserves
//! ratios that double precision cannot, e.g. three coefficients of 1/3
//! summing to exactly 1. A derived "scaled rows" representation feeds
//! the fast transform paths: per row, the non-zero elements are stored
//! as doubles premultiplied by a common denominator which is carried in
//! one extra column.

use crate::math::rational::Rational;
use crate::Error;
use std::fmt;

// ----- C O E F F I C I E N T S -------------------------------------------------------

/// A single non-zero matrix element. Exact zeros are represented by
/// the absence of a coefficient, never by `Rational(0)` or `Real(0.0)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Coefficient {
    Rational(Rational),
    Real(f64),
}

impl Coefficient {
    /// The double-precision value of this coefficient.
    pub fn as_f64(&self) -> f64 {
        match self {
            Coefficient::Rational(r) => r.as_f64(),
            Coefficient::Real(v) => *v,
        }
    }

    /// A coefficient for `value`, preferring the exact rational form.
    /// `None` represents an exact zero.
    pub fn from_f64(value: f64) -> Option<Coefficient> {
        if value == 0. {
            return None;
        }
        if let Some(r) = Rational::from_f64(value) {
            return Some(Coefficient::Rational(r));
        }
        Some(Coefficient::Real(value))
    }

    fn rational(&self) -> Option<Rational> {
        match self {
            Coefficient::Rational(r) => Some(*r),
            Coefficient::Real(_) => None,
        }
    }

    // Exact where both operands are rational and nothing overflows,
    // double precision otherwise.
    fn mul(&self, other: &Coefficient) -> Coefficient {
        if let (Some(a), Some(b)) = (self.rational(), other.rational()) {
            if let Some(product) = a.checked_mul(b) {
                return Coefficient::Rational(product);
            }
        }
        Coefficient::Real(self.as_f64() * other.as_f64())
    }

    fn add(&self, other: &Coefficient) -> Option<Coefficient> {
        if let (Some(a), Some(b)) = (self.rational(), other.rational()) {
            if let Some(sum) = a.checked_add(b) {
                if sum.is_zero() {
                    return None;
                }
                return Some(Coefficient::Rational(sum));
            }
        }
        let sum = self.as_f64() + other.as_f64();
        if sum == 0. {
            return None;
        }
        Some(Coefficient::Real(sum))
    }
}

impl fmt::Display for Coefficient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Coefficient::Rational(r) => write!(f, "{r}"),
            Coefficient::Real(v) => write!(f, "{v}"),
        }
    }
}

// ----- T H E   M A T R I X   T Y P E -------------------------------------------------

/// A dense row-major matrix of extended-precision coefficients.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    entries: Vec<Option<Coefficient>>,
}

impl Matrix {
    /// An all-zero matrix.
    pub fn zero(rows: usize, cols: usize) -> Matrix {
        Matrix {
            rows,
            cols,
            entries: vec![None; rows * cols],
        }
    }

    /// The identity matrix of order `n`.
    pub fn identity(n: usize) -> Matrix {
        let mut m = Matrix::zero(n, n);
        for i in 0..n {
            m.entries[i * n + i] = Some(Coefficient::Rational(Rational::integer(1)));
        }
        m
    }

    /// A matrix filled from a row-major slice of doubles.
    pub fn from_elements(rows: usize, cols: usize, elements: &[f64]) -> Result<Matrix, Error> {
        if elements.len() != rows * cols {
            return Err(Error::Invalid(format!(
                "{} elements cannot fill a {rows}x{cols} matrix",
                elements.len()
            )));
        }
        let entries = elements.iter().map(|v| Coefficient::from_f64(*v)).collect();
        Ok(Matrix {
            rows,
            cols,
            entries,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// The element at (i, j) in double precision. Exact zeros read as 0.
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.entries[i * self.cols + j].map_or(0., |c| c.as_f64())
    }

    /// The element at (i, j), or `None` for an exact zero.
    pub fn get_or_null(&self, i: usize, j: usize) -> Option<Coefficient> {
        self.entries[i * self.cols + j]
    }

    /// A writable copy of all coefficients, row-major.
    pub fn coefficients(&self) -> Vec<Option<Coefficient>> {
        self.entries.clone()
    }

    /// Set the element at (i, j). A value of 0 erases the coefficient.
    pub fn set(&mut self, i: usize, j: usize, value: f64) {
        self.entries[i * self.cols + j] = Coefficient::from_f64(value);
    }

    /// Set the element at (i, j) to the exact ratio `num/den`.
    pub fn set_rational(&mut self, i: usize, j: usize, num: i64, den: i64) -> Result<(), Error> {
        let r = Rational::new(num, den)
            .ok_or_else(|| Error::Invalid(format!("bad ratio {num}/{den}")))?;
        self.entries[i * self.cols + j] = if r.is_zero() {
            None
        } else {
            Some(Coefficient::Rational(r))
        };
        Ok(())
    }

    /// Set the element at (i, j) to a given coefficient (or exact zero).
    pub fn set_coefficient(&mut self, i: usize, j: usize, value: Option<Coefficient>) {
        // Normalize: zeros are always stored as absence
        self.entries[i * self.cols + j] = match value {
            Some(c) if c.as_f64() == 0. => None,
            other => other,
        };
    }

    pub fn is_square(&self) -> bool {
        self.rows == self.cols
    }

    pub fn is_identity(&self) -> bool {
        if !self.is_square() {
            return false;
        }
        for i in 0..self.rows {
            for j in 0..self.cols {
                let expected = if i == j { 1. } else { 0. };
                if self.get(i, j) != expected {
                    return false;
                }
            }
        }
        true
    }

    /// True if the last row is `[0 … 0 1]`, i.e. the matrix maps
    /// affinely without a projective divide.
    pub fn is_affine(&self) -> bool {
        let last = self.rows - 1;
        for j in 0..self.cols - 1 {
            if self.entries[last * self.cols + j].is_some() {
                return false;
            }
        }
        self.get(last, self.cols - 1) == 1.
    }

    /// The matrix product `self · other`.
    pub fn multiply(&self, other: &Matrix) -> Result<Matrix, Error> {
        if self.cols != other.rows {
            return Err(Error::DimensionMismatch(format!(
                "cannot multiply {}x{} by {}x{}",
                self.rows, self.cols, other.rows, other.cols
            )));
        }
        let mut product = Matrix::zero(self.rows, other.cols);
        for i in 0..self.rows {
            for j in 0..other.cols {
                let mut sum: Option<Coefficient> = None;
                for k in 0..self.cols {
                    let (Some(a), Some(b)) = (
                        self.entries[i * self.cols + k],
                        other.entries[k * other.cols + j],
                    ) else {
                        continue;
                    };
                    let term = a.mul(&b);
                    sum = match sum {
                        None => Some(term),
                        Some(s) => s.add(&term),
                    };
                }
                product.entries[i * other.cols + j] = sum;
            }
        }
        Ok(product)
    }

    /// The inverse of a square matrix. Exact when all coefficients are
    /// rational and nothing overflows, double-precision Gauss-Jordan
    /// with partial pivoting otherwise.
    pub fn inverted(&self) -> Result<Matrix, Error> {
        if !self.is_square() {
            return Err(Error::NonInvertible(format!(
                "{}x{} matrix",
                self.rows, self.cols
            )));
        }
        if let Some(inverse) = self.inverted_exactly() {
            return Ok(inverse);
        }
        self.inverted_in_doubles()
    }

    // Rational Gauss-Jordan. Bails out (returning None) on the first
    // non-rational coefficient or overflowing operation.
    fn inverted_exactly(&self) -> Option<Matrix> {
        let n = self.rows;
        let zero = Rational::integer(0);
        let mut work: Vec<Rational> = Vec::with_capacity(n * 2 * n);
        for i in 0..n {
            for j in 0..n {
                match self.entries[i * n + j] {
                    None => work.push(zero),
                    Some(c) => work.push(c.rational()?),
                }
            }
            for j in 0..n {
                work.push(if i == j { Rational::integer(1) } else { zero });
            }
        }
        let stride = 2 * n;

        for col in 0..n {
            // Any non-zero pivot is exact; no magnitude concerns here
            let pivot_row = (col..n).find(|&r| !work[r * stride + col].is_zero())?;
            if pivot_row != col {
                for j in 0..stride {
                    work.swap(col * stride + j, pivot_row * stride + j);
                }
            }
            let pivot = work[col * stride + col];
            for j in 0..stride {
                work[col * stride + j] = work[col * stride + j].checked_div(pivot)?;
            }
            for r in 0..n {
                if r == col || work[r * stride + col].is_zero() {
                    continue;
                }
                let factor = work[r * stride + col];
                for j in 0..stride {
                    let term = factor.checked_mul(work[col * stride + j])?;
                    work[r * stride + j] = work[r * stride + j].checked_sub(term)?;
                }
            }
        }

        let mut inverse = Matrix::zero(n, n);
        for i in 0..n {
            for j in 0..n {
                let r = work[i * stride + n + j];
                if !r.is_zero() {
                    inverse.entries[i * n + j] = Some(Coefficient::Rational(r));
                }
            }
        }
        Some(inverse)
    }

    fn inverted_in_doubles(&self) -> Result<Matrix, Error> {
        let n = self.rows;
        let stride = 2 * n;
        let mut work = vec![0.; n * stride];
        for i in 0..n {
            for j in 0..n {
                work[i * stride + j] = self.get(i, j);
            }
            work[i * stride + n + i] = 1.;
        }

        for col in 0..n {
            let pivot_row = (col..n)
                .max_by(|&a, &b| {
                    work[a * stride + col]
                        .abs()
                        .total_cmp(&work[b * stride + col].abs())
                })
                .ok_or(Error::Internal("empty pivot search"))?;
            let pivot = work[pivot_row * stride + col];
            if pivot == 0. || !pivot.is_finite() {
                return Err(Error::NonInvertible("singular matrix".to_string()));
            }
            if pivot_row != col {
                for j in 0..stride {
                    work.swap(col * stride + j, pivot_row * stride + j);
                }
            }
            for j in 0..stride {
                work[col * stride + j] /= pivot;
            }
            for r in 0..n {
                if r == col {
                    continue;
                }
                let factor = work[r * stride + col];
                if factor == 0. {
                    continue;
                }
                for j in 0..stride {
                    work[r * stride + j] -= factor * work[col * stride + j];
                }
            }
        }

        let mut inverse = Matrix::zero(n, n);
        for i in 0..n {
            for j in 0..n {
                inverse.set(i, j, work[i * stride + n + j]);
            }
        }
        Ok(inverse)
    }

    /// The fast-path representation: row-major elements premultiplied by
    /// a per-row common denominator, plus the denominator column. For a
    /// row of rationals with common denominator d, the stored elements
    /// are exact integers and evaluation divides by d once.
    pub fn scaled_rows(&self) -> (Vec<f64>, Vec<f64>) {
        let mut elements = vec![0.; self.rows * self.cols];
        let mut denominators = vec![1.; self.rows];
        for i in 0..self.rows {
            let mut common: i64 = 1;
            for j in 0..self.cols {
                if let Some(Coefficient::Rational(r)) = self.entries[i * self.cols + j] {
                    let Some(lcm) = lcm(common, r.denominator()) else {
                        common = 1;
                        break;
                    };
                    common = lcm;
                }
            }
            let d = common as f64;
            denominators[i] = d;
            for j in 0..self.cols {
                if let Some(c) = self.entries[i * self.cols + j] {
                    elements[i * self.cols + j] = match c {
                        // num · (d / den) is an exact integer product
                        Coefficient::Rational(r) => {
                            r.numerator() as f64 * (d / r.denominator() as f64)
                        }
                        Coefficient::Real(v) => v * d,
                    };
                }
            }
        }
        (elements, denominators)
    }
}

fn lcm(a: i64, b: i64) -> Option<i64> {
    let g = {
        let (mut x, mut y) = (a.unsigned_abs(), b.unsigned_abs());
        while y != 0 {
            (x, y) = (y, x % y);
        }
        x.max(1)
    };
    (a / g as i64).checked_mul(b)
}

impl fmt::Display for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.rows {
            for j in 0..self.cols {
                if j > 0 {
                    write!(f, "  ")?;
                }
                match self.get_or_null(i, j) {
                    None => write!(f, "0")?,
                    Some(c) => write!(f, "{c}")?,
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

// ----- T E S T S ------------------------------------------------------------------
