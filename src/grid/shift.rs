//! The datum shift operation backed by a grid: forward evaluation adds
//! the interpolated translation, the inverse iterates until the update
//! drops below the grid's cell precision.

use super::ShiftGrid;
use crate::matrix::Matrix;
use crate::transform::Transform;
use crate::Error;
use std::sync::Arc;

// Fallback stop tolerance when the grid publishes no accuracy
const DEFAULT_TOLERANCE: f64 = 1e-10;

/// A horizontal datum shift interpolated from a two-dimensional grid of
/// translation vectors.
#[derive(Debug, Clone)]
pub struct GridShift {
    grid: Arc<ShiftGrid>,
    inverse: bool,
}

impl GridShift {
    pub fn new(grid: Arc<ShiftGrid>) -> Result<GridShift, Error> {
        if grid.dimensions() != 2 {
            return Err(Error::DimensionMismatch(format!(
                "a horizontal datum shift needs 2 translation dimensions, grid has {}",
                grid.dimensions()
            )));
        }
        Ok(GridShift {
            grid,
            inverse: false,
        })
    }

    pub fn grid(&self) -> &Arc<ShiftGrid> {
        &self.grid
    }

    fn tolerance(&self) -> f64 {
        let precision = self.grid.cell_precision();
        if precision.is_finite() && precision > 0. {
            precision
        } else {
            DEFAULT_TOLERANCE
        }
    }

    fn shift_forward(&self, x: f64, y: f64, out: &mut [f64]) -> Result<(), Error> {
        let mut d = [0.; 2];
        self.grid.interpolate_into(x, y, &mut d)?;
        out[0] = x + d[0];
        out[1] = y + d[1];
        Ok(())
    }

    // In the inverse direction we must iterate: the translation is
    // tabulated at source positions, but only the target is known
    fn shift_inverse(&self, x: f64, y: f64, out: &mut [f64]) -> Result<(), Error> {
        let tolerance = self.tolerance();
        let mut d = [0.; 2];
        self.grid.interpolate_into(x, y, &mut d)?;
        let (mut tx, mut ty) = (x - d[0], y - d[1]);

        for _ in 0..10 {
            self.grid.interpolate_into(tx, ty, &mut d)?;
            let (ex, ey) = (tx + d[0] - x, ty + d[1] - y);
            tx -= ex;
            ty -= ey;
            if ex * ex + ey * ey < tolerance * tolerance {
                break;
            }
        }
        out[0] = tx;
        out[1] = ty;
        Ok(())
    }
}

impl Transform for GridShift {
    fn source_dimensions(&self) -> usize {
        2
    }

    fn target_dimensions(&self) -> usize {
        2
    }

    fn transform_slice(&self, src: &[f64], dst: &mut [f64]) -> Result<usize, Error> {
        if src.len() % 2 != 0 || dst.len() != src.len() {
            return Err(Error::DimensionMismatch(format!(
                "{} values do not pack into 2D points",
                src.len()
            )));
        }
        let n = src.len() / 2;
        for i in 0..n {
            let (x, y) = (src[2 * i], src[2 * i + 1]);
            if self.inverse {
                self.shift_inverse(x, y, &mut dst[2 * i..2 * i + 2])?;
            } else {
                self.shift_forward(x, y, &mut dst[2 * i..2 * i + 2])?;
            }
        }
        Ok(n)
    }

    fn derivative(&self, at: &[f64]) -> Result<Matrix, Error> {
        // d(x + s(x))/dx = I + ds/dx
        let ds = self.grid.derivative(at[0], at[1]);
        let mut d = Matrix::identity(2);
        for i in 0..2 {
            for j in 0..2 {
                d.set(i, j, d.get(i, j) + ds.get(i, j));
            }
        }
        if self.inverse {
            return d.inverted().map_err(|_| {
                Error::NonInvertible("grid shift derivative".to_string())
            });
        }
        Ok(d)
    }

    fn inverted(&self) -> Result<Arc<dyn Transform>, Error> {
        Ok(Arc::new(GridShift {
            grid: self.grid.clone(),
            inverse: !self.inverse,
        }))
    }
}

// ----- T E S T S ------------------------------------------------------------------
