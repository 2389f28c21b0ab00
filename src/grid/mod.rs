//! Datum shift grids: regular grids of translation vectors with
//! bilinear interpolation, longitude wraparound, quantized compression
//! and sub-grid hierarchies.
//!
//! Reading grid files is a collaborator concern: a loader hands over
//! the geometry and the per-dimension value arrays, and everything here
//! is in-memory and immutable once published.

mod cache;
mod shift;

pub use cache::{GridCache, GridKey};
pub use shift::GridShift;

use crate::cs::Unit;
use crate::math::angular::{ulp_f32, wrap_towards};
use crate::math::Accumulator;
use crate::matrix::Matrix;
use crate::Error;
use log::warn;
use std::sync::Arc;

// ----- G R I D   G E O M E T R Y -----------------------------------------------------

/// The regular geometry of a shift grid: sizes, the scale-and-translation
/// mapping from coordinates to fractional grid indices, the wraparound
/// period, and the published accuracy of the gridded values.
#[derive(Debug, Clone, PartialEq)]
pub struct GridGeometry {
    coordinate_unit: Unit,
    translation_unit: Unit,
    nx: usize,
    ny: usize,
    x0: f64,
    y0: f64,
    dx: f64,
    dy: f64,
    /// Grid cells per 360° along the first axis; 0 when the grid does
    /// not wrap.
    period: f64,
    /// Estimated residual uncertainty of the gridded values, in the
    /// translation unit.
    accuracy: f64,
}

impl GridGeometry {
    pub fn new(
        size: (usize, usize),
        origin: (f64, f64),
        spacing: (f64, f64),
    ) -> Result<GridGeometry, Error> {
        let (nx, ny) = size;
        let (dx, dy) = spacing;
        if nx < 1 || ny < 1 {
            return Err(Error::Invalid(format!("malformed grid size {nx}x{ny}")));
        }
        if dx == 0. || dy == 0. {
            return Err(Error::Invalid("grid spacing of zero".to_string()));
        }
        Ok(GridGeometry {
            coordinate_unit: Unit::Degree,
            translation_unit: Unit::ArcSecond,
            nx,
            ny,
            x0: origin.0,
            y0: origin.1,
            dx,
            dy,
            period: 0.,
            accuracy: f64::NAN,
        })
    }

    pub fn with_units(mut self, coordinate: Unit, translation: Unit) -> GridGeometry {
        self.coordinate_unit = coordinate;
        self.translation_unit = translation;
        self
    }

    /// Configure wraparound: the number of grid cells spanning a full
    /// turn along the first axis.
    pub fn with_wraparound(mut self, cells_per_turn: f64) -> GridGeometry {
        self.period = cells_per_turn;
        self
    }

    pub fn with_accuracy(mut self, accuracy: f64) -> GridGeometry {
        self.accuracy = accuracy;
        self
    }

    pub fn size(&self) -> (usize, usize) {
        (self.nx, self.ny)
    }

    pub fn coordinate_unit(&self) -> Unit {
        self.coordinate_unit
    }

    pub fn translation_unit(&self) -> Unit {
        self.translation_unit
    }

    pub fn accuracy(&self) -> f64 {
        self.accuracy
    }

    // Coordinates to fractional grid indices. Pure scale and
    // translation: the grid axes are never rotated or sheared.
    fn to_grid(&self, x: f64, y: f64) -> (f64, f64) {
        ((x - self.x0) / self.dx, (y - self.y0) / self.dy)
    }

    /// Whether the point falls inside this grid's domain of validity.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let (gx, gy) = self.to_grid(x, y);
        (0. ..=(self.nx - 1) as f64).contains(&gx) && (0. ..=(self.ny - 1) as f64).contains(&gy)
    }

    // Same domain of validity: used for duplicate sub-grid detection
    fn same_domain(&self, other: &GridGeometry) -> bool {
        self.nx == other.nx
            && self.ny == other.ny
            && self.x0 == other.x0
            && self.y0 == other.y0
            && self.dx == other.dx
            && self.dy == other.dy
    }
}

// ----- G R I D   D A T A -------------------------------------------------------------

/// The translation values of a grid, one array per dimension, in one of
/// three encodings.
#[derive(Debug, Clone)]
pub enum GridData {
    /// Raw single precision.
    Float(Vec<Vec<f32>>),
    /// Raw double precision.
    Double(Vec<Vec<f64>>),
    /// Quantized: the stored value q represents `q·scale + average`.
    Quantized {
        values: Vec<Vec<i16>>,
        averages: Vec<f64>,
        scale: f64,
    },
}

impl GridData {
    /// The number of translation dimensions.
    pub fn dimensions(&self) -> usize {
        match self {
            GridData::Float(v) => v.len(),
            GridData::Double(v) => v.len(),
            GridData::Quantized { values, .. } => values.len(),
        }
    }

    fn len(&self) -> usize {
        match self {
            GridData::Float(v) => v.first().map_or(0, Vec::len),
            GridData::Double(v) => v.first().map_or(0, Vec::len),
            GridData::Quantized { values, .. } => values.first().map_or(0, Vec::len),
        }
    }

    // The raw stored value: the quantized integer for compressed grids
    fn raw(&self, dim: usize, index: usize) -> f64 {
        match self {
            GridData::Float(v) => v[dim][index] as f64,
            GridData::Double(v) => v[dim][index],
            GridData::Quantized { values, .. } => values[dim][index] as f64,
        }
    }

    // Scale and offset turning raw values into translations
    fn decoding(&self, dim: usize) -> (f64, f64) {
        match self {
            GridData::Quantized {
                averages, scale, ..
            } => (*scale, averages[dim]),
            _ => (1., 0.),
        }
    }

    /// Retained memory, for the cache cost function.
    pub fn memory_bytes(&self) -> usize {
        match self {
            GridData::Float(v) => v.iter().map(|d| d.len() * 4).sum(),
            GridData::Double(v) => v.iter().map(|d| d.len() * 8).sum(),
            GridData::Quantized { values, .. } => values.iter().map(|d| d.len() * 2).sum(),
        }
    }

    /// Bit-for-bit equality, the criterion for sharing data arrays
    /// between grids.
    pub fn bitwise_eq(&self, other: &GridData) -> bool {
        match (self, other) {
            (GridData::Float(a), GridData::Float(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| {
                        x.len() == y.len()
                            && x.iter().zip(y).all(|(p, q)| p.to_bits() == q.to_bits())
                    })
            }
            (GridData::Double(a), GridData::Double(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b).all(|(x, y)| {
                        x.len() == y.len()
                            && x.iter().zip(y).all(|(p, q)| p.to_bits() == q.to_bits())
                    })
            }
            (
                GridData::Quantized {
                    values: a,
                    averages: aa,
                    scale: sa,
                },
                GridData::Quantized {
                    values: b,
                    averages: ab,
                    scale: sb,
                },
            ) => {
                sa.to_bits() == sb.to_bits()
                    && aa.len() == ab.len()
                    && aa.iter().zip(ab).all(|(p, q)| p.to_bits() == q.to_bits())
                    && a == b
            }
            _ => false,
        }
    }
}

// ----- T H E   S H I F T   G R I D ---------------------------------------------------

/// An immutable datum shift grid: geometry, values, and any sub-grids
/// providing higher resolution inside parts of the domain.
#[derive(Debug, Clone)]
pub struct ShiftGrid {
    geometry: GridGeometry,
    data: Arc<GridData>,
    subgrids: Vec<ShiftGrid>,
}

impl ShiftGrid {
    pub fn new(geometry: GridGeometry, data: GridData) -> Result<ShiftGrid, Error> {
        let expected = geometry.nx * geometry.ny;
        if data.dimensions() < 1 {
            return Err(Error::Invalid("grid with no translation dimensions".to_string()));
        }
        if data.len() != expected {
            return Err(Error::Invalid(format!(
                "{} values cannot fill a {}x{} grid",
                data.len(),
                geometry.nx,
                geometry.ny
            )));
        }
        Ok(ShiftGrid {
            geometry,
            data: Arc::new(data),
            subgrids: Vec::new(),
        })
    }

    pub fn geometry(&self) -> &GridGeometry {
        &self.geometry
    }

    pub fn data(&self) -> &Arc<GridData> {
        &self.data
    }

    /// The number of translation dimensions.
    pub fn dimensions(&self) -> usize {
        self.data.dimensions()
    }

    /// The reconstructed translation value of one cell.
    pub fn cell(&self, dim: usize, x: usize, y: usize) -> f64 {
        let (scale, average) = self.data.decoding(dim);
        self.data.raw(dim, x + y * self.geometry.nx) * scale + average
    }

    /// Register a sub-grid. A child whose domain duplicates an already
    /// registered one is logged and ignored.
    pub fn add_subgrid(&mut self, child: ShiftGrid) {
        if self
            .subgrids
            .iter()
            .any(|g| g.geometry.same_domain(&child.geometry))
        {
            warn!(
                "ignoring sub-grid with duplicate domain at ({}, {})",
                child.geometry.x0, child.geometry.y0
            );
            return;
        }
        self.subgrids.push(child);
    }

    pub fn subgrids(&self) -> &[ShiftGrid] {
        &self.subgrids
    }

    // The innermost grid whose domain contains the point; self when no
    // child does
    fn locate(&self, x: f64, y: f64) -> &ShiftGrid {
        for child in &self.subgrids {
            if child.geometry.contains(x, y) {
                return child.locate(x, y);
            }
        }
        self
    }

    /// Reduce out-of-range grid coordinates: wraparound along the first
    /// axis where a period is configured, clamping to the boundary
    /// otherwise. Idempotent.
    pub fn replace_outside_grid_coordinates(&self, gx: f64, gy: f64) -> (f64, f64) {
        let g = &self.geometry;
        let mut gx = gx;
        if g.period > 0. && !(0. ..=(g.nx - 1) as f64).contains(&gx) {
            gx = wrap_towards(gx, (g.nx - 1) as f64 / 2., g.period);
        }
        (
            gx.clamp(0., (g.nx - 1) as f64),
            gy.clamp(0., (g.ny - 1) as f64),
        )
    }

    /// Interpolate the translation vector at `(x, y)`, in coordinate
    /// units, writing one value per translation dimension into `out`.
    pub fn interpolate_into(&self, x: f64, y: f64, out: &mut [f64]) -> Result<(), Error> {
        let grid = self.locate(x, y);
        grid.interpolate_local(x, y, out)
    }

    /// Convenience form of [ShiftGrid::interpolate_into].
    pub fn interpolate(&self, x: f64, y: f64) -> Vec<f64> {
        let mut out = vec![0.; self.dimensions()];
        // Length is correct by construction
        let _ = self.interpolate_into(x, y, &mut out);
        out
    }

    fn interpolate_local(&self, x: f64, y: f64, out: &mut [f64]) -> Result<(), Error> {
        if out.len() != self.dimensions() {
            return Err(Error::DimensionMismatch(format!(
                "grid has {} translation dimensions, output has {}",
                self.dimensions(),
                out.len()
            )));
        }
        let g = &self.geometry;
        let (gx, gy) = g.to_grid(x, y);
        let (gx, gy) = self.replace_outside_grid_coordinates(gx, gy);

        let ix = (gx.floor() as usize).min(g.nx.saturating_sub(2));
        let iy = (gy.floor() as usize).min(g.ny.saturating_sub(2));
        let x1 = (ix + 1).min(g.nx - 1);
        let y1 = (iy + 1).min(g.ny - 1);
        let fx = gx - ix as f64;
        let fy = gy - iy as f64;

        for (dim, value) in out.iter_mut().enumerate() {
            let v00 = self.data.raw(dim, ix + iy * g.nx);
            let v10 = self.data.raw(dim, x1 + iy * g.nx);
            let v01 = self.data.raw(dim, ix + y1 * g.nx);
            let v11 = self.data.raw(dim, x1 + y1 * g.nx);
            let bottom = fx.mul_add(v10 - v00, v00);
            let top = fx.mul_add(v11 - v01, v01);
            let raw = fy.mul_add(top - bottom, bottom);
            let (scale, average) = self.data.decoding(dim);
            *value = raw.mul_add(scale, average);
        }
        Ok(())
    }

    /// The partial derivatives of the interpolated translations with
    /// respect to the input coordinates, as a `dimensions() × 2` matrix.
    pub fn derivative(&self, x: f64, y: f64) -> Matrix {
        let grid = self.locate(x, y);
        let g = &grid.geometry;
        let (gx, gy) = g.to_grid(x, y);
        let (gx, gy) = grid.replace_outside_grid_coordinates(gx, gy);

        let ix = (gx.floor() as usize).min(g.nx.saturating_sub(2));
        let iy = (gy.floor() as usize).min(g.ny.saturating_sub(2));
        let x1 = (ix + 1).min(g.nx - 1);
        let y1 = (iy + 1).min(g.ny - 1);
        let fx = gx - ix as f64;
        let fy = gy - iy as f64;

        let mut d = Matrix::zero(grid.dimensions(), 2);
        for dim in 0..grid.dimensions() {
            let v00 = grid.data.raw(dim, ix + iy * g.nx);
            let v10 = grid.data.raw(dim, x1 + iy * g.nx);
            let v01 = grid.data.raw(dim, ix + y1 * g.nx);
            let v11 = grid.data.raw(dim, x1 + y1 * g.nx);
            let (scale, _) = grid.data.decoding(dim);
            // Standard bilinear partials, chained through the
            // coordinate-to-grid scaling
            let ddx = (1. - fy) * (v10 - v00) + fy * (v11 - v01);
            let ddy = (1. - fx) * (v01 - v00) + fx * (v11 - v10);
            d.set(dim, 0, ddx * scale / g.dx);
            d.set(dim, 1, ddy * scale / g.dy);
        }
        d
    }

    /// An upper bound for the error committed when interpolating, used
    /// as the stop tolerance of iterative inverse shifts.
    pub fn cell_precision(&self) -> f64 {
        let from_accuracy = self.geometry.accuracy / 10.;
        match &*self.data {
            GridData::Quantized { scale, .. } => {
                let from_scale = 5. * scale;
                if from_accuracy.is_nan() {
                    from_scale
                } else {
                    from_accuracy.min(from_scale)
                }
            }
            _ => from_accuracy,
        }
    }

    /// Attempt to re-encode single-precision data as quantized short
    /// integers with the given scale, averaging each dimension. Returns
    /// the grid unchanged whenever any cell cannot be reconstructed to
    /// within one ULP of its single-precision value. Sub-grids are
    /// compressed independently.
    pub fn compress(self, scale: f64) -> ShiftGrid {
        self.compress_with(scale, None)
    }

    /// As [ShiftGrid::compress], with caller-supplied averages.
    pub fn compress_with(mut self, scale: f64, averages: Option<&[f64]>) -> ShiftGrid {
        let subgrids = std::mem::take(&mut self.subgrids);
        self.subgrids = subgrids
            .into_iter()
            .map(|g| g.compress_with(scale, averages))
            .collect();
        let quantized = match &*self.data {
            GridData::Float(floats) => quantize(floats, scale, averages),
            _ => None,
        };
        match quantized {
            Some(data) => ShiftGrid {
                geometry: self.geometry,
                data: Arc::new(data),
                subgrids: self.subgrids,
            },
            None => self,
        }
    }

    /// Replace this grid's data with the bitwise-equal array of another
    /// grid held by the cache, if there is one. The data then lives for
    /// as long as any holder references it.
    pub fn share_data(mut self, cache: &GridCache) -> ShiftGrid {
        if let Some(shared) = cache.find_shared_data(&self.data) {
            self.data = shared;
        }
        self
    }

    /// Retained memory, for the cache cost function.
    pub fn memory_bytes(&self) -> usize {
        self.data.memory_bytes() + self.subgrids.iter().map(ShiftGrid::memory_bytes).sum::<usize>()
    }
}

// Quantization: q = round(value/scale − m/scale), with m the rounded
// mean. Fails if any q overflows a short or any cell reconstructs to
// more than one ULP from its single-precision value.
fn quantize(floats: &[Vec<f32>], scale: f64, averages: Option<&[f64]>) -> Option<GridData> {
    if !(scale.is_finite() && scale > 0.) {
        return None;
    }
    let mut values = Vec::with_capacity(floats.len());
    let mut used_averages = Vec::with_capacity(floats.len());
    for (dim, band) in floats.iter().enumerate() {
        let average = match averages {
            Some(user) => user[dim],
            None => {
                let sum: Accumulator = band.iter().map(|v| *v as f64).collect();
                (sum.value() / band.len() as f64 / scale).round() * scale
            }
        };
        let mut quantized = Vec::with_capacity(band.len());
        for &v in band {
            let q = (v as f64 / scale - average / scale).round();
            if q < i16::MIN as f64 || q > i16::MAX as f64 {
                return None;
            }
            let reconstructed = q.mul_add(scale, average);
            if !((v as f64 - reconstructed).abs() <= ulp_f32(v) as f64) {
                return None;
            }
            quantized.push(q as i16);
        }
        values.push(quantized);
        used_averages.push(average);
    }
    Some(GridData::Quantized {
        values,
        averages: used_averages,
        scale,
    })
}

// ----- T E S T S ------------------------------------------------------------------
