//! Least-squares fitting of affine transforms to sets of control points.
//!
//! A [Fitter] collects (source, target) control points, either on an
//! implicit integer grid or as a scattered list, and [Fitter::create]
//! estimates the affine transform minimizing the summed squared target
//! residuals. When candidate [Linearizer]s are registered, the one
//! maximizing the Pearson correlation of the resulting fit is applied
//! to the target coordinates first.

mod linearizer;
pub use linearizer::Linearizer;

use crate::math::Accumulator;
use crate::matrix::Matrix;
use crate::transform::{LinearTransform, Transform};
use crate::Error;
use std::sync::Arc;

// Grid sizes are validated against this bound, so flat indices stay
// within the range any reasonable backing store can address.
const MAX_GRID_ELEMENTS: usize = i32::MAX as usize;

// ----- T H E   F I T T E R -----------------------------------------------------------

/// A mutable collector of control points. Consumed by [Fitter::create],
/// which produces the immutable [Fit].
#[derive(Debug)]
pub struct Fitter {
    /// Grid sizes, fastest-varying axis first. Empty for scattered sets.
    grid_size: Vec<usize>,
    src_dim: usize,
    dst_dim: usize,
    /// Scattered sources, packed. Unused in gridded mode: there, the
    /// source coordinates are implicit in the flat index.
    sources: Vec<f64>,
    /// One dense value array per target dimension.
    targets: Vec<Vec<f64>>,
    /// Number of scattered points. Gridded sets use the full grid.
    count: usize,
    linearizers: Vec<Linearizer>,
}

impl Fitter {
    /// A fitter for scattered control points of the given dimensions.
    /// Only one- and two-dimensional sources can be fitted.
    pub fn new(source_dimensions: usize, target_dimensions: usize) -> Result<Fitter, Error> {
        if !(1..=2).contains(&source_dimensions) {
            return Err(Error::Invalid(format!(
                "can only fit 1D or 2D sources, got {source_dimensions}D"
            )));
        }
        if target_dimensions == 0 {
            return Err(Error::Invalid("no target dimensions".to_string()));
        }
        Ok(Fitter {
            grid_size: Vec::new(),
            src_dim: source_dimensions,
            dst_dim: target_dimensions,
            sources: Vec::new(),
            targets: vec![Vec::new(); target_dimensions],
            count: 0,
            linearizers: Vec::new(),
        })
    }

    /// A fitter over an implicit integer grid: source coordinates are
    /// the grid indices, fastest-varying axis first.
    pub fn with_grid_size(sizes: &[usize], target_dimensions: usize) -> Result<Fitter, Error> {
        if sizes.is_empty() || sizes.len() > 2 {
            return Err(Error::Invalid(format!(
                "can only fit 1D or 2D grids, got {}D",
                sizes.len()
            )));
        }
        let mut elements = 1_usize;
        for &s in sizes {
            if s < 1 {
                return Err(Error::Invalid("grid size of zero".to_string()));
            }
            elements = elements
                .checked_mul(s)
                .filter(|e| *e <= MAX_GRID_ELEMENTS)
                .ok_or_else(|| Error::Invalid(format!("grid size {sizes:?} too large")))?;
        }
        if target_dimensions == 0 {
            return Err(Error::Invalid("no target dimensions".to_string()));
        }
        Ok(Fitter {
            grid_size: sizes.to_vec(),
            src_dim: sizes.len(),
            dst_dim: target_dimensions,
            sources: Vec::new(),
            targets: vec![vec![f64::NAN; elements]; target_dimensions],
            count: elements,
            linearizers: Vec::new(),
        })
    }

    pub fn source_dimensions(&self) -> usize {
        self.src_dim
    }

    pub fn target_dimensions(&self) -> usize {
        self.dst_dim
    }

    fn is_gridded(&self) -> bool {
        !self.grid_size.is_empty()
    }

    // Flat index of an integral source tuple, fastest-varying axis first
    fn flat_index(&self, source: &[f64]) -> Result<usize, Error> {
        let mut index = 0_usize;
        for (axis, &size) in self.grid_size.iter().enumerate().rev() {
            let c = source[axis];
            if c.fract() != 0. || c < 0. || c >= size as f64 {
                return Err(Error::Invalid(format!(
                    "source {source:?} is not a grid cell of {:?}",
                    self.grid_size
                )));
            }
            index = index * size + c as usize;
        }
        Ok(index)
    }

    /// Register the target of one control point. In gridded mode the
    /// source must be an integral tuple of grid indices; in scattered
    /// mode an existing point with the same source is overwritten, and a
    /// new point appended otherwise. A non-finite target coordinate
    /// fails the call and marks the point as absent.
    pub fn set_control_point(&mut self, source: &[f64], target: &[f64]) -> Result<(), Error> {
        if source.len() != self.src_dim || target.len() != self.dst_dim {
            return Err(Error::DimensionMismatch(format!(
                "expected {}D source and {}D target",
                self.src_dim, self.dst_dim
            )));
        }
        let finite = target.iter().all(|t| t.is_finite());

        if self.is_gridded() {
            let index = self.flat_index(source)?;
            if !finite {
                self.targets[0][index] = f64::NAN;
                return Err(Error::Invalid(format!(
                    "non-finite target {target:?} for source {source:?}"
                )));
            }
            for (dim, t) in target.iter().enumerate() {
                self.targets[dim][index] = *t;
            }
            return Ok(());
        }

        // Scattered: linear search, overwrite on match, append otherwise.
        // Deliberately O(n) per call; scattered sets are small.
        let matched = (0..self.count).find(|i| {
            self.sources[i * self.src_dim..(i + 1) * self.src_dim] == *source
        });
        if !finite {
            if let Some(i) = matched {
                self.targets[0][i] = f64::NAN;
            }
            return Err(Error::Invalid(format!(
                "non-finite target {target:?} for source {source:?}"
            )));
        }
        match matched {
            Some(i) => {
                for (dim, t) in target.iter().enumerate() {
                    self.targets[dim][i] = *t;
                }
            }
            None => {
                self.sources.extend_from_slice(source);
                for (dim, t) in target.iter().enumerate() {
                    self.targets[dim].push(*t);
                }
                self.count += 1;
            }
        }
        Ok(())
    }

    /// The target of the control point at `source`, if present.
    pub fn control_point(&self, source: &[f64]) -> Option<Vec<f64>> {
        let index = if self.is_gridded() {
            self.flat_index(source).ok()?
        } else {
            (0..self.count)
                .find(|i| self.sources[i * self.src_dim..(i + 1) * self.src_dim] == *source)?
        };
        if !self.present(index) {
            return None;
        }
        Some(self.targets.iter().map(|t| t[index]).collect())
    }

    /// The number of control points currently present.
    pub fn len(&self) -> usize {
        (0..self.count).filter(|i| self.present(*i)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill the whole grid by evaluating `grid_to_crs` at every grid
    /// node. Batches one grid row at a time, fastest-varying axis first.
    pub fn set_all_from_transform(&mut self, grid_to_crs: &dyn Transform) -> Result<(), Error> {
        if !self.is_gridded() {
            return Err(Error::General("no grid size has been configured"));
        }
        if grid_to_crs.source_dimensions() != self.src_dim
            || grid_to_crs.target_dimensions() != self.dst_dim
        {
            return Err(Error::DimensionMismatch(format!(
                "transform is {}D → {}D, control points are {}D → {}D",
                grid_to_crs.source_dimensions(),
                grid_to_crs.target_dimensions(),
                self.src_dim,
                self.dst_dim
            )));
        }
        let nx = self.grid_size[0];
        let rows = self.count / nx;
        let mut batch = vec![0.; nx * self.src_dim];
        let mut result = vec![0.; nx * self.dst_dim];
        for row in 0..rows {
            for x in 0..nx {
                batch[x * self.src_dim] = x as f64;
                if self.src_dim == 2 {
                    batch[x * self.src_dim + 1] = row as f64;
                }
            }
            grid_to_crs.transform_slice(&batch, &mut result)?;
            for x in 0..nx {
                for dim in 0..self.dst_dim {
                    self.targets[dim][row * nx + x] = result[x * self.dst_dim + dim];
                }
            }
        }
        Ok(())
    }

    /// Register candidate linearizers: nonlinear transforms applied to
    /// the target dimensions selected by `proj_to_grid` before fitting.
    /// With `compensate`, the inverse of the selected candidate is
    /// concatenated after the fitted transform, so the result still maps
    /// onto the original target coordinates.
    pub fn add_linearizers(
        &mut self,
        candidates: Vec<(String, Arc<dyn Transform>)>,
        compensate: bool,
        proj_to_grid: &[usize],
    ) -> Result<(), Error> {
        for (i, d) in proj_to_grid.iter().enumerate() {
            if *d >= self.dst_dim {
                return Err(Error::Invalid(format!(
                    "projected dimension {d} out of range"
                )));
            }
            if proj_to_grid[..i].contains(d) {
                return Err(Error::Invalid(format!(
                    "dimension {d} appears twice in {proj_to_grid:?}"
                )));
            }
        }
        for (name, transform) in candidates {
            self.linearizers.push(Linearizer::new(
                name,
                transform,
                proj_to_grid.to_vec(),
                compensate,
            ));
        }
        Ok(())
    }

    fn present(&self, index: usize) -> bool {
        self.targets.iter().all(|t| !t[index].is_nan())
    }

    // Source coordinate of a point: implicit grid indices in gridded
    // mode, stored values otherwise
    fn source_coordinate(&self, index: usize, axis: usize) -> f64 {
        if self.is_gridded() {
            let mut i = index;
            for &size in &self.grid_size[..axis] {
                i /= size;
            }
            (i % self.grid_size[axis]) as f64
        } else {
            self.sources[index * self.src_dim + axis]
        }
    }

    /// Run the least-squares fit, selecting the best linearizer when
    /// candidates are present. Consumes the fitter: the produced [Fit]
    /// is immutable.
    pub fn create(mut self) -> Result<Fit, Error> {
        let present: Vec<usize> = (0..self.count).filter(|i| self.present(*i)).collect();
        if present.is_empty() {
            return Err(Error::MissingData("no control points".to_string()));
        }

        if self.linearizers.is_empty() {
            let (matrix, correlations) = self.fit_targets(&present, &self.targets)?;
            return Ok(Fit {
                matrix,
                correlations,
                linearizer: None,
                src_dim: self.src_dim,
                sources: self.sources,
                grid_size: self.grid_size,
                targets: self.targets,
            });
        }

        let selection = linearizer::select(&self, &present)?;
        let linearizer = self.linearizers.swap_remove(selection.index);
        // The winner replaces the internal target arrays: control points
        // observed from the product are the projected coordinates
        if let Some(projected) = selection.targets {
            self.targets = projected;
        }
        Ok(Fit {
            matrix: selection.matrix,
            correlations: selection.correlations,
            linearizer: Some(linearizer),
            src_dim: self.src_dim,
            sources: self.sources,
            grid_size: self.grid_size,
            targets: self.targets,
        })
    }

    // Fit all target dimensions of `targets` against the sources of the
    // points listed in `present`
    pub(crate) fn fit_targets(
        &self,
        present: &[usize],
        targets: &[Vec<f64>],
    ) -> Result<(Matrix, Vec<f64>), Error> {
        let mut matrix = Matrix::zero(self.dst_dim + 1, self.src_dim + 1);
        matrix.set(self.dst_dim, self.src_dim, 1.);
        let mut correlations = Vec::with_capacity(self.dst_dim);

        let normal = self.normal_matrix(present)?;
        let inverse = normal.inverted().map_err(|_| {
            Error::Invalid("control points do not span the source space".to_string())
        })?;

        for (dim, target) in targets.iter().enumerate() {
            let moments = self.moment_vector(present, target);
            let coefficients = inverse.multiply(&moments)?;
            for j in 0..=self.src_dim {
                matrix.set_coefficient(dim, j, coefficients.get_or_null(j, 0));
            }
            correlations.push(self.correlation(present, target, &coefficients));
        }
        Ok((matrix, correlations))
    }

    // The normal-equation matrix of the source coordinates:
    // 1D: [[Σx², Σx], [Σx, n]]
    // 2D: [[Σx², Σxy, Σx], [Σxy, Σy², Σy], [Σx, Σy, n]]
    fn normal_matrix(&self, present: &[usize]) -> Result<Matrix, Error> {
        let k = self.src_dim + 1;
        let mut sums = vec![Accumulator::new(); k * k];
        for &i in present {
            let mut coords = [0., 0., 0.];
            coords[self.src_dim] = 1.;
            for axis in 0..self.src_dim {
                coords[axis] = self.source_coordinate(i, axis);
            }
            for r in 0..k {
                for c in 0..k {
                    sums[r * k + c].add(coords[r] * coords[c]);
                }
            }
        }
        let elements: Vec<f64> = sums.iter().map(|a| a.value()).collect();
        Matrix::from_elements(k, k, &elements)
    }

    // The right-hand side for one target dimension: Σ(coord·t) per
    // source coordinate, plus Σt
    fn moment_vector(&self, present: &[usize], target: &[f64]) -> Matrix {
        let k = self.src_dim + 1;
        let mut sums = vec![Accumulator::new(); k];
        for &i in present {
            let t = target[i];
            for (axis, sum) in sums.iter_mut().enumerate().take(self.src_dim) {
                sum.add(self.source_coordinate(i, axis) * t);
            }
            sums[k - 1].add(t);
        }
        let mut rhs = Matrix::zero(k, 1);
        for (r, sum) in sums.iter().enumerate() {
            rhs.set(r, 0, sum.value());
        }
        rhs
    }

    // Pearson correlation between fitted and observed values
    fn correlation(&self, present: &[usize], target: &[f64], coefficients: &Matrix) -> f64 {
        let n = present.len() as f64;
        let mut sp = Accumulator::new();
        let mut so = Accumulator::new();
        let mut spp = Accumulator::new();
        let mut soo = Accumulator::new();
        let mut spo = Accumulator::new();
        for &i in present {
            let mut predicted = coefficients.get(self.src_dim, 0);
            for axis in 0..self.src_dim {
                predicted += coefficients.get(axis, 0) * self.source_coordinate(i, axis);
            }
            let observed = target[i];
            sp.add(predicted);
            so.add(observed);
            spp.add(predicted * predicted);
            soo.add(observed * observed);
            spo.add(predicted * observed);
        }
        let var_p = n * spp.value() - sp.value() * sp.value();
        let var_o = n * soo.value() - so.value() * so.value();
        if var_p <= 0. || var_o <= 0. {
            // A constant target (or fit) has no variance to explain
            return 1.;
        }
        let r = (n * spo.value() - sp.value() * so.value()) / (var_p * var_o).sqrt();
        r.clamp(-1., 1.)
    }
}

// ----- T H E   F I T T E D   P R O D U C T -------------------------------------------

/// The immutable result of a fit: the affine matrix, the per-dimension
/// Pearson correlations, and the selected linearizer, if any.
#[derive(Debug)]
pub struct Fit {
    matrix: Matrix,
    correlations: Vec<f64>,
    linearizer: Option<Linearizer>,
    src_dim: usize,
    sources: Vec<f64>,
    grid_size: Vec<usize>,
    targets: Vec<Vec<f64>>,
}

impl Fit {
    /// The fitted affine matrix, of shape `(targets+1) × (sources+1)`.
    pub fn matrix(&self) -> &Matrix {
        &self.matrix
    }

    /// Pearson correlation coefficient per target dimension.
    pub fn correlations(&self) -> &[f64] {
        &self.correlations
    }

    /// The global quality measure `√(Σrᵢ²/n)`.
    pub fn correlation(&self) -> f64 {
        let sum: f64 = self.correlations.iter().map(|r| r * r).sum();
        (sum / self.correlations.len() as f64).sqrt()
    }

    /// Name of the selected linearizer, if candidates were registered.
    pub fn linearizer(&self) -> Option<&str> {
        self.linearizer.as_ref().map(|l| l.name())
    }

    /// The fitted operation. Purely affine without linearization; with a
    /// compensating linearizer, the affine fit concatenated with the
    /// inverse of the selected candidate.
    pub fn transform(&self) -> Result<Arc<dyn Transform>, Error> {
        let linear: Arc<dyn Transform> = Arc::new(LinearTransform::new(self.matrix.clone())?);
        let Some(linearizer) = &self.linearizer else {
            return Ok(linear);
        };
        linearizer.compensation(linear)
    }

    /// The target of the control point at `source`. After linearizer
    /// selection these are the projected coordinates, not the ones
    /// originally registered.
    pub fn control_point(&self, source: &[f64]) -> Option<Vec<f64>> {
        let index = if self.grid_size.is_empty() {
            (0..self.targets[0].len())
                .find(|i| self.sources[i * self.src_dim..(i + 1) * self.src_dim] == *source)?
        } else {
            let mut index = 0_usize;
            for (axis, &size) in self.grid_size.iter().enumerate().rev() {
                let c = source[axis];
                if c.fract() != 0. || c < 0. || c >= size as f64 {
                    return None;
                }
                index = index * size + c as usize;
            }
            index
        };
        if self.targets.iter().any(|t| t[index].is_nan()) {
            return None;
        }
        Some(self.targets.iter().map(|t| t[index]).collect())
    }
}

// ----- T E S T S ------------------------------------------------------------------
