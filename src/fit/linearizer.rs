//! Linearizer candidates: nonlinear projections applied to target
//! coordinates before fitting, selected by the Pearson correlation of
//! the resulting linear fit.

use super::Fitter;
use crate::matrix::Matrix;
use crate::transform::{factory, Transform};
use crate::Error;
use std::sync::Arc;

/// One candidate projection. The candidate transforms the target
/// dimensions selected by `proj_to_grid`; after fitting, a compensating
/// candidate has its inverse concatenated onto the fitted transform so
/// the composition still maps onto the original target coordinates.
#[derive(Debug, Clone)]
pub struct Linearizer {
    name: String,
    transform: Arc<dyn Transform>,
    proj_to_grid: Vec<usize>,
    compensate: bool,
}

impl Linearizer {
    pub(crate) fn new(
        name: String,
        transform: Arc<dyn Transform>,
        proj_to_grid: Vec<usize>,
        compensate: bool,
    ) -> Linearizer {
        Linearizer {
            name,
            transform,
            proj_to_grid,
            compensate,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transform(&self) -> &Arc<dyn Transform> {
        &self.transform
    }

    /// The fitted transform, compensated when requested: the linear fit
    /// maps onto projected coordinates, so the inverse of the selected
    /// candidate takes them back.
    pub(crate) fn compensation(
        &self,
        linear: Arc<dyn Transform>,
    ) -> Result<Arc<dyn Transform>, Error> {
        if !self.compensate || self.transform.is_identity() {
            return Ok(linear);
        }
        factory::concatenate(linear, self.transform.inverted()?)
    }
}

// ----- C A N D I D A T E   S E L E C T I O N -----------------------------------------

pub(crate) struct Selection {
    pub index: usize,
    pub matrix: Matrix,
    pub correlations: Vec<f64>,
    /// The projected target arrays of the winner; `None` when the
    /// identity candidate won and the raw targets stand.
    pub targets: Option<Vec<Vec<f64>>>,
}

// The global quality measure √(Σr²/n)
fn score(correlations: &[f64]) -> f64 {
    let sum: f64 = correlations.iter().map(|r| r * r).sum();
    (sum / correlations.len() as f64).sqrt()
}

/// Fit every candidate and keep the one with the highest global
/// correlation. Fails only if every candidate raised an error.
pub(crate) fn select(fitter: &Fitter, present: &[usize]) -> Result<Selection, Error> {
    let mut errors = Vec::new();
    let mut best: Option<(Selection, f64)> = None;

    for (index, candidate) in fitter.linearizers.iter().enumerate() {
        let attempt = if candidate.transform.is_identity() {
            fitter
                .fit_targets(present, &fitter.targets)
                .map(|(matrix, correlations)| Selection {
                    index,
                    matrix,
                    correlations,
                    targets: None,
                })
        } else {
            project(fitter, present, candidate).and_then(|projected| {
                let (matrix, correlations) = fitter.fit_targets(present, &projected)?;
                Ok(Selection {
                    index,
                    matrix,
                    correlations,
                    targets: Some(projected),
                })
            })
        };
        match attempt {
            Err(e) => errors.push(e),
            Ok(selection) => {
                let s = score(&selection.correlations);
                if best.as_ref().map_or(true, |(_, b)| s > *b) {
                    best = Some((selection, s));
                }
            }
        }
    }

    match best {
        Some((selection, _)) => Ok(selection),
        None => Err(Error::CannotLinearize(errors)),
    }
}

// The target arrays with the candidate's projection applied to the
// dimensions it covers. Only present points are projected.
fn project(
    fitter: &Fitter,
    present: &[usize],
    candidate: &Linearizer,
) -> Result<Vec<Vec<f64>>, Error> {
    let m = candidate.proj_to_grid.len();
    if candidate.transform.source_dimensions() != m || candidate.transform.target_dimensions() != m
    {
        return Err(Error::DimensionMismatch(format!(
            "linearizer '{}' is {}D → {}D, but projects {m} target dimensions",
            candidate.name,
            candidate.transform.source_dimensions(),
            candidate.transform.target_dimensions()
        )));
    }

    let mut batch = vec![0.; present.len() * m];
    for (p, &i) in present.iter().enumerate() {
        for (j, &dim) in candidate.proj_to_grid.iter().enumerate() {
            batch[p * m + j] = fitter.targets[dim][i];
        }
    }
    let mut projected = vec![0.; batch.len()];
    candidate.transform.transform_slice(&batch, &mut projected)?;
    if projected.iter().any(|v| !v.is_finite()) {
        return Err(Error::Invalid(format!(
            "linearizer '{}' produced non-finite coordinates",
            candidate.name
        )));
    }

    let mut targets = fitter.targets.clone();
    for (p, &i) in present.iter().enumerate() {
        for (j, &dim) in candidate.proj_to_grid.iter().enumerate() {
            targets[dim][i] = projected[p * m + j];
        }
    }
    Ok(targets)
}

// ----- T E S T S ------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::Fitter;
    use crate::test_data::SphericalMercator;
    use crate::transform::LinearTransform;
    use float_eq::assert_float_eq;

    fn identity() -> Arc<dyn Transform> {
        Arc::new(LinearTransform::new(Matrix::identity(3)).unwrap())
    }

    // A 2x3 grid of (λ, φ) targets whose latitudes are equidistant on
    // the Mercator ordinate, i.e. linear only after projection
    fn mercator_curve_fitter() -> Result<Fitter, Error> {
        let mut fitter = Fitter::with_grid_size(&[2, 3], 2)?;
        for y in 0..3 {
            for x in 0..2 {
                let lon = 0.1 * x as f64;
                let lat = (0.2 * y as f64).sinh().atan();
                fitter.set_control_point(&[x as f64, y as f64], &[lon, lat])?;
            }
        }
        Ok(fitter)
    }

    #[test]
    fn mercator_beats_identity() -> Result<(), Error> {
        let mut fitter = mercator_curve_fitter()?;
        fitter.add_linearizers(
            vec![
                ("identity".to_string(), identity()),
                ("mercator".to_string(), Arc::new(SphericalMercator) as _),
            ],
            false,
            &[0, 1],
        )?;
        let fit = fitter.create()?;

        assert_eq!(fit.linearizer(), Some("mercator"));
        assert_float_eq!(fit.correlation(), 1.0, abs <= 1e-12);

        // The fitted matrix maps grid indices onto projected coordinates
        assert_float_eq!(fit.matrix().get(0, 0), 0.1, abs <= 1e-12);
        assert_float_eq!(fit.matrix().get(1, 1), 0.2, abs <= 1e-12);

        // And the control points now report the projected coordinates
        let p = fit.control_point(&[1., 2.]).unwrap();
        assert_float_eq!(p[0], 0.1, abs <= 1e-12);
        assert_float_eq!(p[1], 0.4, abs <= 1e-12);
        Ok(())
    }

    #[test]
    fn compensation_recovers_the_original_targets() -> Result<(), Error> {
        let mut fitter = mercator_curve_fitter()?;
        fitter.add_linearizers(
            vec![("mercator".to_string(), Arc::new(SphericalMercator) as _)],
            true,
            &[0, 1],
        )?;
        let fit = fitter.create()?;

        // linear ∘ inverse(mercator): grid (1, 2) back to (λ, φ)
        let transform = fit.transform()?;
        let mut out = [0.; 2];
        transform.transform_slice(&[1., 2.], &mut out)?;
        assert_float_eq!(out[0], 0.1, abs <= 1e-12);
        assert_float_eq!(out[1], 0.4_f64.sinh().atan(), abs <= 1e-12);
        Ok(())
    }

    #[test]
    fn duplicated_projection_dimension_is_rejected() -> Result<(), Error> {
        let mut fitter = Fitter::new(2, 2)?;
        let result = fitter.add_linearizers(
            vec![("identity".to_string(), identity())],
            false,
            &[1, 1],
        );
        assert!(matches!(result, Err(Error::Invalid(_))));
        Ok(())
    }

    #[test]
    fn all_candidates_failing_is_reported_with_causes() -> Result<(), Error> {
        let mut fitter = mercator_curve_fitter()?;
        // A candidate of the wrong arity never fits anything
        let bad = factory::scale(&[2., 2., 2.])?;
        fitter.add_linearizers(vec![("bad".to_string(), bad)], false, &[0, 1])?;
        match fitter.create() {
            Err(Error::CannotLinearize(causes)) => assert_eq!(causes.len(), 1),
            other => panic!("expected CannotLinearize, got {other:?}"),
        }
        Ok(())
    }
}
