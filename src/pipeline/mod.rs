//! Assembly of a complete coordinate operation: normalization of the
//! source coordinate system, a parameterized kernel, and
//! denormalization to the target system, with automatic insertion and
//! removal of vertical dimensions where the arities disagree.

mod parameters;

pub use parameters::{
    ParameterDescriptor, ParameterGroup, ParameterValue, ELLIPSOID_PARAMETERS,
};

use crate::cs::CoordinateSystem;
use crate::diagnostic::Warnings;
use crate::ellipsoid::Ellipsoid;
use crate::matrix::Matrix;
use crate::transform::{factory, Transform};
use crate::Error;
use std::sync::Arc;

// The linear tolerance (in metres) below which a user-supplied
// parameter is considered to agree with the bound ellipsoid
const ELLIPSOID_TOLERANCE: f64 = 0.01;

// ----- V E R T I C A L   C O M P L E T I O N -----------------------------------------

// How to fill a vertical dimension the kernel expects but the source
// does not provide
#[derive(Debug, Clone, Copy, PartialEq)]
enum VerticalCompletion {
    Height(f64),
    Radius,
}

/// The step inserting a spherical-radius coordinate: (λ, φ) to
/// (λ, φ, R(φ)) with R the geocentric radius of the ellipsoid.
#[derive(Debug, Clone)]
pub struct GeocentricRadius {
    ellipsoid: Ellipsoid,
}

impl GeocentricRadius {
    pub fn new(ellipsoid: Ellipsoid) -> GeocentricRadius {
        GeocentricRadius { ellipsoid }
    }
}

impl Transform for GeocentricRadius {
    fn source_dimensions(&self) -> usize {
        2
    }

    fn target_dimensions(&self) -> usize {
        3
    }

    fn transform_slice(&self, src: &[f64], dst: &mut [f64]) -> Result<usize, Error> {
        if src.len() % 2 != 0 || dst.len() != src.len() / 2 * 3 {
            return Err(Error::DimensionMismatch(format!(
                "{} values do not pack into 2D points",
                src.len()
            )));
        }
        let n = src.len() / 2;
        for i in 0..n {
            dst[3 * i] = src[2 * i];
            dst[3 * i + 1] = src[2 * i + 1];
            dst[3 * i + 2] = self.ellipsoid.geocentric_radius(src[2 * i + 1]);
        }
        Ok(n)
    }

    fn derivative(&self, at: &[f64]) -> Result<Matrix, Error> {
        // Finite differences are plenty for a radius varying by parts
        // per thousand per radian
        let h = 1e-8;
        let slope = (self.ellipsoid.geocentric_radius(at[1] + h)
            - self.ellipsoid.geocentric_radius(at[1] - h))
            / (2. * h);
        let mut d = Matrix::zero(3, 2);
        d.set(0, 0, 1.);
        d.set(1, 1, 1.);
        d.set(2, 1, slope);
        Ok(d)
    }
}

// ----- T H E   P I P E L I N E   B U I L D E R ---------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    AxesBound,
    ParamsCompleted,
    Built,
}

/// Builder for the composite operation
/// `normalize(source) ∘ kernel ∘ denormalize(target)`.
///
/// The builder walks a strict state machine: bind axes, complete the
/// kernel parameters from the bound ellipsoid, assemble. Once built,
/// every further mutation fails.
#[derive(Debug)]
pub struct PipelineBuilder {
    kernel_params: ParameterGroup,
    source: Option<(CoordinateSystem, Option<Ellipsoid>)>,
    target: Option<(CoordinateSystem, Option<Ellipsoid>)>,
    vertical: VerticalCompletion,
    warnings: Warnings,
    state: State,
}

impl PipelineBuilder {
    pub fn new(kernel_params: ParameterGroup) -> PipelineBuilder {
        PipelineBuilder {
            kernel_params,
            source: None,
            target: None,
            vertical: VerticalCompletion::Height(0.),
            warnings: Warnings::new(),
            state: State::Fresh,
        }
    }

    /// Bind the source coordinate system. May be called at most once,
    /// before the parameters are completed.
    pub fn set_source(
        &mut self,
        cs: CoordinateSystem,
        ellipsoid: Option<Ellipsoid>,
    ) -> Result<(), Error> {
        if !matches!(self.state, State::Fresh | State::AxesBound) || self.source.is_some() {
            return Err(Error::Unmodifiable("source coordinate system"));
        }
        self.source = Some((cs, ellipsoid));
        self.state = State::AxesBound;
        Ok(())
    }

    /// Bind the target coordinate system. May be called at most once,
    /// before the parameters are completed.
    pub fn set_target(
        &mut self,
        cs: CoordinateSystem,
        ellipsoid: Option<Ellipsoid>,
    ) -> Result<(), Error> {
        if !matches!(self.state, State::Fresh | State::AxesBound) || self.target.is_some() {
            return Err(Error::Unmodifiable("target coordinate system"));
        }
        self.target = Some((cs, ellipsoid));
        self.state = State::AxesBound;
        Ok(())
    }

    /// Use the geocentric radius of the source ellipsoid, rather than a
    /// zero ellipsoidal height, when the kernel needs a vertical
    /// dimension the source does not provide.
    pub fn complete_vertical_with_radius(&mut self) {
        self.vertical = VerticalCompletion::Radius;
    }

    /// The kernel's parameters, for values the caller wants to set
    /// explicitly before completion.
    pub fn parameters(&mut self) -> &mut ParameterGroup {
        &mut self.kernel_params
    }

    /// The non-fatal findings recorded so far.
    pub fn warnings(&self) -> &Warnings {
        &self.warnings
    }

    /// Fill the ellipsoid parameters of the kernel from the bound
    /// ellipsoid. A pre-existing user value disagreeing by more than a
    /// linear tolerance of 1 cm is kept, with a diagnostic attached.
    pub fn complete_parameters(&mut self) -> Result<(), Error> {
        match self.state {
            State::Fresh => {
                return Err(Error::General(
                    "bind the coordinate systems before completing parameters",
                ))
            }
            State::ParamsCompleted | State::Built => {
                return Err(Error::Unmodifiable("completed parameters"))
            }
            State::AxesBound => {}
        }

        let ellipsoid = self
            .source
            .as_ref()
            .and_then(|(_, e)| e.as_ref())
            .or_else(|| self.target.as_ref().and_then(|(_, e)| e.as_ref()))
            .copied();

        if let Some(ellipsoid) = ellipsoid {
            let tolerance = ELLIPSOID_TOLERANCE / ellipsoid.axis_unit().to_base();
            self.fill(parameters::SEMI_MAJOR, ellipsoid.semimajor_axis(), tolerance);
            self.fill(parameters::SEMI_MINOR, ellipsoid.semiminor_axis(), tolerance);
            if ellipsoid.is_ivf_definitive() {
                // Inverse flattenings compare through the semiminor axis
                // they imply
                let a = ellipsoid.semimajor_axis();
                let ivf = ellipsoid.inverse_flattening();
                if let Some(value) = self.kernel_params.find_mut(parameters::INVERSE_FLATTENING) {
                    match value.value() {
                        None => value.set(ivf),
                        Some(user) if (a / user - a / ivf).abs() > tolerance => {
                            self.warnings.warn(format!(
                                "inverse_flattening {user} disagrees with the bound ellipsoid ({ivf})"
                            ));
                        }
                        Some(_) => {}
                    }
                }
            }
        }
        self.state = State::ParamsCompleted;
        Ok(())
    }

    fn fill(&mut self, name: &str, value: f64, tolerance: f64) {
        let Some(parameter) = self.kernel_params.find_mut(name) else {
            return;
        };
        match parameter.value() {
            None => parameter.set(value),
            Some(user) if (user - value).abs() > tolerance => {
                self.warnings.warn(format!(
                    "{name} {user} disagrees with the bound ellipsoid ({value})"
                ));
            }
            Some(_) => {}
        }
    }

    /// Assemble `normalize ∘ kernel ∘ denormalize`, inserting or
    /// dropping vertical dimensions where the arities disagree by one.
    /// Terminal: afterwards the builder accepts no further calls.
    pub fn assemble(&mut self, kernel: Arc<dyn Transform>) -> Result<Arc<dyn Transform>, Error> {
        if self.state == State::Built {
            return Err(Error::Unmodifiable("assembled pipeline"));
        }
        let ks = kernel.source_dimensions();
        let kt = kernel.target_dimensions();
        let source_dim = self.source.as_ref().map_or(ks, |(cs, _)| cs.dimension());
        let target_dim = self.target.as_ref().map_or(kt, |(cs, _)| cs.dimension());

        // Step 1: normalization of the source coordinate system
        let mut assembled: Arc<dyn Transform> = match &self.source {
            Some((cs, _)) => factory::affine(cs.normalization()?)?,
            None => factory::affine(Matrix::identity(ks + 1))?,
        };

        // Source-side dimension adjustment
        match ks as i64 - source_dim as i64 {
            0 => {}
            1 if self.adjustable(&self.source, source_dim, ks) => {
                let vertical: Arc<dyn Transform> = match self.vertical {
                    VerticalCompletion::Height(h) => insert_vertical(source_dim, h)?,
                    VerticalCompletion::Radius => {
                        let ellipsoid = self
                            .source
                            .as_ref()
                            .and_then(|(_, e)| *e)
                            .unwrap_or_default();
                        Arc::new(GeocentricRadius::new(ellipsoid))
                    }
                };
                assembled = factory::concatenate(assembled, vertical)?;
            }
            -1 if self.adjustable(&self.source, source_dim, ks) => {
                assembled = factory::concatenate(assembled, drop_trailing(source_dim, ks)?)?;
            }
            _ => return Err(self.arity_error(source_dim, ks, kt, target_dim)),
        }

        // Step 2: the kernel itself
        assembled = factory::concatenate(assembled, kernel)?;

        // Target-side dimension adjustment
        match target_dim as i64 - kt as i64 {
            0 => {}
            1 if self.adjustable(&self.target, target_dim, kt) => {
                assembled = factory::concatenate(assembled, append_unknown(kt, target_dim)?)?;
            }
            -1 if self.adjustable(&self.target, target_dim, kt) => {
                assembled = factory::concatenate(assembled, drop_trailing(kt, target_dim)?)?;
            }
            _ => return Err(self.arity_error(source_dim, ks, kt, target_dim)),
        }

        // Step 3: denormalization to the target coordinate system
        if let Some((cs, _)) = &self.target {
            assembled = factory::concatenate(assembled, factory::affine(cs.denormalization()?)?)?;
        }

        self.state = State::Built;
        Ok(assembled)
    }

    // A one-dimension change is only meaningful against an ellipsoidal
    // CS, and only between 2D and 3D
    fn adjustable(
        &self,
        side: &Option<(CoordinateSystem, Option<Ellipsoid>)>,
        a: usize,
        b: usize,
    ) -> bool {
        match side {
            Some((cs, _)) => cs.is_ellipsoidal() && (2..=3).contains(&a) && (2..=3).contains(&b),
            None => false,
        }
    }

    fn arity_error(&self, source: usize, ks: usize, kt: usize, target: usize) -> Error {
        self.warnings.fatal(format!(
            "cannot associate the coordinate systems to kernel '{}': \
             {source}D → tr({ks}D→{kt}D) → {target}D",
            self.kernel_params.name()
        ))
    }
}

// (λ, φ) to (λ, φ, h) with a constant vertical value
fn insert_vertical(from: usize, value: f64) -> Result<Arc<dyn Transform>, Error> {
    let mut m = Matrix::zero(from + 2, from + 1);
    for i in 0..from {
        m.set(i, i, 1.);
    }
    m.set(from, from, value);
    m.set(from + 1, from, 1.);
    factory::affine(m)
}

// Select the first `to` of `from` coordinates
fn drop_trailing(from: usize, to: usize) -> Result<Arc<dyn Transform>, Error> {
    let mut m = Matrix::zero(to + 1, from + 1);
    for i in 0..to {
        m.set(i, i, 1.);
    }
    m.set(to, from, 1.);
    factory::affine(m)
}

// Append pass-through dimensions carrying NaN, the "unknown" value
fn append_unknown(from: usize, to: usize) -> Result<Arc<dyn Transform>, Error> {
    let mut m = Matrix::zero(to + 1, from + 1);
    for i in 0..from {
        m.set(i, i, 1.);
    }
    for i in from..to {
        m.set(i, from, f64::NAN);
    }
    m.set(to, from, 1.);
    factory::affine(m)
}

// ----- T E S T S ------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cs::{Axis, AxisDirection, Unit};
    use crate::test_data::SphericalMercator;
    use float_eq::assert_float_eq;

    fn builder() -> PipelineBuilder {
        PipelineBuilder::new(ParameterGroup::new("mercator", &ELLIPSOID_PARAMETERS))
    }

    #[test]
    fn height_is_dropped_for_a_2d_kernel() -> Result<(), Error> {
        let mut builder = builder();
        builder.set_source(CoordinateSystem::geographic_3d(), Some(Ellipsoid::default()))?;
        builder.set_target(CoordinateSystem::projected_2d(), None)?;
        builder.complete_parameters()?;

        let kernel: Arc<dyn Transform> = Arc::new(SphericalMercator);
        let pipeline = builder.assemble(kernel.clone())?;
        assert_eq!(pipeline.source_dimensions(), 3);
        assert_eq!(pipeline.target_dimensions(), 2);

        // The result is the kernel applied to normalized (λ, φ); the
        // height plays no part
        let (lon, lat, height) = (12., 55., 1234.5);
        let mut out = [0.; 2];
        pipeline.transform_slice(&[lon, lat, height], &mut out)?;

        let mut expected = [0.; 2];
        kernel.transform_slice(&[lon.to_radians(), lat.to_radians()], &mut expected)?;
        assert_float_eq!(out[0], expected[0], ulps <= 2);
        assert_float_eq!(out[1], expected[1], ulps <= 2);
        Ok(())
    }

    #[test]
    fn ellipsoid_parameters_are_completed() -> Result<(), Error> {
        let mut builder = builder();
        builder.set_source(CoordinateSystem::geographic_2d(), Some(Ellipsoid::default()))?;
        builder.set_target(CoordinateSystem::projected_2d(), None)?;
        builder.complete_parameters()?;

        let params = builder.parameters();
        assert_eq!(params.parameter("semi_major")?.value(), Some(6378137.));
        let b = params.parameter("semi_minor")?.value().unwrap();
        assert!((b - 6356752.3141).abs() < 1e-3);
        assert!(builder.warnings().is_empty());
        Ok(())
    }

    #[test]
    fn disagreeing_user_value_is_kept_with_a_warning() -> Result<(), Error> {
        let mut builder = builder();
        builder.parameters().parameter("semi_major")?.set(6378137.5);
        builder.set_source(CoordinateSystem::geographic_2d(), Some(Ellipsoid::default()))?;
        builder.set_target(CoordinateSystem::projected_2d(), None)?;
        builder.complete_parameters()?;

        assert_eq!(
            builder.parameters().parameter("semi_major")?.value(),
            Some(6378137.5)
        );
        assert_eq!(builder.warnings().records().len(), 1);
        Ok(())
    }

    #[test]
    fn agreement_within_a_centimetre_passes_silently() -> Result<(), Error> {
        let mut builder = builder();
        builder.parameters().parameter("semi_major")?.set(6378137.005);
        builder.set_source(CoordinateSystem::geographic_2d(), Some(Ellipsoid::default()))?;
        builder.set_target(CoordinateSystem::projected_2d(), None)?;
        builder.complete_parameters()?;
        assert!(builder.warnings().is_empty());
        Ok(())
    }

    #[test]
    fn state_machine_is_enforced() -> Result<(), Error> {
        let mut builder = builder();
        assert!(matches!(
            builder.complete_parameters(),
            Err(Error::General(_))
        ));

        builder.set_source(CoordinateSystem::geographic_2d(), None)?;
        assert!(matches!(
            builder.set_source(CoordinateSystem::geographic_2d(), None),
            Err(Error::Unmodifiable(_))
        ));

        builder.set_target(CoordinateSystem::projected_2d(), None)?;
        builder.complete_parameters()?;
        assert!(matches!(
            builder.set_target(CoordinateSystem::projected_2d(), None),
            Err(Error::Unmodifiable(_))
        ));

        let kernel: Arc<dyn Transform> = Arc::new(SphericalMercator);
        builder.assemble(kernel.clone())?;
        assert!(matches!(
            builder.assemble(kernel),
            Err(Error::Unmodifiable(_))
        ));
        Ok(())
    }

    #[test]
    fn incompatible_arities_fail_with_a_summary() -> Result<(), Error> {
        let mut builder = builder();
        // A projected (non-ellipsoidal) 2D source cannot feed a 3D kernel
        builder.set_source(CoordinateSystem::projected_2d(), None)?;
        builder.set_target(CoordinateSystem::projected_2d(), None)?;
        builder.complete_parameters()?;

        let kernel = factory::scale(&[1., 1., 1.])?;
        match builder.assemble(kernel) {
            Err(Error::Factory { message, .. }) => {
                assert!(message.contains("mercator"), "{message}");
                assert!(message.contains("2D → tr(3D→3D) → 2D"), "{message}");
            }
            other => panic!("expected a factory error, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn missing_target_dimension_reads_unknown() -> Result<(), Error> {
        let mut builder = builder();
        builder.set_source(CoordinateSystem::geographic_2d(), None)?;
        builder.set_target(CoordinateSystem::geographic_3d(), None)?;
        builder.complete_parameters()?;

        // An identity kernel: 2D in, 2D out, target is 3D
        let kernel = factory::scale(&[1., 1.])?;
        let pipeline = builder.assemble(kernel)?;
        assert_eq!(pipeline.target_dimensions(), 3);

        let mut out = [0.; 3];
        pipeline.transform_slice(&[12., 55.], &mut out)?;
        assert_float_eq!(out[0], 12., ulps <= 2);
        assert_float_eq!(out[1], 55., ulps <= 2);
        assert!(out[2].is_nan());
        Ok(())
    }

    #[test]
    fn radius_completion_uses_the_ellipsoid() -> Result<(), Error> {
        let ellipsoid = Ellipsoid::default();
        let mut builder = builder();
        builder.complete_vertical_with_radius();
        builder.set_source(CoordinateSystem::geographic_2d(), Some(ellipsoid))?;
        builder.set_target(
            CoordinateSystem::new(
                vec![
                    Axis::new(AxisDirection::East, Unit::Radian),
                    Axis::new(AxisDirection::North, Unit::Radian),
                    Axis::new(AxisDirection::Up, Unit::Metre),
                ],
                true,
            )?,
            Some(ellipsoid),
        )?;
        builder.complete_parameters()?;

        let kernel = factory::scale(&[1., 1., 1.])?;
        let pipeline = builder.assemble(kernel)?;

        let mut out = [0.; 3];
        pipeline.transform_slice(&[0., 45.], &mut out)?;
        assert_float_eq!(
            out[2],
            ellipsoid.geocentric_radius(45_f64.to_radians()),
            ulps <= 4
        );
        Ok(())
    }
}
