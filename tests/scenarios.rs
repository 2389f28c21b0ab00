//! End-to-end scenarios exercising the public API the way an embedding
//! system would: a user-provided projection kernel, a user-provided
//! data-access back end, and the library machinery in between.
//!
//! Since integration tests are compiled as independent crates, the
//! collaborators defined here could just as well live entirely outside
//! the library source tree.

use graticule::authoring::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use float_eq::assert_float_eq;

// ----- U S E R   P R O V I D E D   K E R N E L -------------------------------------

/// A spherical Mercator projection on the unit sphere, as an embedding
/// system would implement it against the `Transform` trait.
#[derive(Debug)]
struct Mercator;

impl Transform for Mercator {
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
        Err(Error::NonInvertible("mercator test kernel".to_string()))
    }
}

// ----- U S E R   P R O V I D E D   B A C K   E N D ---------------------------------

struct Backend {
    creations: Arc<AtomicUsize>,
    closures: Arc<AtomicUsize>,
}

struct BackendSession {
    creations: Arc<AtomicUsize>,
    closures: Arc<AtomicUsize>,
}

impl AccessSession for BackendSession {
    fn create(&mut self, kind: ObjectKind, code: &str) -> Result<SharedObject, Error> {
        self.creations.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(format!("{kind:?}:{code}")))
    }

    fn find(
        &mut self,
        target: &SearchTarget,
        _config: FinderConfig,
    ) -> Result<BTreeSet<String>, Error> {
        Ok(BTreeSet::from([target.name.clone()]))
    }

    fn close(&mut self) -> Result<(), Error> {
        self.closures.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl SessionProvider for Backend {
    fn new_session(&self) -> Result<Box<dyn AccessSession>, Error> {
        Ok(Box::new(BackendSession {
            creations: self.creations.clone(),
            closures: self.closures.clone(),
        }))
    }
}

fn backend() -> (Box<Backend>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let creations = Arc::new(AtomicUsize::new(0));
    let closures = Arc::new(AtomicUsize::new(0));
    let provider = Box::new(Backend {
        creations: creations.clone(),
        closures: closures.clone(),
    });
    (provider, creations, closures)
}

// ----- S C E N A R I O S -----------------------------------------------------------

// Three exact control points give an exact integer affine
#[test]
fn integer_affine_from_three_points() -> Result<(), Error> {
    let mut fitter = Fitter::new(2, 2)?;
    fitter.set_control_point(&[0., 0.], &[3., 1.])?;
    fitter.set_control_point(&[1., 0.], &[5., 1.])?;
    fitter.set_control_point(&[0., 1.], &[3., 2.])?;
    let fit = fitter.create()?;

    let expected = [2., 0., 3., 0., 1., 1., 0., 0., 1.];
    for i in 0..3 {
        for j in 0..3 {
            assert_eq!(fit.matrix().get(i, j), expected[i * 3 + j]);
        }
    }
    assert_eq!(fit.correlations(), &[1.0, 1.0]);

    // Least-squares optimality, spot checked against perturbed affines
    let points: [([f64; 2], [f64; 2]); 3] =
        [([0., 0.], [3., 1.]), ([1., 0.], [5., 1.]), ([0., 1.], [3., 2.])];
    let residual = |m: &[f64; 9]| -> f64 {
        points
            .iter()
            .map(|(s, t)| {
                let x = m[0] * s[0] + m[1] * s[1] + m[2] - t[0];
                let y = m[3] * s[0] + m[4] * s[1] + m[5] - t[1];
                x * x + y * y
            })
            .sum()
    };
    assert_eq!(residual(&expected), 0.);
    let mut perturbed = expected;
    perturbed[2] += 0.01;
    assert!(residual(&perturbed) > 0.);
    Ok(())
}

// A grid of tenths compresses losslessly with scale 0.1
#[test]
fn compression_round_trip() -> Result<(), Error> {
    let band: Vec<f32> = vec![0.1, 0.2, 0.3, 0.2, 0.3, 0.4, 0.3, 0.4, 0.5];
    let geometry = GridGeometry::new((3, 3), (0., 0.), (1., 1.))?;
    let grid = ShiftGrid::new(geometry, GridData::Float(vec![band.clone()]))?;
    let compressed = grid.compress(0.1);
    assert!(matches!(&**compressed.data(), GridData::Quantized { .. }));

    for y in 0..3 {
        for x in 0..3 {
            let source = band[x + 3 * y];
            let restored = compressed.cell(0, x, y) as f32;
            let ulp = f32::from_bits(source.to_bits() + 1) - source;
            assert!(
                (restored - source).abs() <= ulp,
                "cell ({x},{y}): {restored} vs {source}"
            );
        }
    }
    Ok(())
}

// Control points on a Mercator curve select the Mercator linearizer
#[test]
fn linearizer_selection() -> Result<(), Error> {
    let mut fitter = Fitter::with_grid_size(&[2, 3], 2)?;
    for y in 0..3 {
        for x in 0..2 {
            let lon = 0.1 * x as f64;
            let lat = (0.2 * y as f64).sinh().atan();
            fitter.set_control_point(&[x as f64, y as f64], &[lon, lat])?;
        }
    }
    let identity = factory::affine(Matrix::identity(3))?;
    fitter.add_linearizers(
        vec![
            ("identity".to_string(), identity),
            ("mercator".to_string(), Arc::new(Mercator) as _),
        ],
        false,
        &[0, 1],
    )?;
    let fit = fitter.create()?;

    assert_eq!(fit.linearizer(), Some("mercator"));
    assert_float_eq!(fit.correlation(), 1.0, abs <= 1e-12);

    // The internal target arrays were replaced by the projected values
    let projected = fit.control_point(&[1., 2.]).unwrap();
    assert_float_eq!(projected[0], 0.1, abs <= 1e-12);
    assert_float_eq!(projected[1], 0.4, abs <= 1e-12);
    Ok(())
}

// 3D ellipsoidal source, 2D kernel, 2D target: the height is dropped
// and the pipeline equals the kernel on normalized coordinates
#[test]
fn dimension_adjusting_pipeline() -> Result<(), Error> {
    let mut builder = PipelineBuilder::new(ParameterGroup::new("mercator", &ELLIPSOID_PARAMETERS));
    builder.set_source(CoordinateSystem::geographic_3d(), Some(Ellipsoid::default()))?;
    builder.set_target(CoordinateSystem::projected_2d(), None)?;
    builder.complete_parameters()?;
    assert_eq!(
        builder.parameters().parameter("semi_major")?.value(),
        Some(6378137.)
    );

    let kernel: Arc<dyn Transform> = Arc::new(Mercator);
    let pipeline = builder.assemble(kernel.clone())?;
    assert_eq!(pipeline.source_dimensions(), 3);
    assert_eq!(pipeline.target_dimensions(), 2);

    for (lon, lat, height) in [(12., 55., 0.), (12., 55., 8848.), (-71.06, 42.36, -10.)] {
        let mut out = [0.; 2];
        pipeline.transform_slice(&[lon, lat, height], &mut out)?;

        let mut expected = [0.; 2];
        kernel.transform_slice(&[lon.to_radians(), lat.to_radians()], &mut expected)?;
        assert_float_eq!(out[0], expected[0], ulps <= 2);
        assert_float_eq!(out[1], expected[1], ulps <= 2);
    }
    Ok(())
}

// 100 threads, one back-end creation, one shared instance
#[test]
fn concurrent_cache_creates_once() -> Result<(), Error> {
    let (provider, creations, _) = backend();
    let cache = AuthorityCache::new(provider, 4);

    let objects: Vec<SharedObject> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..100)
            .map(|_| s.spawn(|| cache.create(ObjectKind::CoordinateReferenceSystem, "EPSG:4326")))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect::<Result<_, _>>()
    })?;

    assert_eq!(creations.load(Ordering::SeqCst), 1);
    for object in &objects[1..] {
        assert!(Arc::ptr_eq(&objects[0], object));
    }
    let s = objects[0]
        .downcast_ref::<String>()
        .expect("back end produced a string");
    assert_eq!(s, "CoordinateReferenceSystem:4326");
    Ok(())
}

// A 100 ms timeout: the session idles promptly and is closed within the
// scheduling resolution of the sweeper
#[test]
fn session_idle_timeout() -> Result<(), Error> {
    let (provider, _, closures) = backend();
    let cache = AuthorityCache::new(provider, 2);
    cache.set_timeout(Duration::from_millis(100));

    let released = Instant::now();
    cache.create(ObjectKind::Datum, "6326")?;

    // Returned to the idle list promptly after the create
    assert!(released.elapsed() < Duration::from_millis(20));
    assert_eq!(cache.pool().idle_count(), 1);
    assert_eq!(closures.load(Ordering::SeqCst), 0);

    // Closed once the timeout has passed, within the resolution window
    let deadline = released + Duration::from_millis(100) + 2 * TIMEOUT_RESOLUTION;
    while closures.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let elapsed = released.elapsed();
    assert_eq!(closures.load(Ordering::SeqCst), 1);
    assert!(
        elapsed >= Duration::from_millis(100),
        "closed too early: {elapsed:?}"
    );
    assert!(
        elapsed <= Duration::from_millis(100) + 2 * TIMEOUT_RESOLUTION,
        "closed too late: {elapsed:?}"
    );
    assert_eq!(cache.pool().idle_count(), 0);
    Ok(())
}

// The assembled pipeline is denorm ∘ kernel ∘ norm, verified through a
// full axis-order and unit change on both sides
#[test]
fn pipeline_composition_property() -> Result<(), Error> {
    // Latitude-first degrees in, swapped kilometre-ish units out
    let source = CoordinateSystem::new(
        vec![
            Axis::new(AxisDirection::North, Unit::Degree),
            Axis::new(AxisDirection::East, Unit::Degree),
        ],
        true,
    )?;
    let target = CoordinateSystem::new(
        vec![
            Axis::new(AxisDirection::North, Unit::Metre),
            Axis::new(AxisDirection::East, Unit::Metre),
        ],
        false,
    )?;

    let mut builder = PipelineBuilder::new(ParameterGroup::new("mercator", &ELLIPSOID_PARAMETERS));
    builder.set_source(source.clone(), Some(Ellipsoid::default()))?;
    builder.set_target(target.clone(), None)?;
    builder.complete_parameters()?;

    let kernel: Arc<dyn Transform> = Arc::new(Mercator);
    let pipeline = builder.assemble(kernel.clone())?;

    let q = [55., 12.];
    let mut actual = [0.; 2];
    pipeline.transform_slice(&q, &mut actual)?;

    // The same journey, spelled out step by step
    let norm = factory::affine(source.normalization()?)?;
    let denorm = factory::affine(target.denormalization()?)?;
    let mut normalized = [0.; 2];
    norm.transform_slice(&q, &mut normalized)?;
    let mut projected = [0.; 2];
    kernel.transform_slice(&normalized, &mut projected)?;
    let mut expected = [0.; 2];
    denorm.transform_slice(&projected, &mut expected)?;

    assert_float_eq!(actual[0], expected[0], ulps <= 2);
    assert_float_eq!(actual[1], expected[1], ulps <= 2);
    Ok(())
}

// The finder and the creator draw from the same bounded pool, and a
// session released by one is available to the other
#[test]
fn find_and_create_share_the_session_pool() -> Result<(), Error> {
    let (provider, _, _) = backend();
    let cache = AuthorityCache::new(provider, 1);

    let target = SearchTarget::new(ObjectKind::CoordinateReferenceSystem, "WGS 84");
    let config = FinderConfig {
        domain: SearchDomain::NameAndCode,
        ignore_axes: false,
        single_match: true,
    };
    let results = cache.find_matches(&target, config)?;
    assert!(results.contains("WGS 84"));

    // With a pool bounded to one session, a follow-up create must
    // succeed rather than deadlock on an exhausted pool
    cache.create(ObjectKind::CoordinateReferenceSystem, "EPSG:4326")?;
    Ok(())
}
