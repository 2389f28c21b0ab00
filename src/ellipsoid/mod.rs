//! Representation of a biaxial reference ellipsoid, with the derived
//! quantities needed for parameter completion and the spherical-radius
//! pipeline step.

use crate::cs::Unit;
use crate::Error;

mod constants;

/// A biaxial ellipsoid, defined by its semimajor axis and flattening.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ellipsoid {
    a: f64,
    f: f64,
    /// True when the ellipsoid was defined by its inverse flattening,
    /// false when it was defined by its semiminor axis.
    ivf_definitive: bool,
    unit: Unit,
}

/// GRS80 is the default ellipsoid.
impl Default for Ellipsoid {
    fn default() -> Ellipsoid {
        Ellipsoid::new(6_378_137.0, 1. / 298.257_222_100_882_7)
    }
}

impl Ellipsoid {
    /// User defined ellipsoid, from semimajor axis and flattening,
    /// in metres.
    #[must_use]
    pub fn new(semimajor_axis: f64, flattening: f64) -> Ellipsoid {
        Ellipsoid {
            a: semimajor_axis,
            f: flattening,
            ivf_definitive: true,
            unit: Unit::Metre,
        }
    }

    /// User defined ellipsoid, from its two semiaxes.
    #[must_use]
    pub fn from_semiaxes(semimajor_axis: f64, semiminor_axis: f64) -> Ellipsoid {
        Ellipsoid {
            a: semimajor_axis,
            f: (semimajor_axis - semiminor_axis) / semimajor_axis,
            ivf_definitive: false,
            unit: Unit::Metre,
        }
    }

    /// Predefined ellipsoid, or the "semimajor, reciproque-flattening"
    /// form, e.g. "6378137, 298.3".
    pub fn named(name: &str) -> Result<Ellipsoid, Error> {
        if let Some(e) = constants::ELLIPSOID_LIST.iter().find(|e| e.0 == name) {
            let rf = e.2;
            let f = if rf != 0.0 { 1.0 / rf } else { rf };
            return Ok(Ellipsoid::new(e.1, f));
        }

        let a_and_rf = name.split(',').collect::<Vec<_>>();
        if a_and_rf.len() == 2_usize {
            if let Ok(a) = a_and_rf[0].trim().parse::<f64>() {
                if let Ok(rf) = a_and_rf[1].trim().parse::<f64>() {
                    return Ok(Ellipsoid::new(a, 1. / rf));
                }
            }
        }

        Err(Error::MissingResource(format!("ellipsoid '{name}'")))
    }

    // ----- Defining parameters ---------------------------------------------------

    /// The semimajor axis, *a*
    #[must_use]
    pub fn semimajor_axis(&self) -> f64 {
        self.a
    }

    /// The semiminor axis, *b*
    #[must_use]
    pub fn semiminor_axis(&self) -> f64 {
        self.a * (1.0 - self.f)
    }

    /// The flattening, *f = (a - b)/a*
    #[must_use]
    pub fn flattening(&self) -> f64 {
        self.f
    }

    /// The inverse flattening, *1/f*. Infinite for a sphere.
    #[must_use]
    pub fn inverse_flattening(&self) -> f64 {
        1.0 / self.f
    }

    /// True when the inverse flattening is a defining parameter, rather
    /// than derived from the semiminor axis.
    #[must_use]
    pub fn is_ivf_definitive(&self) -> bool {
        self.ivf_definitive
    }

    /// The unit of the axis lengths.
    #[must_use]
    pub fn axis_unit(&self) -> Unit {
        self.unit
    }

    // ----- Derived quantities ----------------------------------------------------

    /// The squared eccentricity *e² = (a² - b²) / a²*
    #[must_use]
    pub fn eccentricity_squared(&self) -> f64 {
        self.f * (2_f64 - self.f)
    }

    /// The eccentricity *e*
    #[must_use]
    pub fn eccentricity(&self) -> f64 {
        self.eccentricity_squared().sqrt()
    }

    /// The radius of curvature in the prime vertical, *N*
    #[must_use]
    pub fn prime_vertical_radius_of_curvature(&self, latitude: f64) -> f64 {
        if self.f == 0.0 {
            return self.a;
        }
        self.a / (1.0 - latitude.sin().powi(2) * self.eccentricity_squared()).sqrt()
    }

    /// The distance from the center of the ellipsoid to its surface at
    /// the given geodetic latitude.
    #[must_use]
    pub fn geocentric_radius(&self, latitude: f64) -> f64 {
        let b = self.semiminor_axis();
        let (sin, cos) = latitude.sin_cos();
        let x = self.a * self.a * cos;
        let y = b * b * sin;
        let num = x * x + y * y;
        let den = (self.a * cos).powi(2) + (b * sin).powi(2);
        (num / den).sqrt()
    }
}

// ----- T E S T S ------------------------------------------------------------------
