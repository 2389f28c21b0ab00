//! Coordinate system metadata: axis directions and units, and the
//! normalization transforms mapping a user coordinate system onto the
//! canonical (east, north, up) axis order with angular coordinates in
//! radians and linear coordinates in metres.

use crate::matrix::Matrix;
use crate::Error;

// ----- U N I T S ---------------------------------------------------------------------

/// The units of measure handled by axis normalization and grid
/// geometries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Radian,
    Degree,
    Gradian,
    ArcSecond,
    Metre,
    Foot,
}

impl Unit {
    /// Conversion factor to the base unit of the same kind:
    /// radians for angular units, metres for linear ones.
    pub fn to_base(&self) -> f64 {
        match self {
            Unit::Radian => 1.,
            Unit::Degree => std::f64::consts::PI / 180.,
            Unit::Gradian => std::f64::consts::PI / 200.,
            Unit::ArcSecond => std::f64::consts::PI / (180. * 3600.),
            Unit::Metre => 1.,
            Unit::Foot => 0.3048,
        }
    }

    pub fn is_angular(&self) -> bool {
        matches!(
            self,
            Unit::Radian | Unit::Degree | Unit::Gradian | Unit::ArcSecond
        )
    }
}

// ----- A X E S -----------------------------------------------------------------------

/// The direction of increasing coordinate values along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisDirection {
    East,
    West,
    North,
    South,
    Up,
    Down,
}

impl AxisDirection {
    // Position in the canonical (east, north, up) order
    fn canonical_slot(&self) -> usize {
        match self {
            AxisDirection::East | AxisDirection::West => 0,
            AxisDirection::North | AxisDirection::South => 1,
            AxisDirection::Up | AxisDirection::Down => 2,
        }
    }

    // +1 along the canonical direction, -1 against it
    fn sign(&self) -> f64 {
        match self {
            AxisDirection::East | AxisDirection::North | AxisDirection::Up => 1.,
            _ => -1.,
        }
    }
}

/// One coordinate system axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Axis {
    pub direction: AxisDirection,
    pub unit: Unit,
}

impl Axis {
    pub fn new(direction: AxisDirection, unit: Unit) -> Axis {
        Axis { direction, unit }
    }
}

// ----- C O O R D I N A T E   S Y S T E M S -------------------------------------------

/// An ordered list of axes, optionally flagged as ellipsoidal (i.e.
/// carrying geodetic longitude/latitude rather than projected
/// coordinates).
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinateSystem {
    axes: Vec<Axis>,
    ellipsoidal: bool,
}

impl CoordinateSystem {
    pub fn new(axes: Vec<Axis>, ellipsoidal: bool) -> Result<CoordinateSystem, Error> {
        if axes.is_empty() {
            return Err(Error::Invalid("a coordinate system needs axes".to_string()));
        }
        Ok(CoordinateSystem { axes, ellipsoidal })
    }

    /// The conventional (longitude, latitude) system in degrees.
    pub fn geographic_2d() -> CoordinateSystem {
        CoordinateSystem {
            axes: vec![
                Axis::new(AxisDirection::East, Unit::Degree),
                Axis::new(AxisDirection::North, Unit::Degree),
            ],
            ellipsoidal: true,
        }
    }

    /// (longitude, latitude, ellipsoidal height) in degrees and metres.
    pub fn geographic_3d() -> CoordinateSystem {
        CoordinateSystem {
            axes: vec![
                Axis::new(AxisDirection::East, Unit::Degree),
                Axis::new(AxisDirection::North, Unit::Degree),
                Axis::new(AxisDirection::Up, Unit::Metre),
            ],
            ellipsoidal: true,
        }
    }

    /// A plain (easting, northing) system in metres.
    pub fn projected_2d() -> CoordinateSystem {
        CoordinateSystem {
            axes: vec![
                Axis::new(AxisDirection::East, Unit::Metre),
                Axis::new(AxisDirection::North, Unit::Metre),
            ],
            ellipsoidal: false,
        }
    }

    pub fn dimension(&self) -> usize {
        self.axes.len()
    }

    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    pub fn is_ellipsoidal(&self) -> bool {
        self.ellipsoidal
    }

    /// The affine mapping this system onto the canonical axis order and
    /// units: axis swaps, sign flips and unit scalings only.
    pub fn normalization(&self) -> Result<Matrix, Error> {
        let dim = self.dimension();
        let mut matrix = Matrix::zero(dim + 1, dim + 1);
        let mut covered = vec![false; dim];
        for (i, axis) in self.axes.iter().enumerate() {
            let slot = axis.direction.canonical_slot();
            if slot >= dim || covered[slot] {
                return Err(Error::Invalid(format!(
                    "axis directions of {self:?} are not a permutation"
                )));
            }
            covered[slot] = true;
            matrix.set(slot, i, axis.direction.sign() * axis.unit.to_base());
        }
        matrix.set(dim, dim, 1.);
        Ok(matrix)
    }

    /// The inverse of [CoordinateSystem::normalization]: canonical
    /// coordinates back to this system's order and units.
    pub fn denormalization(&self) -> Result<Matrix, Error> {
        self.normalization()?.inverted()
    }
}

// ----- T E S T S ------------------------------------------------------------------
