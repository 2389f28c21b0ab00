//! Angular conversions and wraparound handling, and the ULP measures
//! used as tolerances when verifying lossless grid compression.

/// Seconds-of-arc to radians.
pub fn arcsec_to_radians(arcsec: f64) -> f64 {
    (arcsec / 3600.).to_radians()
}

/// Radians to seconds-of-arc.
pub fn radians_to_arcsec(radians: f64) -> f64 {
    radians.to_degrees() * 3600.
}

/// The distance from `value` to the next representable `f64` of larger
/// magnitude. NaN for non-finite input.
pub fn ulp(value: f64) -> f64 {
    if !value.is_finite() {
        return f64::NAN;
    }
    let magnitude = value.abs();
    f64::from_bits(magnitude.to_bits() + 1) - magnitude
}

/// The distance from `value` to the next representable `f32` of larger
/// magnitude. NaN for non-finite input.
pub fn ulp_f32(value: f32) -> f32 {
    if !value.is_finite() {
        return f32::NAN;
    }
    let magnitude = value.abs();
    f32::from_bits(magnitude.to_bits() + 1) - magnitude
}

/// Reduce `value` by an integer number of `period`s, towards the
/// grid-equivalent value nearest to `center`. Idempotent: a value already
/// within half a period of `center` is returned unchanged.
pub fn wrap_towards(value: f64, center: f64, period: f64) -> f64 {
    if period == 0. || !value.is_finite() {
        return value;
    }
    value - period * ((value - center) / period).round()
}

// ----- T E S T S ------------------------------------------------------------------
