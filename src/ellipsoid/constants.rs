/// The builtin ellipsoids: name, semimajor axis, inverse flattening
/// (0 for spheres).
#[rustfmt::skip]
pub(super) const ELLIPSOID_LIST: [(&str, f64, f64); 8] = [
    ("GRS80",      6_378_137.0,   298.257_222_100_882_7),
    ("WGS84",      6_378_137.0,   298.257_223_563),
    ("intl",       6_378_388.0,   297.0),
    ("krass",      6_378_245.0,   298.3),
    ("bessel",     6_377_397.155, 299.152_812_8),
    ("clrk66",     6_378_206.4,   294.978_698_2),
    ("GRS67",      6_378_160.0,   298.247_167_427),
    ("unitsphere", 1.0,           0.0),
];
