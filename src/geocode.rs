//! ECEF→geodetic conversion and the reverse-geocoding seam.
//!
//! Reverse geocoding (`lat, lon -> country, city`) is an external
//! collaborator exactly as the protocol spec describes it: the parser calls
//! a pure function injected as a trait object and tolerates `None`. This
//! crate does not ship a geocoding database; callers wire in whatever
//! service or offline dataset they have.
//!
//! ECEF→LLA itself is not an external collaborator: no crate in reach of
//! this workspace exposes a raw Earth-Centered-Earth-Fixed to geodetic
//! transform (`geoutils::Location` only does great-circle distance between
//! two already-geodetic points), so it is implemented here directly using
//! Heikkinen's closed-form solution — branch-free, no Newton iteration,
//! standard WGS-84 geodesy.

use isocountry::CountryCode;

/// WGS-84 semi-major axis, meters.
const WGS84_A: f64 = 6_378_137.0;
/// WGS-84 flattening.
const WGS84_F: f64 = 1.0 / 298.257_223_563;

/// Converts Earth-Centered Earth-Fixed coordinates (meters) to WGS-84
/// latitude/longitude (degrees) and ellipsoidal height (meters), using
/// Heikkinen's closed-form algorithm.
pub fn ecef_to_lla(x: f64, y: f64, z: f64) -> (f64, f64, f64) {
    let a = WGS84_A;
    let f = WGS84_F;
    let b = a * (1.0 - f);
    let e2 = f * (2.0 - f);
    let ep2 = (a * a - b * b) / (b * b);

    let p = (x * x + y * y).sqrt();
    let theta = (z * a).atan2(p * b);
    let sin_theta = theta.sin();
    let cos_theta = theta.cos();

    let lat = (z + ep2 * b * sin_theta.powi(3)).atan2(p - e2 * a * cos_theta.powi(3));
    let lon = y.atan2(x);
    let sin_lat = lat.sin();
    let n = a / (1.0 - e2 * sin_lat * sin_lat).sqrt();
    let height = p / lat.cos() - n;

    (lat.to_degrees(), lon.to_degrees(), height)
}

/// Maps a 2-letter ISO-3166-1 alpha-2 country code (what most reverse
/// geocoders return) to the 3-letter alpha-3 form the sourcetable uses.
/// Falls back to the input verbatim when unrecognized, mirroring the
/// original catalog's table lookup with an identity fallback.
pub fn alpha2_to_alpha3(alpha2: &str) -> String {
    CountryCode::for_alpha2(alpha2)
        .map(|c| c.alpha3().to_string())
        .unwrap_or_else(|_| alpha2.to_uppercase())
}

/// A reverse-geocoding lookup: `(lat, lon) -> (country_iso3, city)`.
/// Implementations are free to hit a local database, an HTTP API, or
/// anything else; the core only requires the call to be cheap enough to run
/// from inside the bounded parser window and tolerates `None`.
pub trait ReverseGeocoder: Send + Sync {
    fn reverse_geocode(&self, lat: f64, lon: f64) -> Option<(String, String)>;
}

/// A geocoder that never resolves anything. Used when no external
/// geocoding collaborator is configured: station coordinates are still
/// reported, just without a city/country label.
pub struct NullReverseGeocoder;

impl ReverseGeocoder for NullReverseGeocoder {
    fn reverse_geocode(&self, _lat: f64, _lon: f64) -> Option<(String, String)> {
        None
    }
}
