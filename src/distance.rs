use std::fmt::{Display, Formatter};

use serde::{Serialize, Serializer};

/// Mean earth radius in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Currency units charged per kilometer.
pub const RATE_PER_KM: f64 = 0.05;

/// Where every shipment starts.
pub const ORIGIN: Location = Location {
    latitude: 51.164896,
    longitude: 7.068792,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn distance_km_to(&self, other: &Location) -> u64 {
        distance_km(self.latitude, self.longitude, other.latitude, other.longitude)
    }
}

/// Great-circle distance (haversine) between two points given in degrees,
/// rounded to the nearest kilometer.
pub fn distance_km(origin_lat: f64, origin_long: f64, target_lat: f64, target_long: f64) -> u64 {
    let phi_1 = origin_lat.to_radians();
    let phi_2 = target_lat.to_radians();
    let delta_phi = (target_lat - origin_lat).to_radians();
    let delta_lambda = (target_long - origin_long).to_radians();

    let a = (delta_phi / 2.0).sin().powi(2) + phi_1.cos() * phi_2.cos() * (delta_lambda / 2.0).sin().powi(2);
    // clamp guards against a > 1 from rounding for antipodal points
    let c = 2.0 * a.sqrt().min(1.0).asin();

    (EARTH_RADIUS_KM * c).round() as u64
}

/// Money amount kept in whole cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Cost {
    cents: u64,
}

impl Cost {
    pub fn from_cents(cents: u64) -> Self {
        Self { cents }
    }

    pub fn cents(&self) -> u64 {
        self.cents
    }

    pub fn as_f64(&self) -> f64 {
        self.cents as f64 / 100.0
    }
}

impl Display for Cost {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.cents / 100, self.cents % 100)
    }
}

impl Serialize for Cost {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_f64())
    }
}

pub fn cost(distance_km: u64) -> Cost {
    cost_with_rate(distance_km, RATE_PER_KM)
}

/// Cost in whole cents, rounded half away from zero.
pub fn cost_with_rate(distance_km: u64, rate_per_km: f64) -> Cost {
    let cents = (distance_km as f64 * rate_per_km * 100.0).round();
    Cost::from_cents(cents.max(0.0) as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ShipmentQuote {
    pub distance: u64,
    pub cost: Cost,
}

impl ShipmentQuote {
    pub fn new(distance: u64) -> Self {
        Self {
            distance,
            cost: cost(distance),
        }
    }

    pub fn between(origin: &Location, target: &Location) -> Self {
        Self::new(origin.distance_km_to(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_points_have_zero_distance() {
        assert_eq!(distance_km(51.0, 7.0, 51.0, 7.0), 0);
        assert_eq!(distance_km(ORIGIN.latitude, ORIGIN.longitude, ORIGIN.latitude, ORIGIN.longitude), 0);
        assert_eq!(distance_km(-33.9, 151.2, -33.9, 151.2), 0);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let pairs = [
            (51.164896, 7.068792, 48.8566, 2.3522),
            (40.7128, -74.0060, -33.8688, 151.2093),
            (0.0, 0.0, 0.0, 180.0),
            (89.9, 10.0, -89.9, -170.0),
        ];

        for (a, b, c, d) in pairs {
            assert_eq!(distance_km(a, b, c, d), distance_km(c, d, a, b));
        }
    }

    #[test]
    fn test_known_distances() {
        // one degree of longitude on the equator
        assert_eq!(distance_km(0.0, 0.0, 0.0, 1.0), 111);
        // half the circumference
        assert_eq!(distance_km(0.0, 0.0, 0.0, 180.0), 20015);
        // origin to Paris
        let paris = Location::new(48.8566, 2.3522);
        assert_eq!(ORIGIN.distance_km_to(&paris), 424);
    }

    #[test]
    fn test_cost() {
        assert_eq!(cost(0), Cost::from_cents(0));
        assert_eq!(cost(0).to_string(), "0.00");
        assert_eq!(cost(100), Cost::from_cents(500));
        assert_eq!(cost(100).to_string(), "5.00");
        assert_eq!(cost(1).to_string(), "0.05");
        assert_eq!(cost(123).to_string(), "6.15");
        assert_eq!(cost(100).as_f64(), 5.0);
    }

    #[test]
    fn test_cost_rounds_to_nearest_cent() {
        assert_eq!(cost_with_rate(1, 0.014), Cost::from_cents(1));
        assert_eq!(cost_with_rate(1, 0.016), Cost::from_cents(2));
        assert_eq!(cost_with_rate(3, 0.1), Cost::from_cents(30));
    }

    #[test]
    fn test_quote_serializes_like_the_cart_expects() {
        let quote = ShipmentQuote::new(123);
        assert_eq!(
            serde_json::to_value(quote).unwrap(),
            serde_json::json!({"distance": 123, "cost": 6.15})
        );
        assert_eq!(
            serde_json::to_value(ShipmentQuote::default()).unwrap(),
            serde_json::json!({"distance": 0, "cost": 0.0})
        );
    }
}
