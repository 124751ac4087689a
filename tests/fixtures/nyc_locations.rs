//! Real New York City addresses for realistic test fixtures.
//!
//! Coordinates are approximate building locations.

use batch_planner::model::Coordinates;

/// A street address with its ZIP and coordinates.
#[derive(Debug, Clone)]
pub struct Location {
    pub street: &'static str,
    pub zip: &'static str,
    pub lat: f64,
    pub lng: f64,
}

impl Location {
    pub const fn new(street: &'static str, zip: &'static str, lat: f64, lng: f64) -> Self {
        Self { street, zip, lat, lng }
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.lat, self.lng)
    }
}

// ============================================================================
// Collection points (lead farmer drop sites)
// ============================================================================

pub const WILLIAMSBURG_HUB: Location = Location::new("200 Bedford Ave", "11211", 40.7170, -73.9588);
pub const PARK_SLOPE_HUB: Location = Location::new("330 5th Ave", "11215", 40.6720, -73.9840);

// ============================================================================
// Chelsea / Hudson Yards (10001)
// ============================================================================

pub const CHELSEA: &[Location] = &[
    Location::new("350 W 31st St", "10001", 40.7508, -73.9960),
    Location::new("424 W 33rd St", "10001", 40.7530, -73.9990),
    Location::new("305 W 29th St", "10001", 40.7489, -73.9954),
    Location::new("250 W 26th St", "10001", 40.7466, -73.9951),
    Location::new("440 9th Ave", "10001", 40.7535, -73.9963),
    Location::new("132 W 31st St", "10001", 40.7483, -73.9904),
];

// ============================================================================
// Lower East Side (10002)
// ============================================================================

pub const LOWER_EAST_SIDE: &[Location] = &[
    Location::new("145 Essex St", "10002", 40.7206, -73.9874),
    Location::new("88 Orchard St", "10002", 40.7188, -73.9900),
    Location::new("40 Delancey St", "10002", 40.7193, -73.9930),
    Location::new("175 Rivington St", "10002", 40.7199, -73.9852),
];

// ============================================================================
// Williamsburg (11211)
// ============================================================================

pub const WILLIAMSBURG: &[Location] = &[
    Location::new("61 Wythe Ave", "11211", 40.7215, -73.9580),
    Location::new("118 N 11th St", "11211", 40.7212, -73.9555),
    Location::new("276 Grand St", "11211", 40.7134, -73.9578),
];

pub fn all_locations() -> Vec<Location> {
    CHELSEA
        .iter()
        .chain(LOWER_EAST_SIDE)
        .chain(WILLIAMSBURG)
        .chain([&WILLIAMSBURG_HUB, &PARK_SLOPE_HUB])
        .cloned()
        .collect()
}
