/// Station altitude and the barometric millibar correction derived from it
use crate::sensor::SensorError;

pub const METERS_PER_FOOT: f64 = 0.3048;
pub const MIN_ALTITUDE_FEET: f64 = -1000.0;
pub const MAX_ALTITUDE_FEET: f64 = 10000.0;
pub const MIN_ALTITUDE_METERS: f64 = -308.0;
pub const MAX_ALTITUDE_METERS: f64 = 3080.0;

const FEET_PER_BIN: i32 = 200;

// Millibar correction per 200 ft, starting at -1000 ft
// (engineeringtoolbox.com barometer elevation compensation table)
const MILLIBAR_CORRECTIONS: [i16; 56] = [
    -37, -30, -22, -15, -7, // -1000 .. -200
    0, 7, 15, 22, 29, // 0 .. 800
    36, 43, 50, 57, 64, // 1000 .. 1800
    71, 78, 85, 92, 98, // 2000 .. 2800
    105, 112, 118, 125, 132, // 3000 .. 3800
    138, 145, 151, 157, 164, // 4000 .. 4800
    170, 176, 183, 189, 195, // 5000 .. 5800
    201, 207, 213, 219, 225, // 6000 .. 6800
    231, 237, 243, 249, 255, // 7000 .. 7800
    261, 266, 272, 278, 283, // 8000 .. 8800
    289, 295, 300, 306, 311, // 9000 .. 9800
    316, // 10000
];

/// Altitude kept in feet; the metre view is derived
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Altitude {
    feet: f64,
}

impl Altitude {
    pub fn from_feet(feet: f64) -> Result<Self, SensorError> {
        if !(MIN_ALTITUDE_FEET..=MAX_ALTITUDE_FEET).contains(&feet) {
            return Err(SensorError::InvalidAltitude {
                value: feet,
                unit: "feet",
                min: MIN_ALTITUDE_FEET,
                max: MAX_ALTITUDE_FEET,
            });
        }
        Ok(Self { feet })
    }

    pub fn from_meters(meters: f64) -> Result<Self, SensorError> {
        if !(MIN_ALTITUDE_METERS..=MAX_ALTITUDE_METERS).contains(&meters) {
            return Err(SensorError::InvalidAltitude {
                value: meters,
                unit: "meters",
                min: MIN_ALTITUDE_METERS,
                max: MAX_ALTITUDE_METERS,
            });
        }
        Ok(Self {
            feet: meters / METERS_PER_FOOT,
        })
    }

    pub fn feet(&self) -> f64 {
        self.feet
    }

    pub fn meters(&self) -> f64 {
        self.feet * METERS_PER_FOOT
    }

    /// Whole millibars to add to station pressure
    pub fn millibar_correction(&self) -> i32 {
        millibar_correction(self.feet)
    }
}

/// Piecewise-linear lookup, rounded to the nearest millibar
pub fn millibar_correction(altitude_feet: f64) -> i32 {
    let shifted = altitude_feet.clamp(MIN_ALTITUDE_FEET, MAX_ALTITUDE_FEET) as i32
        - MIN_ALTITUDE_FEET as i32;
    let index = (shifted / FEET_PER_BIN) as usize;
    let whole = MILLIBAR_CORRECTIONS[index] as i32;

    if index + 1 >= MILLIBAR_CORRECTIONS.len() {
        return whole;
    }

    let distance = (shifted % FEET_PER_BIN) as f64;
    let next = MILLIBAR_CORRECTIONS[index + 1] as i32;
    let fraction = distance / FEET_PER_BIN as f64 * (next - whole) as f64;
    whole + fraction.round() as i32
}
