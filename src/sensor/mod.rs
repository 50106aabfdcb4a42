pub mod altitude;
pub mod bme280;
pub mod bus;
pub mod calibration;
pub mod compensation;

pub use altitude::Altitude;
pub use bme280::{Bme280, PressureUnit, SensorReading, TemperatureUnit};
pub use bus::{HalBus, SharedBus};

use thiserror::Error;

/// Everything that can go wrong while talking to the environmental sensor
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("slave address {0:#04x} out of range of 0x76-0x77")]
    InvalidAddress(u8),
    #[error("bus clock frequency {0} kHz out of range of 10-400 kHz")]
    InvalidFrequency(u32),
    #[error("altitude {value} {unit} is outside range of {min} to {max}")]
    InvalidAltitude {
        value: f64,
        unit: &'static str,
        min: f64,
        max: f64,
    },
    #[error("invalid chip id {0:#04x}, expected 0x60")]
    InvalidChipId(u8),
    #[error("bus transaction of {expected} byte(s) transferred {transferred} byte(s)")]
    Bus { expected: usize, transferred: usize },
    #[error("bus transaction failed: {0}")]
    BusFault(String),
    #[error("sensor still measuring after {0} status polls")]
    DeviceBusy(u32),
}

impl SensorError {
    /// Configuration problems that no amount of retrying will fix
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SensorError::InvalidAddress(_)
                | SensorError::InvalidFrequency(_)
                | SensorError::InvalidAltitude { .. }
        )
    }
}
