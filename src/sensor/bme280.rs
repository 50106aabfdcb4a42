/// Bosch BME280 temperature / pressure / humidity driver
///
/// The driver only ever uses forced mode with x1 oversampling on all three
/// channels (the datasheet "weather monitoring" profile): every `measure`
/// call triggers exactly one conversion and the chip goes back to sleep.
use embedded_hal::i2c::Operation;
use log::{debug, info};
use std::str::FromStr;
use std::thread;
use std::time::Duration;

use crate::sensor::altitude::Altitude;
use crate::sensor::bus::{BusTransport, SharedBus};
use crate::sensor::calibration::{CalibrationProfile, WINDOW_88_LEN, WINDOW_E1_LEN};
use crate::sensor::compensation::{self, Channel, CompensatedReading, RawSample, ADC_BLOCK_LEN};
use crate::sensor::SensorError;

// Register map
const REG_CHIP_ID: u8 = 0xD0;
const REG_RESET: u8 = 0xE0;
const REG_CTRL_HUM: u8 = 0xF2;
const REG_STATUS: u8 = 0xF3;
const REG_CTRL_MEAS: u8 = 0xF4;
const REG_CONFIG: u8 = 0xF5;
const REG_ADC_START: u8 = 0xF7;
const REG_CALIB_88: u8 = 0x88;
const REG_CALIB_E1: u8 = 0xE1;

const CHIP_ID: u8 = 0x60;
const RESET_COMMAND: u8 = 0xB6;
const STATUS_MASK: u8 = 0x09; // measuring | im_update
const POWER_MODE_MASK: u8 = 0x03;

const HUMIDITY_OVERSAMPLE_X1: u8 = 0x01;
// osrs_t = x1, osrs_p = x1, mode = forced
const WEATHER_MONITORING_CONFIG: u8 = 0x25;
const CONFIG_FILTER_OFF: u8 = 0x00;

pub const MIN_ADDRESS: u8 = 0x76;
pub const MAX_ADDRESS: u8 = 0x77;
pub const MIN_FREQUENCY_KHZ: u32 = 10;
pub const MAX_FREQUENCY_KHZ: u32 = 400;

const SHORT_TIMEOUT: Duration = Duration::from_millis(1000);
const LONG_TIMEOUT: Duration = Duration::from_millis(2000);
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(40);
const MAX_STATUS_POLLS: u32 = 25;

const PA_PER_MILLIBAR: f64 = 100.0;
const KPA_PER_MILLIBAR: f64 = 0.1;
const KPA_TO_INCHES_HG: f64 = 0.2953;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemperatureUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PressureUnit {
    /// Sea-level equivalent millibars (altitude corrected)
    #[default]
    Millibar,
    InchesHg,
}

impl FromStr for TemperatureUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "c" | "celsius" => Ok(TemperatureUnit::Celsius),
            "f" | "fahrenheit" => Ok(TemperatureUnit::Fahrenheit),
            other => Err(format!("unknown temperature unit '{}'", other)),
        }
    }
}

impl FromStr for PressureUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mbar" | "millibar" => Ok(PressureUnit::Millibar),
            "inhg" => Ok(PressureUnit::InchesHg),
            other => Err(format!("unknown pressure unit '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Sleep,
    Forced,
    Normal,
}

/// One measurement in the driver's configured reporting units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub temperature: Channel,
    pub pressure: Channel,
    pub humidity: Channel,
}

pub fn validate_address(address: u8) -> Result<(), SensorError> {
    if !(MIN_ADDRESS..=MAX_ADDRESS).contains(&address) {
        return Err(SensorError::InvalidAddress(address));
    }
    Ok(())
}

pub fn validate_frequency(frequency_khz: u32) -> Result<(), SensorError> {
    if !(MIN_FREQUENCY_KHZ..=MAX_FREQUENCY_KHZ).contains(&frequency_khz) {
        return Err(SensorError::InvalidFrequency(frequency_khz));
    }
    Ok(())
}

pub struct Bme280<B> {
    bus: SharedBus<B>,
    address: u8,
    calibration: CalibrationProfile,
    altitude: Altitude,
    temperature_unit: TemperatureUnit,
    pressure_unit: PressureUnit,
}

impl<B: BusTransport> Bme280<B> {
    /// Identify, reset and read the calibration of the chip at `address`
    ///
    /// Any failure leaves nothing behind; the caller retries by constructing
    /// a new driver.
    pub fn new(bus: SharedBus<B>, address: u8, frequency_khz: u32) -> Result<Self, SensorError> {
        validate_address(address)?;
        validate_frequency(frequency_khz)?;

        let mut chip = [0u8; 1];
        bus.transact(
            address,
            &mut [Operation::Write(&[REG_CHIP_ID]), Operation::Read(&mut chip)],
            SHORT_TIMEOUT,
        )?;
        if chip[0] != CHIP_ID {
            return Err(SensorError::InvalidChipId(chip[0]));
        }

        bus.transact(
            address,
            &mut [Operation::Write(&[REG_RESET, RESET_COMMAND])],
            SHORT_TIMEOUT,
        )?;

        let mut w88 = [0u8; WINDOW_88_LEN];
        let mut we1 = [0u8; WINDOW_E1_LEN];
        bus.transact(
            address,
            &mut [
                Operation::Write(&[REG_CALIB_88]),
                Operation::Read(&mut w88),
                Operation::Write(&[REG_CALIB_E1]),
                Operation::Read(&mut we1),
            ],
            LONG_TIMEOUT,
        )?;
        let calibration = CalibrationProfile::decode(&w88, &we1);
        debug!("BME280 calibration at {:#04x}: {:?}", address, calibration);
        info!("BME280 ready at address {:#04x}", address);

        Ok(Bme280 {
            bus,
            address,
            calibration,
            altitude: Altitude::default(),
            temperature_unit: TemperatureUnit::default(),
            pressure_unit: PressureUnit::default(),
        })
    }

    pub fn with_altitude(mut self, altitude: Altitude) -> Self {
        self.altitude = altitude;
        self
    }

    pub fn with_units(mut self, temperature: TemperatureUnit, pressure: PressureUnit) -> Self {
        self.temperature_unit = temperature;
        self.pressure_unit = pressure;
        self
    }

    pub fn altitude(&self) -> Altitude {
        self.altitude
    }

    #[cfg(test)]
    pub fn calibration(&self) -> &CalibrationProfile {
        &self.calibration
    }

    /// Trigger one forced conversion, wait for it and compensate the result
    ///
    /// Blocks the calling thread for the conversion time (tens of ms).
    pub fn measure(&self) -> Result<SensorReading, SensorError> {
        self.trigger()?;
        self.wait_until_idle()?;
        let raw = self.read_raw()?;
        let compensated = compensation::compensate(&self.calibration, &raw);
        Ok(self.convert(&compensated))
    }

    /// Current power mode bits of ctrl_meas
    pub fn power_mode(&self) -> Result<PowerMode, SensorError> {
        let mode = self.read_register(REG_CTRL_MEAS)? & POWER_MODE_MASK;
        Ok(match mode {
            0 => PowerMode::Sleep,
            3 => PowerMode::Normal,
            _ => PowerMode::Forced,
        })
    }

    fn trigger(&self) -> Result<(), SensorError> {
        // ctrl_hum only latches on the following ctrl_meas write
        self.bus.transact(
            self.address,
            &mut [
                Operation::Write(&[REG_CONFIG, CONFIG_FILTER_OFF]),
                Operation::Write(&[REG_CTRL_HUM, HUMIDITY_OVERSAMPLE_X1]),
                Operation::Write(&[REG_CTRL_MEAS, WEATHER_MONITORING_CONFIG]),
            ],
            SHORT_TIMEOUT,
        )
    }

    fn wait_until_idle(&self) -> Result<(), SensorError> {
        for _ in 0..MAX_STATUS_POLLS {
            if self.read_register(REG_STATUS)? & STATUS_MASK == 0 {
                return Ok(());
            }
            thread::sleep(STATUS_POLL_INTERVAL);
        }
        Err(SensorError::DeviceBusy(MAX_STATUS_POLLS))
    }

    fn read_raw(&self) -> Result<RawSample, SensorError> {
        let mut block = [0u8; ADC_BLOCK_LEN];
        self.bus.transact(
            self.address,
            &mut [Operation::Write(&[REG_ADC_START]), Operation::Read(&mut block)],
            LONG_TIMEOUT,
        )?;
        Ok(RawSample::from_adc_block(&block))
    }

    fn read_register(&self, register: u8) -> Result<u8, SensorError> {
        let mut value = [0u8; 1];
        self.bus.transact(
            self.address,
            &mut [Operation::Write(&[register]), Operation::Read(&mut value)],
            SHORT_TIMEOUT,
        )?;
        Ok(value[0])
    }

    fn convert(&self, reading: &CompensatedReading) -> SensorReading {
        let temperature = match self.temperature_unit {
            TemperatureUnit::Celsius => reading.temperature_c,
            TemperatureUnit::Fahrenheit => Channel {
                value: reading.temperature_c.value * 9.0 / 5.0 + 32.0,
                ..reading.temperature_c
            },
        };

        let millibars = reading.pressure_pa.value / PA_PER_MILLIBAR
            + self.altitude.millibar_correction() as f64;
        let pressure = match self.pressure_unit {
            PressureUnit::Millibar => millibars,
            PressureUnit::InchesHg => millibars * KPA_PER_MILLIBAR * KPA_TO_INCHES_HG,
        };

        SensorReading {
            temperature,
            pressure: Channel {
                value: pressure,
                ..reading.pressure_pa
            },
            humidity: reading.humidity,
        }
    }
}
