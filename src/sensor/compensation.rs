/// Floating-point compensation of raw ADC codes (Bosch BME280 reference formulas)
use crate::sensor::calibration::CalibrationProfile;

pub const TEMPERATURE_MIN_C: f64 = -40.0;
pub const TEMPERATURE_MAX_C: f64 = 85.0;
pub const PRESSURE_MIN_PA: f64 = 30000.0;
pub const PRESSURE_MAX_PA: f64 = 110000.0;
pub const HUMIDITY_MIN: f64 = 0.0;
pub const HUMIDITY_MAX: f64 = 100.0;

/// Length of the burst-read ADC block (0xF7..=0xFE)
pub const ADC_BLOCK_LEN: usize = 8;

/// Uncompensated codes from one forced measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    pub pressure: u32,
    pub temperature: u32,
    pub humidity: u32,
}

impl RawSample {
    /// Pressure and temperature are 20-bit codes left-justified in three
    /// big-endian registers; humidity is a plain 16-bit big-endian code.
    pub fn from_adc_block(block: &[u8; ADC_BLOCK_LEN]) -> Self {
        let be24 = |at: usize| {
            (block[at] as u32) << 16 | (block[at + 1] as u32) << 8 | block[at + 2] as u32
        };
        RawSample {
            pressure: be24(0) >> 4,
            temperature: be24(3) >> 4,
            humidity: u16::from_be_bytes([block[6], block[7]]) as u32,
        }
    }
}

/// One compensated channel and whether it had to be clamped into range
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Channel {
    pub value: f64,
    pub clamped: bool,
}

impl Channel {
    fn clamp(value: f64, min: f64, max: f64) -> Self {
        if !value.is_finite() || value < min {
            Channel {
                value: min,
                clamped: true,
            }
        } else if value > max {
            Channel {
                value: max,
                clamped: true,
            }
        } else {
            Channel {
                value,
                clamped: false,
            }
        }
    }
}

/// Shared intermediate produced by temperature compensation
///
/// Only `compensate_temperature` can create one, which keeps pressure and
/// humidity compensation from running first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FineTemperature(i32);

impl FineTemperature {
    #[cfg(test)]
    pub fn value(self) -> i32 {
        self.0
    }
}

/// Physical values in base units: °C, Pa and %RH
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompensatedReading {
    pub temperature_c: Channel,
    pub pressure_pa: Channel,
    pub humidity: Channel,
}

pub fn compensate(cal: &CalibrationProfile, raw: &RawSample) -> CompensatedReading {
    let (temperature_c, fine) = compensate_temperature(cal, raw.temperature);
    CompensatedReading {
        temperature_c,
        pressure_pa: compensate_pressure(cal, raw.pressure, fine),
        humidity: compensate_humidity(cal, raw.humidity, fine),
    }
}

pub fn compensate_temperature(cal: &CalibrationProfile, adc_t: u32) -> (Channel, FineTemperature) {
    let adc_t = adc_t as f64;
    let t1 = cal.dig_t1 as f64;

    let var1 = (adc_t / 16384.0 - t1 / 1024.0) * cal.dig_t2 as f64;
    let var2 = adc_t / 131072.0 - t1 / 8192.0;
    let var2 = var2 * var2 * cal.dig_t3 as f64;

    let fine = FineTemperature((var1 + var2) as i32);
    let temperature = (var1 + var2) / 5120.0;

    (
        Channel::clamp(temperature, TEMPERATURE_MIN_C, TEMPERATURE_MAX_C),
        fine,
    )
}

pub fn compensate_pressure(cal: &CalibrationProfile, adc_p: u32, fine: FineTemperature) -> Channel {
    let mut var1 = fine.0 as f64 / 2.0 - 64000.0;
    let mut var2 = var1 * var1 * cal.dig_p6 as f64 / 32768.0;
    var2 += var1 * cal.dig_p5 as f64 * 2.0;
    var2 = var2 / 4.0 + cal.dig_p4 as f64 * 65536.0;
    let var3 = cal.dig_p3 as f64 * var1 * var1 / 524288.0;
    var1 = (var3 + cal.dig_p2 as f64 * var1) / 524288.0;
    var1 = (1.0 + var1 / 32768.0) * cal.dig_p1 as f64;

    if var1 == 0.0 {
        // Invalid trim would divide by zero
        return Channel {
            value: PRESSURE_MIN_PA,
            clamped: true,
        };
    }

    let mut pressure = 1048576.0 - adc_p as f64;
    pressure = (pressure - var2 / 4096.0) * 6250.0 / var1;
    let var1 = cal.dig_p9 as f64 * pressure * pressure / 2147483648.0;
    let var2 = pressure * cal.dig_p8 as f64 / 32768.0;
    pressure += (var1 + var2 + cal.dig_p7 as f64) / 16.0;

    Channel::clamp(pressure, PRESSURE_MIN_PA, PRESSURE_MAX_PA)
}

pub fn compensate_humidity(cal: &CalibrationProfile, adc_h: u32, fine: FineTemperature) -> Channel {
    let var1 = fine.0 as f64 - 76800.0;
    let var2 = cal.dig_h4 as f64 * 64.0 + cal.dig_h5 as f64 / 16384.0 * var1;
    let var3 = adc_h as f64 - var2;
    let var4 = cal.dig_h2 as f64 / 65536.0;
    let var5 = 1.0 + cal.dig_h3 as f64 / 67108864.0 * var1;
    let var6 = 1.0 + cal.dig_h6 as f64 / 67108864.0 * var1 * var5;
    let var6 = var3 * var4 * (var5 * var6);
    let humidity = var6 * (1.0 - cal.dig_h1 as f64 * var6 / 524288.0);

    Channel::clamp(humidity, HUMIDITY_MIN, HUMIDITY_MAX)
}
