use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

use crate::sensor::bme280::{validate_address, validate_frequency};
use crate::sensor::{Altitude, PressureUnit, TemperatureUnit};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub i2c_device: PathBuf,
    pub sensor_address: u8,
    pub bus_frequency_khz: u32,
    pub altitude: Altitude,
    pub temperature_unit: TemperatureUnit,
    pub pressure_unit: PressureUnit,
    pub displacement_device: PathBuf,
    pub storage_dir: PathBuf,
    pub broker_url: Url,
    pub device_id: String,
    pub device_name: String,
    pub device_group: String,
    pub device_type: String,
    pub measurements_topic: String,
    pub configuration_topic: String,
    pub ack_topic: String,
    pub sensor_interval_secs: u64,
    pub persist_interval_secs: u64,
    pub heartbeat_ticks: u32,
    pub clock_synchronized: bool,
    pub clock_sync_marker: PathBuf,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key)
        .map(|v| v.trim().to_string())
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_var<T: FromStr>(key: &str, default: &str) -> Result<T, Box<dyn std::error::Error>> {
    let value = var_or(key, default);
    value
        .parse()
        .map_err(|_| format!("{} has an invalid value '{}'", key, value).into())
}

/// `0x76` or `118`
fn parse_address(value: &str) -> Result<u8, Box<dyn std::error::Error>> {
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| format!("BME280_ADDRESS has an invalid value '{}'", value).into())
}

fn parse_bool(key: &str) -> Result<bool, Box<dyn std::error::Error>> {
    match var_or(key, "false").to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(format!("{} has an invalid value '{}'", key, other).into()),
    }
}

impl NodeConfig {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        // Load environment variables
        dotenv::dotenv().ok();

        let broker_url =
            env::var("BROKER_URL").map_err(|_| "BROKER_URL environment variable not set")?;
        let broker_url = Url::parse(broker_url.trim())?;

        let sensor_address = parse_address(&var_or("BME280_ADDRESS", "0x76"))?;
        validate_address(sensor_address)?;
        let bus_frequency_khz = parse_var("BUS_FREQUENCY_KHZ", "100")?;
        validate_frequency(bus_frequency_khz)?;

        let altitude = match (env::var("ALTITUDE_METERS"), env::var("ALTITUDE_FEET")) {
            (Ok(_), Ok(_)) => return Err("Set only one of ALTITUDE_METERS and ALTITUDE_FEET".into()),
            (Ok(_), Err(_)) => Altitude::from_meters(parse_var("ALTITUDE_METERS", "0")?)?,
            (Err(_), Ok(_)) => Altitude::from_feet(parse_var("ALTITUDE_FEET", "0")?)?,
            (Err(_), Err(_)) => Altitude::default(),
        };

        let device_id = var_or("DEVICE_ID", "FEZ_49");
        if device_id.starts_with(char::is_whitespace) || device_id.contains('/') {
            return Err(format!("DEVICE_ID '{}' is not a valid client id", device_id).into());
        }

        let heartbeat_ticks: u32 = parse_var("HEARTBEAT_TICKS", "15")?;
        let sensor_interval_secs: u64 = parse_var("SENSOR_INTERVAL_SECS", "10")?;
        let persist_interval_secs: u64 = parse_var("PERSIST_INTERVAL_SECS", "20")?;
        if heartbeat_ticks == 0 || sensor_interval_secs == 0 || persist_interval_secs == 0 {
            return Err("Intervals and HEARTBEAT_TICKS must be greater than zero".into());
        }

        Ok(NodeConfig {
            i2c_device: var_or("I2C_DEVICE", "/dev/i2c-1").into(),
            sensor_address,
            bus_frequency_khz,
            altitude,
            temperature_unit: parse_var("TEMPERATURE_UNIT", "celsius")?,
            pressure_unit: parse_var("PRESSURE_UNIT", "mbar")?,
            displacement_device: var_or("DISPLACEMENT_DEVICE", "/dev/hidraw0").into(),
            storage_dir: var_or("STORAGE_DIR", "./queue").into(),
            broker_url,
            device_name: var_or("DEVICE_NAME", "Fissure monitoring station"),
            device_group: var_or("DEVICE_GROUP", &device_id),
            device_type: var_or("DEVICE_TYPE", "fissure_monitor"),
            measurements_topic: var_or("MEASUREMENTS_TOPIC", &format!("{}/measurements", device_id)),
            configuration_topic: var_or(
                "CONFIGURATION_TOPIC",
                &format!("{}/configuration", device_id),
            ),
            ack_topic: var_or("ACK_TOPIC", &format!("{}/acks", device_id)),
            device_id,
            sensor_interval_secs,
            persist_interval_secs,
            heartbeat_ticks,
            clock_synchronized: parse_bool("CLOCK_SYNCHRONIZED")?,
            clock_sync_marker: var_or(
                "CLOCK_SYNC_MARKER",
                "/run/systemd/timesync/synchronized",
            )
            .into(),
        })
    }
}
