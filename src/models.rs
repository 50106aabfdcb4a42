use serde::{Deserialize, Serialize};

use crate::utils::iso_timestamp;

/// Schema version written into every queue entry
pub const RECORD_VERSION: u32 = 2;

/// Fixed channel numbering shared with the receiving side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorId {
    DisplacementX = 1,
    DisplacementY = 2,
    Temperature = 3,
    Pressure = 4,
    Humidity = 5,
}

impl SensorId {
    pub const ALL: [SensorId; 5] = [
        SensorId::DisplacementX,
        SensorId::DisplacementY,
        SensorId::Temperature,
        SensorId::Pressure,
        SensorId::Humidity,
    ];

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn index(self) -> usize {
        self as usize - 1
    }

    pub fn name(self) -> &'static str {
        match self {
            SensorId::DisplacementX => "x_fissure_size",
            SensorId::DisplacementY => "y_fissure_size",
            SensorId::Temperature => "temperature",
            SensorId::Pressure => "pressure",
            SensorId::Humidity => "humidity",
        }
    }

    pub fn kind(self) -> &'static str {
        match self {
            SensorId::DisplacementX | SensorId::DisplacementY => "displacement_mm",
            SensorId::Temperature => "temperature",
            SensorId::Pressure => "pressure",
            SensorId::Humidity => "relative_humidity",
        }
    }

    /// Decimal places a value is reported (and compared) with
    pub fn precision(self) -> i32 {
        match self {
            SensorId::DisplacementX | SensorId::DisplacementY => 3,
            _ => 2,
        }
    }
}

/// Per-field outcome of one measurement tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldReading {
    Ok(f64),
    Fail,
    OutOfRange(f64),
    /// Unchanged since last reported; not serialized
    Omitted,
}

impl FieldReading {
    fn entry_parts(&self) -> Option<(f64, MeasurementStatus)> {
        match *self {
            FieldReading::Ok(value) => Some((value, MeasurementStatus::Ok)),
            FieldReading::OutOfRange(value) => Some((value, MeasurementStatus::OutOfRange)),
            FieldReading::Fail => Some((0.0, MeasurementStatus::Fail)),
            FieldReading::Omitted => None,
        }
    }
}

/// When a record was captured, in 100 ns ticks since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTime {
    pub ticks: i64,
    /// Whether the node clock was synchronized when the ticks were taken
    pub synchronized: bool,
}

/// One delivery unit
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    pub captured: CaptureTime,
    pub fields: [FieldReading; 5],
}

impl TelemetryRecord {
    pub fn field(&self, sensor: SensorId) -> FieldReading {
        self.fields[sensor.index()]
    }

    /// True when every field was suppressed
    pub fn is_empty(&self) -> bool {
        self.fields.iter().all(|f| *f == FieldReading::Omitted)
    }

    pub fn to_document(&self, device_id: &str) -> RecordDocument {
        let timestamp = iso_timestamp(self.captured.ticks);
        let measurements = SensorId::ALL
            .iter()
            .filter_map(|sensor| {
                self.field(*sensor)
                    .entry_parts()
                    .map(|(value, status)| MeasurementEntry {
                        sensor_id: sensor.id(),
                        iso_timestamp: timestamp.clone(),
                        value,
                        status,
                    })
            })
            .collect();

        RecordDocument {
            version: RECORD_VERSION,
            device_id: device_id.to_string(),
            iso_timestamp: timestamp,
            measurements,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "FAIL")]
    Fail,
    #[serde(rename = "OUTOFRANGE")]
    OutOfRange,
}

/// Persisted and published JSON form of a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDocument {
    pub version: u32,
    pub device_id: String,
    pub iso_timestamp: String,
    pub measurements: Vec<MeasurementEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementEntry {
    pub sensor_id: u8,
    pub iso_timestamp: String,
    pub value: f64,
    pub status: MeasurementStatus,
}

/// Device description published once per broker connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationDescriptor {
    pub version: u32,
    pub id: String,
    pub name: String,
    pub group: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sensors: Vec<SensorDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    pub id: u8,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl ConfigurationDescriptor {
    pub fn new(id: &str, name: &str, group: &str, kind: &str) -> Self {
        ConfigurationDescriptor {
            version: RECORD_VERSION,
            id: id.to_string(),
            name: name.to_string(),
            group: group.to_string(),
            kind: kind.to_string(),
            sensors: SensorId::ALL
                .iter()
                .map(|sensor| SensorDescriptor {
                    id: sensor.id(),
                    name: sensor.name().to_string(),
                    kind: sensor.kind().to_string(),
                })
                .collect(),
        }
    }
}
