/// Builds telemetry records from the latest sensor and displacement values
use crate::models::{CaptureTime, FieldReading, SensorId, TelemetryRecord};
use crate::sensor::compensation::Channel;
use crate::sensor::SensorReading;
use crate::utils::round_to;

/// What the backing device reported for one field this tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    Unavailable,
    Value(f64),
    /// The driver had to clamp the value into its physical range
    Clamped(f64),
}

impl From<Channel> for Sample {
    fn from(channel: Channel) -> Self {
        if channel.clamped {
            Sample::Clamped(channel.value)
        } else {
            Sample::Value(channel.value)
        }
    }
}

/// Samples in sensor id order from whatever is currently available
pub fn collect_samples(
    displacement_mm: Option<(f64, f64)>,
    reading: Option<&SensorReading>,
) -> [Sample; 5] {
    let (x, y) = match displacement_mm {
        Some((x, y)) => (Sample::Value(x), Sample::Value(y)),
        None => (Sample::Unavailable, Sample::Unavailable),
    };
    match reading {
        Some(r) => [
            x,
            y,
            r.temperature.into(),
            r.pressure.into(),
            r.humidity.into(),
        ],
        None => [
            x,
            y,
            Sample::Unavailable,
            Sample::Unavailable,
            Sample::Unavailable,
        ],
    }
}

/// Change suppression against the last reported state of each field
#[derive(Debug, Default)]
pub struct MeasurementSource {
    last: [Option<FieldReading>; 5],
}

impl MeasurementSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce the record for one tick
    ///
    /// Values are compared at the precision they are reported with. A field
    /// whose state is unchanged (including a repeated FAIL) is OMITTED unless
    /// `force` is set for it.
    pub fn tick(
        &mut self,
        captured: CaptureTime,
        samples: [Sample; 5],
        force: [bool; 5],
    ) -> TelemetryRecord {
        let mut fields = [FieldReading::Omitted; 5];

        for sensor in SensorId::ALL {
            let i = sensor.index();
            let candidate = match samples[i] {
                Sample::Unavailable => FieldReading::Fail,
                Sample::Value(v) => FieldReading::Ok(round_to(v, sensor.precision())),
                Sample::Clamped(v) => FieldReading::OutOfRange(round_to(v, sensor.precision())),
            };

            if !force[i] && self.last[i] == Some(candidate) {
                continue;
            }
            fields[i] = candidate;
            self.last[i] = Some(candidate);
        }

        TelemetryRecord { captured, fields }
    }
}

/// Forces a report of any field left OMITTED for `threshold` consecutive ticks
#[derive(Debug)]
pub struct HeartbeatPolicy {
    threshold: u32,
    omitted: [u32; 5],
}

impl HeartbeatPolicy {
    pub fn new(threshold: u32) -> Self {
        HeartbeatPolicy {
            threshold: threshold.max(1),
            omitted: [0; 5],
        }
    }

    pub fn force_vector(&self) -> [bool; 5] {
        self.omitted.map(|count| count >= self.threshold)
    }

    /// Count runs of omissions; runs on every tick, stored or not
    pub fn observe(&mut self, record: &TelemetryRecord) {
        for (count, field) in self.omitted.iter_mut().zip(record.fields.iter()) {
            if *field == FieldReading::Omitted {
                *count += 1;
            } else {
                *count = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(seconds: i64) -> CaptureTime {
        CaptureTime {
            ticks: seconds * crate::utils::TICKS_PER_SECOND,
            synchronized: true,
        }
    }

    fn steady() -> [Sample; 5] {
        [
            Sample::Value(1.2344),
            Sample::Value(-0.5),
            Sample::Value(21.5),
            Sample::Value(1006.53),
            Sample::Value(35.34),
        ]
    }

    #[test]
    fn identical_readings_are_omitted_until_heartbeat() {
        let mut source = MeasurementSource::new();
        let mut heartbeat = HeartbeatPolicy::new(3);

        let mut records = Vec::new();
        for tick in 0..6 {
            let record = source.tick(at(tick), steady(), heartbeat.force_vector());
            heartbeat.observe(&record);
            records.push(record);
        }

        assert_eq!(records[0].field(SensorId::DisplacementX), FieldReading::Ok(1.234));
        assert!(records[0].fields.iter().all(|f| *f != FieldReading::Omitted));
        for record in &records[1..4] {
            assert!(record.is_empty());
        }
        // Forced after three omitted ticks
        assert_eq!(records[4].fields, records[0].fields);
        assert!(records[5].is_empty());
    }

    #[test]
    fn change_below_reported_precision_is_omitted() {
        let mut source = MeasurementSource::new();
        source.tick(at(0), steady(), [false; 5]);

        let mut samples = steady();
        samples[2] = Sample::Value(21.501);
        samples[3] = Sample::Value(1006.6);
        let record = source.tick(at(1), samples, [false; 5]);

        assert_eq!(record.field(SensorId::Temperature), FieldReading::Omitted);
        assert_eq!(record.field(SensorId::Pressure), FieldReading::Ok(1006.6));
    }

    #[test]
    fn repeated_failure_is_reported_once() {
        let mut source = MeasurementSource::new();
        let first = source.tick(at(0), collect_samples(None, None), [false; 5]);
        let second = source.tick(at(1), collect_samples(None, None), [false; 5]);
        let forced = source.tick(at(2), collect_samples(None, None), [true; 5]);

        assert!(first.fields.iter().all(|f| *f == FieldReading::Fail));
        assert!(second.is_empty());
        assert!(forced.fields.iter().all(|f| *f == FieldReading::Fail));

        let recovered = source.tick(at(3), steady(), [false; 5]);
        assert_eq!(recovered.field(SensorId::Humidity), FieldReading::Ok(35.34));
    }

    #[test]
    fn clamped_channels_become_out_of_range() {
        let reading = SensorReading {
            temperature: Channel {
                value: 85.0,
                clamped: true,
            },
            pressure: Channel {
                value: 1000.0,
                clamped: false,
            },
            humidity: Channel {
                value: 0.0,
                clamped: true,
            },
        };
        let mut source = MeasurementSource::new();

        let record = source.tick(at(0), collect_samples(Some((0.0, 0.0)), Some(&reading)), [false; 5]);

        assert_eq!(record.field(SensorId::Temperature), FieldReading::OutOfRange(85.0));
        assert_eq!(record.field(SensorId::Pressure), FieldReading::Ok(1000.0));
        assert_eq!(record.field(SensorId::Humidity), FieldReading::OutOfRange(0.0));
    }
}
