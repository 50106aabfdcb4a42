mod clock;
mod config;
mod delivery;
mod displacement;
mod measurement;
mod models;
mod network;
mod sensor;
mod storage;
mod utils;

use linux_embedded_hal::I2cdev;
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};

use clock::ClockSync;
use config::NodeConfig;
use delivery::{DeliveryConfig, DeliveryPipeline, MqttBroker};
use displacement::DisplacementAccumulator;
use measurement::{collect_samples, HeartbeatPolicy, MeasurementSource};
use models::ConfigurationDescriptor;
use network::NetworkStatus;
use sensor::{Bme280, HalBus, SensorError, SensorReading, SharedBus};
use storage::{DurableQueue, FsStorage};
use utils::format_datetime;

const SENSOR_RETRY_SECS: u64 = 5;
const DELIVERY_RETRY_SECS: u64 = 5;
const WORKER_PAUSE_MS: u64 = 50;
const NET_CLASS_DIR: &str = "/sys/class/net";

type Sensor = Bme280<HalBus<I2cdev>>;
type LatestReading = Arc<Mutex<Option<SensorReading>>>;

fn open_sensor(config: &NodeConfig) -> Result<Sensor, SensorError> {
    let i2c = I2cdev::new(&config.i2c_device).map_err(|e| {
        SensorError::BusFault(format!("{}: {}", config.i2c_device.display(), e))
    })?;
    let bus = SharedBus::new(HalBus::new(i2c));
    let sensor = Bme280::new(bus, config.sensor_address, config.bus_frequency_khz)?;
    debug!("Sensor power mode after reset: {:?}", sensor.power_mode()?);
    Ok(sensor
        .with_altitude(config.altitude)
        .with_units(config.temperature_unit, config.pressure_unit))
}

/// Retry sensor startup until it succeeds or the configuration is wrong
async fn sensor_init_task(config: NodeConfig, slot: Arc<OnceLock<Arc<Sensor>>>) {
    loop {
        let attempt_config = config.clone();
        match tokio::task::spawn_blocking(move || open_sensor(&attempt_config)).await {
            Ok(Ok(sensor)) => {
                let altitude = sensor.altitude();
                info!(
                    "Sensor initialised at {:.0} m ({:.0} ft), correction {} mbar",
                    altitude.meters(),
                    altitude.feet(),
                    altitude.millibar_correction()
                );
                let _ = slot.set(Arc::new(sensor));
                return;
            }
            Ok(Err(e)) if e.is_validation() => {
                error!("Sensor configuration rejected: {}", e);
                return;
            }
            Ok(Err(e)) => warn!("Sensor not ready: {}", e),
            Err(e) => error!("Sensor startup task failed: {}", e),
        }
        sleep(Duration::from_secs(SENSOR_RETRY_SECS)).await;
    }
}

async fn measurement_task(
    interval_secs: u64,
    slot: Arc<OnceLock<Arc<Sensor>>>,
    latest: LatestReading,
) {
    let mut ticker = interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let sensor = match slot.get() {
            Some(sensor) => Arc::clone(sensor),
            None => continue,
        };

        let reading = match tokio::task::spawn_blocking(move || sensor.measure()).await {
            Ok(Ok(reading)) => {
                debug!(
                    "Measured temperature {:.2}, pressure {:.2}, humidity {:.2} %",
                    reading.temperature.value, reading.pressure.value, reading.humidity.value
                );
                Some(reading)
            }
            Ok(Err(e)) => {
                warn!("Measurement failed: {}", e);
                None
            }
            Err(e) => {
                error!("Measurement task failed: {}", e);
                None
            }
        };
        *latest.lock().unwrap_or_else(PoisonError::into_inner) = reading;
    }
}

async fn main_loop(config: NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting fissure monitoring node {}", config.device_id);

    let clock = Arc::new(ClockSync::new());
    if config.clock_synchronized {
        clock.mark_synchronized(0);
    } else {
        tokio::spawn(clock::watch_host_sync(
            Arc::clone(&clock),
            config.clock_sync_marker.clone(),
        ));
    }

    let storage = FsStorage::new(&config.storage_dir);
    info!("Queue directory {}", storage.root().display());
    let queue = Arc::new(DurableQueue::new(storage, Arc::clone(&clock), &config.device_id));
    if queue.ensure_mounted() {
        queue.recover_at_startup();
    }

    let network = Arc::new(NetworkStatus::new(false));
    tokio::spawn(network::monitor(Arc::clone(&network), NET_CLASS_DIR.into()));

    let broker = Arc::new(MqttBroker::new());
    let options = MqttBroker::options(&config.broker_url, &config.device_id)?;
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    tokio::spawn(Arc::clone(&broker).run(options, events_tx));

    let pipeline = Arc::new(DeliveryPipeline::new(
        Arc::clone(&queue),
        broker,
        network,
        DeliveryConfig {
            measurements_topic: config.measurements_topic.clone(),
            configuration_topic: config.configuration_topic.clone(),
            ack_topic: config.ack_topic.clone(),
            descriptor: ConfigurationDescriptor::new(
                &config.device_id,
                &config.device_name,
                &config.device_group,
                &config.device_type,
            ),
            retry_delay: Duration::from_secs(DELIVERY_RETRY_SECS),
            worker_pause: Duration::from_millis(WORKER_PAUSE_MS),
        },
    ));
    pipeline.seed_from_storage();
    tokio::spawn(Arc::clone(&pipeline).run_events(events_rx));
    tokio::spawn(Arc::clone(&pipeline).run_worker());

    let accumulator = Arc::new(DisplacementAccumulator::new());
    tokio::spawn(displacement::run(
        config.displacement_device.clone(),
        Arc::clone(&accumulator),
    ));

    let sensor_slot = Arc::new(OnceLock::new());
    let latest: LatestReading = Arc::new(Mutex::new(None));
    tokio::spawn(sensor_init_task(config.clone(), Arc::clone(&sensor_slot)));
    tokio::spawn(measurement_task(
        config.sensor_interval_secs,
        sensor_slot,
        Arc::clone(&latest),
    ));

    // Persistence tick
    let mut source = MeasurementSource::new();
    let mut heartbeat = HeartbeatPolicy::new(config.heartbeat_ticks);
    let mut ticker = interval(Duration::from_secs(config.persist_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let mounted = queue.ensure_mounted();
        if mounted {
            queue.recover_at_startup();
        }

        let reading = *latest.lock().unwrap_or_else(PoisonError::into_inner);
        let samples = collect_samples(accumulator.millimeters(), reading.as_ref());
        let record = source.tick(clock.capture(), samples, heartbeat.force_vector());
        heartbeat.observe(&record);

        if record.is_empty() {
            debug!("Nothing changed at {}", format_datetime(record.captured.ticks));
            continue;
        }
        if !mounted {
            warn!("Storage unavailable, record not persisted");
            continue;
        }
        if let Some(name) = queue.enqueue(&record) {
            pipeline.submit(name);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match NodeConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(());
            }
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
                // Keep the sender alive so the node keeps running
                std::future::pending::<()>().await;
                drop(tx);
            }
        }
    });

    tokio::select! {
        result = main_loop(config) => {
            if let Err(e) = result {
                error!("Fatal error: {}", e);
                return Err(e);
            }
        }
        _ = &mut rx => {
            info!("Node terminated by user. Exiting gracefully.");
        }
    }

    Ok(())
}
