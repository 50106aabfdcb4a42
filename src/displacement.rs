/// Displacement input: X/Y counts accumulated from a raw report device
use log::{debug, info, warn};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{sleep, timeout, Duration};

/// Fixed size of one input report
pub const REPORT_LEN: usize = 7;

/// 8200 dpi sensor
pub const DOTS_PER_MILLIMETER: f64 = 8200.0 / 25.4;

const READ_TIMEOUT_MS: u64 = 1000;
const RETRY_SECS: u64 = 5;

/// Running X/Y displacement, written by the reader and sampled by the
/// measurement tick
///
/// Plain atomics: a sample may land between the X and Y update of one
/// report, which shifts one axis by a single report at most.
#[derive(Debug, Default)]
pub struct DisplacementAccumulator {
    x: AtomicI32,
    y: AtomicI32,
    connected: AtomicBool,
}

impl DisplacementAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, dx: i16, dy: i16) {
        self.x.fetch_add(dx as i32, Ordering::Relaxed);
        self.y.fetch_add(dy as i32, Ordering::Relaxed);
    }

    /// Raw counts
    pub fn snapshot(&self) -> (i32, i32) {
        (self.x.load(Ordering::Relaxed), self.y.load(Ordering::Relaxed))
    }

    /// X/Y in millimetres, or `None` while the device is absent
    pub fn millimeters(&self) -> Option<(f64, f64)> {
        if !self.is_connected() {
            return None;
        }
        let (x, y) = self.snapshot();
        Some((x as f64 / DOTS_PER_MILLIMETER, y as f64 / DOTS_PER_MILLIMETER))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

/// Little-endian X delta at bytes 1..3, Y delta at bytes 3..5
pub fn decode_report(report: &[u8; REPORT_LEN]) -> (i16, i16) {
    let dx = i16::from_le_bytes([report[1], report[2]]);
    let dy = i16::from_le_bytes([report[3], report[4]]);
    (dx, dy)
}

pub struct DisplacementReader<R> {
    source: R,
}

impl<R: AsyncRead + Unpin> DisplacementReader<R> {
    pub fn new(source: R) -> Self {
        DisplacementReader { source }
    }

    /// Read one report; `Ok(None)` when nothing arrived within `wait`
    pub async fn read_report(&mut self, wait: Duration) -> io::Result<Option<[u8; REPORT_LEN]>> {
        let mut report = [0u8; REPORT_LEN];
        match timeout(wait, self.source.read_exact(&mut report)).await {
            Ok(Ok(_)) => Ok(Some(report)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    /// Accumulate reports until the source fails or ends
    pub async fn pump(&mut self, accumulator: &DisplacementAccumulator) -> io::Error {
        loop {
            match self
                .read_report(Duration::from_millis(READ_TIMEOUT_MS))
                .await
            {
                Ok(Some(report)) => {
                    let (dx, dy) = decode_report(&report);
                    accumulator.add(dx, dy);
                }
                Ok(None) => {}
                Err(e) => return e,
            }
        }
    }
}

/// Keep the displacement device open for the lifetime of the process
pub async fn run(path: PathBuf, accumulator: Arc<DisplacementAccumulator>) {
    loop {
        match tokio::fs::File::open(&path).await {
            Ok(file) => {
                info!("Displacement device {} opened", path.display());
                accumulator.set_connected(true);
                let error = DisplacementReader::new(file).pump(&accumulator).await;
                warn!("Displacement device lost: {}", error);
            }
            Err(e) => debug!("Displacement device {} unavailable: {}", path.display(), e),
        }
        accumulator.set_connected(false);
        sleep(Duration::from_secs(RETRY_SECS)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_decode_signed_little_endian() {
        let report = [0x01, 0x10, 0x00, 0xF6, 0xFF, 0x00, 0x00];
        assert_eq!(decode_report(&report), (16, -10));
    }

    #[test]
    fn millimeters_need_a_connected_device() {
        let acc = DisplacementAccumulator::new();
        acc.add(8200, -8200);
        assert_eq!(acc.millimeters(), None);

        acc.set_connected(true);
        let (x, y) = acc.millimeters().unwrap();
        assert!((x - 25.4).abs() < 1e-9);
        assert!((y + 25.4).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reader_accumulates_until_source_ends() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0x00, 0x05, 0x00, 0x02, 0x00, 0x00, 0x00]);
        bytes.extend_from_slice(&[0x00, 0xFD, 0xFF, 0x03, 0x00, 0x00, 0x00]);
        let acc = DisplacementAccumulator::new();

        let error = DisplacementReader::new(&bytes[..]).pump(&acc).await;

        assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(acc.snapshot(), (2, 5));
    }

    #[tokio::test]
    async fn silent_source_times_out_without_error() {
        let (_writer, reader) = tokio::io::duplex(64);
        let mut reader = DisplacementReader::new(reader);

        let report = reader.read_report(Duration::from_millis(10)).await.unwrap();

        assert_eq!(report, None);
    }
}
