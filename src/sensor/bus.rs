/// Exclusive, byte-counted sessions on the shared two-wire bus
use embedded_hal::i2c::{I2c, Operation};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::sensor::SensorError;

/// Raw transport underneath the sensor driver
///
/// A session is a batch of write/read operations executed back to back
/// against one device address. Implementations report how many bytes were
/// actually moved so the caller can detect short transfers.
pub trait BusTransport: Send {
    fn execute(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
        timeout: Duration,
    ) -> Result<usize, String>;
}

/// Adapter running sessions on any embedded-hal I2C controller
///
/// embedded-hal transactions are all-or-nothing, so a successful session
/// moved every requested byte.
pub struct HalBus<I> {
    i2c: I,
}

impl<I> HalBus<I> {
    pub fn new(i2c: I) -> Self {
        Self { i2c }
    }
}

impl<I> BusTransport for HalBus<I>
where
    I: I2c + Send,
{
    fn execute(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
        _timeout: Duration,
    ) -> Result<usize, String> {
        // The Linux driver applies its own adapter timeout to every message
        let requested = requested_bytes(operations);
        self.i2c
            .transaction(address, operations)
            .map_err(|e| format!("{:?}", e))?;
        Ok(requested)
    }
}

/// Total number of bytes a batch asks the bus to move
pub fn requested_bytes(operations: &[Operation<'_>]) -> usize {
    operations
        .iter()
        .map(|op| match op {
            Operation::Read(buf) => buf.len(),
            Operation::Write(buf) => buf.len(),
        })
        .sum()
}

/// Bus handle shared by every caller; the mutex is the bus lock
pub struct SharedBus<B> {
    inner: Arc<Mutex<B>>,
}

impl<B> Clone for SharedBus<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: BusTransport> SharedBus<B> {
    pub fn new(transport: B) -> Self {
        Self {
            inner: Arc::new(Mutex::new(transport)),
        }
    }

    /// Run one session while holding the bus lock
    ///
    /// Fails unless the transferred byte count equals the requested count
    /// across every operation in the batch.
    pub fn transact(
        &self,
        address: u8,
        operations: &mut [Operation<'_>],
        timeout: Duration,
    ) -> Result<(), SensorError> {
        let expected = requested_bytes(operations);

        let transferred = {
            let mut bus = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            bus.execute(address, operations, timeout)
                .map_err(SensorError::BusFault)?
        };

        if transferred != expected {
            return Err(SensorError::Bus {
                expected,
                transferred,
            });
        }
        Ok(())
    }
}
