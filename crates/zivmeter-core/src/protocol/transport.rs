//! Byte transport abstraction
//!
//! The engine only ever asks the transport for what is ready right now, so
//! every implementation must answer without waiting on the wire.

use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Instant;

/// Non-blocking byte channel with a monotonic millisecond clock
pub trait Transport {
    /// Write as many of `bytes` as can be accepted now; returns the count
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;

    /// Read at most `buf.len()` bytes that are already available
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Number of bytes ready to be read without blocking
    fn available(&mut self) -> io::Result<usize>;

    /// Monotonic time in milliseconds
    fn now_ms(&self) -> u64;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        (**self).write(bytes)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn available(&mut self) -> io::Result<usize> {
        (**self).available()
    }

    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

/// Serial port wrapper implementing [`Transport`]
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    epoch: Instant,
}

impl SerialTransport {
    /// Wrap an opened port; the clock starts now
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self {
            port,
            epoch: Instant::now(),
        }
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        match self.port.write(bytes) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let ready = self.available()?;
        if ready == 0 {
            return Ok(0);
        }
        let n = ready.min(buf.len());
        match self.port.read(&mut buf[..n]) {
            Ok(n) => Ok(n),
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    fn available(&mut self) -> io::Result<usize> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}
