//! Serial transport implementation.
//!
//! Pumps and valve positioners are reached over RS-232 (usually through a
//! USB adapter). The receive side keeps a buffer so that bytes read past a
//! terminator are not lost between calls.

use std::io;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Default baud rate for chained lab instruments.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Default time allowed for a terminated line to arrive.
pub const DEFAULT_LINE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default connection delay.
pub const DEFAULT_CONNECTION_DELAY: Duration = Duration::from_millis(100);

/// Configuration for serial transport.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Data bits per character.
    pub data_bits: DataBits,
    /// Parity checking mode.
    pub parity: Parity,
    /// Stop bits per character.
    pub stop_bits: StopBits,
    /// Maximum wait for a terminated line.
    pub line_timeout: Duration,
    /// Delay after opening the port before draining stale input.
    pub connection_delay: Duration,
}

impl SerialConfig {
    /// Creates a new serial configuration with default settings (9600 8N1).
    #[must_use]
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            line_timeout: DEFAULT_LINE_TIMEOUT,
            connection_delay: DEFAULT_CONNECTION_DELAY,
        }
    }

    /// Settings used by Hamilton MVP valve positioners (9600 7O1).
    #[must_use]
    pub fn mvp(port: impl Into<String>) -> Self {
        Self::new(port)
            .data_bits(DataBits::Seven)
            .parity(Parity::Odd)
    }

    /// Sets the baud rate.
    #[must_use]
    pub const fn baud_rate(mut self, rate: u32) -> Self {
        self.baud_rate = rate;
        self
    }

    /// Sets the number of data bits.
    #[must_use]
    pub const fn data_bits(mut self, bits: DataBits) -> Self {
        self.data_bits = bits;
        self
    }

    /// Sets the parity mode.
    #[must_use]
    pub const fn parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    /// Sets the number of stop bits.
    #[must_use]
    pub const fn stop_bits(mut self, bits: StopBits) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Sets the line read timeout.
    #[must_use]
    pub const fn line_timeout(mut self, timeout: Duration) -> Self {
        self.line_timeout = timeout;
        self
    }

    /// Sets the connection delay.
    #[must_use]
    pub const fn connection_delay(mut self, delay: Duration) -> Self {
        self.connection_delay = delay;
        self
    }
}

/// Serial transport for chained instruments.
pub struct SerialTransport {
    config: SerialConfig,
    stream: Option<SerialStream>,
    rx: BytesMut,
}

impl SerialTransport {
    /// Creates a new serial transport with the given configuration.
    #[must_use]
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            stream: None,
            rx: BytesMut::with_capacity(256),
        }
    }

    /// Creates a new serial transport for the given port with default settings.
    #[must_use]
    pub fn with_port(port: impl Into<String>) -> Self {
        Self::new(SerialConfig::new(port))
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Reads whatever is available into the receive buffer.
    async fn fill(&mut self) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        let mut buf = [0u8; 256];
        match stream.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("serial port closed");
                Err(Error::Io(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "serial port closed",
                )))
            }
            Ok(n) => {
                tracing::trace!("rx {}", hex::encode(&buf[..n]));
                self.rx.extend_from_slice(&buf[..n]);
                Ok(())
            }
            Err(e) => {
                tracing::error!("serial read error: {}", e);
                Err(Error::Io(e))
            }
        }
    }

    /// Returns the position of `terminator` in the receive buffer.
    fn find(&self, terminator: &[u8]) -> Option<usize> {
        if terminator.is_empty() {
            return None;
        }
        self.rx
            .windows(terminator.len())
            .position(|window| window == terminator)
    }
}

impl Transport for SerialTransport {
    fn connect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.stream.is_some() {
                return Ok(());
            }

            tracing::info!("connecting to serial port: {}", self.config.port);

            let mut stream = tokio_serial::new(&self.config.port, self.config.baud_rate)
                .data_bits(self.config.data_bits)
                .parity(self.config.parity)
                .stop_bits(self.config.stop_bits)
                .open_native_async()
                .map_err(Error::Serial)?;

            if let Err(e) = tokio_serial::SerialPort::write_request_to_send(&mut stream, false) {
                tracing::warn!("failed to set RTS: {}", e);
            }

            tokio::time::sleep(self.config.connection_delay).await;

            // Purge: drop anything the instruments sent before we were listening
            let mut buf = [0u8; 256];
            let mut total_drained = 0usize;
            let drain_deadline = tokio::time::Instant::now() + Duration::from_millis(200);
            while tokio::time::Instant::now() < drain_deadline {
                match tokio::time::timeout(Duration::from_millis(20), stream.read(&mut buf)).await {
                    Ok(Ok(n)) if n > 0 => total_drained += n,
                    _ => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            }
            if total_drained > 0 {
                tracing::warn!("drained {} stale bytes from buffer", total_drained);
            }

            self.stream = Some(stream);
            self.rx.clear();

            tracing::info!("connected to serial port");
            Ok(())
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.stream.take().is_some() {
                tracing::info!("disconnecting from serial port");
            }
            self.rx.clear();
            Ok(())
        })
    }

    fn write(&mut self, data: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
            tracing::trace!("tx {}", hex::encode(&data));
            stream.write_all(&data).await.map_err(Error::Io)?;
            stream.flush().await.map_err(Error::Io)?;
            Ok(())
        })
    }

    fn read_line<'a>(&'a mut self, terminator: &'a [u8]) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let timeout = self.config.line_timeout;
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if let Some(pos) = self.find(terminator) {
                    let line = self.rx.split_to(pos);
                    self.rx.advance(terminator.len());
                    return Ok(String::from_utf8_lossy(&line).into_owned());
                }
                match tokio::time::timeout_at(deadline, self.fill()).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(Error::Timeout {
                            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        });
                    }
                }
            }
        })
    }

    fn clear_input(&mut self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
            let pending = tokio_serial::SerialPort::bytes_to_read(stream).map_err(Error::Serial)?;
            tokio_serial::SerialPort::clear(stream, tokio_serial::ClearBuffer::Input)
                .map_err(Error::Serial)?;
            let dropped = self.rx.len() + pending as usize;
            if dropped > 0 {
                tracing::warn!(
                    "discarding {} stale bytes on {}: {}",
                    dropped,
                    self.config.port,
                    hex::encode(&self.rx)
                );
            }
            self.rx.clear();
            Ok(dropped)
        })
    }

    fn read_byte(&mut self, timeout: Duration) -> BoxFuture<'_, Result<Option<u8>>> {
        Box::pin(async move {
            if self.rx.is_empty() {
                match tokio::time::timeout(timeout, self.fill()).await {
                    Ok(result) => result?,
                    Err(_) => return Ok(None),
                }
            }
            Ok(if self.rx.is_empty() {
                None
            } else {
                Some(self.rx.get_u8())
            })
        })
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn port_name(&self) -> &str {
        &self.config.port
    }
}

/// Lists available serial ports.
///
/// # Errors
///
/// Returns an error if the port list cannot be retrieved.
pub fn list_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports().map_err(Error::Serial)?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}
