//! Transport layer for multi-drop instrument communication.
//!
//! A transport is a byte/line channel to one physical port. Several
//! instruments may sit behind it; the [`Chain`](crate::chain::Chain)
//! serialises access.

pub mod mock;
pub mod serial;

use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::Result;

/// Trait for transport implementations.
pub trait Transport: Send + Sync {
    /// Opens the port and discards any stale input.
    fn connect(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Closes the port.
    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Writes raw bytes to the port.
    fn write(&mut self, data: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Reads until `terminator` is seen and returns the line without it.
    ///
    /// Fails with [`Error::Timeout`](crate::Error::Timeout) if the
    /// terminator is not observed inside the transport's own line timeout.
    fn read_line<'a>(&'a mut self, terminator: &'a [u8]) -> BoxFuture<'a, Result<String>>;

    /// Discards everything received but not read yet.
    ///
    /// Returns the number of bytes dropped.
    fn clear_input(&mut self) -> BoxFuture<'_, Result<usize>>;

    /// Reads a single byte, waiting at most `timeout`.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    fn read_byte(&mut self, timeout: Duration) -> BoxFuture<'_, Result<Option<u8>>>;

    /// Returns true if connected.
    fn is_connected(&self) -> bool;

    /// Name of the underlying port, for diagnostics.
    fn port_name(&self) -> &str;
}

pub use mock::MockTransport;
pub use serial::{SerialConfig, SerialTransport};
