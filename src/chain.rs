//! The dispatcher that owns one physical port.
//!
//! A [`Chain`] serialises command execution over a shared transport: the
//! transport lock is held for the full exchange of one command, so two
//! devices on the same bus never interleave their byte streams.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::protocol::parser::strip_padding;
use crate::protocol::{Command, Framing, ResponseUnit, Step, UnitKind};
use crate::transport::Transport;

/// Dispatcher for one port shared by several addressed instruments.
///
/// Cloning is cheap and yields a handle to the same port and lock.
pub struct Chain<T> {
    transport: Arc<Mutex<T>>,
    framing: Framing,
    port: Arc<str>,
}

impl<T> Clone for Chain<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            framing: self.framing,
            port: Arc::clone(&self.port),
        }
    }
}

impl<T: Transport> Chain<T> {
    /// Wraps a transport with the framing rules of its instrument family.
    #[must_use]
    pub fn new(transport: T, framing: Framing) -> Self {
        let port = Arc::from(transport.port_name());
        Self {
            transport: Arc::new(Mutex::new(transport)),
            framing,
            port,
        }
    }

    /// Port identifier, fixed at construction.
    #[must_use]
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Framing rules of this port.
    #[must_use]
    pub const fn framing(&self) -> &Framing {
        &self.framing
    }

    /// Opens the transport (which purges stale input).
    pub async fn connect(&self) -> Result<()> {
        self.transport.lock().await.connect().await
    }

    /// Closes the transport.
    pub async fn disconnect(&self) -> Result<()> {
        self.transport.lock().await.disconnect().await
    }

    /// Returns true if the transport is connected.
    pub async fn is_connected(&self) -> bool {
        self.transport.lock().await.is_connected()
    }

    /// Sends `command` and reads its reply to completion.
    ///
    /// Input still buffered from an earlier exchange (a late reply, or the
    /// rest of a rejected one) is discarded before writing, so it can never
    /// be taken for this command's reply. Transport errors abort
    /// immediately; nothing is retried here.
    pub async fn send_receive<C: Command>(&self, command: &C) -> Result<C::Reply> {
        let mut transport = self.transport.lock().await;

        let stale = transport.clear_input().await?;
        if stale > 0 {
            tracing::debug!("{}: dropped {} stale bytes before {:?}", self.port, stale, command);
        }

        let encoded = command.encode();
        let mut buf =
            BytesMut::with_capacity(encoded.len() + self.framing.command_terminator.len());
        buf.put_slice(encoded.as_bytes());
        buf.put_slice(self.framing.command_terminator);
        tracing::trace!("{}: sending {:?}", self.port, command);
        transport.write(buf.freeze()).await?;

        let mut units = Vec::new();
        loop {
            match command.advance(&units)? {
                Step::Done(reply) => return Ok(reply),
                Step::Read(kind) => {
                    let unit = self.read_unit(&mut *transport, kind).await?;
                    tracing::trace!("{}: received {}", self.port, unit);
                    units.push(unit);
                }
            }
        }
    }

    async fn read_unit(&self, transport: &mut T, kind: UnitKind) -> Result<ResponseUnit> {
        match kind {
            UnitKind::Byte => self.poll_byte(transport).await.map(ResponseUnit::Byte),
            UnitKind::Line => {
                match transport.read_line(self.framing.response_terminator).await {
                    Ok(line) => {
                        let line = if self.framing.strip_padding {
                            strip_padding(&line).to_owned()
                        } else {
                            line
                        };
                        Ok(ResponseUnit::Line(line))
                    }
                    Err(err) => Err(self.check_syntax_error(transport, err).await),
                }
            }
        }
    }

    /// Polls for one byte until the family's byte deadline.
    async fn poll_byte(&self, transport: &mut T) -> Result<u8> {
        let deadline = tokio::time::Instant::now() + self.framing.byte_timeout;
        loop {
            if let Some(byte) = transport.read_byte(self.framing.poll_interval).await? {
                return Ok(byte);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(timeout_error(self.framing.byte_timeout));
            }
        }
    }

    /// After a line read timed out, looks once for the bare syntax-error byte.
    async fn check_syntax_error(&self, transport: &mut T, err: Error) -> Error {
        let Some(marker) = self.framing.syntax_error_byte else {
            return err;
        };
        if !matches!(err, Error::Timeout { .. }) {
            return err;
        }
        match transport.read_byte(self.framing.poll_interval).await {
            Ok(Some(byte)) if byte == marker => Error::InvalidCommand,
            _ => err,
        }
    }
}

fn timeout_error(timeout: Duration) -> Error {
    Error::Timeout {
        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    }
}
