//! Ismatec MCP peristaltic pumps, possibly chained on one port.
//!
//! Pumps are addressed `1` to `8`. The chain has no auto-addressing, so
//! installed pumps are found by querying every address.

pub mod command;
pub mod pump;

pub use command::{Direction, McpCommand, McpOp, McpReply, Mode, StartOutcome};
pub use pump::{McpPump, PumpIdentity};

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::chain::Chain;
use crate::error::{Error, Result};
use crate::protocol::Framing;
use crate::transport::{SerialConfig, SerialTransport, Transport};

use command::{MAX_ADDRESS, MIN_ADDRESS};
use pump::PumpState;

/// A chain of MCP pumps sharing one serial port.
pub struct McpChain<T> {
    chain: Chain<T>,
    addresses: Option<Vec<u8>>,
    // Indexed by address - 1
    pumps: [Arc<Mutex<PumpState>>; MAX_ADDRESS as usize],
}

impl McpChain<SerialTransport> {
    /// Creates a chain on a serial port with default settings.
    #[must_use]
    pub fn serial(port: impl Into<String>) -> Self {
        Self::with_serial_config(SerialConfig::new(port))
    }

    /// Creates a chain with custom serial configuration.
    #[must_use]
    pub fn with_serial_config(config: SerialConfig) -> Self {
        Self::new(SerialTransport::new(config))
    }
}

impl<T: Transport> McpChain<T> {
    /// Creates a chain over the given transport.
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self {
            chain: Chain::new(transport, Framing::MCP),
            addresses: None,
            pumps: std::array::from_fn(|_| Arc::new(Mutex::new(PumpState::default()))),
        }
    }

    /// The underlying dispatcher.
    #[must_use]
    pub const fn chain(&self) -> &Chain<T> {
        &self.chain
    }

    /// Connects and finds the installed pumps.
    ///
    /// Discovery runs once; later calls return the same addresses.
    pub async fn initialize(&mut self) -> Result<&[u8]> {
        self.chain.connect().await?;
        if self.addresses.is_none() {
            let found = self.detect().await?;
            tracing::info!(
                "found {} pump(s) on {}: {:?}",
                found.len(),
                self.chain.port(),
                found
            );
            self.addresses = Some(found);
        }
        Ok(self.addresses())
    }

    /// Addresses found by [`McpChain::initialize`] (empty before).
    #[must_use]
    pub fn addresses(&self) -> &[u8] {
        self.addresses.as_deref().unwrap_or_default()
    }

    /// Returns a handle to the pump at `address`.
    ///
    /// Every handle to one address shares its cached settings.
    pub fn pump(&self, address: u8) -> Result<McpPump<T>> {
        if !(MIN_ADDRESS..=MAX_ADDRESS).contains(&address) {
            return Err(Error::UnknownAddress {
                address: address.to_string(),
            });
        }
        let state = Arc::clone(&self.pumps[usize::from(address - MIN_ADDRESS)]);
        Ok(McpPump::new(self.chain.clone(), address, state))
    }

    async fn detect(&self) -> Result<Vec<u8>> {
        let mut found = Vec::new();
        for address in MIN_ADDRESS..=MAX_ADDRESS {
            let query = McpCommand::new(address, McpOp::PumpInfo);
            match self.chain.send_receive(&query).await {
                Ok(_) => found.push(address),
                Err(err @ (Error::Serial(_) | Error::Io(_) | Error::NotConnected)) => {
                    return Err(err);
                }
                Err(err) => tracing::debug!("no pump at address {}: {}", address, err),
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[tokio::test(start_paused = true)]
    async fn test_detect_queries_every_address() {
        let mut mock = MockTransport::new();
        mock.expect(b"1#\r", b"MCP 0202 01\r\n")
            .expect(b"2#\r", b"")
            .expect(b"3#\r", b"MCP 0202 01\r\n");
        let handle = mock.handle();
        let mut chain = McpChain::new(mock);

        let found = chain.initialize().await.unwrap().to_vec();
        assert_eq!(found, vec![1, 3]);
        assert_eq!(handle.write_count(), 8);

        // Discovery does not run again
        chain.initialize().await.unwrap();
        assert_eq!(handle.write_count(), 8);
        assert_eq!(chain.addresses(), &[1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detect_propagates_transport_errors() {
        let mut mock = MockTransport::new();
        mock.fail_writes();
        let mut chain = McpChain::new(mock);

        assert!(matches!(chain.initialize().await, Err(Error::Io(_))));
        assert!(chain.addresses().is_empty());
    }

    #[test]
    fn test_pump_address_range() {
        let chain = McpChain::new(MockTransport::new());
        assert!(chain.pump(1).is_ok());
        assert!(chain.pump(8).is_ok());
        assert!(matches!(chain.pump(0), Err(Error::UnknownAddress { .. })));
        assert!(matches!(chain.pump(9), Err(Error::UnknownAddress { .. })));
    }
}
