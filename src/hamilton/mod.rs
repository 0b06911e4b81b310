//! Hamilton MVP valve positioners, possibly chained on one port.
//!
//! Valves are addressed `a` to `z`. The chain can number itself: after
//! auto-addressing, the reply tells how many valves took an address. A
//! chain that was already numbered does not report anything, and is scanned
//! address by address instead.

pub mod command;
pub mod rotation;
pub mod valve;

pub use command::{MovementStatus, MvpCommand, MvpOp, MvpReply};
pub use rotation::{RotationPolicy, ValveType, rotation_angles, should_rotate_ccw};
pub use valve::MvpValve;

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::chain::Chain;
use crate::error::{Error, ParseError, Result};
use crate::protocol::Framing;
use crate::transport::{SerialConfig, SerialTransport, Transport};

use command::{MAX_ADDRESS, MIN_ADDRESS};
use valve::ValveState;

const ADDRESS_COUNT: usize = (MAX_ADDRESS as usize) - (MIN_ADDRESS as usize) + 1;

/// A chain of MVP valves sharing one serial port.
pub struct MvpChain<T> {
    chain: Chain<T>,
    max_address: Option<char>,
    addresses: Option<Vec<char>>,
    // Indexed by address - 'a'
    valves: [Arc<Mutex<ValveState>>; ADDRESS_COUNT],
}

impl MvpChain<SerialTransport> {
    /// Creates a chain on a serial port with the MVP line settings (7O1).
    #[must_use]
    pub fn serial(port: impl Into<String>) -> Self {
        Self::with_serial_config(SerialConfig::mvp(port))
    }

    /// Creates a chain with custom serial configuration.
    #[must_use]
    pub fn with_serial_config(config: SerialConfig) -> Self {
        Self::new(SerialTransport::new(config))
    }
}

impl<T: Transport> MvpChain<T> {
    /// Creates a chain over the given transport.
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self {
            chain: Chain::new(transport, Framing::MVP),
            max_address: None,
            addresses: None,
            valves: std::array::from_fn(|_| Arc::new(Mutex::new(ValveState::default()))),
        }
    }

    /// The underlying dispatcher.
    #[must_use]
    pub const fn chain(&self) -> &Chain<T> {
        &self.chain
    }

    /// Connects, auto-addresses the chain and finds the installed valves.
    ///
    /// Discovery runs once; later calls return the same addresses.
    pub async fn initialize(&mut self) -> Result<&[char]> {
        self.chain.connect().await?;
        if self.addresses.is_none() {
            let found = match self.auto_address().await? {
                Some(max) => {
                    self.max_address = Some(max);
                    (MIN_ADDRESS..=max).collect()
                }
                None => self.scan().await?,
            };
            tracing::info!(
                "found {} valve(s) on {}: {:?}",
                found.len(),
                self.chain.port(),
                found
            );
            self.addresses = Some(found);
        }
        Ok(self.addresses())
    }

    /// Last address assigned by auto-addressing, if the chain reported one.
    #[must_use]
    pub const fn max_address(&self) -> Option<char> {
        self.max_address
    }

    /// Returns true if auto-addressing reported the chain length.
    #[must_use]
    pub const fn has_max_address(&self) -> bool {
        self.max_address.is_some()
    }

    /// Addresses found by [`MvpChain::initialize`] (empty before).
    #[must_use]
    pub fn addresses(&self) -> &[char] {
        self.addresses.as_deref().unwrap_or_default()
    }

    /// Returns a handle to the valve at `address`.
    ///
    /// Every handle to one address shares its rotation policy and cached
    /// valve type.
    pub fn valve(&self, address: char) -> Result<MvpValve<T>> {
        if !(MIN_ADDRESS..=MAX_ADDRESS).contains(&address) {
            return Err(Error::UnknownAddress {
                address: address.to_string(),
            });
        }
        let state = Arc::clone(&self.valves[address as usize - MIN_ADDRESS as usize]);
        Ok(MvpValve::new(self.chain.clone(), address, state))
    }

    async fn auto_address(&self) -> Result<Option<char>> {
        match self.chain.send_receive(&MvpCommand::auto_address()).await? {
            MvpReply::AutoAddress { max_address } => {
                tracing::debug!(
                    "auto-address on {}: max {:?}",
                    self.chain.port(),
                    max_address
                );
                Ok(max_address)
            }
            other => Err(ParseError::unexpected(format!("{other:?}")).into()),
        }
    }

    async fn scan(&self) -> Result<Vec<char>> {
        let mut found = Vec::new();
        for address in MIN_ADDRESS..=MAX_ADDRESS {
            let query = MvpCommand::new(address, MvpOp::FirmwareVersion);
            match self.chain.send_receive(&query).await {
                Ok(_) => found.push(address),
                Err(err @ (Error::Serial(_) | Error::Io(_) | Error::NotConnected)) => {
                    return Err(err);
                }
                Err(err) => tracing::debug!("no valve at address {}: {}", address, err),
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
    async fn test_auto_address_reports_chain_length() {
        let mut mock = MockTransport::new();
        mock.expect(b"1a\r", b"1d\r\x06");
        let handle = mock.handle();
        let mut chain = MvpChain::new(mock);

        let found = chain.initialize().await.unwrap().to_vec();
        assert_eq!(found, vec!['a', 'b', 'c']);
        assert!(chain.has_max_address());
        assert_eq!(chain.max_address(), Some('c'));
        assert_eq!(handle.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_addressed_chain_is_scanned() {
        let mut mock = MockTransport::new();
        mock.expect(b"1a\r", b"1a\r")
            .expect(b"aU\r", b"aU\r\x06MVP 2.1\r")
            .expect(b"bU\r", b"bU\r\x06MVP 2.1\r");
        let handle = mock.handle();
        let mut chain = MvpChain::new(mock);

        let found = chain.initialize().await.unwrap().to_vec();
        assert_eq!(found, vec!['a', 'b']);
        assert!(!chain.has_max_address());
        // Auto-address plus one query per address
        assert_eq!(handle.write_count(), 27);

        chain.initialize().await.unwrap();
        assert_eq!(handle.write_count(), 27);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_address_nak() {
        let mut mock = MockTransport::new();
        mock.expect(b"1a\r", b"1b\r\x15");
        let mut chain = MvpChain::new(mock);

        assert!(matches!(chain.initialize().await, Err(Error::Nak)));
        assert!(chain.addresses().is_empty());
    }

    #[test]
    fn test_valve_address_range() {
        let chain = MvpChain::new(MockTransport::new());
        assert!(chain.valve('a').is_ok());
        assert!(chain.valve('z').is_ok());
        assert!(matches!(chain.valve('A'), Err(Error::UnknownAddress { .. })));
        assert!(matches!(chain.valve('1'), Err(Error::UnknownAddress { .. })));
    }
}
