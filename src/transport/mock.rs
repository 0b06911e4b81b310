//! Scripted in-memory transport.
//!
//! [`MockTransport`] answers each expected write with canned bytes and
//! records everything written, so tests can assert on the exact byte
//! stream (including that nothing was written at all).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Line timeout reported by the mock when no terminator is buffered.
pub const MOCK_LINE_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Default)]
struct MockState {
    expectations: VecDeque<(Vec<u8>, Vec<u8>)>,
    rx: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    fail_writes: bool,
    fail_reads: bool,
}

/// Inspection handle that stays valid after the transport is moved into a chain.
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// All writes performed so far, in order.
    #[must_use]
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state).writes.clone()
    }

    /// Number of writes performed so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        lock(&self.state).writes.len()
    }

    /// Number of scripted exchanges not consumed yet.
    #[must_use]
    pub fn pending_expectations(&self) -> usize {
        lock(&self.state).expectations.len()
    }

    /// Bytes received by the mock but not read by anyone.
    #[must_use]
    pub fn unread(&self) -> Vec<u8> {
        lock(&self.state).rx.iter().copied().collect()
    }

    /// Makes bytes readable without waiting for a write, e.g. a late reply.
    pub fn push_rx(&self, data: &[u8]) {
        lock(&self.state).rx.extend(data);
    }

    /// Scripts another exchange (see [`MockTransport::expect`]).
    pub fn expect(&self, command: &[u8], response: &[u8]) {
        lock(&self.state)
            .expectations
            .push_back((command.to_vec(), response.to_vec()));
    }
}

/// Scripted transport for tests.
#[derive(Debug)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    connected: bool,
    line_timeout: Duration,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Creates a connected mock with nothing scripted.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            connected: true,
            line_timeout: MOCK_LINE_TIMEOUT,
        }
    }

    /// Scripts one exchange: when exactly `command` is written, `response`
    /// becomes readable. Exchanges are matched in order.
    pub fn expect(&mut self, command: &[u8], response: &[u8]) -> &mut Self {
        lock(&self.state)
            .expectations
            .push_back((command.to_vec(), response.to_vec()));
        self
    }

    /// Makes bytes readable without waiting for a write.
    pub fn push_rx(&mut self, data: &[u8]) -> &mut Self {
        lock(&self.state).rx.extend(data);
        self
    }

    /// Makes every subsequent write fail with an I/O error.
    pub fn fail_writes(&mut self) -> &mut Self {
        lock(&self.state).fail_writes = true;
        self
    }

    /// Makes every subsequent line read fail with an I/O error.
    pub fn fail_reads(&mut self) -> &mut Self {
        lock(&self.state).fail_reads = true;
        self
    }

    /// Returns a handle for inspecting the mock after it has been moved.
    #[must_use]
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }
}

fn lock(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn find(rx: &VecDeque<u8>, terminator: &[u8]) -> Option<usize> {
    if terminator.is_empty() || rx.len() < terminator.len() {
        return None;
    }
    (0..=rx.len() - terminator.len())
        .find(|&start| (0..terminator.len()).all(|i| rx[start + i] == terminator[i]))
}

impl Transport for MockTransport {
    fn connect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.connected = true;
            Ok(())
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.connected = false;
            Ok(())
        })
    }

    fn write(&mut self, data: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.connected {
                return Err(Error::NotConnected);
            }
            let mut state = lock(&self.state);
            if state.fail_writes {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "mock write failure",
                )));
            }
            state.writes.push(data.to_vec());
            let matches = state
                .expectations
                .front()
                .is_some_and(|(command, _)| command.as_slice() == data.as_ref());
            if matches {
                if let Some((_, response)) = state.expectations.pop_front() {
                    state.rx.extend(response);
                }
            } else {
                tracing::debug!("mock: unscripted write {:?}", String::from_utf8_lossy(&data));
            }
            Ok(())
        })
    }

    fn read_line<'a>(&'a mut self, terminator: &'a [u8]) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            if !self.connected {
                return Err(Error::NotConnected);
            }
            let line = {
                let mut state = lock(&self.state);
                if state.fail_reads {
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "mock read failure",
                    )));
                }
                find(&state.rx, terminator).map(|pos| {
                    let line: Vec<u8> = state.rx.drain(..pos).collect();
                    state.rx.drain(..terminator.len());
                    line
                })
            };
            match line {
                Some(line) => Ok(String::from_utf8_lossy(&line).into_owned()),
                None => {
                    tokio::time::sleep(self.line_timeout).await;
                    Err(Error::Timeout {
                        timeout_ms: u64::try_from(self.line_timeout.as_millis())
                            .unwrap_or(u64::MAX),
                    })
                }
            }
        })
    }

    fn clear_input(&mut self) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            if !self.connected {
                return Err(Error::NotConnected);
            }
            let mut state = lock(&self.state);
            let dropped = state.rx.len();
            state.rx.clear();
            Ok(dropped)
        })
    }

    fn read_byte(&mut self, timeout: Duration) -> BoxFuture<'_, Result<Option<u8>>> {
        Box::pin(async move {
            if !self.connected {
                return Err(Error::NotConnected);
            }
            let byte = lock(&self.state).rx.pop_front();
            if byte.is_none() {
                tokio::time::sleep(timeout).await;
            }
            Ok(byte)
        })
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn port_name(&self) -> &str {
        "mock"
    }
}
