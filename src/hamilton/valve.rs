//! One MVP valve positioner on a chain.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::chain::Chain;
use crate::error::{Error, ParseError, Result};
use crate::hamilton::command::{MovementStatus, MvpCommand, MvpOp, MvpReply};
use crate::hamilton::rotation::{RotationPolicy, ValveType, should_rotate_ccw};
use crate::transport::Transport;

/// Interval between polls in [`MvpValve::wait_until_idle`].
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Host-side state of one valve, shared by every handle to its address.
#[derive(Debug, Default)]
pub(crate) struct ValveState {
    policy: RotationPolicy,
    valve_type: Option<ValveType>,
}

/// A valve at one address of an [`MvpChain`](crate::hamilton::MvpChain).
pub struct MvpValve<T> {
    chain: Chain<T>,
    address: char,
    state: Arc<Mutex<ValveState>>,
}

impl<T> Clone for MvpValve<T> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            address: self.address,
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Transport> MvpValve<T> {
    pub(crate) const fn new(
        chain: Chain<T>,
        address: char,
        state: Arc<Mutex<ValveState>>,
    ) -> Self {
        Self {
            chain,
            address,
            state,
        }
    }

    /// Bus address.
    #[must_use]
    pub const fn address(&self) -> char {
        self.address
    }

    /// Direction policy for [`MvpValve::move_to`].
    pub async fn rotation_policy(&self) -> RotationPolicy {
        self.state.lock().await.policy
    }

    /// Sets the direction policy.
    pub async fn set_rotation_policy(&self, policy: RotationPolicy) {
        self.state.lock().await.policy = policy;
    }

    /// Homes the valve. The valve type is re-read on next use.
    pub async fn initialize_valve(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.valve_type = None;
        self.expect_accepted(MvpOp::InitializeValve).await
    }

    /// Fitted valve type (queried once, then cached).
    pub async fn valve_type(&self) -> Result<ValveType> {
        let mut state = self.state.lock().await;
        self.cached_valve_type(&mut state).await
    }

    /// Current 0-based position.
    pub async fn position(&self) -> Result<u8> {
        match self.send(MvpOp::ValvePosition).await? {
            MvpReply::Position(position) => Ok(position),
            other => Err(unexpected_reply(&other)),
        }
    }

    /// Rotates to the 0-based position `dest`.
    ///
    /// The destination is checked against the valve type before the move
    /// is sent. With [`RotationPolicy::LeastAngle`] the current position is
    /// read first to pick the shorter way round.
    pub async fn move_to(&self, dest: u8) -> Result<()> {
        let mut state = self.state.lock().await;
        let valve_type = self.cached_valve_type(&mut state).await?;
        if dest >= valve_type.positions() {
            return Err(Error::ValueOutOfRange {
                name: "valve position",
                value: f64::from(dest),
                min: 0.0,
                max: f64::from(valve_type.positions() - 1),
            });
        }
        let counter_clockwise = match state.policy {
            RotationPolicy::Clockwise => false,
            RotationPolicy::CounterClockwise => true,
            RotationPolicy::LeastAngle => {
                let start = self.position().await?;
                should_rotate_ccw(valve_type, start, dest)
            }
        };
        tracing::debug!(
            "valve {}: moving to {} ({})",
            self.address,
            dest,
            if counter_clockwise { "ccw" } else { "cw" }
        );
        self.expect_accepted(MvpOp::Move {
            position: dest,
            counter_clockwise,
        })
        .await
    }

    /// Movement state of the valve.
    pub async fn movement_status(&self) -> Result<MovementStatus> {
        match self.send(MvpOp::MovementFinished).await? {
            MvpReply::Movement(status) => Ok(status),
            other => Err(unexpected_reply(&other)),
        }
    }

    /// Polls until the valve reports its movement finished, at most `timeout`.
    pub async fn wait_until_idle(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.movement_status().await? == MovementStatus::Done {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }

    /// Firmware version string.
    pub async fn firmware_version(&self) -> Result<String> {
        match self.send(MvpOp::FirmwareVersion).await? {
            MvpReply::Text(text) => Ok(text),
            other => Err(unexpected_reply(&other)),
        }
    }

    async fn cached_valve_type(&self, state: &mut ValveState) -> Result<ValveType> {
        if let Some(valve_type) = state.valve_type {
            return Ok(valve_type);
        }
        let valve_type = match self.send(MvpOp::ValveType).await? {
            MvpReply::ValveType(valve_type) => valve_type,
            other => return Err(unexpected_reply(&other)),
        };
        tracing::debug!("valve {} on {}: {}", self.address, self.chain.port(), valve_type);
        state.valve_type = Some(valve_type);
        Ok(valve_type)
    }

    async fn send(&self, op: MvpOp) -> Result<MvpReply> {
        self.chain
            .send_receive(&MvpCommand::new(self.address, op))
            .await
    }

    async fn expect_accepted(&self, op: MvpOp) -> Result<()> {
        match self.send(op).await? {
            MvpReply::Accepted => Ok(()),
            other => Err(unexpected_reply(&other)),
        }
    }
}

fn unexpected_reply(reply: &MvpReply) -> Error {
    ParseError::unexpected(format!("{reply:?}")).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hamilton::MvpChain;
    use crate::transport::MockTransport;
    use crate::transport::mock::MockHandle;

    fn valve(mock: MockTransport) -> (MvpValve<MockTransport>, MockHandle) {
        let handle = mock.handle();
        let chain = MvpChain::new(mock);
        (chain.valve('a').unwrap(), handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_least_angle_move() {
        let mut mock = MockTransport::new();
        mock.expect(b"aLQT\r", b"aLQT\r\x062\r")
            .expect(b"aLQP\r", b"aLQP\r\x061\r")
            .expect(b"aLP18R\r", b"aLP18R\r\x06");
        let (valve, handle) = valve(mock);

        // 0 -> 7 on an 8 port valve is 45 degrees counter-clockwise
        valve.move_to(7).await.unwrap();
        assert_eq!(handle.pending_expectations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tie_moves_clockwise() {
        let mut mock = MockTransport::new();
        mock.expect(b"aLQT\r", b"aLQT\r\x064\r")
            .expect(b"aLQP\r", b"aLQP\r\x061\r")
            .expect(b"aLP03R\r", b"aLP03R\r\x06");
        let (valve, handle) = valve(mock);

        valve.move_to(2).await.unwrap();
        assert_eq!(handle.pending_expectations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_direction_skips_position_query() {
        let mut mock = MockTransport::new();
        mock.expect(b"aLQT\r", b"aLQT\r\x063\r")
            .expect(b"aLP02R\r", b"aLP02R\r\x06");
        let (valve, handle) = valve(mock);
        valve.set_rotation_policy(RotationPolicy::Clockwise).await;

        valve.move_to(1).await.unwrap();
        assert_eq!(handle.write_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destination_checked_before_move() {
        let mut mock = MockTransport::new();
        mock.expect(b"aLQT\r", b"aLQT\r\x064\r");
        let (valve, handle) = valve(mock);

        let err = valve.move_to(3).await.unwrap_err();
        assert!(matches!(err, Error::ValueOutOfRange { max, .. } if max == 2.0));
        // Only the type query went out
        assert_eq!(handle.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_valve_type_cached_until_initialize() {
        let mut mock = MockTransport::new();
        mock.expect(b"aLQT\r", b"aLQT\r\x062\r")
            .expect(b"aLXR\r", b"aLXR\r\x06")
            .expect(b"aLQT\r", b"aLQT\r\x066\r");
        let (valve, handle) = valve(mock);

        assert_eq!(valve.valve_type().await.unwrap(), ValveType::EightPorts);
        assert_eq!(valve.valve_type().await.unwrap(), ValveType::EightPorts);
        assert_eq!(handle.write_count(), 1);

        valve.initialize_valve().await.unwrap();
        assert_eq!(valve.valve_type().await.unwrap(), ValveType::FourPorts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_idle() {
        let mut mock = MockTransport::new();
        mock.expect(b"aF\r", b"aF\r\x06*\r")
            .expect(b"aF\r", b"aF\r\x06N\r")
            .expect(b"aF\r", b"aF\r\x06Y\r");
        let (valve, handle) = valve(mock);

        valve.wait_until_idle(Duration::from_secs(1)).await.unwrap();
        assert_eq!(handle.write_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_idle_is_bounded() {
        let mut mock = MockTransport::new();
        for _ in 0..10 {
            mock.expect(b"aF\r", b"aF\r\x06N\r");
        }
        let (valve, _handle) = valve(mock);

        let err = valve
            .wait_until_idle(Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { timeout_ms: 150 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_firmware_version() {
        let mut mock = MockTransport::new();
        mock.expect(b"aU\r", b"aU\r\x06MVP 2.1\r");
        let (valve, _handle) = valve(mock);

        assert_eq!(valve.firmware_version().await.unwrap(), "MVP 2.1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_handles_to_one_address_share_state() {
        let mut mock = MockTransport::new();
        mock.expect(b"aLQT\r", b"aLQT\r\x062\r")
            .expect(b"aLXR\r", b"aLXR\r\x06")
            .expect(b"aLQT\r", b"aLQT\r\x064\r")
            .expect(b"aLP03R\r", b"aLP03R\r\x06");
        let handle = mock.handle();
        let chain = MvpChain::new(mock);
        let first = chain.valve('a').unwrap();
        let second = chain.valve('a').unwrap();

        assert_eq!(first.valve_type().await.unwrap(), ValveType::EightPorts);
        second.initialize_valve().await.unwrap();
        second.set_rotation_policy(RotationPolicy::Clockwise).await;
        assert_eq!(first.rotation_policy().await, RotationPolicy::Clockwise);

        // Re-reads the type after the other handle homed the valve; no
        // position query under the shared clockwise policy
        first.move_to(2).await.unwrap();
        assert_eq!(handle.pending_expectations(), 0);
        let untouched = chain.valve('b').unwrap();
        assert_eq!(untouched.rotation_policy().await, RotationPolicy::LeastAngle);
    }
}
