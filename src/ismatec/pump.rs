//! One MCP pump on a chain.
//!
//! Most settings can be read back from the pump, and are cached here so a
//! UI polling them does not flood the bus. A cached value is dropped
//! whenever a write could change it, and is ignored altogether while
//! manual control is enabled (the operator may change settings from the
//! front panel behind our back).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::chain::Chain;
use crate::error::{Error, ParseError, Result};
use crate::ismatec::command::{Direction, McpCommand, McpOp, McpReply, Mode, StartOutcome};
use crate::protocol::parser::to_fixed_point;
use crate::transport::Transport;

/// Roller counts a pump head can have.
pub const ROLLER_COUNTS: [u32; 6] = [2, 3, 4, 6, 8, 12];

/// Largest tubing inner diameter, mm.
pub const MAX_TUBING_DIAMETER_MM: f64 = 99.99;
/// Largest speed, rpm.
pub const MAX_SPEED_RPM: f64 = 9999.9;
/// Largest dispensing or pause time, s (999 h).
pub const MAX_TIME_S: f64 = 999.0 * 3600.0;
/// Largest dispensing amount in roller steps.
pub const MAX_ROLLER_STEPS: u32 = 65_535;
/// Largest number of roller back steps.
pub const MAX_ROLLER_BACK_STEPS: u32 = 100;
/// Largest number of dispensing cycles.
pub const MAX_CYCLES: u32 = 9999;

/// Flow rates are reported for this head speed.
const REFERENCE_RPM: f64 = 240.0;

/// Interval between polls in [`McpPump::wait_until_stopped`].
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Identification strings read during initialisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpIdentity {
    /// Pump model line as reported by the pump.
    pub pump_type: String,
    /// Firmware version.
    pub firmware_version: String,
    /// Pump head id.
    pub head_id: String,
}

#[derive(Debug, Clone, Copy, Default)]
struct Cache {
    tubing_inner_diameter_mm: Option<f64>,
    speed_rpm: Option<f64>,
    default_flow_rate: Option<f64>,
    calibrated_flow_rate: Option<f64>,
    dispensing_time_s: Option<f64>,
    dispensing_roller_steps: Option<u32>,
    roller_back_steps: Option<u32>,
    pause_time_s: Option<f64>,
    number_of_cycles: Option<u32>,
}

/// Host-side state of one pump, shared by every handle to its address.
#[derive(Debug)]
pub(crate) struct PumpState {
    rollers: u32,
    // As reported by '[' after the last tubing change. Not refreshed on
    // every use: '[' is unreliable when the calibrated flow rate has one
    // digit fewer than the default flow rate.
    fractional_digits: u32,
    // The pump cannot report these; we force them at initialisation.
    direction: Direction,
    manual_control: bool,
    mode: Mode,
    identity: Option<PumpIdentity>,
    cache: Cache,
}

impl Default for PumpState {
    fn default() -> Self {
        Self {
            rollers: 3,
            fractional_digits: 0,
            direction: Direction::Clockwise,
            manual_control: false,
            mode: Mode::PumpRpm,
            identity: None,
            cache: Cache::default(),
        }
    }
}

impl PumpState {
    fn invalidate_all(&mut self) {
        self.cache = Cache::default();
    }
}

/// A pump at one address of an [`McpChain`](crate::ismatec::McpChain).
///
/// Handles for the same address share one state, so a write through one
/// handle invalidates what the others have cached. The state lock is held
/// for the whole operation, including its bus exchanges.
pub struct McpPump<T> {
    chain: Chain<T>,
    address: u8,
    state: Arc<Mutex<PumpState>>,
}

impl<T> Clone for McpPump<T> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            address: self.address,
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Transport> McpPump<T> {
    pub(crate) const fn new(
        chain: Chain<T>,
        address: u8,
        state: Arc<Mutex<PumpState>>,
    ) -> Self {
        Self {
            chain,
            address,
            state,
        }
    }

    /// Bus address.
    #[must_use]
    pub const fn address(&self) -> u8 {
        self.address
    }

    /// Identity read by [`McpPump::initialize`], if it ran.
    pub async fn identity(&self) -> Option<PumpIdentity> {
        self.state.lock().await.identity.clone()
    }

    /// Brings the pump into a known state.
    ///
    /// Clears overload, stops the pump, pushes direction, manual control and
    /// mode (which cannot be queried), then reads the fractional digit count
    /// and identification strings.
    pub async fn initialize(&self) -> Result<PumpIdentity> {
        let mut state = self.state.lock().await;
        self.expect_accepted(McpOp::ResetOverload).await?;
        self.expect_accepted(McpOp::Stop).await?;
        self.expect_accepted(McpOp::SetDirection(state.direction))
            .await?;
        self.expect_accepted(McpOp::SetManualControl(state.manual_control))
            .await?;
        self.expect_accepted(McpOp::SetMode(state.mode)).await?;
        state.fractional_digits = self.query_count(McpOp::FractionalDigits).await?;

        let identity = PumpIdentity {
            pump_type: self.query_text(McpOp::PumpInfo).await?,
            firmware_version: self.query_text(McpOp::FirmwareVersion).await?,
            head_id: self.query_text(McpOp::HeadId).await?,
        };
        tracing::info!(
            "pump {} on {}: {} (firmware {}, head {})",
            self.address,
            self.chain.port(),
            identity.pump_type,
            identity.firmware_version,
            identity.head_id
        );
        state.identity = Some(identity.clone());
        Ok(identity)
    }

    // ==================== Local settings ====================

    /// Number of rollers of the pump head (used to derive volumes).
    pub async fn number_of_rollers(&self) -> u32 {
        self.state.lock().await.rollers
    }

    /// Sets the number of rollers of the pump head.
    pub async fn set_number_of_rollers(&self, rollers: u32) -> Result<()> {
        if !ROLLER_COUNTS.contains(&rollers) {
            return Err(Error::ValueOutOfRange {
                name: "number of rollers",
                value: f64::from(rollers),
                min: 2.0,
                max: 12.0,
            });
        }
        self.state.lock().await.rollers = rollers;
        Ok(())
    }

    /// Fractional digit count in use for flow rate encoding.
    pub async fn fractional_digits(&self) -> u32 {
        self.state.lock().await.fractional_digits
    }

    // ==================== Pumping ====================

    /// Starts the pump.
    ///
    /// A pump in volume-in-time mode whose settings are out of range refuses
    /// to start; that is reported as
    /// [`StartOutcome::RejectedIncompatibleMode`], not as an error.
    pub async fn start(&self) -> Result<StartOutcome> {
        let state = self.state.lock().await;
        match self.send(McpOp::Start).await? {
            McpReply::Start(outcome) => {
                if outcome == StartOutcome::RejectedIncompatibleMode {
                    tracing::debug!("pump {} refused to start in {}", self.address, state.mode);
                }
                Ok(outcome)
            }
            other => Err(unexpected_reply(&other)),
        }
    }

    /// Stops the pump.
    pub async fn stop(&self) -> Result<()> {
        self.expect_accepted(McpOp::Stop).await
    }

    /// Returns true if the pump is running.
    pub async fn is_pumping(&self) -> Result<bool> {
        match self.send(McpOp::PumpActive).await? {
            McpReply::Active(active) => Ok(active),
            other => Err(unexpected_reply(&other)),
        }
    }

    /// Polls until the pump reports it has stopped, at most `timeout`.
    pub async fn wait_until_stopped(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.is_pumping().await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
    }

    /// Clears an overload condition.
    pub async fn reset_overload(&self) -> Result<()> {
        self.expect_accepted(McpOp::ResetOverload).await
    }

    // ==================== Write-only state ====================

    /// Last direction set.
    pub async fn direction(&self) -> Direction {
        self.state.lock().await.direction
    }

    /// Sets the rotation direction.
    pub async fn set_direction(&self, direction: Direction) -> Result<()> {
        let mut state = self.state.lock().await;
        self.expect_accepted(McpOp::SetDirection(direction)).await?;
        state.direction = direction;
        Ok(())
    }

    /// Whether the front panel controls are enabled.
    pub async fn manual_control(&self) -> bool {
        self.state.lock().await.manual_control
    }

    /// Enables or disables the front panel controls.
    ///
    /// All cached values are dropped: whatever the operator changed while
    /// the panel was live must be read back.
    pub async fn set_manual_control(&self, enabled: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        tracing::debug!("pump {}: dropping all cached values", self.address);
        state.invalidate_all();
        self.expect_accepted(McpOp::SetManualControl(enabled)).await?;
        state.manual_control = enabled;
        Ok(())
    }

    /// Last mode set.
    pub async fn mode(&self) -> Mode {
        self.state.lock().await.mode
    }

    /// Selects the operating mode.
    pub async fn set_mode(&self, mode: Mode) -> Result<()> {
        let mut state = self.state.lock().await;
        self.expect_accepted(McpOp::SetMode(mode)).await?;
        state.mode = mode;
        Ok(())
    }

    // ==================== Cached settings ====================

    /// Tubing inner diameter, mm.
    pub async fn tubing_inner_diameter(&self) -> Result<f64> {
        let mut state = self.state.lock().await;
        self.cached_quantity(&mut state, |c| &mut c.tubing_inner_diameter_mm, McpOp::TubingDiameter)
            .await
    }

    /// Sets the tubing inner diameter (0 < mm ≤ 99.99).
    ///
    /// The pump recomputes both flow rates, and its fractional digit count
    /// may change, so those are dropped and the digit count is re-read.
    pub async fn set_tubing_inner_diameter(&self, mm: f64) -> Result<()> {
        ensure_positive("tubing inner diameter", mm, MAX_TUBING_DIAMETER_MM, 2)?;
        let mut state = self.state.lock().await;
        state.cache.tubing_inner_diameter_mm = None;
        state.cache.default_flow_rate = None;
        state.cache.calibrated_flow_rate = None;
        self.expect_accepted(McpOp::SetTubingDiameter(mm)).await?;
        state.fractional_digits = self.query_count(McpOp::FractionalDigits).await?;
        Ok(())
    }

    /// Speed, rpm.
    pub async fn speed(&self) -> Result<f64> {
        let mut state = self.state.lock().await;
        self.cached_quantity(&mut state, |c| &mut c.speed_rpm, McpOp::Speed)
            .await
    }

    /// Sets the speed (0 < rpm ≤ 9999.9).
    pub async fn set_speed(&self, rpm: f64) -> Result<()> {
        ensure_positive("speed", rpm, MAX_SPEED_RPM, 1)?;
        let mut state = self.state.lock().await;
        state.cache.speed_rpm = None;
        self.expect_accepted(McpOp::SetSpeed(rpm)).await
    }

    /// Uncalibrated flow rate at 240 rpm, ml/min. Read-only.
    pub async fn default_flow_rate(&self) -> Result<f64> {
        let mut state = self.state.lock().await;
        self.cached_quantity(&mut state, |c| &mut c.default_flow_rate, McpOp::DefaultFlowRate)
            .await
    }

    /// Calibrated flow rate at 240 rpm, ml/min.
    pub async fn calibrated_flow_rate(&self) -> Result<f64> {
        let mut state = self.state.lock().await;
        self.cached_quantity(
            &mut state,
            |c| &mut c.calibrated_flow_rate,
            McpOp::CalibratedFlowRate,
        )
        .await
    }

    /// Sets the calibrated flow rate at 240 rpm.
    ///
    /// The upper limit is four digits at the current fractional digit count.
    pub async fn set_calibrated_flow_rate(&self, ml_per_min: f64) -> Result<()> {
        let mut state = self.state.lock().await;
        let fractional_digits = state.fractional_digits;
        let max = 9999.0 / 10f64.powi(fractional_digits as i32);
        ensure_positive("calibrated flow rate", ml_per_min, max, fractional_digits)?;
        state.cache.calibrated_flow_rate = None;
        self.expect_accepted(McpOp::SetCalibratedFlowRate {
            ml_per_min,
            fractional_digits,
        })
        .await
    }

    /// Dispensing time, s.
    pub async fn dispensing_time(&self) -> Result<f64> {
        let mut state = self.state.lock().await;
        self.cached_quantity(&mut state, |c| &mut c.dispensing_time_s, McpOp::DispensingTime)
            .await
    }

    /// Sets the dispensing time (0 ≤ s ≤ 999 h).
    pub async fn set_dispensing_time(&self, seconds: f64) -> Result<()> {
        ensure_within("dispensing time", seconds, MAX_TIME_S)?;
        let mut state = self.state.lock().await;
        state.cache.dispensing_time_s = None;
        self.expect_accepted(McpOp::SetDispensingTime(seconds)).await
    }

    /// Dispensing amount in roller steps.
    pub async fn dispensing_roller_steps(&self) -> Result<u32> {
        let mut state = self.state.lock().await;
        self.cached_count(
            &mut state,
            |c| &mut c.dispensing_roller_steps,
            McpOp::DispensingRollerSteps,
        )
        .await
    }

    /// Sets the dispensing amount in roller steps (0..=65535).
    pub async fn set_dispensing_roller_steps(&self, steps: u32) -> Result<()> {
        ensure_within(
            "dispensing roller steps",
            f64::from(steps),
            f64::from(MAX_ROLLER_STEPS),
        )?;
        let mut state = self.state.lock().await;
        state.cache.dispensing_roller_steps = None;
        self.expect_accepted(McpOp::SetDispensingRollerSteps(steps))
            .await
    }

    /// Dispensing volume, ml, derived from the calibrated flow rate and the
    /// roller steps: `flow × steps / (240 × rollers)`.
    pub async fn dispensing_volume(&self) -> Result<f64> {
        let mut state = self.state.lock().await;
        let flow = self
            .cached_quantity(
                &mut state,
                |c| &mut c.calibrated_flow_rate,
                McpOp::CalibratedFlowRate,
            )
            .await?;
        let steps = self
            .cached_count(
                &mut state,
                |c| &mut c.dispensing_roller_steps,
                McpOp::DispensingRollerSteps,
            )
            .await?;
        Ok(flow * f64::from(steps) / (REFERENCE_RPM * f64::from(state.rollers)))
    }

    /// Sets the dispensing volume in ml.
    ///
    /// Unlike the calibrated flow rate, the volume follows the digit count
    /// the pump reports right now, so it is queried first.
    pub async fn set_dispensing_volume(&self, ml: f64) -> Result<()> {
        let mut state = self.state.lock().await;
        let fractional_digits = self.query_count(McpOp::FractionalDigits).await?;
        let max = 99_999.0 / 10f64.powi(fractional_digits as i32);
        ensure_within("dispensing volume", ml, max)?;
        state.cache.dispensing_roller_steps = None;
        self.expect_accepted(McpOp::SetDispensingVolume {
            ml,
            fractional_digits,
        })
        .await
    }

    /// Roller steps run backwards after dispensing.
    pub async fn roller_back_steps(&self) -> Result<u32> {
        let mut state = self.state.lock().await;
        self.cached_count(&mut state, |c| &mut c.roller_back_steps, McpOp::RollerBackSteps)
            .await
    }

    /// Sets the roller back steps (0..=100).
    pub async fn set_roller_back_steps(&self, steps: u32) -> Result<()> {
        ensure_within(
            "roller back steps",
            f64::from(steps),
            f64::from(MAX_ROLLER_BACK_STEPS),
        )?;
        let mut state = self.state.lock().await;
        state.cache.roller_back_steps = None;
        self.expect_accepted(McpOp::SetRollerBackSteps(steps)).await
    }

    /// Pause time between cycles, s.
    pub async fn pause_time(&self) -> Result<f64> {
        let mut state = self.state.lock().await;
        self.cached_quantity(&mut state, |c| &mut c.pause_time_s, McpOp::PauseTime)
            .await
    }

    /// Sets the pause time (0 ≤ s ≤ 999 h).
    pub async fn set_pause_time(&self, seconds: f64) -> Result<()> {
        ensure_within("pause time", seconds, MAX_TIME_S)?;
        let mut state = self.state.lock().await;
        state.cache.pause_time_s = None;
        self.expect_accepted(McpOp::SetPauseTime(seconds)).await
    }

    /// Number of dispensing cycles.
    pub async fn number_of_cycles(&self) -> Result<u32> {
        let mut state = self.state.lock().await;
        self.cached_count(&mut state, |c| &mut c.number_of_cycles, McpOp::NumberOfCycles)
            .await
    }

    /// Sets the number of dispensing cycles (0..=9999).
    pub async fn set_number_of_cycles(&self, cycles: u32) -> Result<()> {
        ensure_within("number of cycles", f64::from(cycles), f64::from(MAX_CYCLES))?;
        let mut state = self.state.lock().await;
        state.cache.number_of_cycles = None;
        self.expect_accepted(McpOp::SetNumberOfCycles(cycles)).await
    }

    // ==================== Internals ====================

    /// Re-reads the fractional digit count.
    pub async fn refresh_fractional_digits(&self) -> Result<u32> {
        let mut state = self.state.lock().await;
        let digits = self.query_count(McpOp::FractionalDigits).await?;
        state.fractional_digits = digits;
        Ok(digits)
    }

    async fn cached_quantity(
        &self,
        state: &mut PumpState,
        slot: fn(&mut Cache) -> &mut Option<f64>,
        op: McpOp,
    ) -> Result<f64> {
        if !state.manual_control {
            if let Some(value) = *slot(&mut state.cache) {
                return Ok(value);
            }
        }
        let value = self.query_quantity(op).await?;
        *slot(&mut state.cache) = Some(value);
        Ok(value)
    }

    async fn cached_count(
        &self,
        state: &mut PumpState,
        slot: fn(&mut Cache) -> &mut Option<u32>,
        op: McpOp,
    ) -> Result<u32> {
        if !state.manual_control {
            if let Some(value) = *slot(&mut state.cache) {
                return Ok(value);
            }
        }
        let value = self.query_count(op).await?;
        *slot(&mut state.cache) = Some(value);
        Ok(value)
    }

    async fn send(&self, op: McpOp) -> Result<McpReply> {
        self.chain
            .send_receive(&McpCommand::new(self.address, op))
            .await
    }

    async fn expect_accepted(&self, op: McpOp) -> Result<()> {
        match self.send(op).await? {
            McpReply::Accepted => Ok(()),
            other => Err(unexpected_reply(&other)),
        }
    }

    async fn query_quantity(&self, op: McpOp) -> Result<f64> {
        match self.send(op).await? {
            McpReply::Quantity(value) => Ok(value),
            other => Err(unexpected_reply(&other)),
        }
    }

    async fn query_count(&self, op: McpOp) -> Result<u32> {
        match self.send(op).await? {
            McpReply::Count(value) => Ok(value),
            other => Err(unexpected_reply(&other)),
        }
    }

    async fn query_text(&self, op: McpOp) -> Result<String> {
        match self.send(op).await? {
            McpReply::Text(text) => Ok(text),
            other => Err(unexpected_reply(&other)),
        }
    }
}

fn unexpected_reply(reply: &McpReply) -> Error {
    ParseError::unexpected(format!("{reply:?}")).into()
}

/// Checks `0 < value ≤ max`, and that `value` does not encode to zero at
/// `fractional_digits` decimals.
fn ensure_positive(
    name: &'static str,
    value: f64,
    max: f64,
    fractional_digits: u32,
) -> Result<()> {
    if value > 0.0 && value <= max && to_fixed_point(value, fractional_digits) > 0 {
        Ok(())
    } else {
        Err(Error::ValueOutOfRange {
            name,
            value,
            min: 10f64.powi(-(fractional_digits as i32)),
            max,
        })
    }
}

/// Checks `0 ≤ value ≤ max`.
fn ensure_within(name: &'static str, value: f64, max: f64) -> Result<()> {
    if (0.0..=max).contains(&value) {
        Ok(())
    } else {
        Err(Error::ValueOutOfRange {
            name,
            value,
            min: 0.0,
            max,
        })
    }
}
