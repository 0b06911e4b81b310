//! Command set of Ismatec MCP peristaltic pumps.
//!
//! Every command is `<address digit><opcode><arguments>\r`. Set commands
//! answer with one bare byte (`*` accepted, `-` rejected, `#` syntax
//! error); queries answer with one `\r\n`-terminated, possibly padded line.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, ParseError, Result};
use crate::protocol::parser::{
    format_fixed, parse_digits, parse_quantity, parse_text, to_fixed_point,
};
use crate::protocol::{Command, ResponseUnit, Step, UnitKind};

/// Lowest pump address on a chain.
pub const MIN_ADDRESS: u8 = 1;

/// Highest pump address on a chain.
pub const MAX_ADDRESS: u8 = 8;

const ACCEPTED: u8 = b'*';
const REJECTED: u8 = b'-';
const SYNTAX_ERROR: u8 = b'#';
const RUNNING: u8 = b'+';

/// Unit suffix of flow rate replies.
pub const FLOW_RATE_UNIT: &str = "ml/min";
/// Unit suffix of tubing diameter replies.
pub const DIAMETER_UNIT: &str = "mm";
/// Unit suffix of speed replies.
pub const SPEED_UNIT: &str = "rpm";
/// Unit suffix of time replies.
pub const TIME_UNIT: &str = "s";

/// Pump operating mode.
///
/// The pump cannot report its mode, so the host keeps track of it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Continuous pumping at a set speed.
    #[default]
    PumpRpm,
    /// Continuous pumping at a set flow rate.
    PumpFlowRate,
    /// Dispense for a set time.
    DispenseTime,
    /// Dispense a set volume.
    DispenseVolume,
    /// Dispense for a set time, pause, repeat.
    DispenseTimePlusPause,
    /// Dispense a set volume, pause, repeat.
    DispenseVolumePlusPause,
    /// Dispense a set volume within a set time.
    DispenseVolumeInTime,
}

impl Mode {
    /// All modes, in protocol order.
    pub const ALL: [Self; 7] = [
        Self::PumpRpm,
        Self::PumpFlowRate,
        Self::DispenseTime,
        Self::DispenseVolume,
        Self::DispenseTimePlusPause,
        Self::DispenseVolumePlusPause,
        Self::DispenseVolumeInTime,
    ];

    /// Opcode selecting this mode.
    #[must_use]
    pub const fn opcode(self) -> char {
        match self {
            Self::PumpRpm => 'L',
            Self::PumpFlowRate => 'M',
            Self::DispenseTime => 'N',
            Self::DispenseVolume => 'O',
            Self::DispenseTimePlusPause => 'Q',
            Self::DispenseVolumePlusPause => 'P',
            Self::DispenseVolumeInTime => 'G',
        }
    }

    /// Human-readable name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PumpRpm => "Pump (rpm)",
            Self::PumpFlowRate => "Pump (flow rate)",
            Self::DispenseTime => "Dispense (time)",
            Self::DispenseVolume => "Dispense (volume)",
            Self::DispenseTimePlusPause => "Dispense (time) + pause",
            Self::DispenseVolumePlusPause => "Dispense (volume) + pause",
            Self::DispenseVolumeInTime => "Dispense (volume in time)",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = ParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| ParseError::unexpected(s))
    }
}

/// Rotation direction of the pump head.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Clockwise.
    #[default]
    Clockwise,
    /// Counter-clockwise.
    CounterClockwise,
}

/// Outcome of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The pump started.
    Accepted,
    /// The pump refused to start because the current mode's settings are
    /// out of range (volume-in-time mode).
    RejectedIncompatibleMode,
}

/// One MCP operation and its arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum McpOp {
    /// Clear an overload condition.
    ResetOverload,
    /// Start pumping.
    Start,
    /// Stop pumping.
    Stop,
    /// Set the rotation direction.
    SetDirection(Direction),
    /// Enable or disable the front-panel controls.
    SetManualControl(bool),
    /// Select the operating mode.
    SetMode(Mode),
    /// Is the pump running?
    PumpActive,
    /// Pump type, firmware version and head id in one line.
    PumpInfo,
    /// Firmware version.
    FirmwareVersion,
    /// Pump head identification number.
    HeadId,
    /// Digits after the decimal point used for flow rate and volume.
    FractionalDigits,
    /// Tubing inner diameter in mm.
    TubingDiameter,
    /// Set the tubing inner diameter in mm.
    SetTubingDiameter(f64),
    /// Speed in rpm.
    Speed,
    /// Set the speed in rpm.
    SetSpeed(f64),
    /// Uncalibrated flow rate at 240 rpm.
    DefaultFlowRate,
    /// Calibrated flow rate at 240 rpm.
    CalibratedFlowRate,
    /// Set the calibrated flow rate at 240 rpm.
    SetCalibratedFlowRate {
        ml_per_min: f64,
        fractional_digits: u32,
    },
    /// Dispensing time in seconds.
    DispensingTime,
    /// Set the dispensing time in seconds.
    SetDispensingTime(f64),
    /// Dispensing amount in roller steps.
    DispensingRollerSteps,
    /// Set the dispensing amount in roller steps.
    SetDispensingRollerSteps(u32),
    /// Set the dispensing volume in ml.
    SetDispensingVolume { ml: f64, fractional_digits: u32 },
    /// Roller steps run backwards after dispensing.
    RollerBackSteps,
    /// Set the roller back steps.
    SetRollerBackSteps(u32),
    /// Pause time between dispensing cycles in seconds.
    PauseTime,
    /// Set the pause time in seconds.
    SetPauseTime(f64),
    /// Number of dispensing cycles.
    NumberOfCycles,
    /// Set the number of dispensing cycles.
    SetNumberOfCycles(u32),
}

/// Decoded reply of an MCP command.
#[derive(Debug, Clone, PartialEq)]
pub enum McpReply {
    /// The set command was accepted.
    Accepted,
    /// Reply to [`McpOp::Start`].
    Start(StartOutcome),
    /// Reply to [`McpOp::PumpActive`].
    Active(bool),
    /// A text field.
    Text(String),
    /// An integer field.
    Count(u32),
    /// A decimal field with its unit checked.
    Quantity(f64),
}

/// A command addressed to one pump.
#[derive(Debug, Clone, PartialEq)]
pub struct McpCommand {
    address: u8,
    op: McpOp,
}

impl McpCommand {
    /// Creates a command for the pump at `address` (1..=8).
    #[must_use]
    pub const fn new(address: u8, op: McpOp) -> Self {
        Self { address, op }
    }

    /// Target address.
    #[must_use]
    pub const fn address(&self) -> u8 {
        self.address
    }

    /// The operation.
    #[must_use]
    pub const fn op(&self) -> &McpOp {
        &self.op
    }

    fn body(&self) -> String {
        match &self.op {
            McpOp::ResetOverload => "-".into(),
            McpOp::Start => "H".into(),
            McpOp::Stop => "I".into(),
            McpOp::SetDirection(Direction::Clockwise) => "J".into(),
            McpOp::SetDirection(Direction::CounterClockwise) => "K".into(),
            McpOp::SetManualControl(true) => "A".into(),
            McpOp::SetManualControl(false) => "B".into(),
            McpOp::SetMode(mode) => mode.opcode().to_string(),
            McpOp::PumpActive => "E".into(),
            McpOp::PumpInfo => "#".into(),
            McpOp::FirmwareVersion => "(".into(),
            McpOp::HeadId => ")".into(),
            McpOp::FractionalDigits => "[".into(),
            McpOp::TubingDiameter => "+".into(),
            McpOp::SetTubingDiameter(mm) => {
                format!("+{}", format_fixed(to_fixed_point(*mm, 2), 4))
            }
            McpOp::Speed => "S".into(),
            McpOp::SetSpeed(rpm) => {
                // Tenths of rpm; four digits cover up to 999.9, above that five
                let tenths = to_fixed_point(*rpm, 1);
                let width = if tenths > 9999 { 5 } else { 4 };
                format!("S{}", format_fixed(tenths, width))
            }
            McpOp::DefaultFlowRate => "?".into(),
            McpOp::CalibratedFlowRate => "!".into(),
            McpOp::SetCalibratedFlowRate {
                ml_per_min,
                fractional_digits,
            } => format!(
                "!{}",
                format_fixed(to_fixed_point(*ml_per_min, *fractional_digits), 4)
            ),
            McpOp::DispensingTime => "V".into(),
            McpOp::SetDispensingTime(seconds) => encode_time('V', *seconds),
            McpOp::DispensingRollerSteps => "U".into(),
            McpOp::SetDispensingRollerSteps(steps) => {
                format!("U{}", format_fixed(u64::from(*steps), 5))
            }
            McpOp::SetDispensingVolume {
                ml,
                fractional_digits,
            } => format!(
                "W{}",
                format_fixed(to_fixed_point(*ml, *fractional_digits), 5)
            ),
            McpOp::RollerBackSteps => "%".into(),
            McpOp::SetRollerBackSteps(steps) => format!("%{}", format_fixed(u64::from(*steps), 4)),
            McpOp::PauseTime => "T".into(),
            McpOp::SetPauseTime(seconds) => encode_time('T', *seconds),
            McpOp::NumberOfCycles => "\"".into(),
            McpOp::SetNumberOfCycles(cycles) => {
                format!("\"{}", format_fixed(u64::from(*cycles), 4))
            }
        }
    }

    /// Reply shape of the operation.
    #[must_use]
    pub fn reply_kind(&self) -> UnitKind {
        match self.op {
            McpOp::PumpInfo
            | McpOp::FirmwareVersion
            | McpOp::HeadId
            | McpOp::FractionalDigits
            | McpOp::TubingDiameter
            | McpOp::Speed
            | McpOp::DefaultFlowRate
            | McpOp::CalibratedFlowRate
            | McpOp::DispensingTime
            | McpOp::DispensingRollerSteps
            | McpOp::RollerBackSteps
            | McpOp::PauseTime
            | McpOp::NumberOfCycles => UnitKind::Line,
            _ => UnitKind::Byte,
        }
    }

    fn decode_byte(&self, byte: u8) -> Result<McpReply> {
        match (&self.op, byte) {
            (_, SYNTAX_ERROR) => Err(Error::InvalidCommand),
            (McpOp::Start, ACCEPTED) => Ok(McpReply::Start(StartOutcome::Accepted)),
            (McpOp::Start, REJECTED) => Ok(McpReply::Start(StartOutcome::RejectedIncompatibleMode)),
            (McpOp::PumpActive, RUNNING) => Ok(McpReply::Active(true)),
            (McpOp::PumpActive, REJECTED) => Ok(McpReply::Active(false)),
            (McpOp::PumpActive, _) => Err(unexpected_byte(byte)),
            (_, ACCEPTED) => Ok(McpReply::Accepted),
            (_, REJECTED) => Err(Error::Nak),
            _ => Err(unexpected_byte(byte)),
        }
    }

    fn decode_line(&self, line: &str) -> Result<McpReply> {
        let reply = match self.op {
            McpOp::PumpInfo => McpReply::Text(parse_text(line)?),
            McpOp::FirmwareVersion | McpOp::HeadId => {
                parse_digits(line, 4)?;
                McpReply::Text(line.to_owned())
            }
            McpOp::FractionalDigits => McpReply::Count(count(line, 1)?),
            McpOp::TubingDiameter => {
                McpReply::Quantity(parse_quantity(line, DIAMETER_UNIT, 2, 2)?)
            }
            McpOp::Speed => McpReply::Quantity(parse_quantity(line, SPEED_UNIT, 4, 1)?),
            McpOp::DefaultFlowRate | McpOp::CalibratedFlowRate => {
                McpReply::Quantity(parse_quantity(line, FLOW_RATE_UNIT, 4, 4)?)
            }
            McpOp::DispensingTime | McpOp::PauseTime => {
                McpReply::Quantity(parse_quantity(line, TIME_UNIT, 7, 1)?)
            }
            McpOp::DispensingRollerSteps => McpReply::Count(count(line, 5)?),
            McpOp::RollerBackSteps | McpOp::NumberOfCycles => McpReply::Count(count(line, 4)?),
            _ => return Err(ParseError::unexpected(line).into()),
        };
        Ok(reply)
    }
}

impl Command for McpCommand {
    type Reply = McpReply;

    fn encode(&self) -> String {
        format!("{}{}", char::from(b'0' + self.address), self.body())
    }

    fn advance(&self, units: &[ResponseUnit]) -> Result<Step<McpReply>> {
        match (units, self.reply_kind()) {
            ([], kind) => Ok(Step::Read(kind)),
            ([ResponseUnit::Byte(byte)], UnitKind::Byte) => self.decode_byte(*byte).map(Step::Done),
            ([ResponseUnit::Line(line)], UnitKind::Line) => self.decode_line(line).map(Step::Done),
            ([unit, ..], _) => Err(ParseError::unexpected(unit.to_lossy_string()).into()),
        }
    }
}

/// Encodes a time setting: tenths of a second when that fits four digits,
/// otherwise whole minutes (`M`) or whole hours (`H`) in three digits.
fn encode_time(opcode: char, seconds: f64) -> String {
    let tenths = to_fixed_point(seconds, 1);
    if tenths <= 9999 {
        return format!("{opcode}{}", format_fixed(tenths, 4));
    }
    let minutes = to_fixed_point(seconds / 60.0, 0);
    if minutes <= 999 {
        return format!("{opcode}M{}", format_fixed(minutes, 3));
    }
    let hours = to_fixed_point(seconds / 3600.0, 0);
    format!("{opcode}H{}", format_fixed(hours, 3))
}

fn count(line: &str, max_digits: usize) -> std::result::Result<u32, ParseError> {
    let value = parse_digits(line, max_digits)?;
    u32::try_from(value).map_err(|_| ParseError::unexpected(line))
}

fn unexpected_byte(byte: u8) -> Error {
    ParseError::unexpected(char::from(byte).to_string()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(op: McpOp) -> String {
        McpCommand::new(1, op).encode()
    }

    fn decode(op: McpOp, unit: ResponseUnit) -> Result<McpReply> {
        match McpCommand::new(1, op).advance(&[unit])? {
            Step::Done(reply) => Ok(reply),
            Step::Read(kind) => panic!("unexpected request for {kind:?}"),
        }
    }

    #[test]
    fn test_simple_opcodes() {
        assert_eq!(encode(McpOp::Start), "1H");
        assert_eq!(encode(McpOp::Stop), "1I");
        assert_eq!(encode(McpOp::SetDirection(Direction::CounterClockwise)), "1K");
        assert_eq!(encode(McpOp::SetManualControl(false)), "1B");
        assert_eq!(encode(McpOp::SetMode(Mode::DispenseVolumeInTime)), "1G");
        assert_eq!(McpCommand::new(8, McpOp::PumpActive).encode(), "8E");
    }

    #[test]
    fn test_fixed_width_arguments() {
        assert_eq!(encode(McpOp::SetTubingDiameter(1.52)), "1+0152");
        assert_eq!(encode(McpOp::SetTubingDiameter(0.07)), "1+0007");
        assert_eq!(encode(McpOp::SetDispensingRollerSteps(7)), "1U00007");
        assert_eq!(encode(McpOp::SetRollerBackSteps(12)), "1%0012");
        assert_eq!(encode(McpOp::SetNumberOfCycles(3)), "1\"0003");
        assert_eq!(
            encode(McpOp::SetCalibratedFlowRate {
                ml_per_min: 12.5,
                fractional_digits: 2,
            }),
            "1!1250"
        );
        assert_eq!(
            encode(McpOp::SetDispensingVolume {
                ml: 1.5,
                fractional_digits: 3,
            }),
            "1W01500"
        );
    }

    #[test]
    fn test_speed_widens_to_five_digits() {
        assert_eq!(encode(McpOp::SetSpeed(240.0)), "1S2400");
        assert_eq!(encode(McpOp::SetSpeed(999.9)), "1S9999");
        assert_eq!(encode(McpOp::SetSpeed(1000.0)), "1S10000");
        assert_eq!(encode(McpOp::SetSpeed(9999.9)), "1S99999");
    }

    #[test]
    fn test_time_encoding_escalates_units() {
        assert_eq!(encode(McpOp::SetDispensingTime(12.5)), "1V0125");
        assert_eq!(encode(McpOp::SetDispensingTime(999.9)), "1V9999");
        assert_eq!(encode(McpOp::SetDispensingTime(1200.0)), "1VM020");
        assert_eq!(encode(McpOp::SetPauseTime(999.0 * 60.0)), "1TM999");
        assert_eq!(encode(McpOp::SetPauseTime(48.0 * 3600.0)), "1TH048");
    }

    #[test]
    fn test_set_command_replies() {
        assert_eq!(
            decode(McpOp::Stop, ResponseUnit::Byte(b'*')).unwrap(),
            McpReply::Accepted
        );
        assert!(matches!(
            decode(McpOp::Stop, ResponseUnit::Byte(b'-')),
            Err(Error::Nak)
        ));
        assert!(matches!(
            decode(McpOp::Stop, ResponseUnit::Byte(b'#')),
            Err(Error::InvalidCommand)
        ));
        assert!(matches!(
            decode(McpOp::Stop, ResponseUnit::Byte(b'A')),
            Err(Error::Parse(ParseError::UnexpectedResponse { .. }))
        ));
    }

    #[test]
    fn test_start_rejection_is_an_outcome() {
        assert_eq!(
            decode(McpOp::Start, ResponseUnit::Byte(b'*')).unwrap(),
            McpReply::Start(StartOutcome::Accepted)
        );
        assert_eq!(
            decode(McpOp::Start, ResponseUnit::Byte(b'-')).unwrap(),
            McpReply::Start(StartOutcome::RejectedIncompatibleMode)
        );
    }

    #[test]
    fn test_pump_active_reply() {
        assert_eq!(
            decode(McpOp::PumpActive, ResponseUnit::Byte(b'+')).unwrap(),
            McpReply::Active(true)
        );
        assert_eq!(
            decode(McpOp::PumpActive, ResponseUnit::Byte(b'-')).unwrap(),
            McpReply::Active(false)
        );
        assert!(decode(McpOp::PumpActive, ResponseUnit::Byte(b'*')).is_err());
    }

    #[test]
    fn test_quantity_replies() {
        assert_eq!(
            decode(McpOp::CalibratedFlowRate, ResponseUnit::Line("12.50 ml/min".into())).unwrap(),
            McpReply::Quantity(12.5)
        );
        assert_eq!(
            decode(McpOp::TubingDiameter, ResponseUnit::Line("1.52 mm".into())).unwrap(),
            McpReply::Quantity(1.52)
        );
        assert_eq!(
            decode(McpOp::Speed, ResponseUnit::Line("240.0 rpm".into())).unwrap(),
            McpReply::Quantity(240.0)
        );
        assert!(matches!(
            decode(McpOp::DefaultFlowRate, ResponseUnit::Line("12.5 ul/min".into())),
            Err(Error::Parse(ParseError::UnexpectedUnit { .. }))
        ));
        assert!(matches!(
            decode(McpOp::PauseTime, ResponseUnit::Line("1x.5 s".into())),
            Err(Error::Parse(ParseError::UnexpectedResponse { .. }))
        ));
    }

    #[test]
    fn test_count_replies() {
        assert_eq!(
            decode(McpOp::FractionalDigits, ResponseUnit::Line("2".into())).unwrap(),
            McpReply::Count(2)
        );
        assert_eq!(
            decode(McpOp::DispensingRollerSteps, ResponseUnit::Line("65535".into())).unwrap(),
            McpReply::Count(65_535)
        );
        assert!(decode(McpOp::NumberOfCycles, ResponseUnit::Line("12345".into())).is_err());
    }

    #[test]
    fn test_wrong_unit_kind_is_unexpected() {
        assert!(decode(McpOp::Speed, ResponseUnit::Byte(b'*')).is_err());
        assert!(decode(McpOp::Stop, ResponseUnit::Line("*".into())).is_err());
    }

    #[test]
    fn test_reply_kinds() {
        assert_eq!(McpCommand::new(1, McpOp::Start).reply_kind(), UnitKind::Byte);
        assert_eq!(
            McpCommand::new(1, McpOp::SetSpeed(10.0)).reply_kind(),
            UnitKind::Byte
        );
        assert_eq!(McpCommand::new(1, McpOp::Speed).reply_kind(), UnitKind::Line);
    }

    #[test]
    fn test_mode_names_round_trip() {
        for mode in Mode::ALL {
            assert_eq!(mode.to_string().parse::<Mode>(), Ok(mode));
        }
        assert!("Pump".parse::<Mode>().is_err());
    }
}
