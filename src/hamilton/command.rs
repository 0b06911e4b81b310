//! Command set of Hamilton MVP valve positioners.
//!
//! Commands are `<letter address><command>\r`. The valve first echoes the
//! command line, then answers with a bare ACK/NAK byte (actions) or a line
//! starting with ACK followed by the payload (queries). The auto-address
//! command `1a` is the exception: it is not echoed.

use crate::error::{Error, ParseError, Result};
use crate::hamilton::rotation::ValveType;
use crate::protocol::parser::{parse_digits, parse_text};
use crate::protocol::{ACK, Command, NAK, ResponseUnit, Step, UnitKind};

/// Lowest valve address on a chain.
pub const MIN_ADDRESS: char = 'a';

/// Highest valve address on a chain.
pub const MAX_ADDRESS: char = 'z';

const AUTO_ADDRESS: &str = "1a";

/// Movement state reported by the movement-finished query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementStatus {
    /// The valve is at rest (`Y`).
    Done,
    /// The valve is moving (`N`).
    Moving,
    /// The valve is busy with another instruction (`*`).
    Busy,
}

/// One MVP operation and its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MvpOp {
    /// Assign addresses down the chain, starting at `a`.
    AutoAddress,
    /// Home the valve and find its type.
    InitializeValve,
    /// Rotate to a 0-based position.
    Move { position: u8, counter_clockwise: bool },
    /// Current 0-based position.
    ValvePosition,
    /// Fitted valve type.
    ValveType,
    /// Has the last movement finished?
    MovementFinished,
    /// Firmware version string.
    FirmwareVersion,
}

/// Decoded reply of an MVP command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MvpReply {
    /// The action was acknowledged.
    Accepted,
    /// Reply to [`MvpOp::AutoAddress`].
    ///
    /// `max_address` is the last address assigned, or `None` when the chain
    /// did not renumber (for example because it was already addressed).
    AutoAddress { max_address: Option<char> },
    /// 0-based valve position.
    Position(u8),
    /// Fitted valve type.
    ValveType(ValveType),
    /// Movement state.
    Movement(MovementStatus),
    /// Free text.
    Text(String),
}

/// A command addressed to one valve (or to the chain, for auto-address).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MvpCommand {
    address: char,
    op: MvpOp,
}

impl MvpCommand {
    /// Creates a command for the valve at `address` (`'a'..='z'`).
    #[must_use]
    pub const fn new(address: char, op: MvpOp) -> Self {
        Self { address, op }
    }

    /// The chain-wide auto-address command.
    #[must_use]
    pub const fn auto_address() -> Self {
        Self::new(MIN_ADDRESS, MvpOp::AutoAddress)
    }

    /// Target address.
    #[must_use]
    pub const fn address(&self) -> char {
        self.address
    }

    /// The operation.
    #[must_use]
    pub const fn op(&self) -> MvpOp {
        self.op
    }

    const fn is_query(&self) -> bool {
        matches!(
            self.op,
            MvpOp::ValvePosition
                | MvpOp::ValveType
                | MvpOp::MovementFinished
                | MvpOp::FirmwareVersion
        )
    }

    fn advance_auto_address(units: &[ResponseUnit]) -> Result<Step<MvpReply>> {
        let assigned = match units.first() {
            None => return Ok(Step::Read(UnitKind::Line)),
            Some(ResponseUnit::Line(line)) => next_free_address(line)?,
            Some(unit) => return Err(ParseError::unexpected(unit.to_lossy_string()).into()),
        };
        if assigned == MIN_ADDRESS {
            return Ok(Step::Done(MvpReply::AutoAddress { max_address: None }));
        }
        match units.get(1) {
            None => Ok(Step::Read(UnitKind::Byte)),
            Some(ResponseUnit::Byte(ACK)) => Ok(Step::Done(MvpReply::AutoAddress {
                max_address: char::from_u32(u32::from(assigned) - 1),
            })),
            Some(ResponseUnit::Byte(NAK)) => Err(Error::Nak),
            Some(unit) => Err(ParseError::unexpected(unit.to_lossy_string()).into()),
        }
    }

    fn decode_payload(&self, payload: &str) -> Result<MvpReply> {
        let reply = match self.op {
            MvpOp::ValvePosition => {
                let position = parse_digits(payload, 2)?;
                if position == 0 {
                    return Err(ParseError::unexpected(payload).into());
                }
                // 1-based on the wire, at most two digits
                MvpReply::Position((position - 1) as u8)
            }
            MvpOp::ValveType => {
                let code = parse_digits(payload, 1)?;
                MvpReply::ValveType(ValveType::from_code(code as u8)?)
            }
            MvpOp::MovementFinished => MvpReply::Movement(match payload {
                "Y" => MovementStatus::Done,
                "N" => MovementStatus::Moving,
                "*" => MovementStatus::Busy,
                _ => return Err(ParseError::unexpected(payload).into()),
            }),
            MvpOp::FirmwareVersion => MvpReply::Text(parse_text(payload)?),
            _ => return Err(ParseError::unexpected(payload).into()),
        };
        Ok(reply)
    }
}

impl Command for MvpCommand {
    type Reply = MvpReply;

    fn encode(&self) -> String {
        let body = match self.op {
            MvpOp::AutoAddress => return AUTO_ADDRESS.to_owned(),
            MvpOp::InitializeValve => "LXR".to_owned(),
            MvpOp::Move {
                position,
                counter_clockwise,
            } => format!(
                "LP{}{}R",
                u8::from(counter_clockwise),
                u32::from(position) + 1
            ),
            MvpOp::ValvePosition => "LQP".to_owned(),
            MvpOp::ValveType => "LQT".to_owned(),
            MvpOp::MovementFinished => "F".to_owned(),
            MvpOp::FirmwareVersion => "U".to_owned(),
        };
        format!("{}{body}", self.address)
    }

    fn advance(&self, units: &[ResponseUnit]) -> Result<Step<MvpReply>> {
        if self.op == MvpOp::AutoAddress {
            return Self::advance_auto_address(units);
        }
        match units {
            [] => Ok(Step::Read(UnitKind::Line)),
            [ResponseUnit::Line(echo)] => {
                let sent = self.encode();
                if *echo != sent {
                    return Err(ParseError::EchoMismatch {
                        sent,
                        received: echo.clone(),
                    }
                    .into());
                }
                Ok(Step::Read(if self.is_query() {
                    UnitKind::Line
                } else {
                    UnitKind::Byte
                }))
            }
            [_, ResponseUnit::Byte(ACK)] if !self.is_query() => Ok(Step::Done(MvpReply::Accepted)),
            [_, ResponseUnit::Byte(NAK)] if !self.is_query() => Err(Error::Nak),
            [_, ResponseUnit::Line(line)] if self.is_query() => {
                match line.as_bytes().first() {
                    Some(&ACK) => self.decode_payload(&line[1..]).map(Step::Done),
                    Some(&NAK) => Err(Error::Nak),
                    _ => Err(ParseError::unexpected(line.as_str()).into()),
                }
            }
            [.., unit] => Err(ParseError::unexpected(unit.to_lossy_string()).into()),
        }
    }
}

/// Parses the `1x` auto-address reply and returns `x`, the first address
/// not taken by a valve.
fn next_free_address(line: &str) -> std::result::Result<char, ParseError> {
    let mut chars = line.chars();
    match (chars.next(), chars.next(), chars.next()) {
        (Some('1'), Some(next), None) if next.is_ascii_lowercase() => Ok(next),
        // One past 'z' when every address is taken
        (Some('1'), Some('{'), None) => Ok('{'),
        _ => Err(ParseError::unexpected(line)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(command: MvpCommand, replies: &[ResponseUnit]) -> Result<Step<MvpReply>> {
        let mut units = Vec::new();
        let mut step = command.advance(&units)?;
        for unit in replies {
            units.push(unit.clone());
            step = command.advance(&units)?;
        }
        Ok(step)
    }

    fn line(s: &str) -> ResponseUnit {
        ResponseUnit::Line(s.to_owned())
    }

    #[test]
    fn test_encoding() {
        let cmd = |op| MvpCommand::new('a', op).encode();
        assert_eq!(cmd(MvpOp::InitializeValve), "aLXR");
        assert_eq!(
            cmd(MvpOp::Move {
                position: 0,
                counter_clockwise: false
            }),
            "aLP01R"
        );
        assert_eq!(
            cmd(MvpOp::Move {
                position: 11,
                counter_clockwise: true
            }),
            "aLP112R"
        );
        assert_eq!(cmd(MvpOp::ValvePosition), "aLQP");
        assert_eq!(cmd(MvpOp::ValveType), "aLQT");
        assert_eq!(cmd(MvpOp::MovementFinished), "aF");
        assert_eq!(MvpCommand::new('c', MvpOp::FirmwareVersion).encode(), "cU");
        assert_eq!(MvpCommand::auto_address().encode(), "1a");
    }

    #[test]
    fn test_action_replies() {
        let init = MvpCommand::new('a', MvpOp::InitializeValve);
        assert_eq!(
            run(init, &[line("aLXR"), ResponseUnit::Byte(ACK)]).unwrap(),
            Step::Done(MvpReply::Accepted)
        );
        assert!(matches!(
            run(init, &[line("aLXR"), ResponseUnit::Byte(NAK)]),
            Err(Error::Nak)
        ));
        assert!(matches!(
            run(init, &[line("aLXR"), ResponseUnit::Byte(b'A')]),
            Err(Error::Parse(ParseError::UnexpectedResponse { .. }))
        ));
    }

    #[test]
    fn test_echo_is_checked_before_second_unit() {
        let init = MvpCommand::new('a', MvpOp::InitializeValve);
        assert_eq!(run(init, &[]).unwrap(), Step::Read(UnitKind::Line));
        assert_eq!(
            run(init, &[line("aLXR")]).unwrap(),
            Step::Read(UnitKind::Byte)
        );
        assert!(matches!(
            run(init, &[line("bLXR")]),
            Err(Error::Parse(ParseError::EchoMismatch { .. }))
        ));
    }

    #[test]
    fn test_query_replies() {
        let query = |op, payload: &str| {
            let command = MvpCommand::new('a', op);
            let echo = command.encode();
            run(command, &[line(&echo), line(payload)])
        };
        assert_eq!(
            query(MvpOp::ValvePosition, "\u{6}3").unwrap(),
            Step::Done(MvpReply::Position(2))
        );
        assert_eq!(
            query(MvpOp::ValveType, "\u{6}4").unwrap(),
            Step::Done(MvpReply::ValveType(ValveType::ThreePorts))
        );
        assert_eq!(
            query(MvpOp::MovementFinished, "\u{6}N").unwrap(),
            Step::Done(MvpReply::Movement(MovementStatus::Moving))
        );
        assert_eq!(
            query(MvpOp::FirmwareVersion, "\u{6}MVP 1.0").unwrap(),
            Step::Done(MvpReply::Text("MVP 1.0".into()))
        );
        assert!(query(MvpOp::ValvePosition, "\u{6}0").is_err());
        assert!(query(MvpOp::ValveType, "\u{6}9").is_err());
        assert!(query(MvpOp::MovementFinished, "\u{6}?").is_err());
        assert!(query(MvpOp::ValvePosition, "3").is_err());
        assert!(matches!(query(MvpOp::ValveType, "\u{15}"), Err(Error::Nak)));
    }

    #[test]
    fn test_auto_address_without_renumbering() {
        let auto = MvpCommand::auto_address();
        assert_eq!(
            run(auto, &[line("1a")]).unwrap(),
            Step::Done(MvpReply::AutoAddress { max_address: None })
        );
    }

    #[test]
    fn test_auto_address_reads_ack_after_renumbering() {
        let auto = MvpCommand::auto_address();
        assert_eq!(
            run(auto, &[line("1b")]).unwrap(),
            Step::Read(UnitKind::Byte)
        );
        assert_eq!(
            run(auto, &[line("1d"), ResponseUnit::Byte(ACK)]).unwrap(),
            Step::Done(MvpReply::AutoAddress {
                max_address: Some('c')
            })
        );
        assert!(run(auto, &[line("1A")]).is_err());
        assert!(run(auto, &[line("1b"), ResponseUnit::Byte(b'x')]).is_err());
    }
}
