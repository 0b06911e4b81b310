//! Valve geometry and rotation direction selection.

use std::fmt;

use crate::error::ParseError;

/// Valve fitted to an MVP positioner, as reported by its type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValveType {
    /// 8 ports, 45° apart.
    EightPorts,
    /// 6 ports, 60° apart.
    SixPorts,
    /// 3 ports, 90° apart.
    ThreePorts,
    /// 2 × 3 ports, 2 positions 90° apart.
    TwoByThreePorts,
    /// 4 ports, 90° apart.
    FourPorts,
}

impl ValveType {
    /// Decodes the type code returned by the valve type query.
    pub fn from_code(code: u8) -> Result<Self, ParseError> {
        match code {
            2 => Ok(Self::EightPorts),
            3 => Ok(Self::SixPorts),
            4 => Ok(Self::ThreePorts),
            5 => Ok(Self::TwoByThreePorts),
            6 => Ok(Self::FourPorts),
            _ => Err(ParseError::unexpected(code.to_string())),
        }
    }

    /// Type code on the wire.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::EightPorts => 2,
            Self::SixPorts => 3,
            Self::ThreePorts => 4,
            Self::TwoByThreePorts => 5,
            Self::FourPorts => 6,
        }
    }

    /// Number of selectable positions.
    #[must_use]
    pub const fn positions(self) -> u8 {
        match self {
            Self::EightPorts => 8,
            Self::SixPorts => 6,
            Self::ThreePorts => 3,
            Self::TwoByThreePorts => 2,
            Self::FourPorts => 4,
        }
    }

    /// Angle between two adjacent positions, degrees.
    #[must_use]
    pub const fn step_angle(self) -> u32 {
        match self {
            Self::EightPorts => 45,
            Self::SixPorts => 60,
            Self::ThreePorts | Self::TwoByThreePorts | Self::FourPorts => 90,
        }
    }
}

impl fmt::Display for ValveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EightPorts => "8 ports",
            Self::SixPorts => "6 ports",
            Self::ThreePorts => "3 ports",
            Self::TwoByThreePorts => "2x3 ports",
            Self::FourPorts => "4 ports",
        };
        f.write_str(name)
    }
}

/// How [`MvpValve::move_to`](crate::hamilton::MvpValve::move_to) picks a direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RotationPolicy {
    /// Shortest way round; clockwise on a tie.
    #[default]
    LeastAngle,
    /// Always clockwise.
    Clockwise,
    /// Always counter-clockwise.
    CounterClockwise,
}

/// Clockwise and counter-clockwise angles from `start` to `dest`, degrees.
///
/// Positions are 0-based.
#[must_use]
pub fn rotation_angles(valve: ValveType, start: u8, dest: u8) -> (u32, u32) {
    let step = i64::from(valve.step_angle());
    let delta = i64::from(dest) - i64::from(start);
    let cw = (delta * step).rem_euclid(360);
    let ccw = (360 - cw) % 360;
    // Both are in 0..360
    (cw as u32, ccw as u32)
}

/// Returns true if counter-clockwise is strictly shorter.
#[must_use]
pub fn should_rotate_ccw(valve: ValveType, start: u8, dest: u8) -> bool {
    let (cw, ccw) = rotation_angles(valve, start, dest);
    ccw < cw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_three_port_tie_rotates_clockwise() {
        assert_eq!(rotation_angles(ValveType::ThreePorts, 0, 2), (180, 180));
        assert!(!should_rotate_ccw(ValveType::ThreePorts, 0, 2));
    }

    #[test]
    fn test_rotation_angles() {
        assert_eq!(rotation_angles(ValveType::EightPorts, 0, 1), (45, 315));
        assert_eq!(rotation_angles(ValveType::EightPorts, 1, 0), (315, 45));
        assert_eq!(rotation_angles(ValveType::SixPorts, 5, 0), (60, 300));
        assert_eq!(rotation_angles(ValveType::FourPorts, 2, 2), (0, 0));
    }

    #[test]
    fn test_least_path() {
        assert!(should_rotate_ccw(ValveType::EightPorts, 0, 7));
        assert!(!should_rotate_ccw(ValveType::EightPorts, 0, 3));
        assert!(!should_rotate_ccw(ValveType::EightPorts, 0, 4));
        assert!(!should_rotate_ccw(ValveType::FourPorts, 1, 1));
    }

    #[test]
    fn test_type_codes() {
        for code in 2..=6 {
            assert_eq!(ValveType::from_code(code).unwrap().code(), code);
        }
        assert!(ValveType::from_code(1).is_err());
        assert!(ValveType::from_code(7).is_err());
        assert_eq!(ValveType::TwoByThreePorts.positions(), 2);
        assert_eq!(ValveType::SixPorts.step_angle(), 60);
    }
}
