//! Opcode table for the request/response protocol.
//!
//! Every logical operation maps to a single-byte code sent in the command
//! packet. A handful of read operations are multiplexed under
//! [`Opcode::SecondTierCommand`], with the sub-opcode carried in the packet's
//! `value` field.
//!
//! Board quirks live here as data, not logic scattered through drivers:
//! [`ARM_INVERTED_RETVAL`] enumerates exactly which opcodes suffer the
//! ARM firmware's inverted success flag, and [`Opcode::settle_delay`] holds
//! the per-opcode pre-call delay.

use std::time::Duration;

use crate::transport::BoardFamily;

/// Logical device operations and their wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Start an integration (software trigger).
    AcquireSpectrum,
    SetIntegrationTime,
    GetIntegrationTime,
    /// 0 = internal/software, 1 = external hardware pulse.
    SetTriggerSource,
    /// Also repurposed as the hardware-trigger pulse generator and fan GPIO
    /// by the multi-device coordinator.
    SetLaserEnable,
    GetLaserEnable,
    SetTecEnable,
    /// Raw DAC counts derived from the page-1 degC-to-DAC coefficients.
    SetTecSetpoint,
    /// 2-byte big-endian raw thermistor ADC reading.
    GetDetectorTemperature,
    /// Second-tier: index selects the 64-byte page.
    ReadEeprom,
    WriteEeprom,
    GetFirmwareVersion,
    GetFpgaVersion,
    /// Extended-command multiplexer; sub-opcode rides in `value`.
    SecondTierCommand,
}

impl Opcode {
    /// Wire code for this operation.
    pub const fn code(self) -> u8 {
        match self {
            Opcode::AcquireSpectrum => 0xAD,
            Opcode::SetIntegrationTime => 0xB2,
            Opcode::GetIntegrationTime => 0xBF,
            Opcode::SetTriggerSource => 0xD2,
            Opcode::SetLaserEnable => 0xBE,
            Opcode::GetLaserEnable => 0xE2,
            Opcode::SetTecEnable => 0xD6,
            Opcode::SetTecSetpoint => 0xD8,
            Opcode::GetDetectorTemperature => 0xD7,
            Opcode::ReadEeprom => 0x01,
            Opcode::WriteEeprom => 0x02,
            Opcode::GetFirmwareVersion => 0xC0,
            Opcode::GetFpgaVersion => 0xB4,
            Opcode::SecondTierCommand => 0xFF,
        }
    }

    /// Pre-call settle delay. TEC setpoint writes and EEPROM page commits
    /// need the device to finish its previous internal write first.
    pub const fn settle_delay(self) -> Duration {
        match self {
            Opcode::SetTecSetpoint | Opcode::WriteEeprom => Duration::from_millis(10),
            _ => Duration::ZERO,
        }
    }

    /// Opcodes that must be issued through the second-tier multiplexer.
    pub const fn is_second_tier(self) -> bool {
        matches!(self, Opcode::ReadEeprom)
    }
}

/// Opcodes whose success flag is inverted on ARM-family boards.
///
/// A legacy firmware defect: for exactly these operations, the raw transport
/// ack must be read with the opposite polarity. This set is exhaustive and
/// deliberately maintained as data so nothing ever infers membership.
pub const ARM_INVERTED_RETVAL: &[Opcode] = &[
    Opcode::SetIntegrationTime,
    Opcode::SetLaserEnable,
    Opcode::SetTecEnable,
    Opcode::SetTecSetpoint,
    Opcode::SetTriggerSource,
    Opcode::WriteEeprom,
];

/// Whether the raw ack for `opcode` must be inverted on `family` boards.
pub fn retval_inverted(family: BoardFamily, opcode: Opcode) -> bool {
    family == BoardFamily::Arm && ARM_INVERTED_RETVAL.contains(&opcode)
}
