//! Typed error enums for the driver layers.
//!
//! Each layer has its own error type so callers can tell a bus failure from a
//! device rejection from a corrupt calibration record:
//!
//! - [`TransportError`]: timeout or bus fault reported by a transport adapter.
//! - [`ProtocolError`]: command rejected, short response, or a wrapped
//!   transport failure, tagged with the opcode that failed.
//! - [`EepromError`]: calibration record read/write failures.
//! - [`DeviceError`]: device-core level failures, including the sticky
//!   communication-error latch.
//!
//! Expected hardware conditions never panic and never cross the device-core
//! boundary as anything other than an `Err` value; capability traits expose
//! them as `anyhow::Error` at the seam.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::opcodes::Opcode;

/// Failure reported by a transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport timeout after {0:?}")]
    Timeout(Duration),

    #[error("bus error: {0}")]
    Bus(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Timeouts latch the sticky communication-error flag on
    /// session-oriented transports; other faults do not.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// Failure at the opcode request/response layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("transport failure on {opcode:?}: {source}")]
    Transport {
        opcode: Opcode,
        #[source]
        source: TransportError,
    },

    /// The device reported failure for a command, after applying any
    /// board-specific return-value inversion.
    #[error("{opcode:?} rejected by device")]
    CommandRejected { opcode: Opcode },

    #[error("short response for {opcode:?}: got {got} bytes, expected {expected}")]
    ShortResponse {
        opcode: Opcode,
        got: usize,
        expected: usize,
    },
}

impl ProtocolError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ProtocolError::Transport { source, .. } if source.is_timeout()
        )
    }
}

/// Calibration record read/write failures.
#[derive(Debug, Error)]
pub enum EepromError {
    #[error("EEPROM page {page} fetch failed: {source}")]
    PageFetch {
        page: usize,
        #[source]
        source: ProtocolError,
    },

    #[error("EEPROM page {page} commit failed: {source}")]
    PageCommit {
        page: usize,
        #[source]
        source: ProtocolError,
    },

    /// `write()` fails fast when no prior `read()` populated the page cache;
    /// a blind write could destroy fields this revision does not know about.
    #[error("EEPROM write attempted before a successful read")]
    NotRead,

    #[error("EEPROM not writable over this transport")]
    NotWritable,
}

/// Device-core level failures.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Sticky flag set after a timeout on a session-oriented transport.
    /// All operations short-circuit until the caller clears it.
    #[error("communication error latched; clear it before further use")]
    CommunicationLatched,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Eeprom(#[from] EepromError),

    #[error("acquisition returned no data")]
    NoData,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_classification() {
        let err = TransportError::Timeout(Duration::from_millis(100));
        assert!(err.is_timeout());
        assert!(!TransportError::Closed.is_timeout());

        let proto = ProtocolError::Transport {
            opcode: Opcode::AcquireSpectrum,
            source: TransportError::Timeout(Duration::from_millis(100)),
        };
        assert!(proto.is_timeout());
        assert!(!ProtocolError::CommandRejected {
            opcode: Opcode::SetLaserEnable
        }
        .is_timeout());
    }

    #[test]
    fn error_display_names_the_opcode() {
        let err = ProtocolError::ShortResponse {
            opcode: Opcode::GetIntegrationTime,
            got: 2,
            expected: 6,
        };
        assert!(err.to_string().contains("GetIntegrationTime"));
    }
}
