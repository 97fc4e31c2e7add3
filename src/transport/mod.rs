//! The transport seam.
//!
//! Concrete adapters (USB control/bulk endpoints, SPI-over-FTDI framing, raw
//! TCP, vendor SDK shims) live outside this crate. The driver core only
//! requires the capability defined here: deliver a command packet, read a
//! response, read a bulk payload, each with an explicit timeout. Framing is
//! entirely the adapter's problem.
//!
//! [`mock::MockTransport`] is the one in-crate implementation, used by every
//! test layer.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

pub mod mock;

/// Physical transport variant behind a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Usb,
    Spi,
    Tcp,
    VendorSdk,
}

impl TransportKind {
    /// Session-oriented transports latch a sticky communication-error flag
    /// on timeout rather than continuing to issue commands to a device that
    /// has stopped responding.
    pub fn is_session_oriented(self) -> bool {
        matches!(self, TransportKind::Tcp | TransportKind::VendorSdk)
    }
}

/// Controller board family, which selects return-value semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoardFamily {
    Fx2,
    Arm,
}

/// Transport-agnostic command quadruple. Adapters encode this into their
/// native framing (USB setup packet, SPI frame, TCP message, SDK call).
#[derive(Debug, Clone, Default)]
pub struct CommandPacket {
    pub opcode: u8,
    pub value: u16,
    pub index: u16,
    pub payload: Vec<u8>,
}

impl CommandPacket {
    pub fn new(opcode: u8, value: u16, index: u16) -> Self {
        Self {
            opcode,
            value,
            index,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }
}

/// Capability required of every transport adapter.
///
/// `send_command` returns the raw device ack flag; interpreting that flag
/// (including the ARM inverted-retval quirk) is the protocol layer's job,
/// never the adapter's. Timeouts and bus faults surface as [`TransportError`].
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn board_family(&self) -> BoardFamily;

    /// Whether calibration pages can be fetched/committed by address.
    /// Vendor SDK shims and line-scan cameras generally cannot; their
    /// calibration record is synthesized from live queries instead.
    fn has_addressable_eeprom(&self) -> bool {
        true
    }

    /// SPI-framed transports corrupt back-to-back page writes; the record
    /// engine buffers host-side and commits page by page when this is set.
    fn requires_buffered_eeprom_commit(&self) -> bool {
        false
    }

    /// Deliver a command; returns the raw ack flag from the wire.
    async fn send_command(
        &self,
        packet: &CommandPacket,
        timeout: Duration,
    ) -> Result<bool, TransportError>;

    /// Read the response for a command packet.
    async fn read_response(
        &self,
        packet: &CommandPacket,
        len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Read a bulk payload (detector samples).
    async fn read_bulk(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_oriented_kinds() {
        assert!(TransportKind::Tcp.is_session_oriented());
        assert!(TransportKind::VendorSdk.is_session_oriented());
        assert!(!TransportKind::Usb.is_session_oriented());
        assert!(!TransportKind::Spi.is_session_oriented());
    }

    #[test]
    fn packet_builder() {
        let p = CommandPacket::new(0xB2, 100, 0).with_payload(&[1, 2, 3]);
        assert_eq!(p.opcode, 0xB2);
        assert_eq!(p.payload, vec![1, 2, 3]);
    }
}
