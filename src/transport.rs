use std::io;
use std::time::Duration;

use thiserror::Error;

/// Hard channel fault. The loaded program survives these; only the
/// connection needs to be reestablished.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("serial I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Abstract duplex line-oriented channel to the device.
///
/// The engine never opens or closes the underlying port; it is handed a
/// live channel and reports `TransportError` if the channel breaks.
pub trait Channel: Send {
    /// Writes one outbound line; the line terminator is appended here.
    fn send_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Raw outbound bytes, no terminator. Used for realtime control
    /// bytes such as the 0x18 soft-reset.
    fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Next inbound line, or `None` if nothing arrives within `timeout`.
    fn recv_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError>;
}
