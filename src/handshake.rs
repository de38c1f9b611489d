use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::transport::{Channel, TransportError};

/// Result of one command round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Acknowledged,
    DeviceError(String),
    TimedOut,
}

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the send-one-wait-for-ok discipline.
///
/// The controller is single-threaded and cannot accept a second command
/// before acknowledging the first, so the channel mutex is held for
/// exactly one full round trip and at most one command is ever in flight.
pub struct Coordinator<C: Channel> {
    channel: Arc<Mutex<C>>,
    ack_timeout: Duration,
}

impl<C: Channel> Coordinator<C> {
    pub fn new(channel: Arc<Mutex<C>>) -> Self {
        Self::with_timeout(channel, DEFAULT_ACK_TIMEOUT)
    }

    pub fn with_timeout(channel: Arc<Mutex<C>>, ack_timeout: Duration) -> Self {
        Self {
            channel,
            ack_timeout,
        }
    }

    pub fn channel(&self) -> Arc<Mutex<C>> {
        self.channel.clone()
    }

    /// Sends one instruction and blocks until the device acknowledges,
    /// reports an error, or the timeout lapses. Inbound lines that are
    /// neither an ack nor an error are not handshake terminators and are
    /// discarded here.
    pub fn dispatch(&self, text: &str) -> Result<Outcome, TransportError> {
        let mut channel = self.channel.lock().unwrap();
        log::debug!("tx: {text}");
        channel.send_line(text)?;

        let deadline = Instant::now() + self.ack_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                log::warn!("no ack for {text:?} within {:?}", self.ack_timeout);
                return Ok(Outcome::TimedOut);
            }
            match channel.recv_line(deadline - now)? {
                Some(line) => {
                    if is_ack(&line) {
                        log::debug!("rx: {line}");
                        return Ok(Outcome::Acknowledged);
                    }
                    if is_device_error(&line) {
                        return Ok(Outcome::DeviceError(line));
                    }
                    log::debug!("rx (ignored): {line}");
                }
                None => {
                    log::warn!("no ack for {text:?} within {:?}", self.ack_timeout);
                    return Ok(Outcome::TimedOut);
                }
            }
        }
    }

    /// Plain send without the ok handshake, for the manual console path.
    pub fn send_immediate(&self, text: &str) -> Result<(), TransportError> {
        let mut channel = self.channel.lock().unwrap();
        log::debug!("tx (immediate): {text}");
        channel.send_line(text)
    }

    /// Soft-reset byte followed by M112. Waits for any in-flight round
    /// trip to release the channel, never injected into the middle of one.
    pub fn emergency_stop(&self) -> Result<(), TransportError> {
        let mut channel = self.channel.lock().unwrap();
        log::warn!("emergency stop");
        channel.send_bytes(&[0x18])?;
        channel.send_line("M112")
    }

    /// Clears a device alarm so dispatch can resume after a fault.
    pub fn reset_alarm(&self) -> Result<(), TransportError> {
        let mut channel = self.channel.lock().unwrap();
        log::info!("alarm reset");
        channel.send_line("$X")?;
        channel.send_line("M999")
    }
}

fn is_ack(line: &str) -> bool {
    match line.split_whitespace().next() {
        Some(first) => first.eq_ignore_ascii_case("ok"),
        None => false,
    }
}

fn is_device_error(line: &str) -> bool {
    let lower = line.trim_start().to_ascii_lowercase();
    lower.starts_with("error") || lower.starts_with("alarm")
}
