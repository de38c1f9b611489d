use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};

use crate::transport::{Channel, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineFlag {
    Alarm,
    Idle,
    Run,
    Hold,
}

/// Point-in-time decoded device state. Each snapshot supersedes the
/// previous one; nothing is merged.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub position: (f32, f32, f32),
    pub flags: Vec<MachineFlag>,
    pub at: Instant,
}

/// Device-dialect decoder for status traffic. The exact report grammar
/// belongs to the device, not the engine.
pub trait StatusDialect: Send {
    /// Query line that asks the device for a report.
    fn query(&self) -> &str;

    /// Decodes one inbound line; `None` when the line is not a report.
    fn decode(&self, line: &str) -> Option<StatusSnapshot>;
}

/// GRBL-style realtime reports: `<Idle|MPos:0.000,0.000,0.000|FS:0,0>`.
pub struct GrblDialect;

impl StatusDialect for GrblDialect {
    fn query(&self) -> &str {
        "?"
    }

    fn decode(&self, line: &str) -> Option<StatusSnapshot> {
        let body = line.trim().strip_prefix('<')?.strip_suffix('>')?;
        let mut fields = body.split('|');

        let state = fields.next()?;
        let flags = if state.eq_ignore_ascii_case("idle") {
            vec![MachineFlag::Idle]
        } else if state.eq_ignore_ascii_case("run") {
            vec![MachineFlag::Run]
        } else if state.to_ascii_lowercase().starts_with("hold") {
            vec![MachineFlag::Hold]
        } else if state.eq_ignore_ascii_case("alarm") {
            vec![MachineFlag::Alarm]
        } else {
            Vec::new()
        };

        let mut position = None;
        for field in fields {
            let coords = field
                .strip_prefix("MPos:")
                .or_else(|| field.strip_prefix("WPos:"));
            if let Some(coords) = coords {
                let mut parts = coords.split(',').map(|p| p.trim().parse::<f32>());
                let x = parts.next()?.ok()?;
                let y = parts.next()?.ok()?;
                let z = parts.next()?.ok()?;
                position = Some((x, y, z));
            }
        }

        Some(StatusSnapshot {
            position: position?,
            flags,
            at: Instant::now(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusPoll {
    Updated(StatusSnapshot),
    /// The coordinator held the channel; polling is best-effort and
    /// never waits its turn.
    Skipped,
    NoReply,
}

pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(500);

/// Opportunistic position/state polling, sharing the channel with the
/// handshake coordinator under the same per-round-trip mutex.
pub struct StatusReporter<C: Channel, D: StatusDialect> {
    channel: Arc<Mutex<C>>,
    dialect: D,
    reply_timeout: Duration,
    latest: Mutex<Option<StatusSnapshot>>,
}

impl<C: Channel, D: StatusDialect> StatusReporter<C, D> {
    pub fn new(channel: Arc<Mutex<C>>, dialect: D) -> Self {
        Self {
            channel,
            dialect,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            latest: Mutex::new(None),
        }
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    pub fn latest(&self) -> Option<StatusSnapshot> {
        self.latest.lock().unwrap().clone()
    }

    /// One best-effort status round trip. A pending handshake always
    /// wins: if the channel is held this cycle is skipped, not queued.
    pub fn poll(&self) -> Result<StatusPoll, TransportError> {
        let mut channel = match self.channel.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Ok(StatusPoll::Skipped),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        channel.send_line(self.dialect.query())?;
        let deadline = Instant::now() + self.reply_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(StatusPoll::NoReply);
            }
            match channel.recv_line(deadline - now)? {
                Some(line) => {
                    if let Some(snapshot) = self.dialect.decode(&line) {
                        *self.latest.lock().unwrap() = Some(snapshot.clone());
                        return Ok(StatusPoll::Updated(snapshot));
                    }
                    log::debug!("status rx (ignored): {line}");
                }
                None => return Ok(StatusPoll::NoReply),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_realtime_report() {
        let snapshot = GrblDialect
            .decode("<Idle|MPos:1.000,-2.500,0.125|FS:0,0>")
            .unwrap();
        assert_eq!(snapshot.position, (1.0, -2.5, 0.125));
        assert_eq!(snapshot.flags, [MachineFlag::Idle]);
    }

    #[test]
    fn decodes_hold_substates() {
        let snapshot = GrblDialect.decode("<Hold:0|MPos:0,0,0>").unwrap();
        assert_eq!(snapshot.flags, [MachineFlag::Hold]);
    }

    #[test]
    fn non_report_lines_are_rejected() {
        assert!(GrblDialect.decode("ok").is_none());
        assert!(GrblDialect.decode("error:9").is_none());
        assert!(GrblDialect.decode("<Idle|FS:0,0>").is_none());
    }
}
