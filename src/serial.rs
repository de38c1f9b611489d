use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use nix::fcntl::{open, OFlag};
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::termios::{
    cfsetispeed, cfsetospeed, tcflush, tcgetattr, tcsetattr, BaudRate, ControlFlags, FlushArg,
    InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices,
};
use nix::unistd::{close, read, write};

use crate::transport::{Channel, TransportError};

/// `Channel` over a tty device (USB CDC or a UART bridge).
///
/// Inbound bytes are reassembled into newline-delimited frames across
/// partial reads; carriage returns are dropped by termios (IGNCR).
pub struct SerialChannel {
    fd: i32,
    partial: Vec<u8>,
    lines: VecDeque<String>,
}

impl SerialChannel {
    /// Opens the device and puts it in raw 8N1 mode at `baud_rate`.
    pub fn open<P: Into<PathBuf>>(
        path: P,
        baud_rate: BaudRate,
    ) -> Result<SerialChannel, TransportError> {
        let oflag = OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_SYNC;
        let fd = open(&path.into(), oflag, nix::sys::stat::Mode::empty()).map_err(io_err)?;

        let mut termios = tcgetattr(fd).map_err(io_err)?;
        cfsetispeed(&mut termios, baud_rate).map_err(io_err)?;
        cfsetospeed(&mut termios, baud_rate).map_err(io_err)?;
        termios.control_flags |= ControlFlags::CS8;
        termios.output_flags &=
            !(OutputFlags::ONLCR | OutputFlags::ONOCR | OutputFlags::OCRNL);
        termios.output_flags |= OutputFlags::ONLRET;
        termios.local_flags &= !(LocalFlags::ECHO | LocalFlags::ICANON);
        termios.input_flags |= InputFlags::IGNCR;
        termios.input_flags &= !(InputFlags::INPCK | InputFlags::ISTRIP);
        // Reads are driven by poll(2); never block in read itself.
        termios.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        termios.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        tcsetattr(fd, SetArg::TCSAFLUSH, &termios).map_err(io_err)?;
        tcflush(fd, FlushArg::TCIOFLUSH).map_err(io_err)?;

        Ok(SerialChannel {
            fd,
            partial: Vec::new(),
            lines: VecDeque::new(),
        })
    }

    /// Waits up to `wait` for readable bytes and folds them into the
    /// line queue.
    fn fill(&mut self, wait: Duration) -> Result<(), TransportError> {
        let mut fds = [PollFd::new(self.fd, PollFlags::POLLIN)];
        let wait_ms = wait.as_millis().clamp(1, i32::MAX as u128) as i32;
        let ready = poll(&mut fds, wait_ms).map_err(io_err)?;
        if ready == 0 {
            return Ok(());
        }

        let mut chunk = [0u8; 256];
        let n = read(self.fd, &mut chunk).map_err(io_err)?;
        if n == 0 {
            return Err(TransportError::NotConnected);
        }
        for &byte in &chunk[..n] {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&self.partial).trim().to_string();
                self.partial.clear();
                if !line.is_empty() {
                    self.lines.push_back(line);
                }
            } else {
                self.partial.push(byte);
            }
        }
        Ok(())
    }
}

impl Channel for SerialChannel {
    fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        self.send_bytes(&bytes)
    }

    fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut written = 0;
        while written < bytes.len() {
            written += write(self.fd, &bytes[written..]).map_err(io_err)?;
        }
        Ok(())
    }

    fn recv_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(line) = self.lines.pop_front() {
                return Ok(Some(line));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.fill(deadline - now)?;
        }
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}

fn io_err(errno: nix::errno::Errno) -> TransportError {
    TransportError::Io(std::io::Error::from_raw_os_error(errno as i32))
}
