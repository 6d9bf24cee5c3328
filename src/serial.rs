//! AT-command port ownership.
//!
//! The modem exposes two serial devices: one for AT commands (owned here) and
//! one for the PPP data session (owned by `pppd`).  The AT port is opened once
//! at startup and stays open until a full cellular reset closes and reopens it.
//!
//! Commands are exchanged without ever blocking the scheduler: a command is
//! written, then each tick drains whatever bytes the modem has produced until
//! the final result line arrives or the per-command deadline passes.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use nix::sys::termios::{
    self, BaudRate, ControlFlags, FlushArg, InputFlags, LocalFlags, OutputFlags, SetArg,
    SpecialCharacterIndices,
};

use crate::at::{AtResponse, ResponseFramer};
use crate::error::{NetdError, Result};

/// Byte stream to the modem's AT interface.
pub trait AtLink: Send {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    /// Copy whatever is buffered into `buf` without waiting.  `Ok(0)` means
    /// nothing is available yet.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Whether the underlying descriptor is usable.
    fn is_valid(&self) -> bool;
}

/// Produces an [`AtLink`]; called at startup and after a reset.
pub trait PortOpener: Send {
    fn open(&mut self) -> io::Result<Box<dyn AtLink>>;
    fn device(&self) -> &Path;
}

// ── Real tty ──────────────────────────────────────────────────────────────────

/// An open, raw-mode, non-blocking tty.  Closing happens on drop.
pub struct TtyPort {
    file:   File,
    device: PathBuf,
}

impl TtyPort {
    pub fn open(device: &Path, baud: u32) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(device)?;
        configure_serial(&file, baud)?;
        // Discard anything the modem printed before we arrived.
        let _ = termios::tcflush(&file, FlushArg::TCIOFLUSH);
        Ok(Self { file, device: device.to_path_buf() })
    }
}

impl AtLink for TtyPort {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.file.flush()
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.file.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn is_valid(&self) -> bool {
        self.file.as_raw_fd() >= 0
    }
}

impl Drop for TtyPort {
    fn drop(&mut self) {
        debug!("closing AT port {}", self.device.display());
    }
}

/// Configure the port for raw AT traffic (8N1, no echo, no signals) with
/// non-blocking reads.
fn configure_serial(file: &File, baud: u32) -> io::Result<()> {
    let mut t = termios::tcgetattr(file)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    t.local_flags &= !(
        LocalFlags::ICANON |
        LocalFlags::ECHO   |
        LocalFlags::ECHOE  |
        LocalFlags::ISIG
    );
    t.output_flags &= !OutputFlags::OPOST;
    t.input_flags &= !(
        InputFlags::IXON   |
        InputFlags::IXOFF  |
        InputFlags::IXANY  |
        InputFlags::ISTRIP |
        InputFlags::INPCK  |
        InputFlags::ICRNL
    );
    t.control_flags |= ControlFlags::CS8 | ControlFlags::CREAD | ControlFlags::CLOCAL;
    t.control_flags &= !(ControlFlags::CSIZE | ControlFlags::CSTOPB | ControlFlags::PARENB);
    t.control_flags |= ControlFlags::CS8;

    // VMIN=0, VTIME=0: reads return immediately with whatever is buffered
    t.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    t.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    let baud_rate = match baud {
        9600   => BaudRate::B9600,
        19200  => BaudRate::B19200,
        38400  => BaudRate::B38400,
        57600  => BaudRate::B57600,
        230400 => BaudRate::B230400,
        460800 => BaudRate::B460800,
        921600 => BaudRate::B921600,
        _      => BaudRate::B115200,
    };

    termios::cfsetospeed(&mut t, baud_rate)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    termios::cfsetispeed(&mut t, baud_rate)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    termios::tcsetattr(file, SetArg::TCSANOW, &t)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    Ok(())
}

/// Opens [`TtyPort`]s on a fixed device path.
pub struct TtyOpener {
    device: PathBuf,
    baud:   u32,
}

impl TtyOpener {
    pub fn new(device: PathBuf, baud: u32) -> Self {
        Self { device, baud }
    }
}

impl PortOpener for TtyOpener {
    fn open(&mut self) -> io::Result<Box<dyn AtLink>> {
        Ok(Box::new(TtyPort::open(&self.device, self.baud)?))
    }

    fn device(&self) -> &Path {
        &self.device
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

/// Progress of a command exchange.
#[derive(Debug)]
pub enum AtPoll {
    Pending,
    Done(Result<AtResponse>),
}

struct PendingCommand {
    command:  String,
    framer:   ResponseFramer,
    deadline: Instant,
}

pub struct SerialPortManager {
    opener:         Box<dyn PortOpener>,
    port:           Option<Box<dyn AtLink>>,
    pending:        Option<PendingCommand>,
    write_failures: u32,
}

impl SerialPortManager {
    pub fn new(opener: Box<dyn PortOpener>) -> Self {
        Self { opener, port: None, pending: None, write_failures: 0 }
    }

    pub fn device(&self) -> &Path {
        self.opener.device()
    }

    /// Open the AT port.  A second call while open is a no-op.
    pub fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = self.opener.open()?;
        info!("AT port {} open", self.opener.device().display());
        self.port = Some(port);
        self.write_failures = 0;
        Ok(())
    }

    /// Close the AT port.  Only a full cellular reset calls this.
    pub fn close(&mut self) {
        self.pending = None;
        if self.port.take().is_some() {
            info!("AT port {} closed", self.opener.device().display());
        }
        self.write_failures = 0;
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    /// Consecutive failed writes since the last successful one.
    pub fn write_failures(&self) -> u32 {
        self.write_failures
    }

    /// Abandon the command in flight; its late reply is drained before the
    /// next command is written.
    pub fn cancel(&mut self) {
        if let Some(p) = self.pending.take() {
            debug!("AT: abandoning {}", p.command);
        }
    }

    /// Issue `command` (if not already in flight) and poll for its reply.
    ///
    /// Call repeatedly with the same command until it returns
    /// [`AtPoll::Done`].  A different command cancels the one in flight.
    pub fn transact(&mut self, command: &str, timeout: Duration, now: Instant) -> AtPoll {
        if let Some(p) = &self.pending {
            if p.command != command {
                warn!("AT: {} superseded by {command}", p.command);
                self.pending = None;
            }
        }

        if self.pending.is_none() {
            if let Err(e) = self.send(command) {
                return AtPoll::Done(Err(e));
            }
            self.pending = Some(PendingCommand {
                command:  command.to_string(),
                framer:   ResponseFramer::new(command),
                deadline: now + timeout,
            });
        }

        self.poll(now)
    }

    fn send(&mut self, command: &str) -> Result<()> {
        let port = match self.port.as_mut() {
            Some(p) if p.is_valid() => p,
            _ => {
                error!("AT contract violation: {command} issued without a valid handle");
                return Err(NetdError::InvalidHandle { command: command.to_string() });
            }
        };

        // Drop stale bytes (late replies to abandoned commands, URCs).
        let mut scratch = [0u8; 256];
        while let Ok(n) = port.read_available(&mut scratch) {
            if n == 0 { break; }
        }

        let mut line = command.as_bytes().to_vec();
        line.push(b'\r');
        match port.write_all(&line) {
            Ok(()) => {
                self.write_failures = 0;
                debug!("AT > {command}");
                Ok(())
            }
            Err(e) => {
                self.write_failures += 1;
                warn!("AT write of {command} failed ({} in a row): {e}", self.write_failures);
                Err(NetdError::Io(e))
            }
        }
    }

    fn poll(&mut self, now: Instant) -> AtPoll {
        let Some(pending) = self.pending.as_mut() else {
            return AtPoll::Pending;
        };
        let Some(port) = self.port.as_mut() else {
            let command = pending.command.clone();
            self.pending = None;
            error!("AT contract violation: port closed while {command} in flight");
            return AtPoll::Done(Err(NetdError::InvalidHandle { command }));
        };

        let mut buf = [0u8; 512];
        loop {
            match port.read_available(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if let Some(resp) = pending.framer.push(&buf[..n]) {
                        let command = pending.command.clone();
                        self.pending = None;
                        debug!("AT < {command}: {} ({} lines)", resp.result, resp.lines.len());
                        return AtPoll::Done(if resp.result.is_ok() {
                            Ok(resp)
                        } else {
                            Err(NetdError::Modem { command, result: resp.result })
                        });
                    }
                }
                Err(e) => {
                    self.pending = None;
                    return AtPoll::Done(Err(NetdError::Io(e)));
                }
            }
        }

        if now >= pending.deadline {
            let command = pending.command.clone();
            self.pending = None;
            warn!("AT: no reply to {command} within budget");
            return AtPoll::Done(Err(NetdError::Timeout { command }));
        }
        AtPoll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::at::FinalResult;
    use crate::mock::MockModem;

    const T: Duration = Duration::from_secs(5);

    fn manager(modem: &MockModem) -> SerialPortManager {
        let mut m = SerialPortManager::new(Box::new(modem.opener()));
        m.open().unwrap();
        m
    }

    #[test]
    fn send_without_handle_is_contract_violation() {
        let modem = MockModem::new();
        let mut m = SerialPortManager::new(Box::new(modem.opener()));
        let now = Instant::now();
        match m.transact("AT", T, now) {
            AtPoll::Done(Err(NetdError::InvalidHandle { command })) => assert_eq!(command, "AT"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(m.write_failures(), 0);
        assert!(modem.written().is_empty());
    }

    #[test]
    fn reply_is_returned_once_complete() {
        let modem = MockModem::new();
        modem.reply("AT+CSQ", "+CSQ: 20,99\r\nOK\r\n");
        let mut m = manager(&modem);
        let now = Instant::now();
        match m.transact("AT+CSQ", T, now) {
            AtPoll::Done(Ok(resp)) => assert_eq!(resp.info("+CSQ:"), Some("20,99")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(modem.written(), vec!["AT+CSQ"]);
    }

    #[test]
    fn silent_modem_times_out_at_deadline() {
        let modem = MockModem::new();
        modem.silent("AT+COPS=?");
        let mut m = manager(&modem);
        let t0 = Instant::now();
        assert!(matches!(m.transact("AT+COPS=?", T, t0), AtPoll::Pending));
        assert!(matches!(m.transact("AT+COPS=?", T, t0 + Duration::from_secs(4)), AtPoll::Pending));
        match m.transact("AT+COPS=?", T, t0 + T) {
            AtPoll::Done(Err(NetdError::Timeout { command })) => assert_eq!(command, "AT+COPS=?"),
            other => panic!("unexpected {other:?}"),
        }
        // Only written once despite three polls.
        assert_eq!(modem.written().len(), 1);
    }

    #[test]
    fn error_result_maps_to_modem_error() {
        let modem = MockModem::new();
        modem.reply("AT+COPS=0", "+CME ERROR: 3\r\n");
        let mut m = manager(&modem);
        match m.transact("AT+COPS=0", T, Instant::now()) {
            AtPoll::Done(Err(NetdError::Modem { result, .. })) => {
                assert_eq!(result, FinalResult::CmeError("3".into()))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn write_failures_accumulate_and_reset() {
        let modem = MockModem::new();
        let mut m = manager(&modem);
        modem.fail_writes(true);
        let now = Instant::now();
        for _ in 0..3 {
            assert!(matches!(m.transact("AT", T, now), AtPoll::Done(Err(NetdError::Io(_)))));
        }
        assert_eq!(m.write_failures(), 3);
        modem.fail_writes(false);
        assert!(matches!(m.transact("AT", T, now), AtPoll::Done(Ok(_))));
        assert_eq!(m.write_failures(), 0);
    }

    #[test]
    fn close_then_open_reacquires_port() {
        let modem = MockModem::new();
        let mut m = manager(&modem);
        m.close();
        assert!(!m.is_open());
        m.open().unwrap();
        assert!(m.is_open());
        assert_eq!(modem.opens(), 2);
    }
}
