//! Serial port lifecycle: open, raw-mode configuration, reopen for reset.
//!
//! The device descriptor is opened non-blocking and driven through tokio's
//! `AsyncFd`, so all reads and writes happen on readiness and never stall the
//! broker task. The line discipline applied at open is cached and re-applied
//! verbatim when the port is reopened after a reset.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::Mutex;

use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices, Termios};
use nix::unistd;
use tokio::io::unix::AsyncFd;
use tracing::{info, warn};

/// Translate a configured baud number to the discrete termios constant.
///
/// The closed set of supported rates; anything else is a startup error.
pub fn baud_constant(baudrate: u32) -> Option<BaudRate> {
    match baudrate {
        50 => Some(BaudRate::B50),
        75 => Some(BaudRate::B75),
        110 => Some(BaudRate::B110),
        134 => Some(BaudRate::B134),
        150 => Some(BaudRate::B150),
        200 => Some(BaudRate::B200),
        300 => Some(BaudRate::B300),
        600 => Some(BaudRate::B600),
        1200 => Some(BaudRate::B1200),
        1800 => Some(BaudRate::B1800),
        2400 => Some(BaudRate::B2400),
        4800 => Some(BaudRate::B4800),
        9600 => Some(BaudRate::B9600),
        19200 => Some(BaudRate::B19200),
        38400 => Some(BaudRate::B38400),
        57600 => Some(BaudRate::B57600),
        115200 => Some(BaudRate::B115200),
        230400 => Some(BaudRate::B230400),
        _ => None,
    }
}

/// A raw-mode serial device registered with the runtime.
#[derive(Debug)]
pub struct SerialPort {
    fd: AsyncFd<OwnedFd>,
    settings: Mutex<Termios>,
}

impl SerialPort {
    /// Open `device` read-write, put it in raw mode at `baudrate` and
    /// register it non-blocking with the runtime.
    pub fn open(device: &Path, baudrate: u32) -> Result<Self, String> {
        let baud = baud_constant(baudrate)
            .ok_or_else(|| format!("unsupported baud rate {baudrate}"))?;

        let fd = open_nonblocking(device)?;
        let settings = configure_raw(&fd, baud)?;

        let fd = AsyncFd::new(fd)
            .map_err(|e| format!("register {}: {e}", device.display()))?;

        Ok(Self {
            fd,
            settings: Mutex::new(settings),
        })
    }

    /// Reopen `device` after a reset, re-applying a previously captured line
    /// discipline instead of reconfiguring from scratch.
    pub fn reopen(device: &Path, settings: &Termios) -> Result<Self, String> {
        let fd = open_nonblocking(device)?;

        termios::tcsetattr(&fd, SetArg::TCSAFLUSH, settings)
            .map_err(|e| format!("tcsetattr {}: {e}", device.display()))?;

        let fd = AsyncFd::new(fd)
            .map_err(|e| format!("register {}: {e}", device.display()))?;

        Ok(Self {
            fd,
            settings: Mutex::new(settings.clone()),
        })
    }

    /// Line discipline applied to the descriptor, cached for reset.
    pub fn line_discipline(&self) -> Termios {
        self.settings.lock().expect("settings mutex poisoned").clone()
    }

    /// Read whatever is available, waiting for readiness first.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                unistd::read(inner.get_ref().as_raw_fd(), buf).map_err(errno_to_io)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write the whole buffer, waiting for write readiness as needed.
    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| unistd::write(inner.get_ref(), buf).map_err(errno_to_io)) {
                Ok(Ok(n)) => buf = &buf[n..],
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }
}

fn errno_to_io(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn open_nonblocking(device: &Path) -> Result<OwnedFd, String> {
    let raw = fcntl::open(
        device,
        OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
        Mode::empty(),
    )
    .map_err(|e| format!("open {}: {e}", device.display()))?;

    // SAFETY: fcntl::open returned a freshly opened descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Capture the device's attributes, switch to raw mode (no canonical
/// processing, no echo, no signals, no post-processing) at `baud`, 8N1 with
/// flow control off, and apply with a flush. Returns the applied settings.
fn configure_raw(fd: &OwnedFd, baud: BaudRate) -> Result<Termios, String> {
    let mut tio = termios::tcgetattr(fd).map_err(|e| format!("tcgetattr: {e}"))?;

    termios::cfmakeraw(&mut tio);

    termios::cfsetispeed(&mut tio, baud).map_err(|e| format!("cfsetispeed: {e}"))?;
    termios::cfsetospeed(&mut tio, baud).map_err(|e| format!("cfsetospeed: {e}"))?;

    // CLOCAL (ignore modem control), CREAD (enable receiver), no hardware
    // flow control.
    tio.control_flags |= termios::ControlFlags::CLOCAL | termios::ControlFlags::CREAD;
    tio.control_flags &= !termios::ControlFlags::CRTSCTS;

    // The descriptor is non-blocking; VMIN/VTIME only describe the raw-mode
    // read semantics for the discipline we cache.
    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    // TCSAFLUSH: discard pending I/O while applying, so no stale bytes from
    // a previous run leak into the first command.
    termios::tcsetattr(fd, SetArg::TCSAFLUSH, &tio).map_err(|e| format!("tcsetattr: {e}"))?;

    Ok(tio)
}

/// Run the configured reset hook and wait for it to exit. The exit status is
/// logged but never fails the reset.
pub async fn run_reset_hook(hook: &Path) {
    info!("Running reset hook {}", hook.display());
    match tokio::process::Command::new(hook).status().await {
        Ok(status) => info!("Reset hook exited: {status}"),
        Err(e) => warn!("Reset hook {} failed to start: {e}", hook.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
    use std::path::PathBuf;

    #[test]
    fn test_baud_constant_accepts_allowed_set() {
        for rate in [
            50u32, 75, 110, 134, 150, 200, 300, 600, 1200, 1800, 2400, 4800, 9600, 19200, 38400,
            57600, 115200, 230400,
        ] {
            assert!(baud_constant(rate).is_some(), "rate {rate} should map");
        }
    }

    #[test]
    fn test_baud_constant_rejects_others() {
        for rate in [0u32, 42, 14400, 28800, 128000, 460800, 1000000] {
            assert!(baud_constant(rate).is_none(), "rate {rate} should not map");
        }
    }

    #[tokio::test]
    async fn test_open_configures_pty_raw() {
        // A pty slave stands in for a tty device node.
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).expect("posix_openpt");
        grantpt(&master).expect("grantpt");
        unlockpt(&master).expect("unlockpt");
        let slave_path = PathBuf::from(ptsname_r(&master).expect("ptsname_r"));

        let port = SerialPort::open(&slave_path, 115200).expect("open pty slave");
        let tio = port.line_discipline();
        assert!(!tio.local_flags.contains(termios::LocalFlags::ICANON));
        assert!(!tio.local_flags.contains(termios::LocalFlags::ECHO));
        assert!(!tio.local_flags.contains(termios::LocalFlags::ISIG));
        assert!(tio.control_flags.contains(termios::ControlFlags::CREAD));
    }

    #[tokio::test]
    async fn test_open_rejects_bad_baud() {
        let err = SerialPort::open(Path::new("/dev/null"), 12345).unwrap_err();
        assert!(err.contains("unsupported baud rate"));
    }

    #[tokio::test]
    async fn test_open_reports_missing_device() {
        let err = SerialPort::open(Path::new("/dev/does-not-exist"), 9600).unwrap_err();
        assert!(err.contains("open"));
    }
}
