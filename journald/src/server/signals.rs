//! Signal handling through a signalfd.
//!
//! The daemon's control signals are blocked process-wide and consumed as
//! readable events, so they dispatch through the same loop as sockets.
//! `SIGRTMIN+1` is a runtime value, hence the raw libc plumbing instead
//! of a fixed enum of signal names.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGUSR1: copy the runtime journal to persistent storage.
    FlushToVar,
    /// SIGUSR2: rotate all files and vacuum.
    RotateAndVacuum,
    /// SIGRTMIN+1: sync everything to disk now.
    Sync,
    /// SIGTERM / SIGINT: drain and exit.
    Terminate,
}

pub struct SignalFd {
    fd: OwnedFd,
}

impl SignalFd {
    /// Block the control signals and create the descriptor delivering
    /// them.
    pub fn install() -> io::Result<Self> {
        unsafe {
            let mut mask: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut mask);
            libc::sigaddset(&mut mask, libc::SIGUSR1);
            libc::sigaddset(&mut mask, libc::SIGUSR2);
            libc::sigaddset(&mut mask, libc::SIGTERM);
            libc::sigaddset(&mut mask, libc::SIGINT);
            libc::sigaddset(&mut mask, libc::SIGRTMIN() + 1);

            if libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) != 0 {
                return Err(io::Error::last_os_error());
            }

            let fd = libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(Self {
                fd: OwnedFd::from_raw_fd(fd),
            })
        }
    }

    /// Read the next pending control signal, if any.
    pub fn read(&self) -> Option<SignalEvent> {
        loop {
            let mut info: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    (&mut info as *mut libc::signalfd_siginfo).cast(),
                    std::mem::size_of::<libc::signalfd_siginfo>(),
                )
            };

            if n < 0 {
                return None;
            }
            if n as usize != std::mem::size_of::<libc::signalfd_siginfo>() {
                return None;
            }

            let signo = info.ssi_signo as i32;
            return Some(match signo {
                libc::SIGUSR1 => SignalEvent::FlushToVar,
                libc::SIGUSR2 => SignalEvent::RotateAndVacuum,
                libc::SIGTERM | libc::SIGINT => SignalEvent::Terminate,
                _ if signo == libc::SIGRTMIN() + 1 => SignalEvent::Sync,
                _ => continue,
            });
        }
    }
}

impl AsFd for SignalFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
