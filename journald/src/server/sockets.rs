//! Descriptor plumbing for the dispatcher.
//!
//! Sockets are taken over from the supervisor when passed (the
//! `LISTEN_FDS` protocol), bound fresh otherwise. Ancillary data
//! (credentials, passed descriptors) is read with raw `recvmsg`, since
//! that is the one place the standard library offers no safe surface.
//! Everything opened here is non-blocking and close-on-exec.

use crate::storage::Paths;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixDatagram, UnixListener};
use std::path::Path;
use tracing::{debug, warn};

/// First descriptor passed by the supervisor.
const SD_LISTEN_FDS_START: RawFd = 3;

/// Ceiling on a sealed-memfd payload accepted over the native socket.
const SEALED_PAYLOAD_MAX: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct UnixCreds {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

pub struct ReceivedMessage {
    pub length: usize,
    pub creds: Option<UnixCreds>,
    pub passed_fds: Vec<OwnedFd>,
}

/// `read(2)` with `WouldBlock` surfaced through the error kind.
pub fn read_fd(fd: BorrowedFd<'_>, buffer: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd.as_raw_fd(), buffer.as_mut_ptr().cast(), buffer.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn set_cloexec_nonblock(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        let flags = libc::fcntl(fd, libc::F_GETFD);
        libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
    }
}

// ── Supervisor-passed descriptors ────────────────────────────────

/// Claim descriptors passed per the `LISTEN_FDS` protocol.
pub fn take_listen_fds() -> Vec<OwnedFd> {
    let listen_pid = std::env::var("LISTEN_PID")
        .ok()
        .and_then(|v| v.parse::<u32>().ok());
    let listen_fds = std::env::var("LISTEN_FDS")
        .ok()
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(0);

    if listen_pid != Some(std::process::id()) || listen_fds <= 0 {
        return Vec::new();
    }

    // The variables are consumed so children do not inherit them.
    unsafe {
        std::env::remove_var("LISTEN_PID");
        std::env::remove_var("LISTEN_FDS");
        std::env::remove_var("LISTEN_FDNAMES");
    }

    (0..listen_fds)
        .map(|i| {
            let fd = SD_LISTEN_FDS_START + i;
            set_cloexec_nonblock(fd);
            unsafe { OwnedFd::from_raw_fd(fd) }
        })
        .collect()
}

pub enum Classified {
    Native,
    Syslog,
    StreamListener,
    StreamConnection,
    Audit,
    Unknown,
}

fn socket_int_option(fd: RawFd, level: i32, option: i32) -> Option<i32> {
    let mut value: i32 = 0;
    let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            level,
            option,
            (&mut value as *mut i32).cast(),
            &mut len,
        )
    };
    (rc == 0).then_some(value)
}

fn unix_socket_path(fd: RawFd) -> Option<Vec<u8>> {
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(fd, (&mut addr as *mut libc::sockaddr_un).cast(), &mut len)
    };
    if rc != 0 || addr.sun_family != libc::AF_UNIX as libc::sa_family_t {
        return None;
    }

    let path_len = (len as usize)
        .saturating_sub(std::mem::size_of::<libc::sa_family_t>())
        .min(addr.sun_path.len());
    let bytes: Vec<u8> = addr.sun_path[..path_len]
        .iter()
        .map(|&c| c as u8)
        .take_while(|&c| c != 0)
        .collect();
    Some(bytes)
}

/// Identify an inherited descriptor by family, type and bound address.
pub fn classify(fd: &OwnedFd, paths: &Paths) -> Classified {
    let raw = fd.as_raw_fd();

    let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(raw, (&mut addr as *mut libc::sockaddr_storage).cast(), &mut len)
    };
    if rc != 0 {
        return Classified::Unknown;
    }

    if addr.ss_family == libc::AF_NETLINK as libc::sa_family_t {
        return Classified::Audit;
    }

    if addr.ss_family != libc::AF_UNIX as libc::sa_family_t {
        return Classified::Unknown;
    }

    let sock_type = socket_int_option(raw, libc::SOL_SOCKET, libc::SO_TYPE);
    let path = unix_socket_path(raw).unwrap_or_default();
    let native_path = paths.flags_dir.join("socket");
    let syslog_path = paths.flags_dir.join("dev-log");

    match sock_type {
        Some(libc::SOCK_DGRAM) => {
            if path == native_path.as_os_str().as_encoded_bytes() {
                Classified::Native
            } else if path == syslog_path.as_os_str().as_encoded_bytes()
                || path == b"/dev/log"
            {
                Classified::Syslog
            } else {
                Classified::Unknown
            }
        }
        Some(libc::SOCK_STREAM) => {
            let listening = socket_int_option(raw, libc::SOL_SOCKET, libc::SO_ACCEPTCONN)
                .unwrap_or(0)
                != 0;
            if listening {
                Classified::StreamListener
            } else {
                Classified::StreamConnection
            }
        }
        _ => Classified::Unknown,
    }
}

// ── Binding our own sockets ──────────────────────────────────────

fn prepare_socket_path(path: &Path) -> bool {
    if let Some(parent) = path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            warn!(path = %path.display(), error = %err, "cannot create socket directory");
            return false;
        }
    }
    let _ = std::fs::remove_file(path);
    true
}

fn make_world_writable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666));
}

pub fn bind_datagram(path: &Path, pass_credentials: bool) -> Option<OwnedFd> {
    if !prepare_socket_path(path) {
        return None;
    }

    let socket = match UnixDatagram::bind(path) {
        Ok(socket) => socket,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cannot bind datagram socket");
            return None;
        }
    };

    if let Err(err) = socket.set_nonblocking(true) {
        warn!(error = %err, "cannot make socket non-blocking");
    }

    if pass_credentials {
        let enable: i32 = 1;
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_PASSCRED,
                (&enable as *const i32).cast(),
                std::mem::size_of::<i32>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            debug!(path = %path.display(), "cannot enable credential passing");
        }
    }

    make_world_writable(path);
    Some(OwnedFd::from(socket))
}

pub fn bind_stream(path: &Path) -> Option<OwnedFd> {
    if !prepare_socket_path(path) {
        return None;
    }

    let listener = match UnixListener::bind(path) {
        Ok(listener) => listener,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cannot bind stream socket");
            return None;
        }
    };

    if let Err(err) = listener.set_nonblocking(true) {
        warn!(error = %err, "cannot make listener non-blocking");
    }

    make_world_writable(path);
    Some(OwnedFd::from(listener))
}

/// Accept one connection; `None` when the backlog is drained.
pub fn accept_connection(listener: BorrowedFd<'_>) -> io::Result<Option<OwnedFd>> {
    let fd = unsafe {
        libc::accept4(
            listener.as_raw_fd(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };

    if fd < 0 {
        let err = io::Error::last_os_error();
        return if err.kind() == io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err)
        };
    }

    Ok(Some(unsafe { OwnedFd::from_raw_fd(fd) }))
}

// ── Datagram reception with ancillary data ───────────────────────

/// Receive one datagram plus its ancillary credentials and descriptors.
/// `Ok(None)` means the socket is drained.
pub fn recv_with_ancillary(
    fd: BorrowedFd<'_>,
    buffer: &mut [u8],
) -> io::Result<Option<ReceivedMessage>> {
    let mut iov = libc::iovec {
        iov_base: buffer.as_mut_ptr().cast(),
        iov_len: buffer.len(),
    };

    // Room for credentials plus a small number of descriptors.
    let mut control = [0u8; 256];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast();
    msg.msg_controllen = control.len() as _;

    let n = unsafe {
        libc::recvmsg(
            fd.as_raw_fd(),
            &mut msg,
            libc::MSG_DONTWAIT | libc::MSG_CMSG_CLOEXEC,
        )
    };

    if n < 0 {
        let err = io::Error::last_os_error();
        return if err.kind() == io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err)
        };
    }

    let mut creds = None;
    let mut passed_fds = Vec::new();

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let header = &*cmsg;
            if header.cmsg_level == libc::SOL_SOCKET {
                match header.cmsg_type {
                    libc::SCM_CREDENTIALS => {
                        let ucred = &*(libc::CMSG_DATA(cmsg) as *const libc::ucred);
                        creds = Some(UnixCreds {
                            pid: ucred.pid,
                            uid: ucred.uid,
                            gid: ucred.gid,
                        });
                    }
                    libc::SCM_RIGHTS => {
                        let payload = header.cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                        let count = payload / std::mem::size_of::<RawFd>();
                        let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                        for i in 0..count {
                            passed_fds.push(OwnedFd::from_raw_fd(*data.add(i)));
                        }
                    }
                    _ => {}
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(Some(ReceivedMessage {
        length: n as usize,
        creds,
        passed_fds,
    }))
}

/// Read a sealed-file payload passed over the native socket.
pub fn read_sealed_payload(fd: OwnedFd) -> Option<Vec<u8>> {
    let mut file = std::fs::File::from(fd);

    let len = file.metadata().ok()?.len();
    if len > SEALED_PAYLOAD_MAX {
        debug!(len, "sealed payload too large, dropping");
        return None;
    }

    let mut payload = Vec::with_capacity(len as usize);
    file.read_to_end(&mut payload).ok()?;
    Some(payload)
}

/// `SO_PEERCRED` of a connected stream.
pub fn peer_credentials(fd: BorrowedFd<'_>) -> Option<UnixCreds> {
    let mut ucred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut ucred as *mut libc::ucred).cast(),
            &mut len,
        )
    };

    (rc == 0).then_some(UnixCreds {
        pid: ucred.pid,
        uid: ucred.uid,
        gid: ucred.gid,
    })
}

// ── Special input sources ────────────────────────────────────────

pub fn open_kmsg(device: &Path) -> Option<OwnedFd> {
    let device_cstr = std::ffi::CString::new(device.as_os_str().as_encoded_bytes()).ok()?;
    let fd = unsafe {
        libc::open(
            device_cstr.as_ptr(),
            libc::O_RDONLY | libc::O_NONBLOCK | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        debug!(device = %device.display(), "kernel ring unavailable");
        return None;
    }

    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    // Start at the tail: old ring contents were either stored by a
    // previous incarnation or filtered by the persisted seqnum.
    unsafe {
        libc::lseek(fd.as_raw_fd(), 0, libc::SEEK_DATA);
    }

    Some(fd)
}

/// Raw netlink socket joined to the audit read-log group.
pub fn open_audit() -> Option<OwnedFd> {
    const AUDIT_NLGRP_READLOG: u32 = 1;

    let fd = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::NETLINK_AUDIT,
        )
    };
    if fd < 0 {
        debug!("audit netlink unavailable");
        return None;
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr.nl_groups = AUDIT_NLGRP_READLOG;

    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            (&addr as *const libc::sockaddr_nl).cast(),
            std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        debug!(error = %io::Error::last_os_error(), "cannot join audit group");
        return None;
    }

    Some(fd)
}

pub fn open_hostname() -> Option<OwnedFd> {
    let fd = unsafe {
        libc::open(
            c"/proc/sys/kernel/hostname".as_ptr(),
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return None;
    }
    Some(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Re-arm a `/proc` watch after an EPOLLPRI wakeup.
pub fn rewind(fd: BorrowedFd<'_>) {
    unsafe {
        libc::lseek(fd.as_raw_fd(), 0, libc::SEEK_SET);
    }
    let mut scratch = [0u8; 256];
    let _ = read_fd(fd, &mut scratch);
}

// ── Timers ───────────────────────────────────────────────────────

/// A oneshot timerfd; arming replaces any earlier deadline.
pub struct OneshotTimer {
    fd: OwnedFd,
}

impl OneshotTimer {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn arm(&self, usec: u64) {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: (usec / 1_000_000) as libc::time_t,
                // A zero it_value disarms; keep at least a nanosecond.
                tv_nsec: ((usec % 1_000_000) * 1_000).max(1) as libc::c_long,
            },
        };

        let rc = unsafe {
            libc::timerfd_settime(self.fd.as_raw_fd(), 0, &spec, std::ptr::null_mut())
        };
        if rc != 0 {
            warn!(error = %io::Error::last_os_error(), "cannot arm timer");
        }
    }

    /// Clear the expiration count after a wakeup.
    pub fn consume(&self) {
        let mut expirations = [0u8; 8];
        let _ = read_fd(self.fd.as_fd(), &mut expirations);
    }
}

// ── Supervisor notifications ─────────────────────────────────────

pub enum NotifyFlush {
    /// Nothing pending; EPOLLOUT interest can be dropped.
    Idle,
    /// A send would block; wait for writability.
    WouldBlock,
}

/// The `NOTIFY_SOCKET` channel to the supervisor. Sends never block: a
/// full socket parks the message in the queue until EPOLLOUT.
pub struct NotifySocket {
    socket: Option<UnixDatagram>,
    destination: Option<Vec<u8>>,
    pending: VecDeque<String>,
    watchdog_usec: Option<u64>,
    watched: bool,
}

impl NotifySocket {
    pub fn from_env() -> Self {
        let destination = std::env::var_os("NOTIFY_SOCKET").map(|path| {
            let bytes = path.as_encoded_bytes().to_vec();
            bytes
        });

        let socket = destination
            .as_ref()
            .and_then(|_| UnixDatagram::unbound().ok());
        if let Some(socket) = &socket {
            let _ = socket.set_nonblocking(true);
        }

        let watchdog_usec = std::env::var("WATCHDOG_USEC")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&usec| usec > 0);

        Self {
            socket,
            destination,
            pending: VecDeque::new(),
            watchdog_usec,
            watched: false,
        }
    }

    pub fn watchdog_usec(&self) -> Option<u64> {
        self.watchdog_usec
    }

    pub fn enqueue(&mut self, message: &str) {
        if self.socket.is_some() {
            self.pending.push_back(message.to_string());
        }
    }

    /// Send as much of the queue as the socket accepts right now.
    pub fn flush(&mut self) -> NotifyFlush {
        let (Some(socket), Some(destination)) = (&self.socket, &self.destination) else {
            self.pending.clear();
            return NotifyFlush::Idle;
        };

        while let Some(message) = self.pending.front() {
            match send_notify(socket, destination, message.as_bytes()) {
                Ok(()) => {
                    self.pending.pop_front();
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return NotifyFlush::WouldBlock;
                }
                Err(err) => {
                    // Supervisor IPC failures are never fatal; drop the
                    // message and move on.
                    debug!(error = %err, "notify send failed");
                    self.pending.pop_front();
                }
            }
        }

        NotifyFlush::Idle
    }

    pub fn watch(&mut self, epoll: &nix::sys::epoll::Epoll, token: u64) -> io::Result<()> {
        let Some(socket) = &self.socket else {
            return Ok(());
        };
        if self.watched {
            return Ok(());
        }

        epoll
            .add(
                socket.as_fd(),
                nix::sys::epoll::EpollEvent::new(nix::sys::epoll::EpollFlags::EPOLLOUT, token),
            )
            .map_err(io::Error::from)?;
        self.watched = true;
        Ok(())
    }

    pub fn unwatch(&mut self, epoll: &nix::sys::epoll::Epoll) -> io::Result<()> {
        let Some(socket) = &self.socket else {
            return Ok(());
        };
        if !self.watched {
            return Ok(());
        }

        epoll.delete(socket.as_fd()).map_err(io::Error::from)?;
        self.watched = false;
        Ok(())
    }
}

/// Send one notification datagram, handling abstract-namespace
/// destinations (leading `@`).
fn send_notify(socket: &UnixDatagram, destination: &[u8], payload: &[u8]) -> io::Result<()> {
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    if destination.len() >= addr.sun_path.len() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "path too long"));
    }

    for (i, &byte) in destination.iter().enumerate() {
        // Abstract sockets replace the leading '@' with a NUL.
        addr.sun_path[i] = if i == 0 && byte == b'@' { 0 } else { byte as libc::c_char };
    }

    let len = (std::mem::size_of::<libc::sa_family_t>() + destination.len()) as libc::socklen_t;

    let rc = unsafe {
        libc::sendto(
            socket.as_raw_fd(),
            payload.as_ptr().cast(),
            payload.len(),
            libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL,
            (&addr as *const libc::sockaddr_un).cast(),
            len,
        )
    };

    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
