//! The ingestion dispatcher.
//!
//! One cooperative loop owns every descriptor: the ingestion sockets,
//! the signalfd, the coalescing timers, the hostname watcher and the
//! supervisor notification socket. There are no worker threads and no
//! shared state; suspension happens only in `epoll_wait`, and the
//! notification socket is strictly non-blocking so a stalled supervisor
//! can never deadlock the daemon.
//!
//! Within one readiness batch, ingestion descriptors are drained before
//! signals are acted on, which is what makes TERM "late": everything
//! the kernel already queued reaches the journal before the exit path
//! runs.

use crate::config::Config;
use crate::context::ContextCache;
use crate::driver::{
    SD_MESSAGE_JOURNAL_DROPPED, SD_MESSAGE_JOURNAL_ROTATED, SD_MESSAGE_JOURNAL_START,
    SD_MESSAGE_JOURNAL_STOP, SD_MESSAGE_JOURNAL_USAGE,
};
use crate::error::{Result, ServerError};
use crate::kmsg::{self, KernelSeqnum};
use crate::native;
use crate::ratelimit::JournalRateLimit;
use crate::record::{ParsedRecord, Transport};
use crate::server::sockets::UnixCreds;
use crate::storage::{JournalTiers, Paths};
use crate::stream::StdoutStream;
use crate::syslog;
use crate::audit;
use journal_common::{Id128, Microseconds, Priority, hostname};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use tracing::{debug, info, warn};

mod signals;
mod sockets;

pub use signals::SignalEvent;

/// Epoll tokens, in dispatch-priority order (lower first). Signals come
/// last so a TERM never preempts queued datagrams in the same batch.
const TOKEN_KMSG: u64 = 1;
const TOKEN_AUDIT: u64 = 2;
const TOKEN_NATIVE: u64 = 3;
const TOKEN_SYSLOG: u64 = 4;
const TOKEN_STREAM_LISTENER: u64 = 5;
const TOKEN_HOSTNAME: u64 = 6;
const TOKEN_NOTIFY: u64 = 7;
const TOKEN_SYNC_TIMER: u64 = 8;
const TOKEN_POST_TIMER: u64 = 9;
const TOKEN_WATCHDOG: u64 = 10;
const TOKEN_SIGNAL: u64 = 11;
const TOKEN_STREAM_BASE: u64 = 1000;

/// Delay before change notifications are published, coalescing bursts.
const POST_CHANGE_TIMER_USEC: u64 = 250_000;

/// Native datagrams larger than this are truncated reads and dropped.
const DATAGRAM_MAX: usize = 256 * 1024;

pub struct Dispatcher {
    config: Config,
    epoll: Epoll,
    tiers: JournalTiers,
    ratelimit: JournalRateLimit,
    contexts: ContextCache,
    hostname: String,
    machine_id: Id128,
    boot_id: Id128,

    native_fd: Option<OwnedFd>,
    syslog_fd: Option<OwnedFd>,
    stream_listener: Option<OwnedFd>,
    streams: HashMap<u64, StdoutStream>,
    next_stream_token: u64,

    kmsg_fd: Option<OwnedFd>,
    kernel_seqnum: Option<KernelSeqnum>,
    audit_fd: Option<OwnedFd>,

    signal_fd: Option<signals::SignalFd>,
    sync_timer: sockets::OneshotTimer,
    sync_armed: bool,
    post_timer: sockets::OneshotTimer,
    post_armed: bool,
    watchdog_timer: sockets::OneshotTimer,
    watchdog_usec: Option<u64>,

    hostname_fd: Option<OwnedFd>,
    notify: sockets::NotifySocket,

    exiting: bool,
}

impl Dispatcher {
    /// Build the dispatcher: load identities, open journals, claim
    /// supervisor-passed sockets or bind our own, install the signalfd
    /// and timers. Fails only when the event loop itself or every
    /// ingestion socket is unavailable.
    pub fn new(config: Config, paths: Paths) -> Result<Self> {
        let machine_id = Id128::machine_id().unwrap_or_else(|err| {
            warn!(error = %err, "cannot read machine id, using a transient one");
            Id128::random()
        });
        let boot_id = Id128::boot_id().unwrap_or_else(|err| {
            warn!(error = %err, "cannot read boot id, using a transient one");
            Id128::random()
        });

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|errno| ServerError::EventLoop(errno.into()))?;

        let tiers = JournalTiers::new(&config, paths.clone(), machine_id, boot_id);

        let mut dispatcher = Self {
            ratelimit: JournalRateLimit::new(
                config.rate_limit_interval_usec,
                config.rate_limit_burst,
            ),
            epoll,
            tiers,
            contexts: ContextCache::default(),
            hostname: hostname(),
            machine_id,
            boot_id,
            native_fd: None,
            syslog_fd: None,
            stream_listener: None,
            streams: HashMap::new(),
            next_stream_token: TOKEN_STREAM_BASE,
            kmsg_fd: None,
            kernel_seqnum: None,
            audit_fd: None,
            signal_fd: None,
            sync_timer: sockets::OneshotTimer::new()?,
            sync_armed: false,
            post_timer: sockets::OneshotTimer::new()?,
            post_armed: false,
            watchdog_timer: sockets::OneshotTimer::new()?,
            watchdog_usec: None,
            hostname_fd: None,
            notify: sockets::NotifySocket::from_env(),
            exiting: false,
            config,
        };

        dispatcher.open_sockets(&paths)?;
        dispatcher.install_signals()?;
        dispatcher.register_all()?;

        dispatcher.tiers.open_all()?;
        dispatcher.emit_start_message();

        Ok(dispatcher)
    }

    fn open_sockets(&mut self, paths: &Paths) -> Result<()> {
        let inherited = sockets::take_listen_fds();

        let mut restored_streams = Vec::new();
        for fd in inherited {
            match sockets::classify(&fd, paths) {
                sockets::Classified::Native => self.native_fd = Some(fd),
                sockets::Classified::Syslog => self.syslog_fd = Some(fd),
                sockets::Classified::StreamListener => self.stream_listener = Some(fd),
                sockets::Classified::StreamConnection => restored_streams.push(fd),
                sockets::Classified::Audit => self.audit_fd = Some(fd),
                sockets::Classified::Unknown => {
                    debug!("dropping unclassifiable inherited descriptor");
                }
            }
        }

        if self.native_fd.is_none() {
            self.native_fd = sockets::bind_datagram(&paths.flags_dir.join("socket"), true);
        }
        if self.syslog_fd.is_none() {
            self.syslog_fd = sockets::bind_datagram(&paths.flags_dir.join("dev-log"), true);
        }
        if self.stream_listener.is_none() {
            self.stream_listener = sockets::bind_stream(&paths.flags_dir.join("stdout"));
        }
        if self.audit_fd.is_none() && self.config.audit {
            self.audit_fd = sockets::open_audit();
        }

        self.kmsg_fd = sockets::open_kmsg(&paths.kmsg_device);
        if self.kmsg_fd.is_some() {
            match KernelSeqnum::open(&paths.flags_dir.join("kernel-seqnum")) {
                Ok(seqnum) => self.kernel_seqnum = Some(seqnum),
                Err(err) => warn!(error = %err, "cannot persist kernel seqnum"),
            }
        }

        self.hostname_fd = sockets::open_hostname();

        if self.native_fd.is_none()
            && self.syslog_fd.is_none()
            && self.stream_listener.is_none()
            && self.kmsg_fd.is_none()
            && self.audit_fd.is_none()
        {
            return Err(ServerError::NoSockets);
        }

        // Inherited stream connections continue without a header.
        for fd in restored_streams {
            let token = self.next_stream_token;
            self.next_stream_token += 1;
            let stream = StdoutStream::restore(fd, self.config.line_max as usize);
            self.epoll_add(stream.fd(), token)?;
            self.streams.insert(token, stream);
        }

        Ok(())
    }

    fn install_signals(&mut self) -> Result<()> {
        match signals::SignalFd::install() {
            Ok(fd) => {
                self.signal_fd = Some(fd);
                Ok(())
            }
            Err(err) => {
                // Without signals we still collect logs; flushing and
                // clean shutdown degrade.
                warn!(error = %err, "cannot install signalfd");
                Ok(())
            }
        }
    }

    fn epoll_add(&self, fd: BorrowedFd<'_>, token: u64) -> Result<()> {
        self.epoll
            .add(fd, EpollEvent::new(EpollFlags::EPOLLIN, token))
            .map_err(|errno| ServerError::EventLoop(errno.into()))
    }

    fn register_all(&mut self) -> Result<()> {
        if let Some(fd) = &self.native_fd {
            self.epoll_add(fd.as_fd(), TOKEN_NATIVE)?;
        }
        if let Some(fd) = &self.syslog_fd {
            self.epoll_add(fd.as_fd(), TOKEN_SYSLOG)?;
        }
        if let Some(fd) = &self.stream_listener {
            self.epoll_add(fd.as_fd(), TOKEN_STREAM_LISTENER)?;
        }
        if let Some(fd) = &self.kmsg_fd {
            self.epoll_add(fd.as_fd(), TOKEN_KMSG)?;
        }
        if let Some(fd) = &self.audit_fd {
            self.epoll_add(fd.as_fd(), TOKEN_AUDIT)?;
        }
        if let Some(fd) = &self.signal_fd {
            self.epoll_add(fd.as_fd(), TOKEN_SIGNAL)?;
        }
        if let Some(fd) = &self.hostname_fd {
            self.epoll
                .add(
                    fd.as_fd(),
                    EpollEvent::new(EpollFlags::EPOLLPRI | EpollFlags::EPOLLERR, TOKEN_HOSTNAME),
                )
                .map_err(|errno| ServerError::EventLoop(errno.into()))?;
        }

        self.epoll_add(self.sync_timer.fd(), TOKEN_SYNC_TIMER)?;
        self.epoll_add(self.post_timer.fd(), TOKEN_POST_TIMER)?;
        self.epoll_add(self.watchdog_timer.fd(), TOKEN_WATCHDOG)?;

        if let Some(usec) = self.notify.watchdog_usec() {
            self.watchdog_usec = Some(usec);
            self.watchdog_timer.arm(usec / 2);
        }

        Ok(())
    }

    /// Run until terminated.
    pub fn run(&mut self) -> Result<()> {
        self.notify.enqueue("READY=1");
        self.pump_notify();

        while !self.exiting {
            self.dispatch_once(EpollTimeout::NONE)?;
        }

        self.shutdown();
        Ok(())
    }

    /// Wait for one readiness batch and dispatch it completely. Exposed
    /// so tests can drive the loop without signals.
    pub fn dispatch_once(&mut self, timeout: EpollTimeout) -> Result<usize> {
        let mut events = [EpollEvent::empty(); 32];

        let n = match self.epoll.wait(&mut events, timeout) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => return Ok(0),
            Err(errno) => return Err(ServerError::EventLoop(errno.into())),
        };

        // Ingestion before signals: the token order encodes the
        // priority contract.
        let mut batch: Vec<(u64, EpollFlags)> = events[..n]
            .iter()
            .map(|event| (event.data(), event.events()))
            .collect();
        batch.sort_by_key(|(token, _)| *token);

        for (token, flags) in batch {
            self.dispatch(token, flags);
        }

        Ok(n)
    }

    fn dispatch(&mut self, token: u64, flags: EpollFlags) {
        match token {
            TOKEN_KMSG => self.drain_kmsg(),
            TOKEN_AUDIT => self.drain_audit(),
            TOKEN_NATIVE => self.drain_native(),
            TOKEN_SYSLOG => self.drain_syslog(),
            TOKEN_STREAM_LISTENER => self.accept_streams(),
            TOKEN_HOSTNAME => self.on_hostname_change(),
            TOKEN_NOTIFY => self.pump_notify(),
            TOKEN_SYNC_TIMER => self.on_sync_timer(),
            TOKEN_POST_TIMER => self.on_post_timer(),
            TOKEN_WATCHDOG => self.on_watchdog(),
            TOKEN_SIGNAL => self.drain_signals(),
            _ => self.drain_stream(token, flags),
        }
    }

    // ── Ingestion ────────────────────────────────────────────────

    fn drain_native(&mut self) {
        let mut pending = Vec::new();

        {
            let Some(fd) = &self.native_fd else { return };
            let fd = fd.as_fd();

            loop {
                let mut buffer = vec![0u8; DATAGRAM_MAX];
                match sockets::recv_with_ancillary(fd, &mut buffer) {
                    Ok(None) => break,
                    Ok(Some(message)) => {
                        let payload: Vec<u8> = match message.passed_fds.len() {
                            0 => buffer[..message.length].to_vec(),
                            1 => {
                                // A single descriptor is a sealed-file
                                // payload replacing the datagram body.
                                match sockets::read_sealed_payload(
                                    message.passed_fds.into_iter().next().unwrap(),
                                ) {
                                    Some(payload) => payload,
                                    None => continue,
                                }
                            }
                            n => {
                                debug!(n, "dropping native datagram with multiple descriptors");
                                continue;
                            }
                        };

                        if let Some(record) = native::parse_native(&payload) {
                            pending.push((record, message.creds));
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "native receive failed");
                        break;
                    }
                }
            }
        }

        for (record, creds) in pending {
            self.process_record(record, creds);
        }
    }

    fn drain_syslog(&mut self) {
        let line_max = self.config.line_max as usize;
        let mut pending = Vec::new();

        {
            let Some(fd) = &self.syslog_fd else { return };
            let fd = fd.as_fd();

            loop {
                let mut buffer = vec![0u8; line_max + 1];
                match sockets::recv_with_ancillary(fd, &mut buffer) {
                    Ok(None) => break,
                    Ok(Some(message)) => {
                        if !message.passed_fds.is_empty() {
                            // Descriptors have no meaning on this socket.
                            debug!("dropping legacy datagram with descriptor ancillary data");
                            continue;
                        }

                        if let Some(record) = syslog::parse_syslog(&buffer[..message.length]) {
                            pending.push((record, message.creds));
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "legacy receive failed");
                        break;
                    }
                }
            }
        }

        for (record, creds) in pending {
            self.process_record(record, creds);
        }
    }

    fn accept_streams(&mut self) {
        let Some(listener) = &self.stream_listener else {
            return;
        };

        loop {
            match sockets::accept_connection(listener.as_fd()) {
                Ok(Some(fd)) => {
                    let token = self.next_stream_token;
                    self.next_stream_token += 1;

                    let stream = StdoutStream::new(fd, self.config.line_max as usize);
                    if let Err(err) = self.epoll_add(stream.fd(), token) {
                        warn!(error = %err, "cannot watch stream connection");
                        continue;
                    }
                    self.streams.insert(token, stream);
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(error = %err, "stream accept failed");
                    break;
                }
            }
        }
    }

    fn drain_stream(&mut self, token: u64, flags: EpollFlags) {
        let Some(stream) = self.streams.get_mut(&token) else {
            return;
        };

        let creds = sockets::peer_credentials(stream.fd());
        let mut teardown = flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR);
        let mut records = Vec::new();

        loop {
            let mut buffer = vec![0u8; 4096];
            match sockets::read_fd(stream.fd(), &mut buffer) {
                Ok(0) => {
                    records.extend(stream.feed(b""));
                    teardown = true;
                    break;
                }
                Ok(n) => records.extend(stream.feed(&buffer[..n])),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(error = %err, "stream read failed");
                    teardown = true;
                    break;
                }
            }
        }

        if teardown {
            if let Some(stream) = self.streams.remove(&token) {
                let _ = self.epoll.delete(stream.fd());
            }
        }

        for record in records {
            self.process_record(record, creds);
        }
    }

    fn drain_kmsg(&mut self) {
        let mut pending = Vec::new();

        {
            let Some(fd) = &self.kmsg_fd else { return };
            let fd = fd.as_fd();

            loop {
                let mut buffer = vec![0u8; 8192];
                match sockets::read_fd(fd, &mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        let Some(entry) = kmsg::parse_kmsg(&buffer[..n]) else {
                            continue;
                        };

                        // Skip ring messages already stored by a previous
                        // incarnation.
                        if let Some(seqnum) = &mut self.kernel_seqnum {
                            if !seqnum.advance_to(entry.seqnum) {
                                continue;
                            }
                        }

                        pending.push(entry.record);
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.raw_os_error() == Some(libc::EPIPE) => {
                        // The ring overwrote our position; keep reading
                        // from the next record.
                        continue;
                    }
                    Err(err) => {
                        debug!(error = %err, "kmsg read failed");
                        break;
                    }
                }
            }
        }

        for record in pending {
            self.process_record(record, None);
        }
    }

    fn drain_audit(&mut self) {
        let mut pending = Vec::new();

        {
            let Some(fd) = &self.audit_fd else { return };
            let fd = fd.as_fd();

            loop {
                let mut buffer = vec![0u8; 64 * 1024];
                match sockets::read_fd(fd, &mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Some(record) = audit::parse_audit(&buffer[..n]) {
                            pending.push(record);
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        debug!(error = %err, "audit receive failed");
                        break;
                    }
                }
            }
        }

        for record in pending {
            self.process_record(record, None);
        }
    }

    // ── Record pipeline ──────────────────────────────────────────

    fn process_record(&mut self, record: ParsedRecord, creds: Option<UnixCreds>) {
        // Storage mask first; nothing below this level is our business.
        if record.priority > self.config.max_level_store {
            return;
        }

        let context = creds.map(|c| self.contexts.get(c.pid, c.uid, c.gid));

        // Rate limiting applies to per-process transports only; the
        // kernel, audit and our own driver records are exempt.
        if matches!(
            record.transport,
            Transport::Journal | Transport::Syslog | Transport::Stdout
        ) {
            let unit = context
                .as_ref()
                .and_then(|c| c.unit.clone())
                .or_else(|| record.identifier.clone())
                .unwrap_or_else(|| String::from("-"));

            let verdict = self.tiers.current_space();
            let admitted = self.ratelimit.check(
                &unit,
                record.priority,
                verdict.available,
                verdict.limit,
                Microseconds::now_monotonic(),
            );

            match admitted {
                0 => return,
                1 => {}
                k => self.emit_dropped_message(&unit, k - 1),
            }
        }

        let priority = record.priority;
        let items = self.enrich(record, context.as_deref());
        let borrowed: Vec<(&[u8], &[u8])> = items
            .iter()
            .map(|(name, value)| (name.as_slice(), value.as_slice()))
            .collect();

        let split_uid = match self.config.split_mode {
            crate::config::SplitMode::Login => context
                .as_ref()
                .and_then(|c| c.owner_uid)
                .or(creds.map(|c| c.uid))
                .unwrap_or(0),
            _ => creds.map(|c| c.uid).unwrap_or(0),
        };

        // Write-time linearization: the dispatcher's clocks decide
        // ordering, not the sender's stamps.
        let realtime = Microseconds::now_realtime();
        let monotonic = Microseconds::now_monotonic();

        match self.tiers.write_entry(split_uid, realtime, monotonic, &borrowed) {
            Ok(true) => {
                self.schedule_sync(priority);
                self.arm_post_change();
            }
            Ok(false) => {}
            Err(err) => warn!(error = %err, "write failed fatally, entry lost"),
        }
    }

    /// Attach the trusted fields. Client-supplied items come first, in
    /// their original order.
    fn enrich(
        &self,
        record: ParsedRecord,
        context: Option<&crate::context::ClientContext>,
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut items = record.items;

        let mut push = |name: &[u8], value: String| {
            items.push((name.to_vec(), value.into_bytes()));
        };

        push(b"_TRANSPORT", record.transport.as_str().to_string());

        if let Some(ctx) = context {
            push(b"_PID", ctx.pid.to_string());
            push(b"_UID", ctx.uid.to_string());
            push(b"_GID", ctx.gid.to_string());

            let mut push_opt = |name: &[u8], value: &Option<String>| {
                if let Some(value) = value {
                    items.push((name.to_vec(), value.clone().into_bytes()));
                }
            };
            push_opt(b"_COMM", &ctx.comm);
            push_opt(b"_EXE", &ctx.exe);
            push_opt(b"_CMDLINE", &ctx.cmdline);
            push_opt(b"_SELINUX_CONTEXT", &ctx.selinux_context);
            push_opt(b"_SYSTEMD_CGROUP", &ctx.cgroup);
            push_opt(b"_SYSTEMD_UNIT", &ctx.unit);
            push_opt(b"_SYSTEMD_USER_UNIT", &ctx.user_unit);
            push_opt(b"_SYSTEMD_SLICE", &ctx.slice);
            push_opt(b"_SYSTEMD_USER_SLICE", &ctx.user_slice);
            push_opt(b"_SYSTEMD_SESSION", &ctx.session);

            if let Some(cap) = ctx.capability_effective {
                items.push((b"_CAP_EFFECTIVE".to_vec(), format!("{cap:x}").into_bytes()));
            }
            if let Some(session) = ctx.audit_session {
                items.push((b"_AUDIT_SESSION".to_vec(), session.to_string().into_bytes()));
            }
            if let Some(loginuid) = ctx.audit_loginuid {
                items.push((b"_AUDIT_LOGINUID".to_vec(), loginuid.to_string().into_bytes()));
            }
            if let Some(owner) = ctx.owner_uid {
                items.push((b"_SYSTEMD_OWNER_UID".to_vec(), owner.to_string().into_bytes()));
            }
            if let Some(invocation) = ctx.invocation_id {
                items.push((
                    b"_SYSTEMD_INVOCATION_ID".to_vec(),
                    invocation.to_string().into_bytes(),
                ));
            }
        } else if let Some(pid) = record.client_pid {
            items.push((b"_PID".to_vec(), pid.to_string().into_bytes()));
        }

        items.push((b"_BOOT_ID".to_vec(), self.boot_id.to_string().into_bytes()));
        items.push((
            b"_MACHINE_ID".to_vec(),
            self.machine_id.to_string().into_bytes(),
        ));
        items.push((b"_HOSTNAME".to_vec(), self.hostname.clone().into_bytes()));

        if let Some(source) = record.source_realtime {
            items.push((
                b"_SOURCE_REALTIME_TIMESTAMP".to_vec(),
                source.get().to_string().into_bytes(),
            ));
        }

        items
    }

    // ── Driver messages ──────────────────────────────────────────

    fn emit_start_message(&mut self) {
        let verdict = self.tiers.current_space();
        let items = self.tiers.driver().record(
            SD_MESSAGE_JOURNAL_START,
            Priority::Info,
            "Journal started",
            &[],
        );
        self.tiers.write_driver_record(&items);

        let items = self.tiers.driver().record(
            SD_MESSAGE_JOURNAL_USAGE,
            Priority::Info,
            &format!(
                "Journal is using {} of space, {} available",
                verdict.vfs_used, verdict.available
            ),
            &[
                (b"JOURNAL_CURRENT_USE", verdict.vfs_used.to_string()),
                (b"JOURNAL_AVAILABLE", verdict.available.to_string()),
                (b"JOURNAL_LIMIT", verdict.limit.to_string()),
            ],
        );
        self.tiers.write_driver_record(&items);
    }

    fn emit_dropped_message(&mut self, unit: &str, dropped: u64) {
        let items = self.tiers.driver().record(
            SD_MESSAGE_JOURNAL_DROPPED,
            Priority::Warning,
            &format!("Suppressed {dropped} messages from {unit}"),
            &[
                (b"N_DROPPED", dropped.to_string()),
                (b"UNIT", unit.to_string()),
            ],
        );
        self.tiers.write_driver_record(&items);
    }

    // ── Signals & timers ─────────────────────────────────────────

    fn drain_signals(&mut self) {
        let mut events = Vec::new();
        if let Some(signal_fd) = &self.signal_fd {
            while let Some(event) = signal_fd.read() {
                events.push(event);
            }
        }

        for event in events {
            match event {
                SignalEvent::FlushToVar => {
                    info!("received request to flush runtime journal");
                    if let Err(err) = self.tiers.flush_runtime_to_system() {
                        warn!(error = %err, "flush failed");
                    }
                }
                SignalEvent::RotateAndVacuum => {
                    info!("received request to rotate journal files");
                    self.rotate_all_with_notice();
                }
                SignalEvent::Sync => {
                    info!("received request to sync journal files");
                    self.tiers.sync_all();
                    self.sync_armed = false;
                }
                SignalEvent::Terminate => {
                    info!("received termination request");
                    self.exiting = true;
                }
            }
        }
    }

    fn rotate_all_with_notice(&mut self) {
        self.tiers.rotate_all();
        let items = self.tiers.driver().record(
            SD_MESSAGE_JOURNAL_ROTATED,
            Priority::Info,
            "Journal files rotated",
            &[],
        );
        self.tiers.write_driver_record(&items);
    }

    /// Arm the coalesced sync, or sync immediately for critical
    /// messages.
    fn schedule_sync(&mut self, priority: Priority) {
        if priority <= Priority::Critical {
            self.tiers.sync_all();
            self.sync_armed = false;
            return;
        }

        if !self.sync_armed {
            self.sync_timer.arm(self.config.sync_interval_usec);
            self.sync_armed = true;
        }
    }

    fn on_sync_timer(&mut self) {
        self.sync_timer.consume();
        self.sync_armed = false;
        self.tiers.sync_all();
    }

    fn arm_post_change(&mut self) {
        if !self.post_armed {
            self.post_timer.arm(POST_CHANGE_TIMER_USEC);
            self.post_armed = true;
        }
    }

    fn on_post_timer(&mut self) {
        self.post_timer.consume();
        self.post_armed = false;
        // Readers poll file mtimes; nothing further to publish here.
        debug!("change notification window closed");
    }

    fn on_watchdog(&mut self) {
        self.watchdog_timer.consume();
        if let Some(usec) = self.watchdog_usec {
            self.notify.enqueue("WATCHDOG=1");
            self.pump_notify();
            self.watchdog_timer.arm(usec / 2);
        }
    }

    fn on_hostname_change(&mut self) {
        if let Some(fd) = &self.hostname_fd {
            sockets::rewind(fd.as_fd());
        }

        let new_hostname = hostname();
        if new_hostname != self.hostname {
            info!(hostname = %new_hostname, "hostname changed");
            self.hostname = new_hostname;
        }
    }

    /// Push queued notifications without ever blocking; EPOLLOUT interest
    /// is registered only while something is pending.
    fn pump_notify(&mut self) {
        match self.notify.flush() {
            sockets::NotifyFlush::Idle => {
                let _ = self.notify.unwatch(&self.epoll);
            }
            sockets::NotifyFlush::WouldBlock => {
                if let Err(err) = self.notify.watch(&self.epoll, TOKEN_NOTIFY) {
                    debug!(error = %err, "cannot watch notify socket");
                }
            }
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────

    fn shutdown(&mut self) {
        self.notify.enqueue("STOPPING=1");
        self.pump_notify();

        // Late exit: drain anything the kernel still has queued before
        // the files go away.
        self.drain_native();
        self.drain_syslog();
        self.drain_kmsg();
        self.drain_audit();
        let stream_tokens: Vec<u64> = self.streams.keys().copied().collect();
        for token in stream_tokens {
            self.drain_stream(token, EpollFlags::empty());
        }

        let items = self.tiers.driver().record(
            SD_MESSAGE_JOURNAL_STOP,
            Priority::Info,
            "Journal stopped",
            &[],
        );
        self.tiers.write_driver_record(&items);

        self.tiers.sync_all();
        self.tiers.close_all();
        info!("journal daemon exiting");
    }

    // ── Accessors for tests and the binary ───────────────────────

    pub fn tiers_mut(&mut self) -> &mut JournalTiers {
        &mut self.tiers
    }

    pub fn request_exit(&mut self) {
        self.exiting = true;
    }

    pub fn exiting(&self) -> bool {
        self.exiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Storage;
    use journal_file::DirectoryReader;
    use std::os::unix::net::{UnixDatagram, UnixStream};
    use std::io::Write;

    fn test_dispatcher(root: &std::path::Path) -> Dispatcher {
        let config = Config {
            storage: Storage::Volatile,
            audit: false,
            ..Config::default()
        };
        Dispatcher::new(config, Paths::under(root)).unwrap()
    }

    fn drain(dispatcher: &mut Dispatcher) {
        // A few bounded batches; zero timeout returns immediately once
        // nothing is ready.
        for _ in 0..8 {
            dispatcher
                .dispatch_once(EpollTimeout::ZERO)
                .unwrap();
        }
    }

    fn read_messages(dir: &std::path::Path) -> Vec<String> {
        let mut reader = DirectoryReader::open(dir).unwrap();
        let mut messages = Vec::new();
        while let Some(record) = reader.next_entry().unwrap() {
            let message = record
                .items
                .iter()
                .find(|(n, _)| n == b"MESSAGE")
                .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();
            messages.push(message);
        }
        messages
    }

    #[test]
    fn native_datagram_reaches_journal() {
        let root = tempfile::TempDir::new().unwrap();
        let mut dispatcher = test_dispatcher(root.path());

        let socket_path = Paths::under(root.path()).flags_dir.join("socket");
        let client = UnixDatagram::unbound().unwrap();
        client
            .send_to(b"MESSAGE=native hello\nPRIORITY=5\n", &socket_path)
            .unwrap();

        drain(&mut dispatcher);
        dispatcher.tiers_mut().sync_all();

        let dir = dispatcher.tiers_mut().runtime_machine_dir();
        dispatcher.tiers_mut().close_all();

        let messages = read_messages(&dir);
        assert!(messages.iter().any(|m| m == "native hello"), "{messages:?}");
    }

    #[test]
    fn syslog_datagram_reaches_journal() {
        let root = tempfile::TempDir::new().unwrap();
        let mut dispatcher = test_dispatcher(root.path());

        let socket_path = Paths::under(root.path()).flags_dir.join("dev-log");
        let client = UnixDatagram::unbound().unwrap();
        client
            .send_to(b"<11>someapp[42]: legacy hello", &socket_path)
            .unwrap();

        drain(&mut dispatcher);

        let dir = dispatcher.tiers_mut().runtime_machine_dir();
        dispatcher.tiers_mut().close_all();

        let messages = read_messages(&dir);
        assert!(messages.iter().any(|m| m == "legacy hello"), "{messages:?}");
    }

    #[test]
    fn stream_connection_reaches_journal() {
        let root = tempfile::TempDir::new().unwrap();
        let mut dispatcher = test_dispatcher(root.path());

        let socket_path = Paths::under(root.path()).flags_dir.join("stdout");
        let mut client = UnixStream::connect(&socket_path).unwrap();
        client
            .write_all(b"tester\n\n6\n0\n0\n0\n0\nstreamed line one\n")
            .unwrap();

        drain(&mut dispatcher);
        drop(client);
        drain(&mut dispatcher);

        let dir = dispatcher.tiers_mut().runtime_machine_dir();
        dispatcher.tiers_mut().close_all();

        let messages = read_messages(&dir);
        assert!(
            messages.iter().any(|m| m == "streamed line one"),
            "{messages:?}"
        );
    }

    #[test]
    fn records_above_store_level_are_dropped() {
        let root = tempfile::TempDir::new().unwrap();
        let config = Config {
            storage: Storage::Volatile,
            max_level_store: Priority::Warning,
            audit: false,
            ..Config::default()
        };
        let mut dispatcher = Dispatcher::new(config, Paths::under(root.path())).unwrap();

        let socket_path = Paths::under(root.path()).flags_dir.join("socket");
        let client = UnixDatagram::unbound().unwrap();
        client
            .send_to(b"MESSAGE=too verbose\nPRIORITY=6\n", &socket_path)
            .unwrap();
        client
            .send_to(b"MESSAGE=important\nPRIORITY=3\n", &socket_path)
            .unwrap();

        drain(&mut dispatcher);

        let dir = dispatcher.tiers_mut().runtime_machine_dir();
        dispatcher.tiers_mut().close_all();

        let messages = read_messages(&dir);
        assert!(messages.iter().any(|m| m == "important"));
        assert!(!messages.iter().any(|m| m == "too verbose"));
    }

    #[test]
    fn enrichment_fields_are_attached() {
        let root = tempfile::TempDir::new().unwrap();
        let mut dispatcher = test_dispatcher(root.path());

        let socket_path = Paths::under(root.path()).flags_dir.join("socket");
        let client = UnixDatagram::unbound().unwrap();
        client
            .send_to(b"MESSAGE=check fields\n", &socket_path)
            .unwrap();

        drain(&mut dispatcher);

        let dir = dispatcher.tiers_mut().runtime_machine_dir();
        dispatcher.tiers_mut().close_all();

        let mut reader = DirectoryReader::open(&dir).unwrap();
        let mut found = false;
        while let Some(record) = reader.next_entry().unwrap() {
            let is_ours = record
                .items
                .iter()
                .any(|(n, v)| n == b"MESSAGE" && v == b"check fields");
            if !is_ours {
                continue;
            }
            found = true;

            let names: Vec<Vec<u8>> = record.items.iter().map(|(n, _)| n.clone()).collect();
            for required in [
                b"_TRANSPORT".as_slice(),
                b"_PID".as_slice(),
                b"_UID".as_slice(),
                b"_GID".as_slice(),
                b"_COMM".as_slice(),
                b"_BOOT_ID".as_slice(),
                b"_HOSTNAME".as_slice(),
            ] {
                assert!(
                    names.iter().any(|n| n == required),
                    "missing {}",
                    String::from_utf8_lossy(required)
                );
            }
        }
        assert!(found);
    }
}
