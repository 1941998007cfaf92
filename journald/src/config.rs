//! Daemon configuration.
//!
//! Settings come from a `journald.conf`-style file (`[Journal]` section,
//! `Key=Value` lines) with kernel command-line overrides applied on top
//! under the `systemd.journald.` prefix. Syntax errors never abort the
//! daemon: the offending value is clamped to the nearest valid one or
//! replaced by its default, with a warning.

use journal_common::{Priority, USEC_PER_SEC};
use journal_file::ConfiguredMetrics;
use std::path::Path;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/systemd/journald.conf";
const CMDLINE_PREFIX: &str = "systemd.journald.";

/// Smallest permitted line length; shorter configurations are clamped up.
pub const LINE_MAX_MIN: u64 = 79;
/// Largest permitted line length (`SSIZE_MAX − 1`).
pub const LINE_MAX_MAX: u64 = (libc::ssize_t::MAX - 1) as u64;
pub const LINE_MAX_DEFAULT: u64 = 48 * 1024;

const DEFAULT_COMPRESS_THRESHOLD: u64 = 512;
const DEFAULT_RATE_LIMIT_INTERVAL_USEC: u64 = 30 * USEC_PER_SEC;
const DEFAULT_RATE_LIMIT_BURST: u64 = 10_000;
const DEFAULT_SYNC_INTERVAL_USEC: u64 = 5 * 60 * USEC_PER_SEC;
const DEFAULT_MAX_FILE_USEC: u64 = 30 * 24 * 3600 * USEC_PER_SEC;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Storage {
    #[default]
    Auto,
    Volatile,
    Persistent,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitMode {
    None,
    #[default]
    Uid,
    Login,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub storage: Storage,
    /// `Some(threshold)` compresses values at or above the threshold.
    pub compress: Option<u64>,
    pub seal: bool,
    pub split_mode: SplitMode,

    pub rate_limit_interval_usec: u64,
    pub rate_limit_burst: u64,

    pub system_metrics: ConfiguredMetrics,
    pub runtime_metrics: ConfiguredMetrics,

    pub max_retention_usec: Option<u64>,
    pub max_file_usec: Option<u64>,
    pub sync_interval_usec: u64,

    pub line_max: u64,

    pub max_level_store: Priority,
    pub max_level_syslog: Priority,
    pub max_level_kmsg: Priority,
    pub max_level_console: Priority,
    pub max_level_wall: Priority,

    pub forward_to_syslog: bool,
    pub forward_to_kmsg: bool,
    pub forward_to_console: bool,
    pub forward_to_wall: bool,

    /// Whether to subscribe to the kernel audit stream.
    pub audit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: Storage::default(),
            compress: Some(DEFAULT_COMPRESS_THRESHOLD),
            seal: false,
            split_mode: SplitMode::default(),
            rate_limit_interval_usec: DEFAULT_RATE_LIMIT_INTERVAL_USEC,
            rate_limit_burst: DEFAULT_RATE_LIMIT_BURST,
            system_metrics: ConfiguredMetrics::default(),
            runtime_metrics: ConfiguredMetrics::default(),
            max_retention_usec: None,
            max_file_usec: Some(DEFAULT_MAX_FILE_USEC),
            sync_interval_usec: DEFAULT_SYNC_INTERVAL_USEC,
            line_max: LINE_MAX_DEFAULT,
            max_level_store: Priority::Debug,
            max_level_syslog: Priority::Debug,
            max_level_kmsg: Priority::Notice,
            max_level_console: Priority::Info,
            max_level_wall: Priority::Emergency,
            forward_to_syslog: false,
            forward_to_kmsg: false,
            forward_to_console: false,
            forward_to_wall: true,
            audit: true,
        }
    }
}

impl Config {
    /// Load the configuration file (if present), then apply kernel
    /// command-line overrides.
    pub fn load(path: Option<&Path>) -> Self {
        let mut config = Config::default();

        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        match std::fs::read_to_string(path) {
            Ok(content) => config.apply_file(&content),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot read configuration");
            }
        }

        if let Ok(cmdline) = std::fs::read_to_string("/proc/cmdline") {
            config.apply_cmdline(&cmdline);
        }

        config
    }

    pub fn apply_file(&mut self, content: &str) {
        let mut in_journal_section = true;

        for raw_line in content.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                in_journal_section = section.eq_ignore_ascii_case("Journal");
                continue;
            }
            if !in_journal_section {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                warn!(line = raw_line, "ignoring malformed configuration line");
                continue;
            };

            self.apply_assignment(key.trim(), value.trim());
        }
    }

    /// Kernel command line overrides take precedence over the file.
    pub fn apply_cmdline(&mut self, cmdline: &str) {
        for word in cmdline.split_ascii_whitespace() {
            let Some(rest) = word.strip_prefix(CMDLINE_PREFIX) else {
                continue;
            };
            let Some((key, value)) = rest.split_once('=') else {
                continue;
            };
            self.apply_assignment(key, value);
        }
    }

    fn apply_assignment(&mut self, key: &str, value: &str) {
        match key {
            "Storage" => match value {
                "auto" => self.storage = Storage::Auto,
                "volatile" => self.storage = Storage::Volatile,
                "persistent" => self.storage = Storage::Persistent,
                "none" => self.storage = Storage::None,
                _ => warn!(value, "invalid Storage=, keeping previous"),
            },
            "Compress" => self.compress = parse_compress(value, self.compress),
            "Seal" => apply_bool(key, value, &mut self.seal),
            "SplitMode" => match value {
                "none" => self.split_mode = SplitMode::None,
                "uid" => self.split_mode = SplitMode::Uid,
                "login" => self.split_mode = SplitMode::Login,
                _ => warn!(value, "invalid SplitMode=, keeping previous"),
            },
            "RateLimitIntervalSec" => {
                if let Some(usec) = parse_sec(value) {
                    self.rate_limit_interval_usec = usec;
                } else {
                    warn!(value, "invalid RateLimitIntervalSec=");
                }
            }
            "RateLimitBurst" => match value.parse() {
                Ok(burst) => self.rate_limit_burst = burst,
                Err(_) => warn!(value, "invalid RateLimitBurst="),
            },
            "SystemMaxUse" => apply_size(key, value, &mut self.system_metrics.max_use),
            "SystemKeepFree" => apply_size(key, value, &mut self.system_metrics.keep_free),
            "SystemMaxFileSize" => apply_size(key, value, &mut self.system_metrics.max_file_size),
            "SystemMaxFiles" => apply_count(key, value, &mut self.system_metrics.n_max_files),
            "RuntimeMaxUse" => apply_size(key, value, &mut self.runtime_metrics.max_use),
            "RuntimeKeepFree" => apply_size(key, value, &mut self.runtime_metrics.keep_free),
            "RuntimeMaxFileSize" => {
                apply_size(key, value, &mut self.runtime_metrics.max_file_size)
            }
            "RuntimeMaxFiles" => apply_count(key, value, &mut self.runtime_metrics.n_max_files),
            "MaxRetentionSec" => {
                self.max_retention_usec = parse_sec(value).filter(|&usec| usec > 0);
            }
            "MaxFileSec" => {
                self.max_file_usec = parse_sec(value).filter(|&usec| usec > 0);
            }
            "SyncIntervalSec" => {
                if let Some(usec) = parse_sec(value).filter(|&usec| usec > 0) {
                    self.sync_interval_usec = usec;
                } else {
                    warn!(value, "invalid SyncIntervalSec=");
                }
            }
            "LineMax" => {
                let parsed = parse_size(value);
                match parsed {
                    Some(requested) => self.line_max = clamp_line_max(requested),
                    None => warn!(value, "invalid LineMax="),
                }
            }
            "MaxLevelStore" => apply_level(key, value, &mut self.max_level_store),
            "MaxLevelSyslog" => apply_level(key, value, &mut self.max_level_syslog),
            "MaxLevelKMsg" => apply_level(key, value, &mut self.max_level_kmsg),
            "MaxLevelConsole" => apply_level(key, value, &mut self.max_level_console),
            "MaxLevelWall" => apply_level(key, value, &mut self.max_level_wall),
            "Audit" => apply_bool(key, value, &mut self.audit),
            "ForwardToSyslog" => apply_bool(key, value, &mut self.forward_to_syslog),
            "ForwardToKMsg" => apply_bool(key, value, &mut self.forward_to_kmsg),
            "ForwardToConsole" => apply_bool(key, value, &mut self.forward_to_console),
            "ForwardToWall" => apply_bool(key, value, &mut self.forward_to_wall),
            _ => warn!(key, "unknown configuration key"),
        }
    }
}

pub fn clamp_line_max(requested: u64) -> u64 {
    if requested < LINE_MAX_MIN {
        warn!(requested, "LineMax= below minimum, clamping");
        LINE_MAX_MIN
    } else if requested > LINE_MAX_MAX {
        warn!(requested, "LineMax= above maximum, clamping");
        LINE_MAX_MAX
    } else {
        requested
    }
}

fn apply_bool(key: &str, value: &str, target: &mut bool) {
    match parse_bool(value) {
        Some(parsed) => *target = parsed,
        None => warn!(key, value, "invalid boolean"),
    }
}

fn apply_size(key: &str, value: &str, target: &mut Option<u64>) {
    if value.is_empty() {
        *target = None;
        return;
    }
    match parse_size(value) {
        Some(parsed) => *target = Some(parsed),
        None => warn!(key, value, "invalid size"),
    }
}

fn apply_count(key: &str, value: &str, target: &mut Option<u64>) {
    match value.parse() {
        Ok(parsed) => *target = Some(parsed),
        Err(_) => warn!(key, value, "invalid count"),
    }
}

fn apply_level(key: &str, value: &str, target: &mut Priority) {
    match parse_level(value) {
        Some(parsed) => *target = parsed,
        None => warn!(key, value, "invalid log level"),
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "yes" | "true" | "on" => Some(true),
        "0" | "no" | "false" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a size with optional binary suffix (`K`, `M`, `G`, `T`).
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let (digits, multiplier) = match value.as_bytes()[value.len() - 1] {
        b'K' => (&value[..value.len() - 1], 1u64 << 10),
        b'M' => (&value[..value.len() - 1], 1u64 << 20),
        b'G' => (&value[..value.len() - 1], 1u64 << 30),
        b'T' => (&value[..value.len() - 1], 1u64 << 40),
        _ => (value, 1),
    };

    digits.trim().parse::<u64>().ok()?.checked_mul(multiplier)
}

/// Parse a time span into microseconds. Plain numbers are seconds;
/// `us`, `ms`, `s`, `min`, `h`, `day`/`d`, `week`/`w`, `month`, `year`
/// suffixes are understood.
pub fn parse_sec(value: &str) -> Option<u64> {
    const UNITS: &[(&str, u64)] = &[
        ("usec", 1),
        ("us", 1),
        ("msec", 1_000),
        ("ms", 1_000),
        ("seconds", USEC_PER_SEC),
        ("second", USEC_PER_SEC),
        ("sec", USEC_PER_SEC),
        ("s", USEC_PER_SEC),
        ("minutes", 60 * USEC_PER_SEC),
        ("minute", 60 * USEC_PER_SEC),
        ("min", 60 * USEC_PER_SEC),
        ("m", 60 * USEC_PER_SEC),
        ("hours", 3600 * USEC_PER_SEC),
        ("hour", 3600 * USEC_PER_SEC),
        ("h", 3600 * USEC_PER_SEC),
        ("days", 24 * 3600 * USEC_PER_SEC),
        ("day", 24 * 3600 * USEC_PER_SEC),
        ("d", 24 * 3600 * USEC_PER_SEC),
        ("weeks", 7 * 24 * 3600 * USEC_PER_SEC),
        ("week", 7 * 24 * 3600 * USEC_PER_SEC),
        ("w", 7 * 24 * 3600 * USEC_PER_SEC),
        ("month", 30 * 24 * 3600 * USEC_PER_SEC + 12 * 3600 * USEC_PER_SEC),
        ("year", 365 * 24 * 3600 * USEC_PER_SEC + 6 * 3600 * USEC_PER_SEC),
    ];

    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(seconds) = value.parse::<u64>() {
        return seconds.checked_mul(USEC_PER_SEC);
    }

    let split = value.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits.parse().ok()?;
    let (_, factor) = UNITS.iter().find(|(name, _)| *name == unit.trim())?;
    amount.checked_mul(*factor)
}

/// `Compress=` takes a boolean or a size threshold; the empty string
/// keeps the current setting.
fn parse_compress(value: &str, current: Option<u64>) -> Option<u64> {
    if value.is_empty() {
        return current;
    }

    if let Some(enabled) = parse_bool(value) {
        return enabled.then_some(DEFAULT_COMPRESS_THRESHOLD);
    }

    match parse_size(value) {
        Some(threshold) => Some(threshold),
        None => {
            warn!(value, "invalid Compress=, keeping previous");
            current
        }
    }
}

/// Integer or symbolic syslog priority.
pub fn parse_level(value: &str) -> Option<Priority> {
    if let Ok(level) = value.parse::<u8>() {
        return Priority::from_value(level);
    }

    match value {
        "emerg" => Some(Priority::Emergency),
        "alert" => Some(Priority::Alert),
        "crit" => Some(Priority::Critical),
        "err" => Some(Priority::Error),
        "warning" => Some(Priority::Warning),
        "notice" => Some(Priority::Notice),
        "info" => Some(Priority::Info),
        "debug" => Some(Priority::Debug),
        _ => None,
    }
}
