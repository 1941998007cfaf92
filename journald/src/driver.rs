//! Records the daemon writes about its own behavior.
//!
//! Driver messages carry a `MESSAGE_ID` identifying the event class plus
//! the daemon's own trusted fields. They bypass the rate limiter and are
//! built fully in place; a failure to store one is logged and never
//! produces another driver message, so the path cannot recurse.

use journal_common::{Id128, Priority, hostname};

pub const SD_MESSAGE_JOURNAL_START: &str = "f77379a8490b408bbe5f6940505a777b";
pub const SD_MESSAGE_JOURNAL_STOP: &str = "d93fb3c9c24d451a97cea615ce59c00b";
pub const SD_MESSAGE_JOURNAL_USAGE: &str = "ec387f577b844b8fa948f33cad9a75e6";
pub const SD_MESSAGE_JOURNAL_DROPPED: &str = "a596d6fe7bfa4994828e72309e95d61e";
pub const SD_MESSAGE_JOURNAL_FLUSHED: &str = "93a1b5b6b22044c28d9ecf0b76ff4b83";
pub const SD_MESSAGE_JOURNAL_ROTATED: &str = "c7a787079b354eaaa9e77b371893cd27";

/// Identity attached to every driver record.
pub struct Driver {
    pid: u32,
    uid: u32,
    gid: u32,
    machine_id: Id128,
    boot_id: Id128,
    hostname: String,
}

impl Driver {
    pub fn new(machine_id: Id128, boot_id: Id128) -> Self {
        Self {
            pid: std::process::id(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            machine_id,
            boot_id,
            hostname: hostname(),
        }
    }

    /// Build a complete driver record. `extra` fields follow the message
    /// so readers see `MESSAGE_ID`, `PRIORITY` and `MESSAGE` first.
    pub fn record(
        &self,
        message_id: &str,
        priority: Priority,
        message: &str,
        extra: &[(&[u8], String)],
    ) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut items: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(10 + extra.len());

        let mut push = |name: &[u8], value: String| {
            items.push((name.to_vec(), value.into_bytes()));
        };

        push(b"MESSAGE_ID", message_id.to_string());
        push(b"PRIORITY", priority.value().to_string());
        push(b"MESSAGE", message.to_string());

        for (name, value) in extra {
            push(name, value.clone());
        }

        push(b"_TRANSPORT", "driver".to_string());
        push(b"_PID", self.pid.to_string());
        push(b"_UID", self.uid.to_string());
        push(b"_GID", self.gid.to_string());
        push(b"_COMM", "systemd-journald".to_string());
        push(b"_BOOT_ID", self.boot_id.to_string());
        push(b"_MACHINE_ID", self.machine_id.to_string());
        push(b"_HOSTNAME", self.hostname.clone());

        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_enrichment_complete() {
        let driver = Driver::new(Id128([1; 16]), Id128([2; 16]));
        let items = driver.record(
            SD_MESSAGE_JOURNAL_DROPPED,
            Priority::Warning,
            "Suppressed 7 messages from foo.service",
            &[(b"N_DROPPED", 7.to_string())],
        );

        let names: Vec<&[u8]> = items.iter().map(|(n, _)| n.as_slice()).collect();
        assert!(names.contains(&b"MESSAGE_ID".as_slice()));
        assert!(names.contains(&b"N_DROPPED".as_slice()));
        assert!(names.contains(&b"_PID".as_slice()));
        assert!(names.contains(&b"_HOSTNAME".as_slice()));

        let transport = items
            .iter()
            .find(|(n, _)| n == b"_TRANSPORT")
            .map(|(_, v)| v.clone())
            .unwrap();
        assert_eq!(transport, b"driver");
    }
}
