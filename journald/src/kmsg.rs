//! Kernel ring buffer ingestion.
//!
//! `/dev/kmsg` yields one message per read:
//! `priority,seqnum,usec,flags;message`, followed by continuation lines
//! (one leading space, `KEY=value`) for device metadata. Binary bytes in
//! the message arrive as `\xHH` escapes.
//!
//! The kernel replays the whole ring to every new reader, so the seqnum
//! of the last stored message is kept in a small shared-memory file and
//! survives daemon restarts; everything at or below it is skipped.

use crate::record::{ParsedRecord, Transport};
use journal_common::Priority;
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::Path;
use tracing::debug;

/// Parsed kernel message plus its ring seqnum.
pub struct KmsgEntry {
    pub seqnum: u64,
    pub record: ParsedRecord,
}

/// Undo the kernel's `\xHH` escaping.
fn unescape(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len());
    let mut rest = message;

    while let Some(&byte) = rest.first() {
        if byte == b'\\' && rest.len() >= 4 && rest[1] == b'x' {
            if let Ok(value) = u8::from_str_radix(&String::from_utf8_lossy(&rest[2..4]), 16) {
                out.push(value);
                rest = &rest[4..];
                continue;
            }
        }
        out.push(byte);
        rest = &rest[1..];
    }

    out
}

/// Parse one `/dev/kmsg` read.
pub fn parse_kmsg(payload: &[u8]) -> Option<KmsgEntry> {
    let mut lines = payload.split(|&b| b == b'\n');
    let first = lines.next()?;

    let semicolon = first.iter().position(|&b| b == b';')?;
    let (prefix, message) = (&first[..semicolon], &first[semicolon + 1..]);

    let mut fields = prefix.split(|&b| b == b',');
    let priority_facility: u32 = std::str::from_utf8(fields.next()?).ok()?.parse().ok()?;
    let seqnum: u64 = std::str::from_utf8(fields.next()?).ok()?.parse().ok()?;
    let usec: u64 = std::str::from_utf8(fields.next()?).ok()?.parse().ok()?;

    let severity = Priority::from_value((priority_facility & 7) as u8)?;
    let facility = priority_facility >> 3;

    let mut record = ParsedRecord::new(Transport::Kernel);
    record.priority = severity;
    record.identifier = Some(String::from("kernel"));

    record.push(b"MESSAGE", unescape(message));
    record.push(b"PRIORITY", severity.value().to_string());
    record.push(b"SYSLOG_FACILITY", facility.to_string());
    record.push(b"SYSLOG_IDENTIFIER", "kernel");
    record.push(b"_KERNEL_SEQNUM", seqnum.to_string());
    record.push(b"_SOURCE_MONOTONIC_TIMESTAMP", usec.to_string());

    // Continuation lines carry device metadata.
    for line in lines {
        let Some(rest) = line.strip_prefix(b" ") else {
            continue;
        };
        let Some(split) = rest.iter().position(|&b| b == b'=') else {
            continue;
        };
        let (name, value) = (&rest[..split], &rest[split + 1..]);
        match name {
            b"DEVICE" => record.push(b"_KERNEL_DEVICE", unescape(value)),
            b"SUBSYSTEM" => record.push(b"_KERNEL_SUBSYSTEM", unescape(value)),
            _ => debug!(
                key = %String::from_utf8_lossy(name),
                "ignoring kmsg continuation field"
            ),
        }
    }

    Some(KmsgEntry { seqnum, record })
}

/// The kernel-ring position persisted across restarts, an mmap'd u64.
pub struct KernelSeqnum {
    map: MmapMut,
}

impl KernelSeqnum {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(8)?;

        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { map })
    }

    pub fn get(&self) -> u64 {
        u64::from_le_bytes(self.map[..8].try_into().unwrap())
    }

    pub fn set(&mut self, seqnum: u64) {
        self.map[..8].copy_from_slice(&seqnum.to_le_bytes());
    }

    /// True when this seqnum was not seen before; remembers it.
    pub fn advance_to(&mut self, seqnum: u64) -> bool {
        if seqnum <= self.get() {
            return false;
        }
        self.set(seqnum);
        true
    }
}
