//! Audit netlink ingestion.
//!
//! Raw netlink datagrams from the kernel audit subsystem: a 16-byte
//! `nlmsghdr` followed by the audit payload, which for the record types
//! we store is text of the form `audit(<sec>.<frac>:<serial>): k=v …`.

use crate::record::{ParsedRecord, Transport};
use journal_common::{Microseconds, Priority, USEC_PER_SEC};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const NLMSG_HDRLEN: usize = 16;

/// Audit message types outside this range are control traffic and
/// skipped.
const AUDIT_TYPE_MIN: u16 = 1100;
const AUDIT_TYPE_MAX: u16 = 2999;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct NlMsgHdr {
    pub len: u32,
    pub type_: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

/// Split the `audit(<sec>.<frac>:<serial>):` prefix.
fn parse_audit_prefix(text: &str) -> Option<(Microseconds, u64, &str)> {
    let rest = text.strip_prefix("audit(")?;
    let close = rest.find("):")?;
    let (stamp, mut message) = rest.split_at(close);
    message = &message[2..];

    let (time, serial) = stamp.split_once(':')?;
    let (seconds, fraction) = time.split_once('.')?;

    let seconds: u64 = seconds.parse().ok()?;
    let millis: u64 = fraction.parse().ok()?;
    let serial: u64 = serial.parse().ok()?;

    let realtime = Microseconds(seconds * USEC_PER_SEC + millis * 1_000);
    Some((realtime, serial, message.trim_start()))
}

/// Parse one netlink datagram into a record, or `None` for control
/// messages and types we do not store.
pub fn parse_audit(datagram: &[u8]) -> Option<ParsedRecord> {
    let (header, payload) = NlMsgHdr::read_from_prefix(datagram).ok()?;

    if !(AUDIT_TYPE_MIN..=AUDIT_TYPE_MAX).contains(&header.type_) {
        return None;
    }

    let len = (header.len as usize).saturating_sub(NLMSG_HDRLEN);
    if len == 0 || len > payload.len() {
        return None;
    }

    let text = String::from_utf8_lossy(&payload[..len]);
    let text = text.trim_end_matches(['\0', '\n']);

    let mut record = ParsedRecord::new(Transport::Audit);
    record.priority = Priority::Notice;
    record.identifier = Some(String::from("audit"));

    match parse_audit_prefix(text) {
        Some((realtime, serial, message)) => {
            record.source_realtime = Some(realtime);
            record.push(b"MESSAGE", format!("{}: {}", audit_type_name(header.type_), message));
            record.push(b"_AUDIT_ID", serial.to_string());
        }
        None => {
            record.push(b"MESSAGE", text.as_bytes());
        }
    }

    record.push(b"_AUDIT_TYPE", header.type_.to_string());
    record.push(b"SYSLOG_IDENTIFIER", "audit");

    Some(record)
}

fn audit_type_name(type_: u16) -> &'static str {
    match type_ {
        1100 => "USER_AUTH",
        1101 => "USER_ACCT",
        1105 => "USER_START",
        1106 => "USER_END",
        1112 => "USER_LOGIN",
        1113 => "USER_LOGOUT",
        1130 => "SERVICE_START",
        1131 => "SERVICE_STOP",
        1300 => "SYSCALL",
        1400 => "AVC",
        _ => "AUDIT",
    }
}
