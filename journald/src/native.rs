//! The native datagram protocol.
//!
//! A datagram is a sequence of fields, each either text
//! (`KEY=value\n`) or binary (`KEY\n` followed by a little-endian u64
//! length, the raw bytes, and a terminating newline). Credentials ride
//! in the socket's ancillary data; a single passed file descriptor is
//! accepted as a sealed memfd holding the payload instead.

use crate::record::{ParsedRecord, Transport};
use journal_common::{Priority, field_name_is_valid};
use tracing::debug;

/// Hard ceiling on one field's value.
pub const DATA_SIZE_MAX: usize = 1024 * 1024;
/// Hard ceiling on the number of fields per record.
const N_FIELDS_MAX: usize = 1024;

/// Parse one native datagram into a record. Malformed fields end the
/// parse; what was collected up to that point is kept, matching the
/// drop-and-continue protocol error policy.
pub fn parse_native(payload: &[u8]) -> Option<ParsedRecord> {
    let mut record = ParsedRecord::new(Transport::Journal);
    let mut rest = payload;

    while !rest.is_empty() && record.items.len() < N_FIELDS_MAX {
        let newline = match rest.iter().position(|&b| b == b'\n') {
            Some(position) => position,
            None => {
                debug!("native field without newline, dropping remainder");
                break;
            }
        };

        let line = &rest[..newline];
        rest = &rest[newline + 1..];

        if line.is_empty() {
            continue;
        }

        if let Some(split) = line.iter().position(|&b| b == b'=') {
            // Text field.
            let (name, value) = (&line[..split], &line[split + 1..]);
            push_field(&mut record, name, value);
        } else {
            // Binary field: the name line is followed by a length and
            // the raw bytes.
            let name = line;
            if rest.len() < 8 {
                debug!("truncated binary field length");
                break;
            }
            let len = u64::from_le_bytes(rest[..8].try_into().unwrap()) as usize;
            rest = &rest[8..];

            if len > DATA_SIZE_MAX || rest.len() < len + 1 {
                debug!(len, "binary field too large or truncated");
                break;
            }

            let value = &rest[..len];
            if rest[len] != b'\n' {
                debug!("binary field missing terminator");
                break;
            }
            push_field(&mut record, name, value);
            rest = &rest[len + 1..];
        }
    }

    if record.items.is_empty() {
        return None;
    }

    Some(record)
}

fn push_field(record: &mut ParsedRecord, name: &[u8], value: &[u8]) {
    // Trusted fields cannot be claimed by clients.
    if name.starts_with(b"_") || !field_name_is_valid(name) {
        debug!(name = %String::from_utf8_lossy(name), "dropping invalid native field");
        return;
    }

    if value.len() > DATA_SIZE_MAX {
        debug!(name = %String::from_utf8_lossy(name), "dropping oversized native field");
        return;
    }

    if name == b"PRIORITY" && value.len() == 1 {
        if let Some(priority) = Priority::from_level_char(value[0]) {
            record.priority = priority;
        }
    }

    if name == b"SYSLOG_IDENTIFIER" && record.identifier.is_none() {
        record.identifier = String::from_utf8(value.to_vec()).ok();
    }

    record.push(name, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_fields() {
        let record = parse_native(b"MESSAGE=hello\nPRIORITY=3\nFOO=bar\n").unwrap();
        assert_eq!(record.items.len(), 3);
        assert_eq!(record.priority, Priority::Error);
        assert_eq!(record.first_value(b"MESSAGE"), Some(b"hello".as_slice()));
    }

    #[test]
    fn parses_binary_fields() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"MESSAGE\n");
        payload.extend_from_slice(&5u64.to_le_bytes());
        payload.extend_from_slice(b"a\nb\0c");
        payload.push(b'\n');
        payload.extend_from_slice(b"UNIT=foo.service\n");

        let record = parse_native(&payload).unwrap();
        assert_eq!(record.first_value(b"MESSAGE"), Some(b"a\nb\0c".as_slice()));
        assert_eq!(record.first_value(b"UNIT"), Some(b"foo.service".as_slice()));
    }

    #[test]
    fn rejects_trusted_and_invalid_names() {
        let record = parse_native(b"_PID=1\nlowercase=x\nMESSAGE=ok\n").unwrap();
        assert_eq!(record.items.len(), 1);
        assert_eq!(record.first_value(b"MESSAGE"), Some(b"ok".as_slice()));
    }

    #[test]
    fn truncated_binary_field_keeps_earlier_fields() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"MESSAGE=ok\n");
        payload.extend_from_slice(b"DATA\n");
        payload.extend_from_slice(&100u64.to_le_bytes());
        payload.extend_from_slice(b"short");

        let record = parse_native(&payload).unwrap();
        assert_eq!(record.items.len(), 1);
    }

    #[test]
    fn identifier_is_extracted() {
        let record = parse_native(b"SYSLOG_IDENTIFIER=myapp\nMESSAGE=x\n").unwrap();
        assert_eq!(record.identifier.as_deref(), Some("myapp"));
    }

    #[test]
    fn empty_datagram_is_nothing() {
        assert!(parse_native(b"").is_none());
        assert!(parse_native(b"\n\n").is_none());
    }
}
