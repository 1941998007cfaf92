//! Common types shared across the journal crates.
//!
//! This crate provides the foundational vocabulary used by both the file
//! format layer and the collection daemon: microsecond timestamps, 128-bit
//! identifiers, syslog priorities and field-name validation. It exists to
//! avoid code duplication and circular dependencies between the other
//! crates.

mod id;
mod priority;
mod time;

pub use id::{Id128, IdError};
pub use priority::Priority;
pub use time::{Microseconds, USEC_PER_MSEC, USEC_PER_SEC};

/// Upper bound on journal field names, matching the wire format limit.
pub const FIELD_NAME_MAX: usize = 64;

/// Check whether `name` is a valid journal field name.
///
/// Valid names are non-empty ASCII of at most [`FIELD_NAME_MAX`] bytes,
/// consisting of `A`-`Z`, `0`-`9` and `_`, and not starting with a digit.
/// Names starting with `_` are reserved for trusted fields the daemon
/// attaches itself; they are valid here, the caller decides whether to
/// accept them from clients.
pub fn field_name_is_valid(name: &[u8]) -> bool {
    if name.is_empty() || name.len() > FIELD_NAME_MAX {
        return false;
    }

    if name[0].is_ascii_digit() {
        return false;
    }

    name.iter()
        .all(|&b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
}

/// Return the current hostname, or `"localhost"` if it cannot be read.
pub fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| String::from("localhost"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_names() {
        assert!(field_name_is_valid(b"MESSAGE"));
        assert!(field_name_is_valid(b"_PID"));
        assert!(field_name_is_valid(b"SYSLOG_FACILITY"));
        assert!(field_name_is_valid(b"N1"));

        assert!(!field_name_is_valid(b""));
        assert!(!field_name_is_valid(b"1MESSAGE"));
        assert!(!field_name_is_valid(b"lowercase"));
        assert!(!field_name_is_valid(b"WITH SPACE"));
        assert!(!field_name_is_valid(b"WITH=EQ"));
        assert!(!field_name_is_valid(&[b'A'; FIELD_NAME_MAX + 1]));
    }

    #[test]
    fn hostname_nonempty() {
        assert!(!hostname().is_empty());
    }
}
