//! Per-client process metadata, cached by pid.
//!
//! Everything here is best effort: a client may exit before we look at
//! its `/proc` entry, fields may be unreadable under our credentials.
//! Absent fields simply stay unset and the corresponding trusted fields
//! are not attached to records.

use journal_common::Id128;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

/// Cached metadata beyond this many clients is dropped wholesale rather
/// than tracked precisely.
const CACHE_MAX: usize = 8192;

#[derive(Debug, Default, Clone)]
pub struct ClientContext {
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,

    pub comm: Option<String>,
    pub exe: Option<String>,
    pub cmdline: Option<String>,
    pub capability_effective: Option<u64>,
    pub selinux_context: Option<String>,
    pub audit_session: Option<u32>,
    pub audit_loginuid: Option<u32>,

    pub cgroup: Option<String>,
    pub unit: Option<String>,
    pub user_unit: Option<String>,
    pub slice: Option<String>,
    pub user_slice: Option<String>,
    pub session: Option<String>,
    pub owner_uid: Option<u32>,
    pub invocation_id: Option<Id128>,
}

impl ClientContext {
    /// Gather what `/proc/<pid>` offers about a client.
    pub fn acquire(pid: i32, uid: u32, gid: u32) -> Self {
        let proc_dir = PathBuf::from(format!("/proc/{pid}"));

        let mut context = ClientContext {
            pid,
            uid,
            gid,
            ..Default::default()
        };

        context.comm = read_trimmed(proc_dir.join("comm"));
        context.exe = std::fs::read_link(proc_dir.join("exe"))
            .ok()
            .map(|p| p.to_string_lossy().into_owned());
        context.cmdline = std::fs::read(proc_dir.join("cmdline")).ok().map(|raw| {
            let mut text: String = raw
                .split(|&b| b == 0)
                .filter(|part| !part.is_empty())
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            text.truncate(4096);
            text
        });

        context.audit_session = read_trimmed(proc_dir.join("sessionid"))
            .and_then(|s| s.parse().ok())
            .filter(|&id: &u32| id != u32::MAX);
        context.audit_loginuid = read_trimmed(proc_dir.join("loginuid"))
            .and_then(|s| s.parse().ok())
            .filter(|&id: &u32| id != u32::MAX);
        context.selinux_context = read_trimmed(proc_dir.join("attr/current"))
            .map(|s| s.trim_end_matches('\0').to_string())
            .filter(|s| !s.is_empty() && s != "unconfined");

        if let Some(status) = read_trimmed(proc_dir.join("status")) {
            context.capability_effective = status
                .lines()
                .find_map(|line| line.strip_prefix("CapEff:"))
                .and_then(|hex| u64::from_str_radix(hex.trim(), 16).ok());
        }

        if let Some(cgroup) = read_cgroup(&proc_dir) {
            context.apply_cgroup(&cgroup);
            context.cgroup = Some(cgroup);
        }

        context
    }

    /// Derive unit, slice and session attribution from the cgroup path,
    /// e.g. `/system.slice/ssh.service` or
    /// `/user.slice/user-1000.slice/session-4.scope`.
    fn apply_cgroup(&mut self, cgroup: &str) {
        for component in cgroup.split('/') {
            if let Some(stem) = component
                .strip_suffix(".service")
                .or_else(|| component.strip_suffix(".scope"))
                .or_else(|| component.strip_suffix(".socket"))
                .or_else(|| component.strip_suffix(".mount"))
                .or_else(|| component.strip_suffix(".swap"))
            {
                if self.owner_uid.is_some() {
                    self.user_unit = Some(component.to_string());
                } else {
                    self.unit = Some(component.to_string());
                }
                if let Some(session) = stem.strip_prefix("session-") {
                    self.session = Some(session.to_string());
                }
            } else if component.ends_with(".slice") {
                if self.owner_uid.is_some() {
                    self.user_slice = Some(component.to_string());
                } else {
                    self.slice = Some(component.to_string());
                }
                if let Some(uid) = component
                    .strip_prefix("user-")
                    .and_then(|s| s.strip_suffix(".slice"))
                    .and_then(|s| s.parse().ok())
                {
                    self.owner_uid = Some(uid);
                }
            }
        }
    }
}

fn read_trimmed(path: PathBuf) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn read_cgroup(proc_dir: &std::path::Path) -> Option<String> {
    let content = std::fs::read_to_string(proc_dir.join("cgroup")).ok()?;
    // Prefer the unified hierarchy line `0::<path>`.
    for line in content.lines() {
        let mut parts = line.splitn(3, ':');
        let id = parts.next()?;
        let controllers = parts.next()?;
        let path = parts.next()?;
        if id == "0" && controllers.is_empty() {
            return Some(path.to_string());
        }
    }
    content
        .lines()
        .next()
        .and_then(|line| line.splitn(3, ':').nth(2))
        .map(String::from)
}

/// Pid-keyed cache of client contexts.
#[derive(Default)]
pub struct ContextCache {
    map: HashMap<i32, Rc<ClientContext>>,
}

impl ContextCache {
    pub fn get(&mut self, pid: i32, uid: u32, gid: u32) -> Rc<ClientContext> {
        if let Some(context) = self.map.get(&pid) {
            return Rc::clone(context);
        }

        if self.map.len() >= CACHE_MAX {
            self.flush();
        }

        let context = Rc::new(ClientContext::acquire(pid, uid, gid));
        self.map.insert(pid, Rc::clone(&context));
        context
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drop all cached contexts. Outstanding `Rc`s stay valid; only the
    /// cache forgets them.
    pub fn flush(&mut self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_own_process() {
        let pid = std::process::id() as i32;
        let context = ClientContext::acquire(pid, 0, 0);

        // Our own /proc entry is always readable.
        assert!(context.comm.is_some());
        assert!(context.cmdline.is_some());
    }

    #[test]
    fn cache_hits_return_same_context() {
        let mut cache = ContextCache::default();
        let pid = std::process::id() as i32;

        let a = cache.get(pid, 1, 2);
        let b = cache.get(pid, 1, 2);
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        cache.flush();
        assert!(cache.is_empty());
        // The old Rc is still usable after a flush.
        assert_eq!(a.pid, pid);
    }

    #[test]
    fn cgroup_attribution() {
        let mut context = ClientContext::default();
        context.apply_cgroup("/system.slice/ssh.service");
        assert_eq!(context.slice.as_deref(), Some("system.slice"));
        assert_eq!(context.unit.as_deref(), Some("ssh.service"));
        assert_eq!(context.owner_uid, None);

        let mut context = ClientContext::default();
        context.apply_cgroup("/user.slice/user-1000.slice/session-4.scope");
        assert_eq!(context.owner_uid, Some(1000));
        assert_eq!(context.user_unit.as_deref(), Some("session-4.scope"));
        assert_eq!(context.session.as_deref(), Some("4"));
    }
}
