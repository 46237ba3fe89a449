//! Access control (C8): identities, realm-qualified names, and the
//! capability checks gating every Source operation.

use std::fmt;
use std::net::SocketAddr;

/// Flavor-tagged client identity (spec §3/§4.8/§6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Unix(UnixIdentity),
    Global(GlobalIdentity),
    /// Reserved; not implemented on the wire beyond framing (spec §6).
    GssApi { username: String, token: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixIdentity {
    pub timestamp: i32,
    pub machine_name: String,
    pub uid: i32,
    pub gid: i32,
    pub gids: Vec<i32>,
    pub origin: Option<SocketAddr>,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalIdentity {
    pub name: String,
    pub origin: Option<SocketAddr>,
    pub read_only: bool,
}

impl Identity {
    /// Two identities compare equal iff their flavor matches and their
    /// primary user string (global) or uid (unix) matches — a narrower
    /// notion than structural `PartialEq`, which also compares
    /// supplementary fields like origin/read-only.
    pub fn same_principal(&self, other: &Identity) -> bool {
        match (self, other) {
            (Identity::Unix(a), Identity::Unix(b)) => a.uid == b.uid,
            (Identity::Global(a), Identity::Global(b)) => a.name == b.name,
            (Identity::GssApi { username: a, .. }, Identity::GssApi { username: b, .. }) => a == b,
            _ => false,
        }
    }

    pub fn read_only(&self) -> bool {
        match self {
            Identity::Unix(u) => u.read_only,
            Identity::Global(g) => g.read_only,
            Identity::GssApi { .. } => false,
        }
    }
}

/// A `user@realm` or `^group@realm` qualified name (spec §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealmName {
    pub is_group: bool,
    pub user: String,
    pub realm: String,
}

impl RealmName {
    /// Parses `name` against `default_realm`, suffixing bare names.
    pub fn parse(name: &str, default_realm: &str) -> RealmName {
        let (is_group, rest) = match name.strip_prefix('^') {
            Some(rest) => (true, rest),
            None => (false, name),
        };
        match rest.split_once('@') {
            Some((user, realm)) => RealmName { is_group, user: user.to_string(), realm: realm.to_string() },
            None => RealmName { is_group, user: rest.to_string(), realm: default_realm.to_string() },
        }
    }
}

impl fmt::Display for RealmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_group {
            write!(f, "^{}@{}", self.user, self.realm)
        } else {
            write!(f, "{}@{}", self.user, self.realm)
        }
    }
}

/// Permission classes checked against an object's mode bits / owner
/// (spec §3/§4.8). Named `delete` here; the original C++ header spells
/// it `del` (a reserved word collision in that language, not a semantic
/// difference).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    Unrestricted,
    Administrative,
    Ownership,
    Read,
    Write,
    Search,
    Delete,
    SetUid,
    SetGid,
    Agreement,
}

bitflags::bitflags! {
    /// Unix-style rwx mode bits plus the setuid/setgid/sticky bits,
    /// matching `AccessControl::ModeBits` (a plain `Bit32`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ModeBits: u32 {
        const OWNER_READ = 0o400;
        const OWNER_WRITE = 0o200;
        const OWNER_SEARCH = 0o100;
        const GROUP_READ = 0o040;
        const GROUP_WRITE = 0o020;
        const GROUP_SEARCH = 0o010;
        const OTHER_READ = 0o004;
        const OTHER_WRITE = 0o002;
        const OTHER_SEARCH = 0o001;
        const SETUID = 0o4000;
        const SETGID = 0o2000;
    }
}

/// The access-control record carried on every namespace object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub mode: ModeBits,
    pub owner: String,
    pub group: String,
}

/// Process-wide configuration consulted by [`check`]/[`admit`].
#[derive(Debug, Clone)]
pub struct Policy {
    pub admin_user: String,
    pub admin_group: Vec<String>,
    pub restrict_delete: bool,
}

/// Is this identity allowed on the repository at all? A stub in the
/// reference implementation (all validated identities are admitted);
/// kept as its own entry point because access tables may one day make
/// this a real check.
pub fn admit(_id: &Identity, _policy: &Policy) -> bool {
    true
}

fn principal_name(id: &Identity) -> Option<&str> {
    match id {
        Identity::Global(g) => Some(g.name.as_str()),
        _ => None,
    }
}

fn is_administrative(id: &Identity, policy: &Policy) -> bool {
    match principal_name(id) {
        Some(name) => name == policy.admin_user || policy.admin_group.iter().any(|g| g == name),
        None => false,
    }
}

/// `check(id, class, target)` — may `id` exercise `class` against the
/// object described by `record` (and, for `setuid`/`setgid`, the
/// proposed new owner/group named in `target`)?
pub fn check(id: &Identity, class: Class, record: &Record, target: Option<&str>, policy: &Policy) -> bool {
    match class {
        Class::Unrestricted => true,
        Class::Administrative => is_administrative(id, policy),
        Class::Ownership => {
            is_administrative(id, policy) || principal_name(id) == Some(record.owner.as_str())
        }
        Class::Read => has_mode(id, record, policy, ModeBits::OWNER_READ, ModeBits::GROUP_READ, ModeBits::OTHER_READ),
        Class::Write => {
            has_mode(id, record, policy, ModeBits::OWNER_WRITE, ModeBits::GROUP_WRITE, ModeBits::OTHER_WRITE)
        }
        Class::Search => {
            has_mode(id, record, policy, ModeBits::OWNER_SEARCH, ModeBits::GROUP_SEARCH, ModeBits::OTHER_SEARCH)
        }
        Class::Delete => {
            if policy.restrict_delete {
                is_administrative(id, policy)
            } else {
                has_mode(id, record, policy, ModeBits::OWNER_WRITE, ModeBits::GROUP_WRITE, ModeBits::OTHER_WRITE)
            }
        }
        Class::SetUid => is_administrative(id, policy) || target == Some(record.owner.as_str()),
        Class::SetGid => is_administrative(id, policy) || target == Some(record.group.as_str()),
        Class::Agreement => is_administrative(id, policy) || check(id, Class::Write, record, None, policy),
    }
}

fn has_mode(id: &Identity, record: &Record, policy: &Policy, owner_bit: ModeBits, group_bit: ModeBits, other_bit: ModeBits) -> bool {
    if is_administrative(id, policy) {
        return true;
    }
    let name = principal_name(id);
    if name == Some(record.owner.as_str()) {
        return record.mode.contains(owner_bit);
    }
    if name == Some(record.group.as_str()) {
        return record.mode.contains(group_bit);
    }
    record.mode.contains(other_bit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Policy {
        Policy { admin_user: "admin@vesta".into(), admin_group: vec!["wheel@vesta".into()], restrict_delete: false }
    }

    fn global(name: &str) -> Identity {
        Identity::Global(GlobalIdentity { name: name.into(), origin: None, read_only: false })
    }

    #[test]
    fn realm_name_suffixes_bare_names() {
        let n = RealmName::parse("alice", "example.com");
        assert_eq!(n.to_string(), "alice@example.com");
        assert!(!n.is_group);
    }

    #[test]
    fn realm_name_parses_group_with_explicit_realm() {
        let n = RealmName::parse("^eng@example.com", "other.com");
        assert!(n.is_group);
        assert_eq!(n.realm, "example.com");
    }

    #[test]
    fn admin_passes_every_class() {
        let id = global("admin@vesta");
        let record = Record { mode: ModeBits::empty(), owner: "bob@vesta".into(), group: "eng@vesta".into() };
        assert!(check(&id, Class::Read, &record, None, &policy()));
        assert!(check(&id, Class::Write, &record, None, &policy()));
        assert!(check(&id, Class::Administrative, &record, None, &policy()));
    }

    #[test]
    fn owner_read_requires_owner_bit() {
        let id = global("bob@vesta");
        let record = Record { mode: ModeBits::OWNER_WRITE, owner: "bob@vesta".into(), group: "eng@vesta".into() };
        assert!(!check(&id, Class::Read, &record, None, &policy()));
        assert!(check(&id, Class::Write, &record, None, &policy()));
    }

    #[test]
    fn restrict_delete_blocks_non_admins() {
        let mut p = policy();
        p.restrict_delete = true;
        let id = global("bob@vesta");
        let record = Record { mode: ModeBits::all(), owner: "bob@vesta".into(), group: "eng@vesta".into() };
        assert!(!check(&id, Class::Delete, &record, None, &p));
    }

    #[test]
    fn same_principal_ignores_origin_and_read_only() {
        let a = Identity::Global(GlobalIdentity { name: "bob@vesta".into(), origin: None, read_only: false });
        let b = Identity::Global(GlobalIdentity {
            name: "bob@vesta".into(),
            origin: Some("127.0.0.1:1234".parse().unwrap()),
            read_only: true,
        });
        assert!(a.same_principal(&b));
    }
}
