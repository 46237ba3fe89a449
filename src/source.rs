//! Source model (C6): the tagged-variant namespace object and the
//! operation contract both the server-side [`crate::repository`] and
//! the client-side [`crate::surrogate`] implement.
//!
//! Vesta's original C++ expresses this as a class hierarchy dispatched
//! through virtual calls; per spec §9 ("deep polymorphism → tagged
//! variants") we instead use one `Kind` enum plus a single trait,
//! mirroring how the teacher crate's `Vfs` trait stands in for an NFS
//! server's own virtual filesystem hierarchy.

use async_trait::async_trait;
use std::fmt;

use crate::access::Identity;
use crate::longid::{FpTag, LongId, ShortId};

/// Maximum length of one path component (spec GLOSSARY "Arc").
pub const MAX_ARC_LEN: usize = 255;

/// Errors constructing an [`ArcName`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArcError {
    TooLong,
    ContainsSeparator,
}

/// A single validated path component: at most 255 bytes, containing
/// neither `/`, `\`, nor NUL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArcName(String);

impl ArcName {
    pub fn new(s: impl Into<String>) -> Result<Self, ArcError> {
        let s = s.into();
        if s.len() > MAX_ARC_LEN {
            return Err(ArcError::TooLong);
        }
        if s.bytes().any(|b| b == b'/' || b == b'\\' || b == 0) {
            return Err(ArcError::ContainsSeparator);
        }
        Ok(ArcName(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArcName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The full object-kind tag (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    ImmutableFile,
    MutableFile,
    ImmutableDirectory,
    AppendableDirectory,
    MutableDirectory,
    Ghost,
    Stub,
    Deleted,
    Outdated,
    VolatileDirectory,
    EvaluatorDirectory,
    Device,
    VolatileROEDirectory,
    EvaluatorROEDirectory,
    Gap,
    Unused,
}

impl Kind {
    pub fn is_directory(&self) -> bool {
        matches!(
            self,
            Kind::ImmutableDirectory
                | Kind::AppendableDirectory
                | Kind::MutableDirectory
                | Kind::VolatileDirectory
                | Kind::EvaluatorDirectory
                | Kind::VolatileROEDirectory
                | Kind::EvaluatorROEDirectory
        )
    }
}

/// The repository-level error taxonomy (spec §7), in the exact ordinal
/// order of the original `VRErrorCode::errorCode` enum so that any test
/// pinning wire-level integer values stays stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VrError {
    Ok = 0,
    NotFound,
    NoPermission,
    NameInUse,
    InappropriateOp,
    NameTooLong,
    RpcFailure,
    NotADirectory,
    IsADirectory,
    InvalidArgs,
    OutOfSpace,
    NotMaster,
    LongIdOverflow,
}

impl fmt::Display for VrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VrError::Ok => "ok",
            VrError::NotFound => "notFound",
            VrError::NoPermission => "noPermission",
            VrError::NameInUse => "nameInUse",
            VrError::InappropriateOp => "inappropriateOp",
            VrError::NameTooLong => "nameTooLong",
            VrError::RpcFailure => "rpcFailure",
            VrError::NotADirectory => "notADirectory",
            VrError::IsADirectory => "isADirectory",
            VrError::InvalidArgs => "invalidArgs",
            VrError::OutOfSpace => "outOfSpace",
            VrError::NotMaster => "notMaster",
            VrError::LongIdOverflow => "longIdOverflow",
        };
        write!(f, "{s}")
    }
}

impl std::error::Error for VrError {}

pub type Result<T> = std::result::Result<T, VrError>;

/// `lockKindTag` from the original `VestaSource.H`, folded in here per
/// SPEC_FULL's supplemental note: names the lock a `lookup` entry point
/// must acquire on the stable/volatile tree before traversing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    ReadLock,
    WriteLock,
    NoLock,
    CheckLock,
    ReadLockV,
    WriteLockV,
}

/// Policy for `insertX` when an entry with the same arc already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupeCheck {
    DontReplace,
    ReplaceDiff,
    ReplaceNonMaster,
}

/// What kind of object an `insert` operation creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertKind {
    File,
    MutableFile,
    ImmutableDirectory,
    AppendableDirectory,
    MutableDirectory,
    Ghost,
    Stub,
}

/// A value-typed view of one namespace object (spec §3 "Source").
///
/// On the server this is borrowed from the lock holder for the
/// duration of one call or one atomic program; on the client the
/// surrogate owns it and lazily caches stat data (spec §9, §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Source {
    pub kind: Kind,
    pub longid: LongId,
    pub master: bool,
    /// 31-bit NFS pseudo-inode; see [`Kind`]-dependent rules in spec
    /// §4.6 ("Pseudo-inodes").
    pub pseudo_inode: u32,
    pub fptag: Option<FpTag>,
}

/// One entry yielded by [`SourceOps::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub arc: ArcName,
    pub kind: Kind,
    pub index: u32,
    pub pseudo_inode: u32,
    pub shortid: Option<ShortId>,
    pub master: bool,
}

/// Result of `measureDirectory` (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectoryMeasurement {
    pub base_chain_length: u32,
    pub used_entry_count: u64,
    pub used_entry_size: u64,
    pub total_entry_count: u64,
    pub total_entry_size: u64,
}

/// The full Source operation contract (spec §4.6). Implemented
/// in-process by [`crate::repository::Repository`] and remotely by
/// [`crate::surrogate::Surrogate`].
#[async_trait]
pub trait SourceOps: Send + Sync {
    async fn lookup(&self, dir: &Source, arc: &ArcName, identity: &Identity) -> Result<Source>;

    async fn lookup_pathname(&self, start: &Source, path: &str, identity: &Identity) -> Result<Source>;

    async fn lookup_index(&self, dir: &Source, index: u32, identity: &Identity) -> Result<(Source, ArcName)>;

    /// Streams `(arc, type, index, pseudoInode, sid, master)` entries
    /// starting at `first_index`. `delta_only` restricts the stream to
    /// entries added since the directory's base (used by tools that
    /// already have the base cached).
    async fn list(
        &self,
        dir: &Source,
        first_index: u32,
        delta_only: bool,
        identity: &Identity,
    ) -> Result<Vec<ListEntry>>;

    async fn insert(
        &self,
        dir: &Source,
        kind: InsertKind,
        arc: &ArcName,
        master: bool,
        dupe_check: DupeCheck,
        fptag: Option<FpTag>,
        identity: &Identity,
    ) -> Result<Source>;

    async fn really_delete(&self, dir: &Source, arc: &ArcName, exist_check: bool, identity: &Identity) -> Result<()>;

    async fn rename_to(
        &self,
        target_dir: &Source,
        target_arc: &ArcName,
        from_dir: &Source,
        from_arc: &ArcName,
        identity: &Identity,
    ) -> Result<()>;

    /// Copy-on-write: returns a mutable Source with the same LongId
    /// (spec §4.6 "makeMutable" / testable property 6).
    async fn make_mutable(&self, src: &Source, new_shortid: Option<ShortId>, copy_max: u64, identity: &Identity) -> Result<Source>;

    async fn make_files_immutable(&self, root: &Source, threshold: u64, identity: &Identity) -> Result<()>;

    async fn read(&self, file: &Source, offset: u64, nbytes: u32, identity: &Identity) -> Result<Vec<u8>>;

    async fn write(&self, file: &Source, offset: u64, data: &[u8], identity: &Identity) -> Result<()>;

    async fn set_master(&self, src: &Source, master: bool, identity: &Identity) -> Result<()>;

    async fn set_index_master(&self, dir: &Source, index: u32, master: bool, identity: &Identity) -> Result<()>;

    async fn cede_mastership(&self, src: &Source, identity: &Identity) -> Result<()>;

    async fn replicate(&self, src: &Source, pathname: &str, host: &str, port: u16, identity: &Identity) -> Result<()>;

    async fn replicate_attribs(&self, src: &Source, pathname: &str, host: &str, port: u16, identity: &Identity) -> Result<()>;

    async fn acquire_mastership(&self, src: &Source, pathname: &str, host: &str, port: u16, identity: &Identity) -> Result<()>;

    async fn measure_directory(&self, dir: &Source, identity: &Identity) -> Result<DirectoryMeasurement>;

    async fn collapse_base(&self, dir: &Source, identity: &Identity) -> Result<()>;

    async fn get_base(&self, dir: &Source, identity: &Identity) -> Result<Option<Source>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arc_name_rejects_separator() {
        assert_eq!(ArcName::new("a/b").unwrap_err(), ArcError::ContainsSeparator);
        assert_eq!(ArcName::new("a\\b").unwrap_err(), ArcError::ContainsSeparator);
    }

    #[test]
    fn arc_name_rejects_too_long() {
        let long = "a".repeat(MAX_ARC_LEN + 1);
        assert_eq!(ArcName::new(long).unwrap_err(), ArcError::TooLong);
    }

    #[test]
    fn arc_name_accepts_max_length() {
        let ok = "a".repeat(MAX_ARC_LEN);
        assert!(ArcName::new(ok).is_ok());
    }

    #[test]
    fn vr_error_ordinals_match_original_header() {
        assert_eq!(VrError::Ok as u32, 0);
        assert_eq!(VrError::NotFound as u32, 1);
        assert_eq!(VrError::LongIdOverflow as u32, 12);
    }

    #[test]
    fn directory_kinds_are_flagged() {
        assert!(Kind::AppendableDirectory.is_directory());
        assert!(!Kind::ImmutableFile.is_directory());
    }
}
