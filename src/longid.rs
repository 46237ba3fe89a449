//! LongId calculus — parent/child/ancestor arithmetic on the opaque,
//! 32-byte, self-describing object identifiers that double as both a
//! stable NFS-style file handle and a locator for short-id-addressed
//! files (spec C5).
//!
//! All operations here are pure value operations; nothing in this
//! module touches the network or the repository state.

use std::fmt;

/// Width of a [`LongId`] in bytes.
pub const LEN: usize = 32;

/// Width of a [`FpTag`] content/identity tag.
pub const FP_LEN: usize = 16;

/// Errors raised by the LongId calculus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// `append` ran out of room in the fixed 32-byte budget.
    Overflow,
    /// `append` was called on a root for which appending the given
    /// index makes no sense (e.g. past the file-shortid fingerprint
    /// suffix, or on the null root).
    InvalidAppend,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Overflow => write!(f, "longid exceeds the 32-byte budget"),
            Error::InvalidAppend => write!(f, "append is not valid on this longid"),
        }
    }
}

impl std::error::Error for Error {}

/// Which of the reserved roots (or non-root interior node) a
/// [`LongId`] descends from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    /// `/vesta`-equivalent stable, replicated namespace.
    Repository,
    /// Mutable (work-in-progress) namespace.
    Mutable,
    /// Volatile (tool-session scratch) namespace.
    Volatile,
    /// Directory addressed directly by [`ShortId`].
    ShortIdDirectory,
    /// File addressed by [`ShortId`] plus a content [`FpTag`].
    ShortIdFile,
    /// The reserved invalid/null identifier.
    Null,
}

/// A 32-bit opaque handle to a file's content blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortId(pub u32);

/// Reserved value meaning "no shortid".
pub const NULL_SHORT_ID: ShortId = ShortId(0);

/// A 16-byte opaque content/identity tag, used to disambiguate
/// otherwise-equal names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FpTag(pub [u8; FP_LEN]);

/// A hierarchical, self-describing, fixed-width object identifier.
///
/// Equality is byte-for-byte; hashing is the natural byte-array hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LongId([u8; LEN]);

impl fmt::Debug for LongId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LongId(")?;
        for b in &self.0[..self.length()] {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

fn with_tag(tag: u8) -> [u8; LEN] {
    let mut bytes = [0u8; LEN];
    bytes[1] = tag;
    bytes
}

/// LongId of the stable repository root (`/vesta`).
pub fn root() -> LongId {
    LongId([0u8; LEN])
}

/// LongId of the mutable (work-in-progress) root.
pub fn mutable_root() -> LongId {
    LongId(with_tag(1))
}

/// LongId of the volatile (tool-session scratch) root.
pub fn volatile_root() -> LongId {
    LongId(with_tag(2))
}

/// LongId of the short-id directory root.
pub fn shortid_dir_root() -> LongId {
    LongId(with_tag(3))
}

/// LongId of the short-id file root.
pub fn shortid_file_root() -> LongId {
    LongId(with_tag(4))
}

/// The reserved invalid/null LongId.
pub fn null() -> LongId {
    LongId(with_tag(0xFF))
}

impl LongId {
    /// Wraps a raw 32-byte value. The caller is responsible for the
    /// value being well-formed; this never fails because a LongId is,
    /// by definition, any 32-byte pattern (malformed ones simply fail
    /// to resolve to anything on lookup).
    pub fn from_bytes(bytes: [u8; LEN]) -> Self {
        LongId(bytes)
    }

    /// The raw 32-byte wire representation.
    pub fn as_bytes(&self) -> &[u8; LEN] {
        &self.0
    }

    /// Which reserved root this id descends from.
    pub fn root_kind(&self) -> RootKind {
        if self.0[0] != 0 {
            return RootKind::Repository;
        }
        match self.0[1] {
            0 => RootKind::Repository,
            1 => RootKind::Mutable,
            2 => RootKind::Volatile,
            3 => RootKind::ShortIdDirectory,
            4 => RootKind::ShortIdFile,
            0xFF => RootKind::Null,
            _ => RootKind::Repository,
        }
    }

    /// Count of significant bytes. Fixed at 8 for short-id-directory
    /// forms and 24 for short-id-file forms (their trailing fields
    /// carry literal content, not varint child indices, so the usual
    /// "up through the last nonzero byte" rule does not apply to
    /// them); otherwise the position just past the last nonzero byte.
    pub fn length(&self) -> usize {
        if self.0[0] == 0 && self.0[1] == 3 {
            return 8;
        }
        if self.0[0] == 0 && self.0[1] == 4 {
            return 24;
        }
        let mut len = 1;
        while len < LEN && self.0[len] != 0 {
            len += 1;
        }
        len
    }

    /// Builds the LongId of this source's `index`th child (1-origin).
    ///
    /// Children are packed as 7-bit little-endian varints: the first
    /// byte of an index carries no flag; every following byte of the
    /// same index has its high bit set, per spec §3/§4.5 ("bytes with
    /// the high bit set continue the index").
    pub fn append(&self, index: u32) -> Result<LongId, Error> {
        let mut result = *self;

        let mut end = match (1..LEN).find(|&i| result.0[i] == 0) {
            Some(pos) => pos,
            None => return Err(Error::Overflow),
        };

        if result.0[0] == 0 {
            match result.0[1] {
                0 => end = 0,
                1 | 2 => {}
                3 => {
                    if index == 0 {
                        return Err(Error::InvalidAppend);
                    }
                }
                4 => {
                    if result.0[2] != 0 {
                        return Err(Error::InvalidAppend);
                    }
                }
                _ => return Err(Error::InvalidAppend),
            }
        }

        let mut remaining = index;
        loop {
            if end >= LEN {
                return Err(Error::Overflow);
            }
            let mut byte = (remaining & 0x7f) as u8;
            remaining >>= 7;
            if remaining > 0 {
                byte |= 0x80;
            }
            result.0[end] = byte;
            end += 1;
            if remaining == 0 {
                break;
            }
        }
        Ok(result)
    }

    /// The LongId of this source's parent, plus the index within that
    /// parent. Returns `None` for a root (no parent) and for the
    /// short-id forms (their "parent" is not addressable by LongId
    /// arithmetic).
    pub fn get_parent(&self) -> Option<(LongId, u32)> {
        if self.0[0] == 0 && (self.0[1] == 3 || self.0[1] == 4) {
            return None;
        }

        let mut result = *self;
        let mut end: isize = (LEN - 1) as isize;
        while result.0[end as usize] == 0 {
            end -= 1;
            if end < 0 {
                return None;
            }
        }

        let mut idx = result.0[end as usize] as u32;
        result.0[end as usize] = 0;
        end -= 1;

        while end >= 0 {
            let b = result.0[end as usize];
            if b & 0x80 == 0 {
                if b == 0 {
                    return None;
                }
                break;
            }
            idx = (idx << 7) | (b & 0x7f) as u32;
            result.0[end as usize] = 0;
            end -= 1;
        }

        Some((result, idx))
    }

    /// True if `self` is a prefix-ancestor of `child` (a LongId is its
    /// own ancestor). For short-id-file children, bytes 8-23 (the
    /// literal fingerprint) must match exactly rather than being
    /// subject to the "stops at the first zero byte" rule.
    pub fn is_ancestor_of(&self, child: &LongId) -> bool {
        let mut i = 0usize;
        if self.0[0] == 0 {
            match self.0[1] {
                0 => return child.0[0] != 0 || child.0[1] == 0,
                1 | 2 | 3 | 4 => {
                    if child.0[0] != 0 || child.0[1] != self.0[1] {
                        return false;
                    }
                    i = 2;
                }
                _ => return false,
            }
        }
        while i < LEN {
            if self.0[i] != child.0[i] {
                if i >= 7 && self.0[0] == 0 && self.0[1] == 4 {
                    return false;
                }
                return self.0[i] == 0;
            }
            i += 1;
        }
        true
    }

    /// Builds the LongId for a directory addressed directly by
    /// shortid. The shortid occupies a fixed 4-byte big-endian field;
    /// see [`LongId::length`] for why this form has fixed length 8.
    pub fn from_short_id_dir(sid: ShortId) -> LongId {
        let mut bytes = with_tag(3);
        bytes[2..6].copy_from_slice(&sid.0.to_be_bytes());
        LongId(bytes)
    }

    /// Builds the LongId for a file addressed by shortid plus content
    /// fingerprint.
    pub fn from_short_id_file(sid: ShortId, fp: FpTag) -> LongId {
        let mut bytes = with_tag(4);
        bytes[2..6].copy_from_slice(&sid.0.to_be_bytes());
        bytes[7..7 + FP_LEN].copy_from_slice(&fp.0);
        LongId(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_get_parent_roundtrips() {
        let child = mutable_root().append(200).unwrap();
        let (parent, index) = child.get_parent().unwrap();
        assert_eq!(parent, mutable_root());
        assert_eq!(index, 200);
    }

    #[test]
    fn append_matches_varint_layout() {
        // 200 = 0b1100_1000: low chunk 0x48 carries no flag, the
        // continuation chunk 0x01 carries the high bit.
        let child = mutable_root().append(200).unwrap();
        assert_eq!(child.as_bytes()[0..4], [0x00, 0x01, 0x48, 0x81]);
    }

    #[test]
    fn append_is_ancestor_of_child() {
        let root = root();
        let child = root.append(1).unwrap();
        assert!(root.is_ancestor_of(&child));
        assert!(child.is_ancestor_of(&child));
        assert!(!child.is_ancestor_of(&root));
    }

    #[test]
    fn nested_children_chain_ancestry() {
        let a = root().append(3).unwrap();
        let b = a.append(9001).unwrap();
        assert!(root().is_ancestor_of(&b));
        assert!(a.is_ancestor_of(&b));

        let (parent_b, idx_b) = b.get_parent().unwrap();
        assert_eq!(parent_b, a);
        assert_eq!(idx_b, 9001);
    }

    #[test]
    fn shortid_forms_have_fixed_length_and_no_parent() {
        let dir = LongId::from_short_id_dir(ShortId(0x0000_1000));
        assert_eq!(dir.length(), 8);
        assert!(dir.get_parent().is_none());

        let file = LongId::from_short_id_file(ShortId(0x0000_2000), FpTag([7u8; FP_LEN]));
        assert_eq!(file.length(), 24);
        assert!(file.get_parent().is_none());
        assert_eq!(&file.as_bytes()[7..23], &[7u8; FP_LEN]);
    }

    #[test]
    fn append_overflow_on_exhausted_budget() {
        let mut id = root();
        let mut ok = true;
        while ok {
            match id.append(u32::MAX) {
                Ok(next) => id = next,
                Err(Error::Overflow) => ok = false,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
    }

    #[test]
    fn root_has_no_parent() {
        assert!(root().get_parent().is_none());
        assert!(mutable_root().get_parent().is_none());
        assert!(volatile_root().get_parent().is_none());
    }

    #[test]
    fn short_id_file_ancestry_rejects_mismatched_fingerprint() {
        let sid = ShortId(0x0000_3000);
        let a = LongId::from_short_id_file(sid, FpTag([0u8; FP_LEN]));
        let b = LongId::from_short_id_file(sid, FpTag([0xFFu8; FP_LEN]));
        assert!(!a.is_ancestor_of(&b));
        assert!(!b.is_ancestor_of(&a));
    }

    #[test]
    fn short_id_file_ancestry_accepts_identical_fingerprint() {
        let sid = ShortId(0x0000_3001);
        let fp = FpTag([9u8; FP_LEN]);
        let a = LongId::from_short_id_file(sid, fp);
        let b = LongId::from_short_id_file(sid, fp);
        assert!(a.is_ancestor_of(&b));
    }
}
