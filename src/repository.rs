//! Server-side glue (C6 continued): an in-memory namespace tree
//! implementing [`crate::source::SourceOps`] over [`crate::longid`]
//! arithmetic, [`crate::access`] checks, and [`crate::attribs`]
//! histories — the single process that [`crate::dispatch`] and
//! [`crate::atomic`] drive.
//!
//! Grounded on the teacher's `vfs::Vfs` trait + in-memory inode table
//! (`vfs/mod.rs`), generalized from a fixed NFS inode shape to the
//! kind-tagged [`crate::source::Source`] value and Vesta's parent/child
//! LongId calculus in place of a flat inode array.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::access::{self, Class, Identity, Policy, Record};
use crate::attribs::{self, History};
use crate::longid::{self, FpTag, LongId, ShortId};
use crate::source::{
    ArcName, DirectoryMeasurement, DupeCheck, InsertKind, Kind, ListEntry, LockKind, Result, Source, SourceOps,
    VrError,
};

struct DirEntry {
    longid: LongId,
    index: u32,
}

struct DirectoryPayload {
    entries: BTreeMap<ArcName, DirEntry>,
    next_index: u32,
    /// The immutable directory this one was branched from, if any
    /// (spec §4.6 "base" / `collapseBase`/`getBase`).
    base: Option<LongId>,
}

impl DirectoryPayload {
    fn empty() -> Self {
        DirectoryPayload { entries: BTreeMap::new(), next_index: 1, base: None }
    }
}

struct FilePayload {
    shortid: Option<ShortId>,
    len: u64,
}

enum Payload {
    Directory(DirectoryPayload),
    File(FilePayload),
    /// Ghost/stub/deleted/outdated/gap/unused/device entries carry no
    /// content of their own.
    Leaf,
}

struct Node {
    kind: Kind,
    master: bool,
    pseudo_inode: u32,
    fptag: Option<FpTag>,
    access: Record,
    attribs: History,
    payload: Payload,
}

/// The single-process in-memory repository.
pub struct Repository {
    nodes: dashmap::DashMap<LongId, Mutex<Node>>,
    blobs: dashmap::DashMap<ShortId, Vec<u8>>,
    next_shortid: AtomicU32,
    next_pseudo_inode: AtomicU32,
    /// The one write lock backing the atomic program interpreter (spec
    /// §4.10): every mutating op takes it for its duration, so a whole
    /// program appears atomic to every other caller.
    write_lock: Mutex<()>,
    policy: Policy,
}

impl Repository {
    pub fn new(policy: Policy, owner: impl Into<String>) -> Arc<Self> {
        let owner = owner.into();
        let repo = Repository {
            nodes: dashmap::DashMap::new(),
            blobs: dashmap::DashMap::new(),
            next_shortid: AtomicU32::new(1),
            next_pseudo_inode: AtomicU32::new(1),
            write_lock: Mutex::new(()),
            policy,
        };

        for (longid, kind) in [
            (longid::root(), Kind::AppendableDirectory),
            (longid::mutable_root(), Kind::MutableDirectory),
            (longid::volatile_root(), Kind::VolatileDirectory),
        ] {
            let node = Node {
                kind,
                master: true,
                pseudo_inode: repo.alloc_pseudo_inode(),
                fptag: None,
                access: Record { mode: access::ModeBits::all(), owner: owner.clone(), group: owner.clone() },
                attribs: History::new(),
                payload: Payload::Directory(DirectoryPayload::empty()),
            };
            repo.nodes.insert(longid, Mutex::new(node));
        }

        Arc::new(repo)
    }

    fn alloc_pseudo_inode(&self) -> u32 {
        // 31-bit space; NFSv3 fileid is unsigned but some clients treat
        // the top bit as sign, so this reference server never sets it.
        self.next_pseudo_inode.fetch_add(1, Ordering::Relaxed) & 0x7fff_ffff
    }

    fn alloc_shortid(&self) -> ShortId {
        ShortId(self.next_shortid.fetch_add(1, Ordering::Relaxed))
    }

    async fn require(&self, longid: LongId) -> Result<()> {
        if self.nodes.contains_key(&longid) {
            Ok(())
        } else {
            Err(VrError::NotFound)
        }
    }

    fn to_source(&self, longid: LongId, node: &Node) -> Source {
        Source { kind: node.kind, longid, master: node.master, pseudo_inode: node.pseudo_inode, fptag: node.fptag }
    }

    fn check(&self, id: &Identity, class: Class, record: &Record) -> Result<()> {
        if access::check(id, class, record, None, &self.policy) {
            Ok(())
        } else {
            Err(VrError::NoPermission)
        }
    }

    async fn lookup_one(&self, dir: LongId, arc: &ArcName, identity: &Identity, lock: LockKind) -> Result<LongId> {
        let _ = lock; // the in-process tree serializes via `write_lock`; per-call lock kind is advisory here.
        let entry = self.nodes.get(&dir).ok_or(VrError::NotFound)?;
        let guard = entry.lock().await;
        self.check(identity, Class::Search, &guard.access)?;
        match &guard.payload {
            Payload::Directory(dirp) => {
                dirp.entries.get(arc).map(|e| e.longid).ok_or(VrError::NotFound)
            }
            _ => Err(VrError::NotADirectory),
        }
    }
}

#[async_trait]
impl SourceOps for Repository {
    async fn lookup(&self, dir: &Source, arc: &ArcName, identity: &Identity) -> Result<Source> {
        let child_id = self.lookup_one(dir.longid, arc, identity, LockKind::ReadLock).await?;
        let entry = self.nodes.get(&child_id).ok_or(VrError::NotFound)?;
        let guard = entry.lock().await;
        Ok(self.to_source(child_id, &guard))
    }

    async fn lookup_pathname(&self, start: &Source, path: &str, identity: &Identity) -> Result<Source> {
        let mut current = *start;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let arc = ArcName::new(component).map_err(|_| VrError::NameTooLong)?;
            current = self.lookup(&current, &arc, identity).await?;
        }
        Ok(current)
    }

    async fn lookup_index(&self, dir: &Source, index: u32, identity: &Identity) -> Result<(Source, ArcName)> {
        let entry = self.nodes.get(&dir.longid).ok_or(VrError::NotFound)?;
        let guard = entry.lock().await;
        self.check(identity, Class::Search, &guard.access)?;
        let Payload::Directory(dirp) = &guard.payload else { return Err(VrError::NotADirectory) };
        let (arc, de) = dirp
            .entries
            .iter()
            .find(|(_, e)| e.index == index)
            .ok_or(VrError::NotFound)?;
        let child_entry = self.nodes.get(&de.longid).ok_or(VrError::NotFound)?;
        let child_guard = child_entry.lock().await;
        Ok((self.to_source(de.longid, &child_guard), arc.clone()))
    }

    async fn list(&self, dir: &Source, first_index: u32, delta_only: bool, identity: &Identity) -> Result<Vec<ListEntry>> {
        let entry = self.nodes.get(&dir.longid).ok_or(VrError::NotFound)?;
        let guard = entry.lock().await;
        self.check(identity, Class::Read, &guard.access)?;
        let Payload::Directory(dirp) = &guard.payload else { return Err(VrError::NotADirectory) };

        if delta_only && dirp.base.is_none() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for (arc, de) in &dirp.entries {
            if de.index < first_index {
                continue;
            }
            if let Some(child) = self.nodes.get(&de.longid) {
                let child_guard = child.lock().await;
                out.push(ListEntry {
                    arc: arc.clone(),
                    kind: child_guard.kind,
                    index: de.index,
                    pseudo_inode: child_guard.pseudo_inode,
                    shortid: match &child_guard.payload {
                        Payload::File(f) => f.shortid,
                        _ => None,
                    },
                    master: child_guard.master,
                });
            }
        }
        out.sort_by_key(|e| e.index);
        Ok(out)
    }

    async fn insert(
        &self,
        dir: &Source,
        kind: InsertKind,
        arc: &ArcName,
        master: bool,
        dupe_check: DupeCheck,
        fptag: Option<FpTag>,
        identity: &Identity,
    ) -> Result<Source> {
        let _held = self.write_lock.lock().await;

        // Every block below takes its own short-lived `DashMap` `Ref` and
        // drops it before the next `self.nodes` call on a different key —
        // a `Ref` held across a `remove`/`insert` on a colliding shard
        // would deadlock against `DashMap`'s internal per-shard `RwLock`.
        let existing_longid = {
            let entry = self.nodes.get(&dir.longid).ok_or(VrError::NotFound)?;
            let guard = entry.lock().await;
            self.check(identity, Class::Write, &guard.access)?;
            let Payload::Directory(dirp) = &guard.payload else { return Err(VrError::NotADirectory) };
            match dirp.entries.get(arc) {
                Some(_) if dupe_check == DupeCheck::DontReplace => return Err(VrError::NameInUse),
                Some(existing) => Some(existing.longid),
                None => None,
            }
        };

        if let Some(existing_longid) = existing_longid {
            if dupe_check == DupeCheck::ReplaceNonMaster {
                let is_master = {
                    let node = self.nodes.get(&existing_longid).ok_or(VrError::NotFound)?;
                    node.lock().await.master
                };
                if is_master {
                    return Err(VrError::NameInUse);
                }
            }
            self.nodes.remove(&existing_longid);
            let entry = self.nodes.get(&dir.longid).ok_or(VrError::NotFound)?;
            let mut guard = entry.lock().await;
            let Payload::Directory(dirp) = &mut guard.payload else { return Err(VrError::NotADirectory) };
            dirp.entries.remove(arc);
        }

        let (index, child_longid, owner, group) = {
            let entry = self.nodes.get(&dir.longid).ok_or(VrError::NotFound)?;
            let mut guard = entry.lock().await;
            let Payload::Directory(dirp) = &mut guard.payload else { return Err(VrError::NotADirectory) };
            let index = dirp.next_index;
            dirp.next_index += 1;
            let child_longid = dir.longid.append(index).map_err(|_| VrError::LongIdOverflow)?;
            dirp.entries.insert(arc.clone(), DirEntry { longid: child_longid, index });
            (index, child_longid, guard.access.owner.clone(), guard.access.group.clone())
        };
        let _ = index;

        let (new_kind, payload) = match kind {
            InsertKind::File => (Kind::ImmutableFile, Payload::File(FilePayload { shortid: None, len: 0 })),
            InsertKind::MutableFile => {
                (Kind::MutableFile, Payload::File(FilePayload { shortid: Some(self.alloc_shortid()), len: 0 }))
            }
            InsertKind::ImmutableDirectory => (Kind::ImmutableDirectory, Payload::Directory(DirectoryPayload::empty())),
            InsertKind::AppendableDirectory => (Kind::AppendableDirectory, Payload::Directory(DirectoryPayload::empty())),
            InsertKind::MutableDirectory => (Kind::MutableDirectory, Payload::Directory(DirectoryPayload::empty())),
            InsertKind::Ghost => (Kind::Ghost, Payload::Leaf),
            InsertKind::Stub => (Kind::Stub, Payload::Leaf),
        };

        let child_node = Node {
            kind: new_kind,
            master,
            pseudo_inode: self.alloc_pseudo_inode(),
            fptag,
            access: Record { mode: access::ModeBits::all(), owner, group },
            attribs: History::new(),
            payload,
        };
        self.nodes.insert(child_longid, Mutex::new(child_node));
        debug!(?child_longid, arc = %arc, "inserted source");

        let child_entry = self.nodes.get(&child_longid).ok_or(VrError::NotFound)?;
        let child_guard = child_entry.lock().await;
        Ok(self.to_source(child_longid, &child_guard))
    }

    async fn really_delete(&self, dir: &Source, arc: &ArcName, exist_check: bool, identity: &Identity) -> Result<()> {
        let _held = self.write_lock.lock().await;
        let removed_longid = {
            let entry = self.nodes.get(&dir.longid).ok_or(VrError::NotFound)?;
            let mut guard = entry.lock().await;
            self.check(identity, Class::Write, &guard.access)?;
            let Payload::Directory(dirp) = &mut guard.payload else { return Err(VrError::NotADirectory) };
            dirp.entries.remove(arc)
        };

        match removed_longid {
            Some(de) => {
                self.nodes.remove(&de.longid);
                Ok(())
            }
            None if exist_check => Err(VrError::NotFound),
            None => Ok(()),
        }
    }

    async fn rename_to(
        &self,
        target_dir: &Source,
        target_arc: &ArcName,
        from_dir: &Source,
        from_arc: &ArcName,
        identity: &Identity,
    ) -> Result<()> {
        let _held = self.write_lock.lock().await;

        let moved_longid = {
            let from_entry = self.nodes.get(&from_dir.longid).ok_or(VrError::NotFound)?;
            let mut from_guard = from_entry.lock().await;
            self.check(identity, Class::Write, &from_guard.access)?;
            let Payload::Directory(from_dirp) = &mut from_guard.payload else { return Err(VrError::NotADirectory) };
            from_dirp.entries.remove(from_arc).ok_or(VrError::NotFound)?.longid
        };

        let target_entry = self.nodes.get(&target_dir.longid).ok_or(VrError::NotFound)?;
        let mut target_guard = target_entry.lock().await;
        self.check(identity, Class::Write, &target_guard.access)?;
        let Payload::Directory(target_dirp) = &mut target_guard.payload else { return Err(VrError::NotADirectory) };
        if target_dirp.entries.contains_key(target_arc) {
            return Err(VrError::NameInUse);
        }
        let index = target_dirp.next_index;
        target_dirp.next_index += 1;
        target_dirp.entries.insert(target_arc.clone(), DirEntry { longid: moved_longid, index });
        Ok(())
    }

    async fn make_mutable(&self, src: &Source, new_shortid: Option<ShortId>, copy_max: u64, identity: &Identity) -> Result<Source> {
        let _held = self.write_lock.lock().await;
        let entry = self.nodes.get(&src.longid).ok_or(VrError::NotFound)?;
        let mut guard = entry.lock().await;
        self.check(identity, Class::Write, &guard.access)?;

        match (&mut guard.payload, guard.kind) {
            (Payload::File(fp), Kind::ImmutableFile) => {
                let sid = new_shortid.unwrap_or_else(|| self.alloc_shortid());
                if let Some(old_sid) = fp.shortid {
                    if fp.len <= copy_max {
                        if let Some(bytes) = self.blobs.get(&old_sid) {
                            self.blobs.insert(sid, bytes.clone());
                        }
                    }
                }
                fp.shortid = Some(sid);
                guard.kind = Kind::MutableFile;
            }
            (Payload::Directory(_), k) if k.is_directory() => {
                guard.kind = Kind::MutableDirectory;
            }
            _ => return Err(VrError::InappropriateOp),
        }

        Ok(self.to_source(src.longid, &guard))
    }

    async fn make_files_immutable(&self, root: &Source, threshold: u64, identity: &Identity) -> Result<()> {
        let _held = self.write_lock.lock().await;
        self.make_files_immutable_rec(root.longid, threshold, identity).await
    }

    async fn read(&self, file: &Source, offset: u64, nbytes: u32, identity: &Identity) -> Result<Vec<u8>> {
        let entry = self.nodes.get(&file.longid).ok_or(VrError::NotFound)?;
        let guard = entry.lock().await;
        self.check(identity, Class::Read, &guard.access)?;
        let Payload::File(fp) = &guard.payload else { return Err(VrError::IsADirectory) };
        let Some(sid) = fp.shortid else { return Ok(Vec::new()) };
        let Some(bytes) = self.blobs.get(&sid) else { return Ok(Vec::new()) };
        let start = (offset as usize).min(bytes.len());
        let end = (start + nbytes as usize).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    async fn write(&self, file: &Source, offset: u64, data: &[u8], identity: &Identity) -> Result<()> {
        let _held = self.write_lock.lock().await;
        let entry = self.nodes.get(&file.longid).ok_or(VrError::NotFound)?;
        let mut guard = entry.lock().await;
        self.check(identity, Class::Write, &guard.access)?;
        if guard.kind != Kind::MutableFile {
            return Err(VrError::InappropriateOp);
        }
        let Payload::File(fp) = &mut guard.payload else { return Err(VrError::IsADirectory) };
        let sid = *fp.shortid.get_or_insert_with(|| self.alloc_shortid());
        let mut bytes = self.blobs.entry(sid).or_default();
        let end = offset as usize + data.len();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[offset as usize..end].copy_from_slice(data);
        fp.len = bytes.len() as u64;
        Ok(())
    }

    async fn set_master(&self, src: &Source, master: bool, identity: &Identity) -> Result<()> {
        let entry = self.nodes.get(&src.longid).ok_or(VrError::NotFound)?;
        let mut guard = entry.lock().await;
        self.check(identity, Class::Administrative, &guard.access)?;
        guard.master = master;
        Ok(())
    }

    async fn set_index_master(&self, dir: &Source, index: u32, master: bool, identity: &Identity) -> Result<()> {
        let (child, _) = self.lookup_index(dir, index, identity).await?;
        self.set_master(&child, master, identity).await
    }

    async fn cede_mastership(&self, src: &Source, identity: &Identity) -> Result<()> {
        self.set_master(src, false, identity).await
    }

    /// This reference server runs as a single standalone process (no
    /// multi-repository federation); cross-repository replication
    /// requires a peer repository reachable through [`crate::pool`],
    /// which the binary built around this type does not configure.
    async fn replicate(&self, _src: &Source, _pathname: &str, _host: &str, _port: u16, _identity: &Identity) -> Result<()> {
        Err(VrError::InappropriateOp)
    }

    async fn replicate_attribs(&self, _src: &Source, _pathname: &str, _host: &str, _port: u16, _identity: &Identity) -> Result<()> {
        Err(VrError::InappropriateOp)
    }

    async fn acquire_mastership(&self, _src: &Source, _pathname: &str, _host: &str, _port: u16, _identity: &Identity) -> Result<()> {
        Err(VrError::InappropriateOp)
    }

    async fn measure_directory(&self, dir: &Source, identity: &Identity) -> Result<DirectoryMeasurement> {
        let entry = self.nodes.get(&dir.longid).ok_or(VrError::NotFound)?;
        let guard = entry.lock().await;
        self.check(identity, Class::Read, &guard.access)?;
        let Payload::Directory(dirp) = &guard.payload else { return Err(VrError::NotADirectory) };

        let mut measurement = DirectoryMeasurement::default();
        measurement.base_chain_length = if dirp.base.is_some() { 1 } else { 0 };
        for (arc, _) in &dirp.entries {
            measurement.total_entry_count += 1;
            measurement.total_entry_size += arc.as_str().len() as u64 + 1;
            measurement.used_entry_count += 1;
            measurement.used_entry_size += arc.as_str().len() as u64 + 1;
        }
        Ok(measurement)
    }

    async fn collapse_base(&self, dir: &Source, identity: &Identity) -> Result<()> {
        let entry = self.nodes.get(&dir.longid).ok_or(VrError::NotFound)?;
        let mut guard = entry.lock().await;
        self.check(identity, Class::Write, &guard.access)?;
        let Payload::Directory(dirp) = &mut guard.payload else { return Err(VrError::NotADirectory) };
        dirp.base = None;
        Ok(())
    }

    async fn get_base(&self, dir: &Source, identity: &Identity) -> Result<Option<Source>> {
        let entry = self.nodes.get(&dir.longid).ok_or(VrError::NotFound)?;
        let guard = entry.lock().await;
        self.check(identity, Class::Read, &guard.access)?;
        let Payload::Directory(dirp) = &guard.payload else { return Err(VrError::NotADirectory) };
        match dirp.base {
            None => Ok(None),
            Some(base_longid) => {
                let base_entry = self.nodes.get(&base_longid).ok_or(VrError::NotFound)?;
                let base_guard = base_entry.lock().await;
                Ok(Some(self.to_source(base_longid, &base_guard)))
            }
        }
    }
}

impl Repository {
    fn make_files_immutable_rec<'a>(
        &'a self,
        longid: LongId,
        threshold: u64,
        identity: &'a Identity,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let children: Vec<LongId> = {
                let entry = self.nodes.get(&longid).ok_or(VrError::NotFound)?;
                let guard = entry.lock().await;
                match &guard.payload {
                    Payload::Directory(dirp) => dirp.entries.values().map(|e| e.longid).collect(),
                    _ => Vec::new(),
                }
            };

            for child in children {
                self.make_files_immutable_rec(child, threshold, identity).await?;
            }

            let entry = self.nodes.get(&longid).ok_or(VrError::NotFound)?;
            let mut guard = entry.lock().await;
            if guard.kind == Kind::MutableFile {
                if let Payload::File(fp) = &guard.payload {
                    if fp.len <= threshold {
                        guard.kind = Kind::ImmutableFile;
                    }
                }
            }
            Ok(())
        })
    }

    /// Attribute read/write entry points, exposed directly since they
    /// are per-object and not part of the tree-navigation contract in
    /// [`SourceOps`] (spec §4.7).
    pub async fn get_attribs(&self, src: &Source) -> Result<Arc<History>> {
        let entry = self.nodes.get(&src.longid).ok_or(VrError::NotFound)?;
        let guard = entry.lock().await;
        Ok(Arc::new(guard.attribs.clone()))
    }

    pub async fn write_attrib(
        &self,
        src: &Source,
        op: attribs::Op,
        name: &str,
        value: &str,
        timestamp: i64,
        identity: &Identity,
    ) -> Result<()> {
        let entry = self.nodes.get(&src.longid).ok_or(VrError::NotFound)?;
        let mut guard = entry.lock().await;
        self.check(identity, Class::Agreement, &guard.access)?;
        guard.attribs.write_attrib(op, name, value, timestamp);
        Ok(())
    }

    /// Overwrites `src`'s attribute history wholesale. Used by the
    /// atomic interpreter's `merge-attrib` step, which computes the
    /// merged history value-side (see [`crate::attribs::History::merge_attrib`])
    /// and then commits it back in one step.
    pub async fn replace_attribs(&self, src: &Source, history: History) -> Result<()> {
        let entry = self.nodes.get(&src.longid).ok_or(VrError::NotFound)?;
        let mut guard = entry.lock().await;
        guard.attribs = history;
        Ok(())
    }

    /// `access-check` step support: does `identity` hold `class` against
    /// `src`'s access record, without raising `NoPermission` itself (the
    /// caller, e.g. [`crate::atomic`], turns a `false` into whatever
    /// error code the step catalogue specifies).
    pub async fn check_access(&self, src: &Source, class: Class, identity: &Identity) -> Result<bool> {
        let entry = self.nodes.get(&src.longid).ok_or(VrError::NotFound)?;
        let guard = entry.lock().await;
        Ok(access::check(identity, class, &guard.access, None, &self.policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_policy() -> Policy {
        Policy { admin_user: "admin@vesta".into(), admin_group: vec![], restrict_delete: false }
    }

    fn id() -> Identity {
        Identity::Global(access::GlobalIdentity { name: "admin@vesta".into(), origin: None, read_only: false })
    }

    #[tokio::test]
    async fn insert_then_lookup_roundtrips() {
        let repo = Repository::new(test_policy(), "admin@vesta");
        let root_node = repo.nodes.get(&longid::mutable_root()).unwrap();
        let root = repo.to_source(longid::mutable_root(), &root_node.lock().await);

        let arc = ArcName::new("foo").unwrap();
        let created = repo
            .insert(&root, InsertKind::MutableFile, &arc, true, DupeCheck::DontReplace, None, &id())
            .await
            .unwrap();
        assert_eq!(created.kind, Kind::MutableFile);

        let found = repo.lookup(&root, &arc, &id()).await.unwrap();
        assert_eq!(found.longid, created.longid);
    }

    #[tokio::test]
    async fn insert_duplicate_without_replace_fails() {
        let repo = Repository::new(test_policy(), "admin@vesta");
        let root_node = repo.nodes.get(&longid::mutable_root()).unwrap();
        let root = repo.to_source(longid::mutable_root(), &root_node.lock().await);
        let arc = ArcName::new("dup").unwrap();

        repo.insert(&root, InsertKind::File, &arc, true, DupeCheck::DontReplace, None, &id()).await.unwrap();
        let err = repo
            .insert(&root, InsertKind::File, &arc, true, DupeCheck::DontReplace, None, &id())
            .await
            .unwrap_err();
        assert_eq!(err, VrError::NameInUse);
    }

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let repo = Repository::new(test_policy(), "admin@vesta");
        let root_node = repo.nodes.get(&longid::mutable_root()).unwrap();
        let root = repo.to_source(longid::mutable_root(), &root_node.lock().await);
        let arc = ArcName::new("data").unwrap();
        let file = repo
            .insert(&root, InsertKind::MutableFile, &arc, true, DupeCheck::DontReplace, None, &id())
            .await
            .unwrap();

        repo.write(&file, 0, b"hello", &id()).await.unwrap();
        let back = repo.read(&file, 0, 5, &id()).await.unwrap();
        assert_eq!(back, b"hello");
    }

    #[tokio::test]
    async fn rename_moves_entry_between_directories() {
        let repo = Repository::new(test_policy(), "admin@vesta");
        let root_node = repo.nodes.get(&longid::mutable_root()).unwrap();
        let root = repo.to_source(longid::mutable_root(), &root_node.lock().await);

        let src_arc = ArcName::new("src").unwrap();
        let file = repo
            .insert(&root, InsertKind::File, &src_arc, true, DupeCheck::DontReplace, None, &id())
            .await
            .unwrap();

        let dst_arc = ArcName::new("dst").unwrap();
        repo.rename_to(&root, &dst_arc, &root, &src_arc, &id()).await.unwrap();

        assert!(repo.lookup(&root, &src_arc, &id()).await.is_err());
        let moved = repo.lookup(&root, &dst_arc, &id()).await.unwrap();
        assert_eq!(moved.longid, file.longid);
    }

    #[tokio::test]
    async fn make_mutable_changes_kind_preserves_longid() {
        let repo = Repository::new(test_policy(), "admin@vesta");
        let root_node = repo.nodes.get(&longid::root()).unwrap();
        let root = repo.to_source(longid::root(), &root_node.lock().await);
        let arc = ArcName::new("imm").unwrap();
        let file = repo
            .insert(&root, InsertKind::File, &arc, true, DupeCheck::DontReplace, None, &id())
            .await
            .unwrap();

        let mutable = repo.make_mutable(&file, None, 1024, &id()).await.unwrap();
        assert_eq!(mutable.longid, file.longid);
        assert_eq!(mutable.kind, Kind::MutableFile);
    }
}
