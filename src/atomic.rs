//! Atomic program interpreter (C10): a client-composed straight-line
//! program of [`crate::source::SourceOps`] steps, executed server-side
//! with commit-on-progress, no-rollback semantics (spec §4.10).
//!
//! Step argument shapes follow `original_source`'s
//! `VestaSourceAtomic.H` step catalogue (`declare`/`set-target`/
//! `test-master`/`access-check`/`type-check` named explicitly there;
//! spec.md's prose list names the rest).

use crate::access::{Class, Identity};
use crate::attribs;
use crate::longid::{FpTag, LongId};
use crate::repository::Repository;
use crate::source::{ArcName, DupeCheck, InsertKind, Kind, Source, SourceOps, VrError};

/// An index into a program's slot table (the interpreter's only
/// "variable"). Slot 0 is conventionally bound to a root via the first
/// `Declare` step.
pub type Slot = usize;

/// One instruction in a program (spec §4.10).
#[derive(Debug, Clone)]
pub enum Step {
    /// Sets the two codes that count as "continue" for every following
    /// step until the next `SetTarget`, plus the code substituted for a
    /// clean `ok` completion in the final response.
    SetTarget { target1: VrError, target2: VrError, ok_replacement: VrError },
    /// Binds `slot` directly to a known [`LongId`] (no server lookup).
    Declare { slot: Slot, longid: LongId },
    /// Refreshes `slot`'s cached Source fields from the current tree
    /// state (a no-op against this in-process repository, which never
    /// caches independently of the tree — kept as a distinct step so
    /// program traces match the original protocol).
    Resync { slot: Slot },
    /// Sets the "now" substituted for any step in this program that
    /// defaults its timestamp argument to 0.
    SetTimestamp { timestamp: i64 },
    Lookup { dir: Slot, arc: ArcName, result: Slot },
    LookupPathname { start: Slot, path: String, result: Slot },
    LookupIndex { dir: Slot, index: u32, result: Slot },
    ReallyDelete { dir: Slot, arc: ArcName, exist_check: bool },
    Insert {
        dir: Slot,
        kind: InsertKind,
        arc: ArcName,
        master: bool,
        dupe_check: DupeCheck,
        fptag: Option<FpTag>,
        result: Slot,
    },
    RenameTo { target_dir: Slot, target_arc: ArcName, from_dir: Slot, from_arc: ArcName },
    MakeFilesImmutable { root: Slot, threshold: u64 },
    /// `testMaster` — succeeds (`ok`) iff `slot`'s master flag equals
    /// `expected`, else `notMaster`.
    TestMaster { slot: Slot, expected: bool },
    SetMaster { slot: Slot, master: bool },
    /// `inAttribs` as a step predicate: `ok` iff `value` is currently a
    /// member of `F(name)`, else `notFound`.
    InAttribs { slot: Slot, name: String, value: String },
    /// `timestamp = None` defaults to the program's sampled "now" (see
    /// [`Step::SetTimestamp`]).
    WriteAttrib { slot: Slot, op: attribs::Op, name: String, value: String, timestamp: Option<i64> },
    MergeAttrib { dst: Slot, src: Slot, name: String },
    AccessCheck { slot: Slot, class: Class },
    /// `ok` iff `slot`'s kind equals `expected`, else `inappropriateOp`.
    TypeCheck { slot: Slot, expected: Kind },
}

/// A straight-line sequence of [`Step`]s built by the client before
/// `run` ships it to the server in one RPC (spec §4.9/§4.10).
#[derive(Debug, Clone, Default)]
pub struct Program {
    steps: Vec<Step>,
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }

    pub fn push(&mut self, step: Step) -> &mut Self {
        self.steps.push(step);
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

/// `(steps_done, last_error, okreplacement, success)` from spec §4.10.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub steps_done: usize,
    pub last_error: VrError,
    pub ok_replacement: VrError,
    pub success: bool,
}

struct State {
    slots: Vec<Option<Source>>,
    target1: VrError,
    target2: VrError,
    ok_replacement: VrError,
    timestamp: i64,
}

impl State {
    fn new(now: i64) -> Self {
        State { slots: Vec::new(), target1: VrError::Ok, target2: VrError::Ok, ok_replacement: VrError::Ok, timestamp: now }
    }

    fn ensure(&mut self, slot: Slot) {
        if self.slots.len() <= slot {
            self.slots.resize(slot + 1, None);
        }
    }

    fn get(&self, slot: Slot) -> Result<Source, VrError> {
        self.slots.get(slot).copied().flatten().ok_or(VrError::InvalidArgs)
    }

    fn set(&mut self, slot: Slot, src: Source) {
        self.ensure(slot);
        self.slots[slot] = Some(src);
    }
}

/// Runs `program` against `repo`, sampling "now" once for the whole
/// program (spec §4.7's "one `now` value is sampled per program and
/// applied to all defaulted-timestamp steps").
///
/// Each [`Step`] that mutates the tree takes `repo`'s per-directory
/// locks for just that step rather than one program-wide write lock
/// (see `DESIGN.md`: the original's single stable-namespace write lock
/// is approximated here by `repository`'s finer-grained per-node
/// locking, since `SourceOps` methods each acquire what they need
/// internally and are not reentrant-safe to call under an outer lock
/// of the same kind). Programs still observe commit-on-progress,
/// no-rollback semantics; they are not serialized against each other
/// as one atomic unit the way a single process-wide lock would give.
pub async fn run(repo: &Repository, identity: &Identity, now: i64, program: &Program) -> Outcome {
    let mut state = State::new(now);
    let mut steps_done = 0usize;
    let mut last_error = VrError::Ok;

    for step in program.steps() {
        let code = execute_step(repo, identity, step, &mut state).await;
        match code {
            Ok(()) => {
                last_error = VrError::Ok;
                if last_error == state.target1 || last_error == state.target2 {
                    steps_done += 1;
                } else {
                    return Outcome { steps_done, last_error, ok_replacement: state.ok_replacement, success: false };
                }
            }
            Err(e) => {
                last_error = e;
                if e == state.target1 || e == state.target2 {
                    steps_done += 1;
                } else {
                    return Outcome { steps_done, last_error, ok_replacement: state.ok_replacement, success: false };
                }
            }
        }
    }

    let success = last_error == VrError::Ok;
    let reported = if success { state.ok_replacement } else { last_error };
    Outcome { steps_done, last_error: reported, ok_replacement: state.ok_replacement, success }
}

async fn execute_step(repo: &Repository, identity: &Identity, step: &Step, state: &mut State) -> Result<(), VrError> {
    match step {
        Step::SetTarget { target1, target2, ok_replacement } => {
            state.target1 = *target1;
            state.target2 = *target2;
            state.ok_replacement = *ok_replacement;
            Ok(())
        }
        Step::Declare { slot, longid } => {
            // A declared LongId has no known kind/master/pseudo-inode
            // until resolved; stand in with a placeholder that later
            // steps overwrite via `Lookup`/`Insert`.
            state.set(*slot, Source { kind: Kind::Gap, longid: *longid, master: false, pseudo_inode: 0, fptag: None });
            Ok(())
        }
        Step::Resync { slot } => {
            state.get(*slot).map(|_| ())
        }
        Step::SetTimestamp { timestamp } => {
            state.timestamp = *timestamp;
            Ok(())
        }
        Step::Lookup { dir, arc, result } => {
            let dir_src = state.get(*dir)?;
            let found = repo.lookup(&dir_src, arc, identity).await?;
            state.set(*result, found);
            Ok(())
        }
        Step::LookupPathname { start, path, result } => {
            let start_src = state.get(*start)?;
            let found = repo.lookup_pathname(&start_src, path, identity).await?;
            state.set(*result, found);
            Ok(())
        }
        Step::LookupIndex { dir, index, result } => {
            let dir_src = state.get(*dir)?;
            let (found, _arc) = repo.lookup_index(&dir_src, *index, identity).await?;
            state.set(*result, found);
            Ok(())
        }
        Step::ReallyDelete { dir, arc, exist_check } => {
            let dir_src = state.get(*dir)?;
            repo.really_delete(&dir_src, arc, *exist_check, identity).await
        }
        Step::Insert { dir, kind, arc, master, dupe_check, fptag, result } => {
            let dir_src = state.get(*dir)?;
            let created = repo.insert(&dir_src, *kind, arc, *master, *dupe_check, *fptag, identity).await?;
            state.set(*result, created);
            Ok(())
        }
        Step::RenameTo { target_dir, target_arc, from_dir, from_arc } => {
            let target_src = state.get(*target_dir)?;
            let from_src = state.get(*from_dir)?;
            repo.rename_to(&target_src, target_arc, &from_src, from_arc, identity).await
        }
        Step::MakeFilesImmutable { root, threshold } => {
            let root_src = state.get(*root)?;
            repo.make_files_immutable(&root_src, *threshold, identity).await
        }
        Step::TestMaster { slot, expected } => {
            let src = state.get(*slot)?;
            if src.master == *expected {
                Ok(())
            } else {
                Err(VrError::NotMaster)
            }
        }
        Step::SetMaster { slot, master } => {
            let src = state.get(*slot)?;
            repo.set_master(&src, *master, identity).await?;
            state.set(*slot, Source { master: *master, ..src });
            Ok(())
        }
        Step::InAttribs { slot, name, value } => {
            let src = state.get(*slot)?;
            let history = repo.get_attribs(&src).await?;
            if history.in_attribs(name, value) {
                Ok(())
            } else {
                Err(VrError::NotFound)
            }
        }
        Step::WriteAttrib { slot, op, name, value, timestamp } => {
            let src = state.get(*slot)?;
            let ts = resolve_step_timestamp(*timestamp, state.timestamp);
            repo.write_attrib(&src, *op, name, value, ts, identity).await
        }
        Step::MergeAttrib { dst, src, name } => {
            let dst_src = state.get(*dst)?;
            let src_src = state.get(*src)?;
            let source_history = repo.get_attribs(&src_src).await?;
            let mut dst_history = (*repo.get_attribs(&dst_src).await?).clone();
            dst_history.merge_attrib(&source_history, name, state.timestamp);
            repo.replace_attribs(&dst_src, dst_history).await
        }
        Step::AccessCheck { slot, class } => {
            let src = state.get(*slot)?;
            if repo.check_access(&src, *class, identity).await? {
                Ok(())
            } else {
                Err(VrError::NoPermission)
            }
        }
        Step::TypeCheck { slot, expected } => {
            let src = state.get(*slot)?;
            if src.kind == *expected {
                Ok(())
            } else {
                Err(VrError::InappropriateOp)
            }
        }
    }
}

fn resolve_step_timestamp(requested: Option<i64>, program_now: i64) -> i64 {
    match requested {
        Some(0) | None => program_now,
        Some(ts) => ts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{GlobalIdentity, Policy};
    use crate::longid;

    fn policy() -> Policy {
        Policy { admin_user: "admin@vesta".into(), admin_group: vec![], restrict_delete: false }
    }

    fn id() -> Identity {
        Identity::Global(GlobalIdentity { name: "admin@vesta".into(), origin: None, read_only: false })
    }

    #[tokio::test]
    async fn commit_on_progress_scenario_from_spec() {
        // declare(root); insertStub("s", master=true) [target1=ok];
        // testMaster(s, false) [target1=ok] -> halts at step 3 with
        // notMaster, but the stub from step 2 remains.
        let repo = Repository::new(policy(), "admin@vesta");

        let mut program = Program::new();
        program
            .push(Step::SetTarget { target1: VrError::Ok, target2: VrError::Ok, ok_replacement: VrError::Ok })
            .push(Step::Declare { slot: 0, longid: longid::mutable_root() })
            .push(Step::Insert {
                dir: 0,
                kind: InsertKind::Stub,
                arc: ArcName::new("s").unwrap(),
                master: true,
                dupe_check: DupeCheck::DontReplace,
                fptag: None,
                result: 1,
            })
            .push(Step::TestMaster { slot: 1, expected: false });

        let outcome = run(&repo, &id(), 1_000, &program).await;
        assert_eq!(outcome.steps_done, 2);
        assert_eq!(outcome.last_error, VrError::NotMaster);
        assert!(!outcome.success);

        let root = Source { kind: Kind::MutableDirectory, longid: longid::mutable_root(), master: true, pseudo_inode: 0, fptag: None };
        let found = repo.lookup(&root, &ArcName::new("s").unwrap(), &id()).await.unwrap();
        assert_eq!(found.kind, Kind::Stub);
    }

    #[tokio::test]
    async fn empty_program_after_full_program_yields_same_state() {
        let repo = Repository::new(policy(), "admin@vesta");
        let mut program = Program::new();
        program
            .push(Step::Declare { slot: 0, longid: longid::mutable_root() })
            .push(Step::Insert {
                dir: 0,
                kind: InsertKind::File,
                arc: ArcName::new("f").unwrap(),
                master: true,
                dupe_check: DupeCheck::DontReplace,
                fptag: None,
                result: 1,
            });
        let outcome = run(&repo, &id(), 1, &program).await;
        assert!(outcome.success);

        let empty = Program::new();
        let outcome2 = run(&repo, &id(), 2, &empty).await;
        assert!(outcome2.success);
        assert_eq!(outcome2.steps_done, 0);
    }
}
