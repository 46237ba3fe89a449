//! Attribute history engine (C7): a commutative, merge-safe,
//! timestamp-ordered log of `set`/`clear`/`add`/`remove` records whose
//! fold is a function from names to sets of strings.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// The four mutation kinds (spec §3/§4.7). Ordered so that `Op`'s
/// derived `Ord` matches the tie-break order the fold sorts by
/// (`timestamp, op, name, value`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    Set,
    Clear,
    Add,
    Remove,
}

/// One recorded mutation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Record {
    pub timestamp: i64,
    pub op: Op,
    pub name: String,
    pub value: String,
}

/// Errors raised by attribute operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The caller attempted a write without the `agreement` access
    /// class and without administrative credentials.
    NoPermission,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NoPermission => write!(f, "attribute write requires agreement or admin credentials"),
        }
    }
}

impl std::error::Error for Error {}

/// A set *H* of attribute records for one namespace object.
#[derive(Debug, Clone, Default)]
pub struct History {
    records: Vec<Record>,
}

impl History {
    pub fn new() -> Self {
        History { records: Vec::new() }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Appends one record. The caller is responsible for access checks
    /// (see [`crate::access`]); this never fails.
    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    /// Folds the history into *F*: a function from attribute name to
    /// its current set of string values, per the sort-then-fold rule in
    /// spec §3.
    pub fn fold(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut sorted = self.records.clone();
        sorted.sort_by(|a, b| {
            (a.timestamp, a.op, &a.name, &a.value).cmp(&(b.timestamp, b.op, &b.name, &b.value))
        });

        let mut result: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for record in sorted {
            let entry = result.entry(record.name.clone()).or_default();
            match record.op {
                Op::Set => {
                    entry.clear();
                    entry.insert(record.value);
                }
                Op::Clear => entry.clear(),
                Op::Add => {
                    entry.insert(record.value);
                }
                Op::Remove => {
                    entry.remove(&record.value);
                }
            }
        }
        result
    }

    /// `inAttribs(n, v)` — is `v` currently a member of `F(n)`?
    pub fn in_attribs(&self, name: &str, value: &str) -> bool {
        self.fold().get(name).is_some_and(|set| set.contains(value))
    }

    /// `getAttrib(n)` — an arbitrary member of `F(n)`, if any.
    pub fn get_attrib(&self, name: &str) -> Option<String> {
        self.fold().get(name).and_then(|set| set.iter().next().cloned())
    }

    /// `listAttribs` — names with a nonempty value set, in sorted order.
    pub fn list_attribs(&self) -> Vec<String> {
        self.fold().into_iter().filter(|(_, v)| !v.is_empty()).map(|(k, _)| k).collect()
    }

    /// `writeAttrib` — appends a new record. `timestamp = 0` is the
    /// caller asking the server to substitute "now"; callers of this
    /// library function must resolve that substitution themselves (see
    /// [`resolve_timestamp`]) since `History` has no clock access.
    pub fn write_attrib(&mut self, op: Op, name: impl Into<String>, value: impl Into<String>, timestamp: i64) {
        self.push(Record { timestamp, op, name: name.into(), value: value.into() });
    }

    /// Merges another object's `name` attribute into this one: reads
    /// `other`'s *current* folded value set for `name` and re-adds each
    /// value here as a fresh `Add` record at `timestamp`. Folding first
    /// is what keeps the merge commutative regardless of how `other`
    /// arrived at that value set — copying `other`'s raw records (and
    /// their original timestamps/ops) would instead replay history that
    /// may no longer hold once interleaved with this object's own
    /// records. (`mergeAttrib` in the atomic interpreter's step
    /// catalogue; see `mergeAttribCallback`/`mergeValueCallback` in the
    /// original repository server.)
    pub fn merge_attrib(&mut self, other: &History, name: &str, timestamp: i64) {
        let folded = other.fold();
        if let Some(values) = folded.get(name) {
            for value in values {
                self.push(Record { timestamp, op: Op::Add, name: name.to_string(), value: value.clone() });
            }
        }
    }

    /// Compacts the history while preserving equivalence: any record
    /// that cannot affect `F(H ∪ L)` for *any* future `L` is dropped.
    ///
    /// A conservative, provably-safe rule is applied: a record is kept
    /// unless a later (by the same sort order) record on the same name
    /// fully supersedes it on its own — `set`/`clear` fully reset the
    /// name's state, so any record strictly before the last `set` or
    /// `clear` on that name (other than that `set`/`clear` itself) is
    /// redundant for merges that only ever inject records, never delete
    /// them (append-only replication is the engine's only merge mode).
    /// `add`/`remove` records are never dropped: a future merge can
    /// inject an intervening record (e.g. an earlier-dated `clear`)
    /// whose effect depends on them still being present (testable
    /// property 3).
    pub fn compact(&self) -> History {
        let mut sorted = self.records.clone();
        sorted.sort_by(|a, b| {
            (a.timestamp, a.op, &a.name, &a.value).cmp(&(b.timestamp, b.op, &b.name, &b.value))
        });

        let mut last_reset_index: BTreeMap<String, usize> = BTreeMap::new();
        for (i, record) in sorted.iter().enumerate() {
            if matches!(record.op, Op::Set | Op::Clear) {
                last_reset_index.insert(record.name.clone(), i);
            }
        }

        let kept: Vec<Record> = sorted
            .into_iter()
            .enumerate()
            .filter(|(i, record)| match last_reset_index.get(&record.name) {
                Some(&reset_at) => *i >= reset_at,
                None => true,
            })
            .map(|(_, record)| record)
            .collect();

        History { records: kept }
    }
}

/// Resolves a caller-supplied timestamp of `0` to `now`, nudging forward
/// one second past `floor` if that would collide with an existing
/// same-timestamp record's sort position (spec §4.7). `now` and `floor`
/// are both caller-supplied since this module has no clock access.
pub fn resolve_timestamp(requested: i64, now: i64, max_existing_same_second: i64) -> i64 {
    if requested != 0 {
        return requested;
    }
    if now <= max_existing_same_second {
        max_existing_same_second + 1
    } else {
        now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_applies_set_clear_add_remove_in_order() {
        let mut h = History::new();
        h.write_attrib(Op::Add, "k", "a", 1);
        h.write_attrib(Op::Add, "k", "b", 2);
        h.write_attrib(Op::Remove, "k", "a", 3);
        let f = h.fold();
        assert_eq!(f.get("k").unwrap(), &BTreeSet::from(["b".to_string()]));
    }

    #[test]
    fn set_resets_before_further_adds() {
        let mut h = History::new();
        h.write_attrib(Op::Add, "k", "a", 1);
        h.write_attrib(Op::Set, "k", "z", 2);
        let f = h.fold();
        assert_eq!(f.get("k").unwrap(), &BTreeSet::from(["z".to_string()]));
    }

    #[test]
    fn merge_scenario_from_spec() {
        // Object A: {set("k","x",t=10)}, so F(A)("k") = {"x"}. Object B:
        // {add("k","y",t=5), remove("k","x",t=15)}, so F(B)("k") =
        // {"y"}. mergeAttrib(A->B,"k") at t=20 re-adds A's *current*
        // folded value ("x") into B as a fresh record, yielding F(B)("k")
        // = {"x","y"} — not a verbatim copy of A's raw `set` record.
        let mut a = History::new();
        a.write_attrib(Op::Set, "k", "x", 10);

        let mut b = History::new();
        b.write_attrib(Op::Add, "k", "y", 5);
        b.write_attrib(Op::Remove, "k", "x", 15);

        b.merge_attrib(&a, "k", 20);
        let f = b.fold();
        assert_eq!(f.get("k").unwrap(), &BTreeSet::from(["x".to_string(), "y".to_string()]));
    }

    #[test]
    fn compact_preserves_fold_under_future_merge() {
        let mut h = History::new();
        h.write_attrib(Op::Add, "k", "a", 1);
        h.write_attrib(Op::Add, "k", "b", 2);
        h.write_attrib(Op::Set, "k", "z", 3);

        let compacted = h.compact();
        assert_eq!(compacted.fold(), h.fold());

        // future merge injects an operation; compaction must not change
        // the observable result of that merge either.
        let mut extra = History::new();
        extra.write_attrib(Op::Add, "k", "w", 4);

        let mut merged_full = h.clone();
        merged_full.merge_attrib(&extra, "k", 5);
        let mut merged_compacted = compacted.clone();
        merged_compacted.merge_attrib(&extra, "k", 5);
        assert_eq!(merged_full.fold(), merged_compacted.fold());
    }

    #[test]
    fn resolve_timestamp_substitutes_now() {
        assert_eq!(resolve_timestamp(0, 100, 0), 100);
    }

    #[test]
    fn resolve_timestamp_nudges_past_collision() {
        assert_eq!(resolve_timestamp(0, 100, 100), 101);
    }
}
