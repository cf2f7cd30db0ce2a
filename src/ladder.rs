//! Binary Ladders
//!
//! A ladder is the deterministic schedule of version lookups the server
//! answers for one log entry, amortising (non-)inclusion proofs across the
//! versions of a label. The probe schedule for target `t` doubles through
//! 0, 1, 3, 7, ... until it first exceeds `t`, then binary-halves the final
//! bracket, recording every probe, until the bracket has width one.
//!
//! Facts proven at other log positions make probes redundant: versions only
//! accumulate along the log, so an inclusion seen at-or-left of a position
//! or a non-inclusion seen at-or-right of it already answers the probe
//! there. The walker consumes those facts without emitting a lookup.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LadderError {
    #[error("ladder results contradict earlier facts: {0}")]
    Contradiction(String),

    #[error("ladder ended without a verdict")]
    Ambiguous,
}

/// Which algorithm is driving the ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderFlavor {
    /// Fixed-version search: stops as soon as the entry is classified.
    Search,
    /// Monitoring: probes every non-redundant version up to the target.
    Monitoring,
    /// Greatest-version search: a search ladder whose target is the
    /// claimed greatest version.
    Greatest,
}

/// Full probe schedule for target `t`, doubling then halving.
pub fn base_schedule(t: u32) -> Vec<u32> {
    let t = t as u64;
    let mut out: Vec<u64> = Vec::new();
    let mut i = 0u32;
    loop {
        let val = (1u64 << i) - 1;
        out.push(val);
        if val > t {
            break;
        }
        i += 1;
    }
    if out.len() >= 2 {
        let mut lo = out[out.len() - 2];
        let mut hi = out[out.len() - 1];
        while hi - lo > 1 {
            let mid = (lo + hi) / 2;
            out.push(mid);
            if mid <= t {
                lo = mid;
            } else {
                hi = mid;
            }
        }
    }
    out.into_iter().map(|v| v as u32).collect()
}

/// Facts already proven at other log positions. Versions only grow along
/// the log, so an inclusion propagates rightward and a non-inclusion
/// propagates leftward.
#[derive(Debug, Default, Clone)]
pub struct LadderState {
    /// version -> leftmost position where it was proven included
    inclusions: BTreeMap<u32, u64>,
    /// version -> rightmost position where it was proven absent
    non_inclusions: BTreeMap<u32, u64>,
}

impl LadderState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_inclusion(&mut self, version: u32, pos: u64) {
        self.inclusions
            .entry(version)
            .and_modify(|p| *p = (*p).min(pos))
            .or_insert(pos);
    }

    pub fn note_non_inclusion(&mut self, version: u32, pos: u64) {
        self.non_inclusions
            .entry(version)
            .and_modify(|p| *p = (*p).max(pos))
            .or_insert(pos);
    }

    fn known_included(&self, version: u32, pos: u64) -> bool {
        self.inclusions.get(&version).is_some_and(|&p| p <= pos)
    }

    fn known_absent(&self, version: u32, pos: u64) -> bool {
        self.non_inclusions.get(&version).is_some_and(|&p| p >= pos)
    }
}

/// Incremental ladder walker. The producer answers `next_version` from its
/// label index; the verifier answers it from the proof stream. Both feed
/// the outcome back through `record`, so the emitted version sequence is
/// identical on both sides by construction.
#[derive(Debug)]
pub struct LadderWalker {
    flavor: LadderFlavor,
    target: u32,
    pos: u64,
    schedule: Vec<u32>,
    idx: usize,
    done: bool,
    max_included: Option<u32>,
    min_absent: Option<u32>,
}

impl LadderWalker {
    pub fn new(flavor: LadderFlavor, target: u32, pos: u64) -> Self {
        Self {
            flavor,
            target,
            pos,
            schedule: base_schedule(target),
            idx: 0,
            done: false,
            max_included: None,
            min_absent: None,
        }
    }

    /// Next version to look up, or None when the ladder is finished.
    /// Versions answered by `state` are folded in without being emitted.
    pub fn next_version(&mut self, state: &LadderState) -> Result<Option<u32>, LadderError> {
        while !self.done && self.idx < self.schedule.len() {
            let v = self.schedule[self.idx];
            if self.flavor == LadderFlavor::Monitoring && v > self.target {
                self.idx += 1;
                continue;
            }
            if state.known_included(v, self.pos) {
                self.idx += 1;
                self.absorb(v, true)?;
                continue;
            }
            if state.known_absent(v, self.pos) {
                self.idx += 1;
                self.absorb(v, false)?;
                continue;
            }
            return Ok(Some(v));
        }
        Ok(None)
    }

    /// Feed back the outcome of a lookup emitted by `next_version`.
    pub fn record(
        &mut self,
        version: u32,
        included: bool,
        state: &mut LadderState,
    ) -> Result<(), LadderError> {
        if included {
            state.note_inclusion(version, self.pos);
        } else {
            state.note_non_inclusion(version, self.pos);
        }
        self.idx += 1;
        self.absorb(version, included)
    }

    fn absorb(&mut self, version: u32, included: bool) -> Result<(), LadderError> {
        if included {
            if self.min_absent.is_some_and(|a| version >= a) {
                return Err(LadderError::Contradiction(format!(
                    "version {version} included above an absent version"
                )));
            }
            self.max_included = Some(self.max_included.map_or(version, |m| m.max(version)));
            if version >= self.target {
                self.done = true;
            }
        } else {
            if self.max_included.is_some_and(|m| version <= m) {
                return Err(LadderError::Contradiction(format!(
                    "version {version} absent below an included version"
                )));
            }
            self.min_absent = Some(self.min_absent.map_or(version, |m| m.min(version)));
            if version <= self.target {
                self.done = true;
            }
        }
        Ok(())
    }

    /// Classify the entry's greatest version against the target:
    /// Less, Equal, or Greater. None if the facts do not disambiguate.
    pub fn verdict(&self) -> Option<Ordering> {
        if self.min_absent.is_some_and(|a| a <= self.target) {
            return Some(Ordering::Less);
        }
        match self.max_included {
            Some(m) if m > self.target => Some(Ordering::Greater),
            Some(m) if m == self.target => Some(Ordering::Equal),
            _ => None,
        }
    }
}

/// Run a full ladder with a presence oracle (the producer side): returns
/// the emitted lookups with their outcomes, updating `state`.
pub fn run_with_oracle(
    flavor: LadderFlavor,
    target: u32,
    pos: u64,
    greatest: Option<u32>,
    state: &mut LadderState,
) -> Result<(Vec<(u32, bool)>, Option<Ordering>), LadderError> {
    let mut walker = LadderWalker::new(flavor, target, pos);
    let mut emitted = Vec::new();
    while let Some(v) = walker.next_version(state)? {
        let included = greatest.is_some_and(|g| v <= g);
        walker.record(v, included, state)?;
        emitted.push((v, included));
    }
    Ok((emitted, walker.verdict()))
}
