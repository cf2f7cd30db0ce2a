//! Log Search Algorithms
//!
//! Binary searches over the implicit search tree of log entries. Each
//! entry pins a timestamp and a prefix-tree root; the algorithms descend
//! by binary-ladder verdicts, collecting distinguished entries (those
//! whose bounding timestamps span a monitoring window) and skipping
//! expired regions.

use std::cmp::Ordering;

use crate::ladder::LadderFlavor;
use crate::treemath;

use super::provider::{AlgorithmError, Prober};

/// Clock and policy inputs for one run. `now` is injected so tests can
/// freeze it.
#[derive(Debug, Clone, Copy)]
pub struct ViewParams {
    pub now: u64,
    pub max_ahead: u64,
    pub max_behind: u64,
    pub reasonable_monitoring_window: u64,
    pub maximum_lifetime: Option<u64>,
}

impl ViewParams {
    fn expired(&self, ts: u64, last_ts: u64) -> bool {
        self.maximum_lifetime
            .is_some_and(|ml| last_ts.saturating_sub(ts) >= ml)
    }
}

/// Inspect the timestamps connecting the previous view (size `m`, if any)
/// to the current size `n`: the direct paths of entries `n - 1` and
/// `m - 1`. Monotonicity is enforced by the data provider; freshness of
/// the latest entry is checked here.
pub async fn update_view(
    prober: &mut dyn Prober,
    n: u64,
    m: Option<u64>,
    params: &ViewParams,
) -> Result<(), AlgorithmError> {
    if n == 0 {
        return Err(AlgorithmError::BadRequest("empty log".into()));
    }
    if let Some(m) = m {
        if m == 0 || m > n {
            return Err(AlgorithmError::BadRequest(format!(
                "previous size {m} is incompatible with current size {n}"
            )));
        }
    }
    let mut positions = treemath::bst_direct_path(n - 1, n);
    if let Some(m) = m {
        positions.extend(treemath::bst_direct_path(m - 1, n));
    }
    positions.sort_unstable();
    positions.dedup();
    for pos in positions {
        prober.timestamp(pos).await?;
    }

    let latest = prober.timestamp(n - 1).await?;
    if latest + params.max_behind < params.now {
        return Err(AlgorithmError::ProofViolation(
            "latest log entry is too far behind local time".into(),
        ));
    }
    if latest > params.now + params.max_ahead {
        return Err(AlgorithmError::ProofViolation(
            "latest log entry is ahead of local time".into(),
        ));
    }
    Ok(())
}

/// Walk the right spine of the search tree while a distinguished entry can
/// still exist further right, returning the rightmost distinguished entry.
/// Each returned entry is sandwiched between a spine ancestor and the last
/// entry, with at least one monitoring window between their timestamps.
pub async fn rightmost_distinguished(
    prober: &mut dyn Prober,
    n: u64,
    params: &ViewParams,
) -> Result<Option<u64>, AlgorithmError> {
    let last_ts = prober.timestamp(n - 1).await?;
    let mut cur = treemath::bst_root(0, n);
    let mut out = None;
    loop {
        let ts = prober.timestamp(cur).await?;
        if last_ts.saturating_sub(ts) < params.reasonable_monitoring_window {
            break;
        }
        match treemath::bst_right(cur, n) {
            Some(r) => {
                out = Some(r);
                cur = r;
            }
            None => break,
        }
    }
    Ok(out)
}

/// Find the first log entry at which `target` exists. Returns the terminal
/// position after emitting its point inclusion proof.
pub async fn fixed_version_search(
    prober: &mut dyn Prober,
    n: u64,
    target: u32,
    params: &ViewParams,
) -> Result<u64, AlgorithmError> {
    let last_ts = prober.timestamp(n - 1).await?;

    let mut lo = 0u64;
    let mut hi = n;
    let mut cur = treemath::bst_root(0, n);
    let mut left_ts: Option<u64> = None;
    let mut right_ts: Option<u64> = None;
    let mut terminal: Option<u64> = None;
    let mut expired_seen = false;
    let mut distinguished: Vec<u64> = Vec::new();

    loop {
        let ts = prober.timestamp(cur).await?;
        let is_expired = params.expired(ts, last_ts);
        let span = right_ts
            .unwrap_or(last_ts)
            .saturating_sub(left_ts.unwrap_or(ts));
        if span >= params.reasonable_monitoring_window && !is_expired {
            distinguished.push(cur);
        }

        if is_expired {
            if let Some(r) = treemath::bst_right(cur, hi) {
                expired_seen = true;
                left_ts = Some(ts);
                lo = cur + 1;
                cur = r;
                continue;
            }
        }

        let verdict = prober.ladder(cur, LadderFlavor::Search, target).await?;
        match verdict {
            Ordering::Less => match treemath::bst_right(cur, hi) {
                Some(r) => {
                    left_ts = Some(ts);
                    lo = cur + 1;
                    cur = r;
                }
                None => break,
            },
            Ordering::Greater | Ordering::Equal => {
                if terminal.map_or(true, |t| cur < t) {
                    terminal = Some(cur);
                }
                if verdict == Ordering::Equal {
                    break;
                }
                match treemath::bst_left(cur, lo) {
                    Some(l) => {
                        right_ts = Some(ts);
                        hi = cur;
                        cur = l;
                    }
                    None => break,
                }
            }
        }
    }

    let terminal = match terminal {
        Some(t) => t,
        None => return Err(AlgorithmError::LabelNotFound),
    };
    if expired_seen && !distinguished.iter().any(|&d| terminal <= d) {
        return Err(AlgorithmError::LabelExpired);
    }
    prober.point_inclusion(terminal, target).await?;
    Ok(terminal)
}

/// Confirm that `target` is the label's greatest version and find the
/// entry at which it appeared. Starts at the rightmost distinguished entry
/// (or the root) and follows the frontier to the last entry.
pub async fn greatest_version_search(
    prober: &mut dyn Prober,
    n: u64,
    target: u32,
    params: &ViewParams,
) -> Result<u64, AlgorithmError> {
    let start = rightmost_distinguished(prober, n, params).await?;
    let mut cur = start.unwrap_or_else(|| treemath::bst_root(0, n));
    let mut found: Option<u64> = None;
    loop {
        prober.timestamp(cur).await?;
        let verdict = prober.ladder(cur, LadderFlavor::Greatest, target).await?;
        match verdict {
            Ordering::Equal => {
                if found.is_none() {
                    found = Some(cur);
                }
            }
            Ordering::Less if found.is_none() => {}
            Ordering::Less => {
                return Err(AlgorithmError::ProofViolation(format!(
                    "greatest version disappeared after entry {cur}"
                )))
            }
            Ordering::Greater => {
                return Err(AlgorithmError::ProofViolation(format!(
                    "entry {cur} holds a version above the claimed greatest"
                )))
            }
        }
        match treemath::bst_right(cur, n) {
            Some(r) => cur = r,
            None => break,
        }
    }
    let found = found.ok_or(AlgorithmError::LabelNotFound)?;
    prober.point_inclusion(found, target).await?;
    Ok(found)
}
