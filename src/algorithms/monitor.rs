//! Owner Monitoring
//!
//! A label owner who saw their own version history can confirm the server
//! never rewrote it: walk every unexpired distinguished log entry to the
//! right of the owner's anchor and check a monitoring ladder there for the
//! version the owner expects to be greatest at that point.

use std::cmp::Ordering;
use std::future::Future;
use std::pin::Pin;

use crate::ladder::LadderFlavor;
use crate::treemath;

use super::provider::{AlgorithmError, Prober};
use super::search::ViewParams;

/// What the owner retained from previous interactions.
#[derive(Debug, Clone)]
pub struct OwnerState {
    /// Log position up to which history was already confirmed.
    pub starting: u64,
    /// Greatest version the owner held at `starting`.
    pub version_at_starting: u32,
    /// Versions the owner created since, with the position each appeared
    /// at, ascending.
    pub upcoming: Vec<(u64, u32)>,
}

impl OwnerState {
    /// Version the owner expects to be greatest at log position `pos`.
    fn expected_at(&self, pos: u64) -> u32 {
        let mut expected = self.version_at_starting;
        for &(p, v) in &self.upcoming {
            if p <= pos {
                expected = expected.max(v);
            }
        }
        expected
    }
}

/// Check every unexpired distinguished entry right of the owner's anchor.
/// Returns the checked positions, ascending; the rightmost becomes the
/// owner's next anchor.
pub async fn monitor(
    prober: &mut dyn Prober,
    n: u64,
    state: &OwnerState,
    params: &ViewParams,
) -> Result<Vec<u64>, AlgorithmError> {
    if state.starting >= n {
        return Err(AlgorithmError::BadRequest(format!(
            "anchor {} is outside the log of size {n}",
            state.starting
        )));
    }
    let last_ts = prober.timestamp(n - 1).await?;
    let mut checked = Vec::new();
    let frame = Frame {
        lo: 0,
        hi: n,
        left_ts: None,
        right_ts: None,
    };
    walk(prober, frame, last_ts, state, params, &mut checked).await?;
    Ok(checked)
}

#[derive(Clone, Copy)]
struct Frame {
    lo: u64,
    hi: u64,
    left_ts: Option<u64>,
    right_ts: Option<u64>,
}

type WalkFuture<'a> = Pin<Box<dyn Future<Output = Result<(), AlgorithmError>> + Send + 'a>>;

/// Depth-first, in-order walk over `[lo, hi)`. A subtree is entered only
/// if its bounding timestamps can still span a monitoring window and it
/// contains entries right of the anchor.
fn walk<'a>(
    prober: &'a mut dyn Prober,
    frame: Frame,
    last_ts: u64,
    state: &'a OwnerState,
    params: &'a ViewParams,
    checked: &'a mut Vec<u64>,
) -> WalkFuture<'a> {
    Box::pin(async move {
        if frame.lo >= frame.hi || frame.hi <= state.starting + 1 {
            return Ok(());
        }
        let cur = treemath::bst_root(frame.lo, frame.hi);
        let ts = prober.timestamp(cur).await?;

        // Left subtree: bounded by (left_ts, ts).
        if cur > frame.lo {
            let left_span = ts.saturating_sub(frame.left_ts.unwrap_or(ts));
            let may_hold =
                frame.left_ts.is_none() || left_span >= params.reasonable_monitoring_window;
            if may_hold {
                let left = Frame {
                    lo: frame.lo,
                    hi: cur,
                    left_ts: frame.left_ts,
                    right_ts: Some(ts),
                };
                walk(&mut *prober, left, last_ts, state, params, &mut *checked).await?;
            }
        }

        let span = frame
            .right_ts
            .unwrap_or(last_ts)
            .saturating_sub(frame.left_ts.unwrap_or(ts));
        let distinguished = span >= params.reasonable_monitoring_window;
        let expired = params
            .maximum_lifetime
            .is_some_and(|ml| last_ts.saturating_sub(ts) >= ml);
        if cur > state.starting && distinguished && !expired {
            let expected = state.expected_at(cur);
            if expected == u32::MAX {
                return Err(AlgorithmError::BadRequest(
                    "owner state names an out-of-range version".into(),
                ));
            }
            let verdict = prober
                .ladder(cur, LadderFlavor::Monitoring, expected)
                .await?;
            if verdict != Ordering::Equal {
                return Err(AlgorithmError::ProofViolation(format!(
                    "monitoring ladder at entry {cur} does not confirm version {expected}"
                )));
            }
            checked.push(cur);
        }

        // Right subtree: bounded by (ts, right_ts or the last entry).
        if cur + 1 < frame.hi {
            let right_span = frame.right_ts.unwrap_or(last_ts).saturating_sub(ts);
            if right_span >= params.reasonable_monitoring_window {
                let right = Frame {
                    lo: cur + 1,
                    hi: frame.hi,
                    left_ts: Some(ts),
                    right_ts: frame.right_ts,
                };
                walk(&mut *prober, right, last_ts, state, params, &mut *checked).await?;
            }
        }
        Ok(())
    })
}
