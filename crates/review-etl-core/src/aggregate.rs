//! Per-entity rolling-window statistics.
//!
//! Records arrive sorted by `(entity, ts)`, ties in input order. Each
//! entity's run is scanned once; the window bounds only ever move forward, so
//! the running sums are updated by adding the records that enter and
//! subtracting the ones that leave.

use log::debug;
use snafu::prelude::*;

use crate::{
    config::{Alignment, PartialWindowPolicy, WindowConfig},
    model::{CleanRecord, WindowAggregate},
};

/// Errors from [`aggregate`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AggregateError {
    /// Window size must be at least one record.
    #[snafu(display("Invalid window size {size}"))]
    InvalidWindowSize {
        /// Requested size.
        size: usize,
    },

    /// Input is not sorted by `(entity, ts)`.
    #[snafu(display("Records are not sorted at index {index}"))]
    Unsorted {
        /// First out-of-order index.
        index: usize,
    },
}

/// Number of records before and after the anchor covered by a full window.
fn reach(cfg: &WindowConfig) -> (usize, usize) {
    let w = cfg.size;
    match cfg.alignment {
        Alignment::Trailing => (w - 1, 0),
        Alignment::Centered => {
            let after = (w - 1) / 2;
            (w - 1 - after, after)
        }
    }
}

/// Running totals over `[lo, hi)` of one entity's run.
#[derive(Default)]
struct RunningWindow {
    lo: usize,
    hi: usize,
    rating_sum: f64,
    sentiment_sum: f64,
}

impl RunningWindow {
    fn slide_to(&mut self, run: &[CleanRecord], lo: usize, hi: usize) {
        while self.hi < hi {
            self.rating_sum += run[self.hi].rating;
            self.sentiment_sum += run[self.hi].sentiment;
            self.hi += 1;
        }
        while self.lo < lo {
            self.rating_sum -= run[self.lo].rating;
            self.sentiment_sum -= run[self.lo].sentiment;
            self.lo += 1;
        }
    }

    fn len(&self) -> usize {
        self.hi - self.lo
    }
}

/// Compute one [`WindowAggregate`] per record (minus suppressed partial
/// windows), in input order.
pub fn aggregate(
    records: &[CleanRecord],
    cfg: &WindowConfig,
) -> Result<Vec<WindowAggregate>, AggregateError> {
    ensure!(cfg.size >= 1, InvalidWindowSizeSnafu { size: cfg.size });
    if let Some(pos) = records
        .windows(2)
        .position(|pair| pair[0].order_key() > pair[1].order_key())
    {
        return UnsortedSnafu { index: pos + 1 }.fail();
    }

    let (before, after) = reach(cfg);
    let mut out = Vec::with_capacity(records.len());

    for run in records.chunk_by(|a, b| a.entity == b.entity) {
        let mut window = RunningWindow::default();
        for i in 0..run.len() {
            let lo = i.saturating_sub(before);
            let hi = (i + after + 1).min(run.len());
            window.slide_to(run, lo, hi);

            let count = window.len();
            let partial = count < cfg.size;
            if partial && cfg.partial == PartialWindowPolicy::Suppress {
                continue;
            }

            let n = count as f64;
            out.push(WindowAggregate {
                entity: run[i].entity.clone(),
                window_start: run[lo].ts,
                window_end: run[hi - 1].ts,
                anchor: run[i].ts,
                mean: window.rating_sum / n,
                sentiment_mean: window.sentiment_sum / n,
                count: u32::try_from(count).unwrap_or(u32::MAX),
                partial,
            });
        }
    }

    debug!(
        "aggregated {} records into {} windows (size {}, {:?})",
        records.len(),
        out.len(),
        cfg.size,
        cfg.alignment
    );
    Ok(out)
}
