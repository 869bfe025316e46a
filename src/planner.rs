//! Query planner for filtered search
//!
//! Decides between two strategies based on estimated filter selectivity:
//!
//! - **Post-filter** (common case): run the graph search with a widened
//!   beam and drop non-matching candidates as they surface. The widening
//!   factor grows as the filter gets more selective.
//! - **Pre-filter** (highly selective filters): enumerate the matching ids
//!   outright and score them by brute force, bypassing the graph. Below
//!   ~1% selectivity this is both faster and exact.
//!
//! Selectivity is estimated by probing a fixed-size, evenly spaced sample
//! of ids. The planner is pure: same inputs, same plan, no caching.

use vantage_core::{Filter, MetadataStore};

/// How many records to probe when estimating selectivity.
pub const SAMPLE_SIZE: usize = 1024;

/// Below this estimated selectivity the planner bypasses the graph.
pub const PREFILTER_THRESHOLD: f64 = 0.01;

/// Chosen execution strategy for one filtered search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPlan {
    /// Enumerate matching ids and score them directly.
    PreFilter,
    /// Graph search with the beam widened to compensate for discards.
    PostFilter { widened_ef: usize },
}

/// Estimate the fraction of ids in `0..total` matching `filter`.
///
/// Probes up to [`SAMPLE_SIZE`] ids at a fixed stride so the estimate is
/// deterministic for a given store state.
pub fn estimate_selectivity(meta: &MetadataStore, total: u32, filter: &Filter) -> f64 {
    if total == 0 {
        return 1.0;
    }

    let total = total as usize;
    let samples = total.min(SAMPLE_SIZE);
    let stride = total / samples;

    let mut matched = 0usize;
    for i in 0..samples {
        let id = (i * stride) as u32;
        if meta.matches(id, filter) {
            matched += 1;
        }
    }
    matched as f64 / samples as f64
}

/// Pick a strategy for `filter` given the caller's beam width.
pub fn plan(meta: &MetadataStore, total: u32, filter: &Filter, ef_search: usize) -> (QueryPlan, f64) {
    let selectivity = estimate_selectivity(meta, total, filter);

    if selectivity < PREFILTER_THRESHOLD {
        return (QueryPlan::PreFilter, selectivity);
    }

    let oversample = if selectivity >= 0.5 {
        2.0
    } else {
        (1.0 / selectivity).max(4.0)
    };
    let widened_ef = (ef_search as f64 * oversample).ceil() as usize;
    (QueryPlan::PostFilter { widened_ef }, selectivity)
}
