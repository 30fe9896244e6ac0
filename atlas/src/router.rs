//! Router — the pure stop-condition evaluator between Cortex and Probe.
//!
//! Evaluated once per hop, after Cortex runs. Checks conditions in a
//! fixed order and returns the first match; if two conditions are true
//! simultaneously, the earliest in this order wins.

use crate::config::AtlasConfig;
use crate::state::{Decision, RunState, StopReason};

/// Where the router sends control after evaluating one hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Loop back to Probe for another batch.
    Probe,
    /// Hand off to the findings extractor and reporter; terminal.
    Report(StopReason),
}

/// Evaluate the ordered stop conditions against `state`, a pure function
/// of `(state, config)`.
#[must_use]
pub fn route(state: &RunState, config: &AtlasConfig) -> Route {
    if state.hops >= config.max_hops {
        return Route::Report(StopReason::MaxHops);
    }
    if state.metrics.requests >= config.max_req_per_run {
        return Route::Report(StopReason::BudgetExhausted);
    }
    if state.consecutive_skips >= 3 {
        return Route::Report(StopReason::NoValidPaths);
    }
    if state.decision == Decision::Report {
        return Route::Report(StopReason::DecisionReport);
    }
    Route::Probe
}
