//! Download decision engine.
//!
//! [`decide`] turns a requested date range and a [`CoverageMap`] into the
//! smallest list of fetches that brings every subject to full coverage of
//! the request. It does no I/O and keeps no state, so calling it twice with
//! the same input yields the same list.
//!
//! Rules, applied per subject with covered span `[cs, ce]`:
//!
//! - nothing stored at all: one `full` fetch of the whole request for `All`;
//! - a universe member without coverage: `full` for that entity;
//! - `end > ce`: `extend_tail` over `[max(ce + 1, start), end]`;
//! - `start < cs`: `extend_head` over `[start, min(cs - 1, end)]`;
//! - every gap intersecting the request: `fill_gap` clipped to the request;
//! - with `refetch_uncertain`, every unreadable partition span intersecting
//!   the request: `fill_gap` for `All`.
//!
//! Adjacent items are never merged. The result is ordered by data type
//! priority, then subject (`All` first, then entity ID), then range start.

use std::{collections::BTreeSet, fmt};

use serde::Serialize;

use crate::{
    config::DataTypeConfig,
    date::DateRange,
    registry::EntityId,
    scan::{CoverageMap, Subject},
};

/// How a work item extends coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Nothing is stored; fetch everything requested.
    Full,
    /// Fetch dates before the earliest stored one.
    ExtendHead,
    /// Fetch dates after the latest stored one.
    ExtendTail,
    /// Fetch missing dates inside the stored span.
    FillGap,
}

/// Why a work item was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    /// No stored data for the subject.
    NoExistingData,
    /// The request reaches past the stored tail.
    ExtendsBeyondTail,
    /// The request starts before the stored head.
    ExtendsBeforeHead,
    /// A gap was found inside the stored span.
    GapDetected,
    /// A partition covering these dates could not be read.
    UncertainCoverage,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reason::NoExistingData => "no_existing_data",
            Reason::ExtendsBeyondTail => "extends_beyond_tail",
            Reason::ExtendsBeforeHead => "extends_before_head",
            Reason::GapDetected => "gap_detected",
            Reason::UncertainCoverage => "uncertain_coverage",
        };
        f.write_str(s)
    }
}

/// One fetch an orchestrator should perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkItem {
    /// Data type to fetch.
    pub data_type: String,
    /// Priority of the data type (lower first).
    pub priority: u32,
    /// Whose rows to fetch.
    pub target: Subject,
    /// Dates to fetch, inclusive.
    pub range: DateRange,
    /// Kind of fetch.
    pub strategy: Strategy,
    /// Why it is needed.
    pub reason: Reason,
}

/// Per-data-type knobs of the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecisionPolicy {
    /// Ordering priority of the data type.
    pub priority: u32,
    /// Re-fetch spans of unreadable partitions.
    pub refetch_uncertain: bool,
}

impl From<&DataTypeConfig> for DecisionPolicy {
    fn from(config: &DataTypeConfig) -> Self {
        Self {
            priority: config.priority,
            refetch_uncertain: config.refetch_uncertain,
        }
    }
}

/// One data type's input to [`decide_many`].
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    /// Requested dates.
    pub request: DateRange,
    /// Scan result of the data type.
    pub coverage: &'a CoverageMap,
    /// Data type policy.
    pub policy: DecisionPolicy,
    /// Entities that should exist, if known.
    pub universe: Option<&'a [EntityId]>,
}

/// Decide the work for one data type.
pub fn decide(
    request: DateRange,
    coverage: &CoverageMap,
    policy: &DecisionPolicy,
    universe: Option<&[EntityId]>,
) -> Vec<WorkItem> {
    if request.is_empty() {
        return Vec::new();
    }

    let item = |target: Subject, range: DateRange, strategy: Strategy, reason: Reason| WorkItem {
        data_type: coverage.data_type.clone(),
        priority: policy.priority,
        target,
        range,
        strategy,
        reason,
    };

    let mut items = Vec::new();

    if !coverage.has_data() {
        items.push(item(
            Subject::All,
            request,
            Strategy::Full,
            Reason::NoExistingData,
        ));
    } else {
        if let Some(universe) = universe {
            let members: BTreeSet<EntityId> = universe.iter().copied().collect();
            for id in members {
                if coverage.get(Subject::Entity(id)).is_none() {
                    items.push(item(
                        Subject::Entity(id),
                        request,
                        Strategy::Full,
                        Reason::NoExistingData,
                    ));
                }
            }
        }

        for (subject, record) in &coverage.subjects {
            let (cs, ce) = (record.first, record.last);

            if request.end > ce {
                if let Some(after) = ce.succ() {
                    let range = DateRange::new(after.max(request.start), request.end);
                    items.push(item(
                        *subject,
                        range,
                        Strategy::ExtendTail,
                        Reason::ExtendsBeyondTail,
                    ));
                }
            }

            if request.start < cs {
                if let Some(before) = cs.pred() {
                    let range = DateRange::new(request.start, before.min(request.end));
                    items.push(item(
                        *subject,
                        range,
                        Strategy::ExtendHead,
                        Reason::ExtendsBeforeHead,
                    ));
                }
            }

            for gap in &record.gaps {
                if let Some(range) = gap.intersect(&request) {
                    items.push(item(
                        *subject,
                        range,
                        Strategy::FillGap,
                        Reason::GapDetected,
                    ));
                }
            }
        }
    }

    // Uncertain spans are refetched under `All`, which does not exclude
    // entity leases; writes still serialize on partition leases.
    if policy.refetch_uncertain {
        for bad in &coverage.unreadable {
            let span = bad.span.unwrap_or(request);
            if let Some(range) = span.intersect(&request) {
                items.push(item(
                    Subject::All,
                    range,
                    Strategy::FillGap,
                    Reason::UncertainCoverage,
                ));
            }
        }
    }

    sort_items(&mut items);
    items
}

/// Decide the work for several data types and order it globally.
pub fn decide_many<'a>(inputs: impl IntoIterator<Item = DecisionInput<'a>>) -> Vec<WorkItem> {
    let mut items: Vec<WorkItem> = inputs
        .into_iter()
        .flat_map(|input| decide(input.request, input.coverage, &input.policy, input.universe))
        .collect();
    sort_items(&mut items);
    items
}

fn sort_items(items: &mut [WorkItem]) {
    items.sort_by(|a, b| {
        (a.priority, &a.data_type, a.target, a.range.start).cmp(&(
            b.priority,
            &b.data_type,
            b.target,
            b.range.start,
        ))
    });
}
