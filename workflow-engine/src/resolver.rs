//! Conflict resolution for parallel groups.
//!
//! When sibling nodes of a parallel group claim overlapping resources, the
//! resolver picks one winner per resource and records why. The policy is
//! fixed at the top: a blocking result always overrides advisory and
//! informational claimants (security/correctness priority, not configurable
//! below that level). Same-severity conflicts fall through to the
//! workflow's category priority order, then to earliest start time, then to
//! node id. Every step is deterministic regardless of completion order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use workflow_engine_sdk::TaskResult;

/// Which rule decided a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// Blocking severity overrode lower-severity claimants.
    SeverityOverride,
    /// The workflow's category priority order decided among equals.
    PriorityOrder,
    /// Equal severity and priority; earliest `started_at` won.
    StartedAtTieBreak,
}

/// One resolved conflict over a single resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// The contested resource id.
    pub resource: String,
    /// Every node that claimed the resource, sorted.
    pub claimants: Vec<String>,
    pub winning_node_id: String,
    pub rationale: String,
    pub policy_applied: ResolutionPolicy,
}

/// Resolution report for one completed group (or one iteration of an
/// iterative phase). Recorded even when empty, so the report shows the
/// group was examined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupResolution {
    pub phase_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    pub conflicts: Vec<ConflictRecord>,
}

impl GroupResolution {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// One succeeded group member, as seen by the resolver.
#[derive(Debug)]
pub struct GroupMember {
    pub node_id: String,
    pub category: String,
    pub started_at: Option<DateTime<Utc>>,
    pub result: TaskResult,
}

/// Resolve a completed group of sibling results.
///
/// Annotates each member's `conflicts_with` in place and returns the
/// group's resolution report. Disjoint claims make this a no-op
/// pass-through with an empty conflict list.
pub fn resolve_group(
    phase_id: &str,
    iteration: Option<u32>,
    members: &mut [GroupMember],
    priority_order: &[String],
) -> GroupResolution {
    // Resource id -> indexes of the members claiming it. BTreeMap keeps
    // record order deterministic.
    let mut claims: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (idx, member) in members.iter().enumerate() {
        for resource in &member.result.claims {
            claims.entry(resource.clone()).or_default().push(idx);
        }
    }

    let mut conflicts = Vec::new();
    for (resource, claimants) in &claims {
        if claimants.len() < 2 {
            continue;
        }

        let (winner, policy) = pick_winner(members, claimants, priority_order);
        let rationale = build_rationale(members, claimants, winner, policy, resource);

        let mut claimant_ids: Vec<String> = claimants
            .iter()
            .map(|&i| members[i].node_id.clone())
            .collect();
        claimant_ids.sort();

        // Annotate every claimant with the others it conflicted with.
        for &idx in claimants {
            let own_id = members[idx].node_id.clone();
            for other in claimant_ids.iter().filter(|id| **id != own_id) {
                if !members[idx].result.conflicts_with.contains(other) {
                    members[idx].result.conflicts_with.push(other.clone());
                }
            }
            members[idx].result.conflicts_with.sort();
        }

        conflicts.push(ConflictRecord {
            resource: resource.clone(),
            claimants: claimant_ids,
            winning_node_id: members[winner].node_id.clone(),
            rationale,
            policy_applied: policy,
        });
    }

    GroupResolution {
        phase_id: phase_id.to_string(),
        iteration,
        conflicts,
    }
}

/// Position of a category in the priority order; unlisted categories rank
/// after every listed one.
fn priority_rank(category: &str, priority_order: &[String]) -> usize {
    priority_order
        .iter()
        .position(|c| c == category)
        .unwrap_or(priority_order.len())
}

fn pick_winner(
    members: &[GroupMember],
    claimants: &[usize],
    priority_order: &[String],
) -> (usize, ResolutionPolicy) {
    let mut ordered: Vec<usize> = claimants.to_vec();
    ordered.sort_by(|&a, &b| {
        let ma = &members[a];
        let mb = &members[b];
        mb.result
            .severity
            .cmp(&ma.result.severity)
            .then_with(|| {
                priority_rank(&ma.category, priority_order)
                    .cmp(&priority_rank(&mb.category, priority_order))
            })
            .then_with(|| cmp_started(ma.started_at, mb.started_at))
            .then_with(|| ma.node_id.cmp(&mb.node_id))
    });

    let winner = ordered[0];
    let runner_up = ordered[1];

    let policy = if members[winner].result.severity > members[runner_up].result.severity {
        ResolutionPolicy::SeverityOverride
    } else if priority_rank(&members[winner].category, priority_order)
        < priority_rank(&members[runner_up].category, priority_order)
    {
        ResolutionPolicy::PriorityOrder
    } else {
        ResolutionPolicy::StartedAtTieBreak
    };

    (winner, policy)
}

fn cmp_started(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> std::cmp::Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    }
}

fn build_rationale(
    members: &[GroupMember],
    claimants: &[usize],
    winner: usize,
    policy: ResolutionPolicy,
    resource: &str,
) -> String {
    let w = &members[winner];
    match policy {
        ResolutionPolicy::SeverityOverride => format!(
            "'{}' asserts {} severity on '{}', overriding {} lower-severity claimant(s)",
            w.node_id,
            w.result.severity,
            resource,
            claimants.len() - 1
        ),
        ResolutionPolicy::PriorityOrder => format!(
            "'{}' (category '{}') ranks highest in the priority order among equal-severity claimants of '{}'",
            w.node_id, w.category, resource
        ),
        ResolutionPolicy::StartedAtTieBreak => format!(
            "equal severity and priority on '{}'; '{}' started earliest",
            resource, w.node_id
        ),
    }
}
