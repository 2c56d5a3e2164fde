//! Conflict detection and resolution across parallel groups

use super::common::*;
use std::sync::Arc;
use workflow_engine::sdk::Severity;
use workflow_engine::{
    NodeState, PhaseSpec, ResolutionPolicy, RunOutcome, WorkflowDefinition,
};

fn review_workflow() -> WorkflowDefinition {
    WorkflowDefinition::builder("review")
        .phase(PhaseSpec::parallel("review", ["security", "style"]))
        .build()
}

#[tokio::test]
async fn test_blocking_security_beats_advisory_style() {
    // Scenario: both reviewers claim auth.ts; the blocking security result
    // must win with a rationale citing severity priority.
    let registry = registry(vec![
        (
            "security",
            Arc::new(StaticExecutor::with_claims(
                Severity::Blocking,
                "security",
                &["auth.ts"],
            )) as _,
        ),
        (
            "style",
            Arc::new(StaticExecutor::with_claims(
                Severity::Advisory,
                "style",
                &["auth.ts"],
            )) as _,
        ),
    ]);

    let report = workflow_engine::run_workflow(&review_workflow(), registry, fast_opts())
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    let resolution = report.phase("review").unwrap().resolution.as_ref().unwrap();
    assert_eq!(resolution.conflicts.len(), 1);

    let record = &resolution.conflicts[0];
    assert_eq!(record.resource, "auth.ts");
    assert_eq!(record.winning_node_id, "review/security");
    assert_eq!(record.policy_applied, ResolutionPolicy::SeverityOverride);
    assert!(record.rationale.contains("blocking"));

    // Both stored results carry the cross-reference.
    let security = report.node("review/security").unwrap();
    let style = report.node("review/style").unwrap();
    assert_eq!(
        security.result.as_ref().unwrap().conflicts_with,
        vec!["review/style"]
    );
    assert_eq!(
        style.result.as_ref().unwrap().conflicts_with,
        vec!["review/security"]
    );
}

#[tokio::test]
async fn test_disjoint_claims_record_empty_resolution() {
    let registry = registry(vec![
        (
            "security",
            Arc::new(StaticExecutor::with_claims(
                Severity::Blocking,
                "security",
                &["auth.ts"],
            )) as _,
        ),
        (
            "style",
            Arc::new(StaticExecutor::with_claims(
                Severity::Advisory,
                "style",
                &["render.ts"],
            )) as _,
        ),
    ]);

    let report = workflow_engine::run_workflow(&review_workflow(), registry, fast_opts())
        .await
        .unwrap();

    // The resolver still ran once for the group; it just found nothing.
    let resolution = report.phase("review").unwrap().resolution.as_ref().unwrap();
    assert!(resolution.conflicts.is_empty());
    assert!(report
        .node("review/security")
        .unwrap()
        .result
        .as_ref()
        .unwrap()
        .conflicts_with
        .is_empty());
}

#[tokio::test]
async fn test_custom_priority_order_decides_equal_severity() {
    let def = WorkflowDefinition::builder("tool-review")
        .phase(PhaseSpec::parallel("review", ["perf", "style"]))
        .priority_order(["performance", "style", "security"])
        .build();

    let registry = registry(vec![
        (
            "perf",
            Arc::new(StaticExecutor::with_claims(
                Severity::Advisory,
                "performance",
                &["db.rs"],
            )) as _,
        ),
        (
            "style",
            Arc::new(StaticExecutor::with_claims(
                Severity::Advisory,
                "style",
                &["db.rs"],
            )) as _,
        ),
    ]);

    let report = workflow_engine::run_workflow(&def, registry, fast_opts())
        .await
        .unwrap();

    let resolution = report.phase("review").unwrap().resolution.as_ref().unwrap();
    let record = &resolution.conflicts[0];
    assert_eq!(record.winning_node_id, "review/perf");
    assert_eq!(record.policy_applied, ResolutionPolicy::PriorityOrder);
}

#[tokio::test]
async fn test_failed_member_does_not_participate_in_resolution() {
    // One group member fails; the survivor's claims resolve without it and
    // the group still gets exactly one resolution pass.
    let def = WorkflowDefinition::builder("mixed")
        .phase(PhaseSpec::parallel("review", ["security", "doomed"]))
        .phase(PhaseSpec::sequential("after", ["next"]).depends_on(["review"]))
        .build();

    let registry = registry(vec![
        (
            "security",
            Arc::new(StaticExecutor::with_claims(
                Severity::Blocking,
                "security",
                &["auth.ts"],
            )) as _,
        ),
        ("doomed", Arc::new(FailingExecutor::fatal("cannot perform")) as _),
        ("next", Arc::new(StaticExecutor::ok()) as _),
    ]);

    let report = workflow_engine::run_workflow(&def, registry, fast_opts())
        .await
        .unwrap();

    assert_eq!(
        report.node("review/security").unwrap().state,
        NodeState::Succeeded
    );
    assert_eq!(report.node("review/doomed").unwrap().state, NodeState::Failed);

    let resolution = report.phase("review").unwrap().resolution.as_ref().unwrap();
    assert!(resolution.conflicts.is_empty());

    // Downstream of a partially failed phase still skips.
    assert_eq!(report.node("after/next").unwrap().state, NodeState::Skipped);
}

#[tokio::test]
async fn test_resolution_waits_for_slowest_group_member() {
    // The fast member finishes long before the slow one; the conflict must
    // still be detected, proving resolution only runs once the whole group
    // is terminal.
    let def = WorkflowDefinition::builder("staggered")
        .phase(PhaseSpec::parallel("review", ["fast", "slow"]))
        .build();

    let mut slow = StaticExecutor::with_claims(Severity::Blocking, "security", &["auth.ts"]);
    slow.delay = std::time::Duration::from_millis(100);

    let registry = registry(vec![
        (
            "fast",
            Arc::new(StaticExecutor::with_claims(
                Severity::Advisory,
                "style",
                &["auth.ts"],
            )) as _,
        ),
        ("slow", Arc::new(slow) as _),
    ]);

    let report = workflow_engine::run_workflow(&def, registry, fast_opts())
        .await
        .unwrap();

    let resolution = report.phase("review").unwrap().resolution.as_ref().unwrap();
    assert_eq!(resolution.conflicts.len(), 1);
    assert_eq!(resolution.conflicts[0].winning_node_id, "review/slow");
    assert_eq!(
        resolution.conflicts[0].policy_applied,
        ResolutionPolicy::SeverityOverride
    );
}

#[tokio::test]
async fn test_three_reviewers_one_contested_resource() {
    let def = WorkflowDefinition::builder("triple")
        .phase(PhaseSpec::parallel("review", ["security", "perf", "style"]))
        .build();

    let registry = registry(vec![
        (
            "security",
            Arc::new(StaticExecutor::with_claims(
                Severity::Advisory,
                "security",
                &["config.rs"],
            )) as _,
        ),
        (
            "perf",
            Arc::new(StaticExecutor::with_claims(
                Severity::Advisory,
                "performance",
                &["config.rs"],
            )) as _,
        ),
        (
            "style",
            Arc::new(StaticExecutor::with_claims(
                Severity::Advisory,
                "style",
                &["config.rs"],
            )) as _,
        ),
    ]);

    let report = workflow_engine::run_workflow(&def, registry, fast_opts())
        .await
        .unwrap();

    let resolution = report.phase("review").unwrap().resolution.as_ref().unwrap();
    assert_eq!(resolution.conflicts.len(), 1);
    let record = &resolution.conflicts[0];
    assert_eq!(record.claimants.len(), 3);
    // Default order puts security first among equal severities.
    assert_eq!(record.winning_node_id, "review/security");

    let style = report.node("review/style").unwrap();
    assert_eq!(
        style.result.as_ref().unwrap().conflicts_with,
        vec!["review/perf", "review/security"]
    );
}
