//! Planner output flowing into WriteGate: auto-generated safety fields are
//! what keeps first-pass verdicts out of NEED_APPROVAL for low-risk work.

use governance::{Verdict, WriteGate};
use planner::PlannerOrchestrator;

fn gate() -> (tempfile::TempDir, WriteGate) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("default.yaml");
    std::fs::write(
        &path,
        "forbidden_paths:\n  - \".env\"\nwritegate_rules:\n  triggers:\n    - path_matches: \"agent/**\"\n",
    )
    .unwrap();
    (dir, WriteGate::new(&path).unwrap())
}

#[test]
fn docs_update_passes_writegate_first_try() {
    let (_dir, gate) = gate();
    let bundle = PlannerOrchestrator::new()
        .create_plan_from_intent("update docs with new setup steps", "planner")
        .unwrap();

    // Safety fields were injected, so gating cannot fail on missing plans.
    assert!(!bundle.plan.rollback_plan.is_empty());
    assert!(!bundle.plan.verification_plan.is_empty());

    let decision = gate.evaluate(&bundle.plan, &bundle.changeset, None, None);
    assert_eq!(decision.verdict, Verdict::Allow);
    assert!(decision.policy_snapshot_hash.len() == 64);
}

#[test]
fn governance_heavy_intent_needs_approval() {
    let (_dir, gate) = gate();
    let bundle = PlannerOrchestrator::new()
        .create_plan_from_intent("refactor the writegate governance approval flow", "planner")
        .unwrap();

    // Components put this at high proposed risk; WriteGate holds it for a human.
    let decision = gate.evaluate(&bundle.plan, &bundle.changeset, None, None);
    assert_eq!(decision.verdict, Verdict::NeedApproval);
}

#[test]
fn decision_records_the_plan_and_changeset_binding() {
    let (_dir, gate) = gate();
    let bundle = PlannerOrchestrator::new()
        .create_plan_from_intent("fix bug in api endpoint", "planner")
        .unwrap();

    let decision = gate.evaluate(&bundle.plan, &bundle.changeset, Some("srchash"), None);
    assert_eq!(decision.plan_id, bundle.plan.id);
    assert_eq!(decision.changeset_id, bundle.changeset.id);
    assert_eq!(decision.agent_source_hash, "srchash");
    assert!(bundle.changeset.verify_checksum());
}
