//! Integration tests for the validate-and-fix workflow against a real
//! JSON manifest on disk.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use common::{reference, seed_manifest, FakeAgent, FakeRewriter, CODE};
use reelforge_core::agent::{AgentFailure, FailureKind};
use reelforge_core::manifest::ManifestStore;
use reelforge_core::validation_status::{RoleHint, ValidationStatus};
use reelforge_events::{EventBus, FleetEventKind};
use reelforge_pipeline::{FixStage, ItemOutcome, ReferenceValidator, ValidatorConfig};

fn no_delays() -> ValidatorConfig {
    ValidatorConfig {
        item_delay: Duration::ZERO,
        retest_delay: Duration::ZERO,
    }
}

fn validator(
    store: Arc<dyn ManifestStore>,
    agent: Arc<FakeAgent>,
    rewriter: Arc<FakeRewriter>,
) -> ReferenceValidator {
    ReferenceValidator::new(store, agent, rewriter).with_config(no_delays())
}

// ---------------------------------------------------------------------------
// Test: violation fixed end to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn violated_location_is_rewritten_and_fixed() {
    let dir = tempfile::tempdir().unwrap();
    let store = seed_manifest(
        dir.path(),
        vec![reference("loc1", "a crowded harbour", "h1", ValidationStatus::Untested)],
    )
    .await;
    let agent = FakeAgent::new();
    agent.push_err(AgentFailure::policy_violation("prominent people"));
    agent.push_ok("h2");
    agent.push_ok("probe");
    let rewriter = FakeRewriter::replying("an empty harbour at dawn");
    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe();

    let outcome = validator(store.clone(), agent.clone(), rewriter.clone())
        .with_job(CODE, dir.path())
        .with_events(bus)
        .validate_and_fix("loc1")
        .await
        .unwrap();

    assert_eq!(
        outcome,
        ItemOutcome::Fixed {
            prompt: "an empty harbour at dawn".into(),
            handle: "h2".into(),
        }
    );
    let item = store.read_item("loc1").await.unwrap().unwrap();
    assert_eq!(item.validation, ValidationStatus::VerifiedFixed);
    assert_eq!(item.media_id, "h2");
    assert_eq!(item.prompt, "an empty harbour at dawn");

    let calls = rewriter.calls.lock().unwrap().clone();
    assert_eq!(calls, vec![("a crowded harbour".to_string(), RoleHint::Location)]);

    // probe, regenerate, retest
    let requests = agent.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].references[0].handle, "h1");
    assert_eq!(
        requests[1].output_path.as_deref(),
        Some(dir.path().join("img/loc1.png").as_path())
    );
    assert_eq!(requests[2].references[0].handle, "h2");

    let mut steps = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.kind, FleetEventKind::WorkflowStatus);
        assert_eq!(event.code.as_deref(), Some(CODE));
        let payload = event.payload;
        let step = payload
            .get("status")
            .or_else(|| payload.get("stage"))
            .and_then(|v| v.as_str())
            .unwrap()
            .to_string();
        steps.push(step);
    }
    assert_eq!(
        steps,
        vec!["testing", "violated", "fixing", "regenerating", "retesting", "verified_fixed"]
    );
}

#[tokio::test]
async fn supplied_test_prompt_is_used_for_the_test_only() {
    let dir = tempfile::tempdir().unwrap();
    let store = seed_manifest(
        dir.path(),
        vec![reference("nv1", "a sailor", "s1", ValidationStatus::Untested)],
    )
    .await;
    let agent = FakeAgent::new();
    agent.push_err(AgentFailure::policy_violation("rejected"));
    let rewriter = FakeRewriter::replying("a sailor in a raincoat");

    let outcome = validator(store.clone(), agent.clone(), rewriter.clone())
        .validate_and_fix_with("nv1", Some("the sailor waves from the pier"))
        .await
        .unwrap();

    assert_matches!(outcome, ItemOutcome::Fixed { .. });
    let prompts = agent.prompts();
    assert_eq!(prompts[0], "the sailor waves from the pier");
    assert_eq!(prompts[1], "a sailor in a raincoat");
    let calls = rewriter.calls.lock().unwrap().clone();
    assert_eq!(calls, vec![("a sailor".to_string(), RoleHint::Character)]);
}

// ---------------------------------------------------------------------------
// Test: retest still violating
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_retest_leaves_item_unfixable_without_handle() {
    let dir = tempfile::tempdir().unwrap();
    let store = seed_manifest(
        dir.path(),
        vec![reference("nv1", "a sailor", "h1", ValidationStatus::Untested)],
    )
    .await;
    let agent = FakeAgent::new();
    agent.push_err(AgentFailure::policy_violation("minor"));
    agent.push_ok("h2");
    agent.push_err(AgentFailure::policy_violation("minor"));
    let rewriter = FakeRewriter::replying("an adult sailor");

    let outcome = validator(store.clone(), agent, rewriter)
        .validate_and_fix("nv1")
        .await
        .unwrap();

    assert_matches!(outcome, ItemOutcome::Unfixed(FixStage::Retest));
    let item = store.read_item("nv1").await.unwrap().unwrap();
    assert_eq!(item.validation, ValidationStatus::ViolatedUnfixable);
    assert!(item.media_id.is_empty());
    assert_eq!(item.prompt, "a sailor");
}

// ---------------------------------------------------------------------------
// Test: rewrite failure reverts to violated
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_rewrite_reverts_to_violated() {
    let dir = tempfile::tempdir().unwrap();
    let store = seed_manifest(
        dir.path(),
        vec![reference("nv1", "a sailor", "h1", ValidationStatus::Untested)],
    )
    .await;
    let agent = FakeAgent::new();
    agent.push_err(AgentFailure::policy_violation("minor"));

    let outcome = validator(store.clone(), agent.clone(), FakeRewriter::failing())
        .validate_and_fix("nv1")
        .await
        .unwrap();

    assert_matches!(outcome, ItemOutcome::Unfixed(FixStage::Rewrite));
    let item = store.read_item("nv1").await.unwrap().unwrap();
    assert_eq!(item.validation, ValidationStatus::Violated);
    assert!(item.media_id.is_empty());
    assert_eq!(agent.generation_count(), 1);
}

#[tokio::test]
async fn failed_regeneration_reverts_to_violated() {
    let dir = tempfile::tempdir().unwrap();
    let store = seed_manifest(
        dir.path(),
        vec![reference("loc2", "a square", "", ValidationStatus::Violated)],
    )
    .await;
    let agent = FakeAgent::new();
    agent.push_err(AgentFailure::transient("timed out"));

    let outcome = validator(store.clone(), agent, FakeRewriter::replying("an empty square"))
        .validate_and_fix("loc2")
        .await
        .unwrap();

    assert_matches!(outcome, ItemOutcome::Unfixed(FixStage::Regenerate));
    let item = store.read_item("loc2").await.unwrap().unwrap();
    assert_eq!(item.validation, ValidationStatus::Violated);
    assert_eq!(item.prompt, "a square");
}

// ---------------------------------------------------------------------------
// Test: non-policy failure and skip rules
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unauthorized_probe_is_recorded_without_fix() {
    let dir = tempfile::tempdir().unwrap();
    let store = seed_manifest(
        dir.path(),
        vec![reference("nv1", "a sailor", "h1", ValidationStatus::Untested)],
    )
    .await;
    let agent = FakeAgent::new();
    agent.push_err(AgentFailure::unauthorized("signed out"));
    let rewriter = FakeRewriter::replying("unused");

    let outcome = validator(store.clone(), agent, rewriter.clone())
        .validate_and_fix("nv1")
        .await
        .unwrap();

    assert_eq!(outcome, ItemOutcome::Errored(FailureKind::Unauthorized));
    let item = store.read_item("nv1").await.unwrap().unwrap();
    assert_eq!(item.validation.as_string(), "error_unauthorized");
    assert_eq!(item.media_id, "h1");
    assert_eq!(rewriter.call_count(), 0);
}

#[tokio::test]
async fn item_without_handle_is_skipped_and_unknown_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let store = seed_manifest(
        dir.path(),
        vec![reference("nv1", "a sailor", "", ValidationStatus::Untested)],
    )
    .await;
    let agent = FakeAgent::new();
    let v = validator(store, agent.clone(), FakeRewriter::replying("unused"));

    assert_eq!(v.validate_and_fix("nv1").await.unwrap(), ItemOutcome::Skipped);
    assert_eq!(v.validate_and_fix("nv9").await.unwrap(), ItemOutcome::Missing);
    assert_eq!(agent.generation_count(), 0);
}

// ---------------------------------------------------------------------------
// Test: settled items are not touched again
// ---------------------------------------------------------------------------

#[tokio::test]
async fn verified_fixed_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = seed_manifest(
        dir.path(),
        vec![reference("loc1", "an empty harbour", "h2", ValidationStatus::VerifiedFixed)],
    )
    .await;
    let before = store.load().await.unwrap();
    let agent = FakeAgent::new();
    let rewriter = FakeRewriter::replying("unused");

    let outcome = validator(store.clone(), agent.clone(), rewriter.clone())
        .validate_and_fix("loc1")
        .await
        .unwrap();

    assert_eq!(outcome, ItemOutcome::Settled(ValidationStatus::VerifiedFixed));
    assert_eq!(agent.generation_count(), 0);
    assert_eq!(rewriter.call_count(), 0);
    assert_eq!(store.load().await.unwrap(), before);
}

// ---------------------------------------------------------------------------
// Test: crash during fixing resumes like violated
// ---------------------------------------------------------------------------

#[tokio::test]
async fn interrupted_fix_resumes_like_fresh_violation() {
    let crashed_dir = tempfile::tempdir().unwrap();
    let crashed = seed_manifest(
        crashed_dir.path(),
        vec![reference("loc1", "a crowded harbour", "", ValidationStatus::Fixing)],
    )
    .await;
    let violated_dir = tempfile::tempdir().unwrap();
    let violated = seed_manifest(
        violated_dir.path(),
        vec![reference("loc1", "a crowded harbour", "h1", ValidationStatus::Violated)],
    )
    .await;

    let mut outcomes = Vec::new();
    for store in [crashed.clone(), violated.clone()] {
        let agent = FakeAgent::new();
        agent.push_ok("h2");
        agent.push_ok("probe");
        let rewriter = FakeRewriter::replying("an empty harbour");
        let outcome = validator(store, agent.clone(), rewriter.clone())
            .validate_and_fix("loc1")
            .await
            .unwrap();
        // regenerate and retest only; the stale handle is never probed
        assert_eq!(agent.generation_count(), 2);
        assert_eq!(rewriter.call_count(), 1);
        outcomes.push(outcome);
    }

    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(
        crashed.load().await.unwrap(),
        violated.load().await.unwrap()
    );
    let item = crashed.read_item("loc1").await.unwrap().unwrap();
    assert_eq!(item.validation, ValidationStatus::VerifiedFixed);
}

// ---------------------------------------------------------------------------
// Test: batch statistics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn validate_all_counts_each_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let store = seed_manifest(
        dir.path(),
        vec![
            reference("nv1", "a sailor", "h1", ValidationStatus::Verified),
            reference("loc1", "a crowded harbour", "h2", ValidationStatus::Untested),
            reference("nv2", "a fisherman", "h3", ValidationStatus::Untested),
            reference("nv3", "a child", "h4", ValidationStatus::Untested),
        ],
    )
    .await;
    let agent = FakeAgent::new();
    // loc1: violation, regenerate, retest
    agent.push_err(AgentFailure::policy_violation("people"));
    agent.push_ok("h5");
    agent.push_ok("probe");
    // nv2: passes
    agent.push_ok("probe");
    // nv3: transient
    agent.push_err(AgentFailure::transient("timeout"));

    let ids = store.list_items().await.unwrap();
    let stats = validator(store.clone(), agent, FakeRewriter::replying("an empty harbour"))
        .validate_all(&ids)
        .await;

    assert_eq!(stats.tested, 3);
    assert_eq!(stats.verified, 1);
    assert_eq!(stats.violated, 1);
    assert_eq!(stats.fixed, 1);
    assert_eq!(stats.failed, 1);

    let manifest = store.load().await.unwrap();
    let statuses: Vec<String> = manifest
        .subtasks
        .iter()
        .map(|s| s.validation.as_string())
        .collect();
    assert_eq!(
        statuses,
        vec!["verified", "verified_fixed", "verified", "error_transient"]
    );
}
