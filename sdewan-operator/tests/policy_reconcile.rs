//! Reconcile of Mwan3Policy resources against in-memory CNF replicas.

mod harness;

use std::sync::Arc;

use kube::ResourceExt;
use sdewan_operator::crd::{ResourceId, SdewanResource, FINALIZER, PURPOSE_LABEL};
use sdewan_operator::model::ConfigKind;
use sdewan_operator::reconciler::reconcile;
use sdewan_operator::reconciler::sweep::Op;
use sdewan_operator::test_util::ResolveFailure;
use sdewan_operator::{Outcome, ReconcileError, RETRY_DELAY};

use harness::*;

#[tokio::test]
async fn test_fresh_policy_is_created_on_every_replica() {
    let h = policy_harness(&[CNF_A, CNF_B]);
    let id = h.store.insert(balanced_policy());

    let outcome = reconcile(&h.ctx, &id).await.expect("reconcile failed");
    assert_eq!(outcome, Outcome::Done);

    assert_eq!(h.remote.count(Op::Create), 2);
    assert_eq!(h.remote.count(Op::Restart), 2);
    assert_eq!(h.remote.count(Op::Update), 0);
    for addr in [CNF_A, CNF_B] {
        assert_eq!(
            h.remote.object(ip(addr), ConfigKind::Policy, "balanced"),
            Some(balanced_config())
        );
    }

    let stored = h.store.object(&id).expect("policy exists");
    assert_eq!(stored.finalizers(), &[FINALIZER.to_string()]);
    let status = stored.status().expect("status written");
    assert!(status.in_sync);
    assert!(status.applied_time.is_some());
    // insert -> 1, finalizer update -> 2
    assert_eq!(status.applied_version.as_deref(), Some("2"));
}

#[tokio::test]
async fn test_rerun_without_changes_is_noop() {
    let h = policy_harness(&[CNF_A, CNF_B]);
    let id = h.store.insert(balanced_policy());
    reconcile(&h.ctx, &id).await.expect("first reconcile failed");
    let status_before = h.store.object(&id).and_then(|p| p.status().cloned());
    h.remote.clear_calls();

    let outcome = reconcile(&h.ctx, &id).await.expect("second reconcile failed");
    assert_eq!(outcome, Outcome::Done);

    assert_eq!(h.remote.count(Op::Get), 2);
    assert_eq!(h.remote.count(Op::Create), 0);
    assert_eq!(h.remote.count(Op::Update), 0);
    assert_eq!(h.remote.count(Op::Restart), 0);
    assert_eq!(h.store.updates(), 1);
    assert_eq!(h.store.status_updates(), 1);
    assert_eq!(
        h.store.object(&id).and_then(|p| p.status().cloned()),
        status_before
    );
}

#[tokio::test]
async fn test_delete_with_absent_remote_object() {
    let h = policy_harness(&[CNF_A, CNF_B]);
    let id = h.store.insert(with_finalizer(balanced_policy()));
    h.store.mark_deleted(&id);

    let outcome = reconcile(&h.ctx, &id).await.expect("reconcile failed");
    assert_eq!(outcome, Outcome::Done);

    assert_eq!(h.remote.count(Op::Get), 2);
    assert_eq!(h.remote.count(Op::Delete), 0);
    assert_eq!(h.remote.count(Op::Restart), 0);
    // Finalizer gone, so the object is purged
    assert!(h.store.object(&id).is_none());
}

#[tokio::test]
async fn test_delete_removes_policy_from_every_replica() {
    let h = policy_harness(&[CNF_A, CNF_B]);
    let id = h.store.insert(balanced_policy());
    reconcile(&h.ctx, &id).await.expect("create failed");
    h.remote.clear_calls();

    h.store.mark_deleted(&id);
    let outcome = reconcile(&h.ctx, &id).await.expect("delete failed");
    assert_eq!(outcome, Outcome::Done);

    assert_eq!(h.remote.count(Op::Delete), 2);
    assert_eq!(h.remote.count(Op::Restart), 2);
    for addr in [CNF_A, CNF_B] {
        assert!(h
            .remote
            .object(ip(addr), ConfigKind::Policy, "balanced")
            .is_none());
    }
    assert!(h.store.object(&id).is_none());
}

#[tokio::test]
async fn test_sweep_stops_at_first_failing_replica() {
    let h = policy_harness(&[CNF_A, CNF_B, CNF_C]);
    for addr in [CNF_A, CNF_B, CNF_C] {
        h.remote.seed(ip(addr), stale_config());
    }
    h.remote.fail_on(ip(CNF_B), Op::Update);
    let id = h.store.insert(balanced_policy());

    let outcome = reconcile(&h.ctx, &id).await.expect("reconcile failed");
    assert_eq!(outcome, Outcome::RequeueAfter(RETRY_DELAY));

    assert_eq!(
        h.remote.calls_to(ip(CNF_A)),
        vec![Op::Get, Op::Update, Op::Restart]
    );
    assert_eq!(h.remote.calls_to(ip(CNF_B)), vec![Op::Get, Op::Update]);
    assert!(h.remote.calls_to(ip(CNF_C)).is_empty());

    // No rollback of A, no status for a partial sweep
    assert_eq!(
        h.remote.object(ip(CNF_A), ConfigKind::Policy, "balanced"),
        Some(balanced_config())
    );
    assert_eq!(
        h.remote.object(ip(CNF_C), ConfigKind::Policy, "balanced"),
        Some(stale_config())
    );
    let stored = h.store.object(&id).expect("policy exists");
    assert!(stored.status().is_none());
    assert_eq!(stored.finalizers(), &[FINALIZER.to_string()]);

    // The next attempt starts over and finishes the job
    h.remote.clear_failures();
    h.remote.clear_calls();
    let outcome = reconcile(&h.ctx, &id).await.expect("retry failed");
    assert_eq!(outcome, Outcome::Done);
    assert_eq!(h.remote.calls_to(ip(CNF_A)), vec![Op::Get]);
    assert_eq!(h.remote.count(Op::Update), 2);
    assert!(h.store.object(&id).and_then(|p| p.status().cloned()).is_some());
}

#[tokio::test]
async fn test_only_differing_replica_is_updated() {
    let h = policy_harness(&[CNF_A, CNF_B, CNF_C]);
    h.remote.seed(ip(CNF_A), balanced_config());
    h.remote.seed(ip(CNF_B), stale_config());
    h.remote.seed(ip(CNF_C), balanced_config());
    let id = h.store.insert(balanced_policy());

    let outcome = reconcile(&h.ctx, &id).await.expect("reconcile failed");
    assert_eq!(outcome, Outcome::Done);

    assert_eq!(h.remote.count(Op::Create), 0);
    assert_eq!(h.remote.count(Op::Update), 1);
    assert_eq!(h.remote.count(Op::Restart), 1);
    assert_eq!(
        h.remote.calls_to(ip(CNF_B)),
        vec![Op::Get, Op::Update, Op::Restart]
    );
    assert_eq!(h.store.status_updates(), 1);
}

#[tokio::test]
async fn test_converged_replicas_leave_status_untouched() {
    let h = policy_harness(&[CNF_A, CNF_B]);
    h.remote.seed(ip(CNF_A), balanced_config());
    h.remote.seed(ip(CNF_B), balanced_config());
    let id = h.store.insert(balanced_policy());

    let outcome = reconcile(&h.ctx, &id).await.expect("reconcile failed");
    assert_eq!(outcome, Outcome::Done);

    assert_eq!(h.remote.count(Op::Restart), 0);
    assert_eq!(h.store.status_updates(), 0);
    let stored = h.store.object(&id).expect("policy exists");
    assert_eq!(stored.finalizers(), &[FINALIZER.to_string()]);
}

#[tokio::test]
async fn test_conversion_failure_touches_nothing() {
    let h = policy_harness(&[CNF_A, CNF_B]);
    let mut policy = balanced_policy();
    policy.spec.members[1].network = "wan9".to_string();
    let id = h.store.insert(policy);

    let outcome = reconcile(&h.ctx, &id).await.expect("reconcile failed");
    assert_eq!(outcome, Outcome::RequeueAfter(RETRY_DELAY));

    assert!(h.remote.calls().is_empty());
    assert_eq!(h.store.updates(), 0);
    assert!(h.store.object(&id).expect("policy exists").finalizers().is_empty());
}

#[tokio::test]
async fn test_failed_deletion_keeps_finalizer() {
    let h = policy_harness(&[CNF_A, CNF_B]);
    let id = h.store.insert(balanced_policy());
    reconcile(&h.ctx, &id).await.expect("create failed");

    h.store.mark_deleted(&id);
    h.remote.fail_on(ip(CNF_B), Op::Delete);
    let outcome = reconcile(&h.ctx, &id).await.expect("delete failed");
    assert_eq!(outcome, Outcome::RequeueAfter(RETRY_DELAY));

    let stored = h.store.object(&id).expect("policy still exists");
    assert!(stored.is_deleting());
    assert_eq!(stored.finalizers(), &[FINALIZER.to_string()]);

    h.remote.clear_failures();
    h.remote.clear_calls();
    let outcome = reconcile(&h.ctx, &id).await.expect("retry failed");
    assert_eq!(outcome, Outcome::Done);
    // A was cleaned up by the first attempt
    assert_eq!(h.remote.calls_to(ip(CNF_A)), vec![Op::Get]);
    assert_eq!(
        h.remote.calls_to(ip(CNF_B)),
        vec![Op::Get, Op::Delete, Op::Restart]
    );
    assert!(h.store.object(&id).is_none());
}

#[tokio::test]
async fn test_no_replicas_leaves_resource_alone() {
    let h = policy_harness(&[]);
    let id = h.store.insert(balanced_policy());

    let outcome = reconcile(&h.ctx, &id).await.expect("reconcile failed");
    assert_eq!(outcome, Outcome::Done);

    assert!(h.remote.calls().is_empty());
    assert_eq!(h.store.updates(), 0);

    h.resolver.remove_group(PURPOSE);
    let outcome = reconcile(&h.ctx, &id).await.expect("reconcile failed");
    assert_eq!(outcome, Outcome::Done);
    assert!(h.store.object(&id).expect("policy exists").finalizers().is_empty());
}

#[tokio::test]
async fn test_missing_purpose_is_not_resolved() {
    let h = policy_harness(&[CNF_A]);
    let mut policy = balanced_policy();
    policy.labels_mut().remove(PURPOSE_LABEL);
    let id = h.store.insert(policy);

    let outcome = reconcile(&h.ctx, &id).await.expect("reconcile failed");
    assert_eq!(outcome, Outcome::Done);
    assert_eq!(h.resolver.calls(), 0);
    assert!(h.remote.calls().is_empty());
}

#[tokio::test]
async fn test_deleting_without_cnf_drops_finalizer() {
    let h = policy_harness(&[CNF_A]);
    h.resolver.remove_group(PURPOSE);
    let id = h.store.insert(with_finalizer(balanced_policy()));
    h.store.mark_deleted(&id);

    let outcome = reconcile(&h.ctx, &id).await.expect("reconcile failed");
    assert_eq!(outcome, Outcome::Done);

    assert!(h.remote.calls().is_empty());
    assert!(h.store.object(&id).is_none());
}

#[tokio::test]
async fn test_deleting_without_our_finalizer_is_left_alone() {
    let h = policy_harness(&[CNF_A, CNF_B]);
    let mut policy = balanced_policy();
    policy.metadata.finalizers = Some(vec!["example.com/protect".to_string()]);
    let id = h.store.insert(policy);
    h.store.mark_deleted(&id);

    let outcome = reconcile(&h.ctx, &id).await.expect("reconcile failed");
    assert_eq!(outcome, Outcome::Done);

    assert!(h.remote.calls().is_empty());
    assert_eq!(h.store.updates(), 0);
    let stored = h.store.object(&id).expect("policy still exists");
    assert!(stored.is_deleting());
    assert_eq!(stored.finalizers(), &["example.com/protect".to_string()]);
}

#[tokio::test]
async fn test_missing_resource_is_done() {
    let h = policy_harness(&[CNF_A]);
    let id = ResourceId::new(NAMESPACE, "gone");

    let outcome = reconcile(&h.ctx, &id).await.expect("reconcile failed");
    assert_eq!(outcome, Outcome::Done);
    assert!(h.remote.calls().is_empty());
}

#[tokio::test]
async fn test_store_read_failure_requeues() {
    let h = policy_harness(&[CNF_A]);
    let id = h.store.insert(balanced_policy());
    h.store.fail_get(true);

    let outcome = reconcile(&h.ctx, &id).await.expect("reconcile failed");
    assert_eq!(outcome, Outcome::RequeueAfter(RETRY_DELAY));
    assert!(h.remote.calls().is_empty());
}

#[tokio::test]
async fn test_resolver_failures() {
    let h = policy_harness(&[CNF_A]);
    let id = h.store.insert(balanced_policy());

    h.resolver.fail(Some(ResolveFailure::Lookup));
    let outcome = reconcile(&h.ctx, &id).await.expect("reconcile failed");
    assert_eq!(outcome, Outcome::RequeueAfter(RETRY_DELAY));

    // Ambiguity needs a deployment change, which arrives as a new event
    h.resolver.fail(Some(ResolveFailure::Ambiguous));
    let outcome = reconcile(&h.ctx, &id).await.expect("reconcile failed");
    assert_eq!(outcome, Outcome::Done);

    assert!(h.remote.calls().is_empty());
}

#[tokio::test]
async fn test_finalizer_write_failure_is_error() {
    let h = policy_harness(&[CNF_A]);
    let id = h.store.insert(balanced_policy());
    h.store.fail_update(true);

    let result = reconcile(&h.ctx, &id).await;
    assert!(matches!(result, Err(ReconcileError::Finalizer { .. })));
    assert!(h.remote.calls().is_empty());
}

#[tokio::test]
async fn test_status_write_failure_is_error() {
    let h = policy_harness(&[CNF_A]);
    let id = h.store.insert(balanced_policy());
    h.store.fail_update_status(true);

    let result = reconcile(&h.ctx, &id).await;
    assert!(matches!(result, Err(ReconcileError::Status { .. })));
    assert_eq!(h.remote.count(Op::Create), 1);
}

#[tokio::test]
async fn test_custom_retry_delay() {
    let h = policy_harness(&[CNF_A]);
    let delay = std::time::Duration::from_secs(30);
    let ctx = h.ctx.with_retry_delay(delay);
    let id = h.store.insert(balanced_policy());
    h.store.fail_get(true);

    let outcome = reconcile(&ctx, &id).await.expect("reconcile failed");
    assert_eq!(outcome, Outcome::RequeueAfter(delay));
}

#[tokio::test]
async fn test_concurrent_reconciles_of_same_policy_are_serialized() {
    let h = policy_harness(&[CNF_A, CNF_B]);
    let id = h.store.insert(balanced_policy());
    let ctx = Arc::new(h.ctx);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let ctx = Arc::clone(&ctx);
        let id = id.clone();
        handles.push(tokio::spawn(async move { reconcile(&ctx, &id).await }));
    }
    for handle in handles {
        let outcome = handle.await.expect("task panicked").expect("reconcile failed");
        assert_eq!(outcome, Outcome::Done);
    }

    // Only the first reconcile finds the replicas empty
    assert_eq!(h.remote.count(Op::Create), 2);
    assert_eq!(h.remote.count(Op::Restart), 2);
    assert_eq!(h.store.updates(), 1);
}
