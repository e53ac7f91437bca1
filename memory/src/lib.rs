//! Memory layer: proposals awaiting review, versioned scoped facts, and an
//! append-only audit log of every transition.

mod audit;
mod schemas;
mod store;

pub use audit::{AuditActor, AuditEvent, AuditEventDiff, AuditEventType, AuditTarget};
pub use schemas::{
    ConflictStrategy, Fact, FactStatus, Proposal, ProposalPayload, ProposalStatus, Scope, SourceRef,
};
pub use store::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("storage: {0}")]
    Storage(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(key: &str, value: serde_json::Value) -> ProposalPayload {
        ProposalPayload {
            key: key.to_string(),
            value,
            tags: vec![],
            ttl_seconds: None,
        }
    }

    fn source() -> SourceRef {
        SourceRef {
            kind: "conversation".to_string(),
            ref_id: "conv_1".to_string(),
            excerpt: None,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn proposal_lifecycle_accept_creates_fact() {
        let store = MemoryStore::in_memory().unwrap();
        let proposal = store
            .create_proposal(
                payload("preferred_name", json!("Alice")),
                source(),
                None,
                Some(0.9),
                None,
            )
            .await
            .unwrap();
        assert_eq!(proposal.status, ProposalStatus::Pending);

        let (accepted, fact) = store
            .accept_proposal(&proposal.id, None, None, None, None, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(accepted.status, ProposalStatus::Accepted);
        assert_eq!(fact.key, "preferred_name");
        assert_eq!(fact.value, json!("Alice"));
        assert_eq!(fact.version, 1);
        assert_eq!(fact.scope, Scope::Global);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overwrite_latest_bumps_version_and_keeps_one_active() {
        let store = MemoryStore::in_memory().unwrap();

        let p1 = store
            .create_proposal(payload("preferred_name", json!("Alice")), source(), None, None, None)
            .await
            .unwrap();
        let (_, fact1) = store
            .accept_proposal(&p1.id, Some(ConflictStrategy::OverwriteLatest), None, None, None, None)
            .await
            .unwrap()
            .unwrap();

        let p2 = store
            .create_proposal(payload("preferred_name", json!("Bob")), source(), None, None, None)
            .await
            .unwrap();
        let (_, fact2) = store
            .accept_proposal(&p2.id, Some(ConflictStrategy::OverwriteLatest), None, None, None, None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(fact1.id, fact2.id);
        assert_eq!(fact2.version, 2);
        assert_eq!(fact2.value, json!("Bob"));

        let active = store
            .list_facts(None, None, None, Some(FactStatus::Active))
            .await
            .unwrap();
        let named: Vec<&Fact> = active.iter().filter(|f| f.key == "preferred_name").collect();
        assert_eq!(named.len(), 1);

        // fact.updated event carries the before/after diff.
        let events = store
            .list_audit_events(Some("fact"), Some(&fact1.id), Some("fact.updated"), 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        let diff = events[0].diff.as_ref().unwrap();
        assert_eq!(diff.before["value"], json!("Alice"));
        assert_eq!(diff.after["version"], json!(2));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keep_both_creates_many_facts() {
        let store = MemoryStore::in_memory().unwrap();
        for value in ["rust", "python"] {
            let p = store
                .create_proposal(payload("favorite_tools", json!(value)), source(), None, None, None)
                .await
                .unwrap();
            store
                .accept_proposal(&p.id, None, None, None, None, None)
                .await
                .unwrap()
                .unwrap();
        }
        let facts = store
            .list_facts(None, None, None, Some(FactStatus::Active))
            .await
            .unwrap();
        assert_eq!(facts.iter().filter(|f| f.key == "favorite_tools").count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn project_scope_requires_project_id() {
        let store = MemoryStore::in_memory().unwrap();
        let p = store
            .create_proposal(payload("project_x_goal", json!("ship")), source(), None, None, None)
            .await
            .unwrap();
        let err = store
            .accept_proposal(&p.id, None, Some(Scope::Project), None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidArgument(_)));

        let (_, fact) = store
            .accept_proposal(&p.id, None, Some(Scope::Project), Some("proj1".to_string()), None, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fact.project_id.as_deref(), Some("proj1"));
        assert_eq!(fact.scope, Scope::Project);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn scope_hint_is_used_when_scope_missing() {
        let store = MemoryStore::in_memory().unwrap();
        let p = store
            .create_proposal(
                payload("timezone", json!("UTC+8")),
                source(),
                None,
                None,
                Some(Scope::Session),
            )
            .await
            .unwrap();
        let (_, fact) = store
            .accept_proposal(&p.id, None, None, None, Some("sess1".to_string()), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fact.scope, Scope::Session);
        assert_eq!(fact.session_id.as_deref(), Some("sess1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reject_only_from_pending() {
        let store = MemoryStore::in_memory().unwrap();
        let p = store
            .create_proposal(payload("k", json!("v")), source(), None, None, None)
            .await
            .unwrap();
        let rejected = store.reject_proposal(&p.id, None).await.unwrap().unwrap();
        assert_eq!(rejected.status, ProposalStatus::Rejected);

        // Already rejected: no-op.
        assert!(store.reject_proposal(&p.id, None).await.unwrap().is_none());
        assert!(store
            .accept_proposal(&p.id, None, None, None, None, None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ttl_sweep_expires_pending_proposals() {
        let store = MemoryStore::in_memory().unwrap();
        let mut p = payload("k", json!("v"));
        p.ttl_seconds = Some(0);
        let created = store
            .create_proposal(p, source(), None, None, None)
            .await
            .unwrap();

        let expired = store.check_expired_proposals().await.unwrap();
        assert_eq!(expired, vec![created.id.clone()]);
        let reloaded = store.get_proposal(&created.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, ProposalStatus::Expired);

        let events = store
            .list_audit_events(Some("proposal"), Some(&created.id), Some("proposal.expired"), 10)
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fact_status_transitions_and_reactivation() {
        let store = MemoryStore::in_memory().unwrap();
        let p = store
            .create_proposal(payload("email", json!("a@b.c")), source(), None, None, None)
            .await
            .unwrap();
        let (_, fact) = store
            .accept_proposal(&p.id, None, None, None, None, None)
            .await
            .unwrap()
            .unwrap();

        let revoked = store.revoke_fact(&fact.id, None).await.unwrap().unwrap();
        assert_eq!(revoked.status, FactStatus::Revoked);
        // Archive only from active.
        assert!(store.archive_fact(&fact.id, None).await.unwrap().is_none());

        let active = store.reactivate_fact(&fact.id, None).await.unwrap().unwrap();
        assert_eq!(active.status, FactStatus::Active);

        // Revoked fact no longer counts as conflict, then reactivated does.
        let found = store
            .get_fact_by_key("email", Scope::Global, None, None)
            .await
            .unwrap();
        assert!(found.is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn explicit_key_policy_wins_over_defaults() {
        let store = MemoryStore::in_memory().unwrap();
        store
            .set_key_policy("preferred_name", ConflictStrategy::KeepBoth)
            .await
            .unwrap();
        for value in ["Alice", "Bob"] {
            let p = store
                .create_proposal(payload("preferred_name", json!(value)), source(), None, None, None)
                .await
                .unwrap();
            store
                .accept_proposal(&p.id, None, None, None, None, None)
                .await
                .unwrap()
                .unwrap();
        }
        let facts = store
            .list_facts(None, None, None, Some(FactStatus::Active))
            .await
            .unwrap();
        assert_eq!(facts.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_confidence_is_rejected() {
        let store = MemoryStore::in_memory().unwrap();
        let err = store
            .create_proposal(payload("k", json!("v")), source(), None, Some(1.5), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidArgument(_)));
    }
}
