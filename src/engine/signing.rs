//! Document review and signing.
//!
//! Two stages. Review: the client walks through and acknowledges every
//! required document; nothing is signable until the whole set is
//! acknowledged. Signing: each document collects one signature per required
//! role, the client submits the whole batch in one atomic step, and the
//! agent validates it. Validation is the only trigger for
//! `documents_signed`. Submitted documents are frozen; if validation turns
//! anything up, the entire batch is returned for a fresh signing round so
//! the audit trail never shows a half-reopened set.

use crate::errors::EngineError;

use super::models::*;
use super::resolver::{self, Phase};
use super::snapshot::TransactionSnapshot;
use super::{ensure_reader, gate, load_authz, map_engine_err, now_rfc3339, snapshot, Engine};

fn signer_matches_actor(actor: &Actor, tx: &Transaction, role: SignerRole) -> Result<(), EngineError> {
    match (role, actor.role) {
        (_, ActorRole::System) => Ok(()),
        (SignerRole::Buyer, ActorRole::Client) => Ok(()),
        (SignerRole::Agent, ActorRole::Agent) if actor.id == tx.agent_id => Ok(()),
        (SignerRole::Agent, ActorRole::Agent) => Err(EngineError::unauthorized(format!(
            "agent {} does not own transaction {}",
            actor.id, tx.id
        ))),
        _ => Err(EngineError::unauthorized(format!(
            "{} cannot sign as {}",
            actor.role.as_str(),
            role.as_str()
        ))),
    }
}

impl Engine {
    /// Add a document to the signing set with one slot per required signer.
    pub async fn create_document(
        &self,
        actor: &Actor,
        transaction_id: i64,
        title: String,
        required_roles: Vec<SignerRole>,
    ) -> Result<TransactionSnapshot, EngineError> {
        if actor.role == ActorRole::Client {
            return Err(EngineError::unauthorized("only agents define documents"));
        }
        if title.trim().is_empty() {
            return Err(EngineError::precondition("document title must not be empty"));
        }
        if required_roles.is_empty() {
            return Err(EngineError::precondition(
                "a document needs at least one required signer",
            ));
        }
        let mut roles: Vec<SignerRole> = Vec::new();
        for role in required_roles {
            if !roles.contains(&role) {
                roles.push(role);
            }
        }

        let actor = actor.clone();
        let now = now_rfc3339();
        self.db
            .call(move |db| {
                let (tx, access, progress) = load_authz(db, transaction_id)?;
                gate::ensure_unlocked(&tx)?;
                let active = resolver::active_phase(&progress);
                gate::authorize(&actor, &tx, Some(&access), Phase::Signing, active)?;

                let doc = db.create_document(transaction_id, &title, &roles, &now)?;
                db.touch_transaction(transaction_id, &now)?;
                tracing::info!(transaction_id, document_id = doc.id, title = %doc.title, "document created");
                Ok(snapshot::assemble(db, transaction_id)?)
            })
            .await
            .map_err(map_engine_err)
    }

    /// Client confirms they have been walked through a document.
    pub async fn acknowledge_document(
        &self,
        actor: &Actor,
        transaction_id: i64,
        document_id: i64,
    ) -> Result<TransactionSnapshot, EngineError> {
        if actor.role == ActorRole::Agent {
            return Err(EngineError::unauthorized(
                "acknowledgment comes from the client",
            ));
        }
        let actor = actor.clone();
        let now = now_rfc3339();
        self.db
            .call(move |db| {
                let (tx, access, progress) = load_authz(db, transaction_id)?;
                ensure_reader(&actor, &tx, &access)?;
                let doc = db
                    .get_document(document_id)?
                    .filter(|d| d.transaction_id == transaction_id)
                    .ok_or_else(|| EngineError::not_found(format!("Document {}", document_id)))?;

                if doc.acknowledged {
                    return Ok(snapshot::assemble(db, transaction_id)?);
                }

                gate::ensure_unlocked(&tx)?;
                let active = resolver::active_phase(&progress);
                gate::authorize(&actor, &tx, Some(&access), Phase::Signing, active)?;

                db.acknowledge_document(document_id, &now)?;
                db.touch_transaction(transaction_id, &now)?;
                Ok(snapshot::assemble(db, transaction_id)?)
            })
            .await
            .map_err(map_engine_err)
    }

    /// Record one signature. Signing only opens once every document has been
    /// acknowledged, and closes again when the batch is submitted.
    pub async fn sign_document(
        &self,
        actor: &Actor,
        transaction_id: i64,
        document_id: i64,
        role: SignerRole,
        signature_ref: String,
    ) -> Result<TransactionSnapshot, EngineError> {
        if signature_ref.trim().is_empty() {
            return Err(EngineError::precondition("signature reference must not be empty"));
        }
        let actor = actor.clone();
        let now = now_rfc3339();
        self.db
            .call(move |db| {
                let (tx, access, progress) = load_authz(db, transaction_id)?;
                ensure_reader(&actor, &tx, &access)?;
                db.get_document(document_id)?
                    .filter(|d| d.transaction_id == transaction_id)
                    .ok_or_else(|| EngineError::not_found(format!("Document {}", document_id)))?;
                let record = db.get_signing_record(document_id, role)?.ok_or_else(|| {
                    EngineError::not_found(format!(
                        "Signing slot for {} on document {}",
                        role.as_str(),
                        document_id
                    ))
                })?;

                // The same signature arriving again is a retry, not re-signing.
                if record.signature_ref.as_deref() == Some(signature_ref.as_str())
                    && record.status != SigningStatus::Unsigned
                {
                    return Ok(snapshot::assemble(db, transaction_id)?);
                }

                signer_matches_actor(&actor, &tx, role)?;
                gate::ensure_unlocked(&tx)?;
                let active = resolver::active_phase(&progress);
                gate::authorize(&actor, &tx, Some(&access), Phase::Signing, active)?;

                if !db.all_documents_acknowledged(transaction_id)? {
                    return Err(EngineError::precondition(
                        "signing opens once every document is acknowledged",
                    )
                    .into());
                }
                if !record.status.accepts_signature() {
                    return Err(EngineError::precondition(format!(
                        "signing slot is {}; submitted documents are frozen",
                        record.status.as_str()
                    ))
                    .into());
                }

                db.record_signature(document_id, role, &signature_ref, &now)?;
                db.touch_transaction(transaction_id, &now)?;
                tracing::info!(transaction_id, document_id, role = role.as_str(), "document signed");
                Ok(snapshot::assemble(db, transaction_id)?)
            })
            .await
            .map_err(map_engine_err)
    }

    /// Submit the whole signing set at once. Refused while any slot is still
    /// unsigned, so a submitted batch is always complete.
    pub async fn submit_documents(
        &self,
        actor: &Actor,
        transaction_id: i64,
    ) -> Result<TransactionSnapshot, EngineError> {
        if actor.role == ActorRole::Agent {
            return Err(EngineError::unauthorized("the client submits the batch"));
        }
        let actor = actor.clone();
        let now = now_rfc3339();
        self.db
            .call(move |db| {
                let (tx, access, progress) = load_authz(db, transaction_id)?;
                ensure_reader(&actor, &tx, &access)?;
                let records = db.list_signing_records(transaction_id)?;
                if records.is_empty() {
                    return Err(EngineError::precondition("no documents to submit").into());
                }

                if records
                    .iter()
                    .all(|r| matches!(r.status, SigningStatus::Submitted | SigningStatus::Validated))
                {
                    return Ok(snapshot::assemble(db, transaction_id)?);
                }

                gate::ensure_unlocked(&tx)?;
                let active = resolver::active_phase(&progress);
                gate::authorize(&actor, &tx, Some(&access), Phase::Signing, active)?;

                let missing: Vec<i64> = records
                    .iter()
                    .filter(|r| r.status != SigningStatus::Signed)
                    .map(|r| r.document_id)
                    .collect();
                if !missing.is_empty() {
                    return Err(EngineError::precondition(format!(
                        "documents {:?} are missing signatures",
                        missing
                    ))
                    .into());
                }

                let count = db.submit_signing_batch(transaction_id)?;
                db.touch_transaction(transaction_id, &now)?;
                tracing::info!(transaction_id, records = count, "signing batch submitted");
                Ok(snapshot::assemble(db, transaction_id)?)
            })
            .await
            .map_err(map_engine_err)
    }

    /// Agent accepts the submitted batch. This is the write that raises
    /// `documents_signed`.
    pub async fn validate_documents(
        &self,
        actor: &Actor,
        transaction_id: i64,
    ) -> Result<TransactionSnapshot, EngineError> {
        self.decide_documents(actor, transaction_id, SigningStatus::Validated, None)
            .await
    }

    /// Agent sends the submitted batch back. Every slot reopens together and
    /// the reason lands in the review trail.
    pub async fn return_documents(
        &self,
        actor: &Actor,
        transaction_id: i64,
        reason: String,
    ) -> Result<TransactionSnapshot, EngineError> {
        if reason.trim().is_empty() {
            return Err(EngineError::precondition("a returned batch must carry a reason"));
        }
        self.decide_documents(actor, transaction_id, SigningStatus::Returned, Some(reason))
            .await
    }

    async fn decide_documents(
        &self,
        actor: &Actor,
        transaction_id: i64,
        to_status: SigningStatus,
        reason: Option<String>,
    ) -> Result<TransactionSnapshot, EngineError> {
        if actor.role == ActorRole::Client {
            return Err(EngineError::unauthorized("only agents resolve the batch"));
        }
        let actor = actor.clone();
        let now = now_rfc3339();
        self.db
            .call(move |db| {
                let (tx, access, progress) = load_authz(db, transaction_id)?;
                ensure_reader(&actor, &tx, &access)?;
                let records = db.list_signing_records(transaction_id)?;
                if records.is_empty() {
                    return Err(EngineError::precondition("no documents to resolve").into());
                }

                // Replaying the decision the batch already has is benign.
                if records.iter().all(|r| r.status == to_status) {
                    return Ok(snapshot::assemble(db, transaction_id)?);
                }

                gate::ensure_unlocked(&tx)?;
                let active = resolver::active_phase(&progress);
                gate::authorize(&actor, &tx, Some(&access), Phase::Signing, active)?;

                if !records.iter().all(|r| r.status == SigningStatus::Submitted) {
                    return Err(EngineError::precondition(
                        "no submitted batch awaiting review",
                    )
                    .into());
                }

                let action = match to_status {
                    SigningStatus::Validated => "validate",
                    _ => "return",
                };
                db.decide_signing_batch(transaction_id, to_status, action, reason.as_deref(), &now)?;
                if to_status == SigningStatus::Validated {
                    gate::apply_flag(db, &tx, ProgressFlag::DocumentsSigned, true, &now)?;
                }
                db.touch_transaction(transaction_id, &now)?;
                tracing::info!(transaction_id, action, "signing batch resolved");
                Ok(snapshot::assemble(db, transaction_id)?)
            })
            .await
            .map_err(map_engine_err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::kyc::{FixedAnalyzer, KycAction};
    use super::super::store::{DbHandle, EngineDb};
    use super::super::EngineConfig;
    use super::*;

    fn agent() -> Actor {
        Actor::agent("agent-1")
    }

    fn client() -> Actor {
        Actor::client("client-7")
    }

    fn test_engine() -> Engine {
        let db = DbHandle::new(EngineDb::new_in_memory().unwrap());
        Engine::new(db, Arc::new(FixedAnalyzer::new(92)), EngineConfig::default())
    }

    /// Transaction advanced to Document Signing with an admitted client.
    async fn seeded_phase3(engine: &Engine) -> i64 {
        let snap = engine
            .create_transaction(&agent(), "lot-12".into(), 25_000_00, "horizon-dev".into())
            .await
            .unwrap();
        let id = snap.transaction.id;
        engine.join(&client(), id, &snap.access.code).await.unwrap();
        engine.approve_access(&agent(), id).await.unwrap();
        let snap = engine
            .create_milestone(&agent(), id, "Reservation fee".into(), 25_000_00, "*".into())
            .await
            .unwrap();
        let mid = snap.milestones[0].id;
        engine
            .submit_proof(&client(), id, mid, "fee.jpg".into())
            .await
            .unwrap();
        engine
            .decide_payment(&agent(), id, mid, ReviewDecision::Approve, None)
            .await
            .unwrap();
        engine
            .kyc_action(&client(), id, KycAction::UploadId { file_ref: "id.png".into() })
            .await
            .unwrap();
        engine
            .kyc_action(&client(), id, KycAction::UploadSelfie { file_ref: "selfie.png".into() })
            .await
            .unwrap();
        engine
            .kyc_action(&client(), id, KycAction::StartAnalysis)
            .await
            .unwrap();
        engine
            .kyc_action(&agent(), id, KycAction::AgentApprove)
            .await
            .unwrap();
        id
    }

    /// Two documents: one buyer-only, one dual-signed.
    async fn seeded_docs(engine: &Engine, id: i64) -> (i64, i64) {
        let snap = engine
            .create_document(&agent(), id, "Reservation Agreement".into(), vec![SignerRole::Buyer])
            .await
            .unwrap();
        let first = snap.documents[0].id;
        let snap = engine
            .create_document(
                &agent(),
                id,
                "Buyer Information Sheet".into(),
                vec![SignerRole::Buyer, SignerRole::Agent],
            )
            .await
            .unwrap();
        let second = snap.documents[1].id;
        (first, second)
    }

    #[tokio::test]
    async fn test_full_signing_flow_raises_documents_signed() {
        let engine = test_engine();
        let id = seeded_phase3(&engine).await;
        let (first, second) = seeded_docs(&engine, id).await;

        engine.acknowledge_document(&client(), id, first).await.unwrap();
        engine.acknowledge_document(&client(), id, second).await.unwrap();

        engine
            .sign_document(&client(), id, first, SignerRole::Buyer, "sig-ra.p7s".into())
            .await
            .unwrap();
        engine
            .sign_document(&client(), id, second, SignerRole::Buyer, "sig-bis-b.p7s".into())
            .await
            .unwrap();
        engine
            .sign_document(&agent(), id, second, SignerRole::Agent, "sig-bis-a.p7s".into())
            .await
            .unwrap();

        let snap = engine.submit_documents(&client(), id).await.unwrap();
        assert!(snap
            .signing
            .iter()
            .all(|r| r.status == SigningStatus::Submitted));

        let snap = engine.validate_documents(&agent(), id).await.unwrap();
        assert!(snap.progress.documents_signed);
        assert_eq!(snap.phase.phase.index(), 4);
        assert!(snap
            .signing
            .iter()
            .all(|r| r.status == SigningStatus::Validated));
    }

    #[tokio::test]
    async fn test_signing_waits_for_all_acknowledgments() {
        let engine = test_engine();
        let id = seeded_phase3(&engine).await;
        let (first, _second) = seeded_docs(&engine, id).await;

        engine.acknowledge_document(&client(), id, first).await.unwrap();
        let err = engine
            .sign_document(&client(), id, first, SignerRole::Buyer, "sig.p7s".into())
            .await
            .expect_err("one document still unacknowledged");
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_submit_refuses_incomplete_batch() {
        let engine = test_engine();
        let id = seeded_phase3(&engine).await;
        let (first, second) = seeded_docs(&engine, id).await;

        engine.acknowledge_document(&client(), id, first).await.unwrap();
        engine.acknowledge_document(&client(), id, second).await.unwrap();
        engine
            .sign_document(&client(), id, first, SignerRole::Buyer, "sig-ra.p7s".into())
            .await
            .unwrap();
        engine
            .sign_document(&client(), id, second, SignerRole::Buyer, "sig-bis-b.p7s".into())
            .await
            .unwrap();

        // The agent slot on the second document is still unsigned.
        let err = engine
            .submit_documents(&client(), id)
            .await
            .expect_err("incomplete batch");
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));

        let snap = engine.snapshot(&agent(), id).await.unwrap();
        assert!(!snap.progress.documents_signed);
        assert!(snap
            .signing
            .iter()
            .all(|r| r.status != SigningStatus::Submitted));
    }

    #[tokio::test]
    async fn test_submitted_documents_are_frozen() {
        let engine = test_engine();
        let id = seeded_phase3(&engine).await;
        let snap = engine
            .create_document(&agent(), id, "Reservation Agreement".into(), vec![SignerRole::Buyer])
            .await
            .unwrap();
        let doc = snap.documents[0].id;
        engine.acknowledge_document(&client(), id, doc).await.unwrap();
        engine
            .sign_document(&client(), id, doc, SignerRole::Buyer, "sig-v1.p7s".into())
            .await
            .unwrap();
        engine.submit_documents(&client(), id).await.unwrap();

        // Replaying the identical signature is a benign retry.
        let snap = engine
            .sign_document(&client(), id, doc, SignerRole::Buyer, "sig-v1.p7s".into())
            .await
            .unwrap();
        assert_eq!(snap.signing[0].status, SigningStatus::Submitted);

        // A different signature is re-signing, which is not permitted.
        let err = engine
            .sign_document(&client(), id, doc, SignerRole::Buyer, "sig-v2.p7s".into())
            .await
            .expect_err("submitted documents are frozen");
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));

        // Submitting again is a benign replay.
        let snap = engine.submit_documents(&client(), id).await.unwrap();
        assert_eq!(snap.signing[0].status, SigningStatus::Submitted);
    }

    #[tokio::test]
    async fn test_returned_batch_reopens_together() {
        let engine = test_engine();
        let id = seeded_phase3(&engine).await;
        let (first, second) = seeded_docs(&engine, id).await;

        for doc in [first, second] {
            engine.acknowledge_document(&client(), id, doc).await.unwrap();
        }
        engine
            .sign_document(&client(), id, first, SignerRole::Buyer, "sig-ra.p7s".into())
            .await
            .unwrap();
        engine
            .sign_document(&client(), id, second, SignerRole::Buyer, "sig-bis-b.p7s".into())
            .await
            .unwrap();
        engine
            .sign_document(&agent(), id, second, SignerRole::Agent, "sig-bis-a.p7s".into())
            .await
            .unwrap();
        engine.submit_documents(&client(), id).await.unwrap();

        let err = engine
            .return_documents(&agent(), id, "  ".into())
            .await
            .expect_err("return without reason");
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));

        let snap = engine
            .return_documents(&agent(), id, "notary stamp missing on page 3".into())
            .await
            .unwrap();
        assert!(snap
            .signing
            .iter()
            .all(|r| r.status == SigningStatus::Returned));
        assert!(!snap.progress.documents_signed);
        assert_eq!(snap.signing_reviews.len(), 1);
        assert_eq!(
            snap.signing_reviews[0].reason.as_deref(),
            Some("notary stamp missing on page 3")
        );

        // Round two: every slot signs again, then the batch validates.
        engine
            .sign_document(&client(), id, first, SignerRole::Buyer, "sig-ra-v2.p7s".into())
            .await
            .unwrap();
        engine
            .sign_document(&client(), id, second, SignerRole::Buyer, "sig-bis-b-v2.p7s".into())
            .await
            .unwrap();
        engine
            .sign_document(&agent(), id, second, SignerRole::Agent, "sig-bis-a-v2.p7s".into())
            .await
            .unwrap();
        engine.submit_documents(&client(), id).await.unwrap();
        let snap = engine.validate_documents(&agent(), id).await.unwrap();
        assert!(snap.progress.documents_signed);
        assert_eq!(snap.signing_reviews.len(), 2);
    }

    #[tokio::test]
    async fn test_role_and_actor_must_line_up() {
        let engine = test_engine();
        let id = seeded_phase3(&engine).await;
        let snap = engine
            .create_document(
                &agent(),
                id,
                "Buyer Information Sheet".into(),
                vec![SignerRole::Buyer, SignerRole::Agent],
            )
            .await
            .unwrap();
        let doc = snap.documents[0].id;
        engine.acknowledge_document(&client(), id, doc).await.unwrap();

        let err = engine
            .sign_document(&client(), id, doc, SignerRole::Agent, "sig.p7s".into())
            .await
            .expect_err("client signing the agent slot");
        assert!(matches!(err, EngineError::Unauthorized { .. }));

        let err = engine
            .sign_document(&agent(), id, doc, SignerRole::Buyer, "sig.p7s".into())
            .await
            .expect_err("agent signing the buyer slot");
        assert!(matches!(err, EngineError::Unauthorized { .. }));

        let err = engine
            .validate_documents(&client(), id)
            .await
            .expect_err("clients never validate");
        assert!(matches!(err, EngineError::Unauthorized { .. }));

        let err = engine
            .validate_documents(&agent(), id)
            .await
            .expect_err("nothing submitted yet");
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_documents_close_with_the_phase_window() {
        let engine = test_engine();
        let id = seeded_phase3(&engine).await;
        let snap = engine
            .create_document(&agent(), id, "Reservation Agreement".into(), vec![SignerRole::Buyer])
            .await
            .unwrap();
        let doc = snap.documents[0].id;
        engine.acknowledge_document(&client(), id, doc).await.unwrap();
        engine
            .sign_document(&client(), id, doc, SignerRole::Buyer, "sig.p7s".into())
            .await
            .unwrap();
        engine.submit_documents(&client(), id).await.unwrap();
        engine.validate_documents(&agent(), id).await.unwrap();

        // Phase 4 is active; the signing window has closed for new documents.
        let err = engine
            .create_document(&agent(), id, "Late addendum".into(), vec![SignerRole::Buyer])
            .await
            .expect_err("window closed");
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));

        // Re-validating the settled batch stays benign.
        let snap = engine.validate_documents(&agent(), id).await.unwrap();
        assert_eq!(snap.signing_reviews.len(), 1);
    }

    #[tokio::test]
    async fn test_signing_replays_require_an_admitted_actor() {
        let engine = test_engine();
        let id = seeded_phase3(&engine).await;
        let snap = engine
            .create_document(&agent(), id, "Reservation Agreement".into(), vec![SignerRole::Buyer])
            .await
            .unwrap();
        let doc = snap.documents[0].id;
        engine.acknowledge_document(&client(), id, doc).await.unwrap();
        engine
            .sign_document(&client(), id, doc, SignerRole::Buyer, "sig.p7s".into())
            .await
            .unwrap();
        engine.submit_documents(&client(), id).await.unwrap();
        engine.validate_documents(&agent(), id).await.unwrap();

        // Each of these would be a benign replay for the transaction's own
        // actors; outsiders get turned away instead.
        let outsider = Actor::client("client-999");
        let err = engine
            .acknowledge_document(&outsider, id, doc)
            .await
            .expect_err("client outside the transaction");
        assert!(matches!(err, EngineError::Unauthorized { .. }));

        let err = engine
            .sign_document(&outsider, id, doc, SignerRole::Buyer, "sig.p7s".into())
            .await
            .expect_err("client outside the transaction");
        assert!(matches!(err, EngineError::Unauthorized { .. }));

        let err = engine
            .submit_documents(&outsider, id)
            .await
            .expect_err("client outside the transaction");
        assert!(matches!(err, EngineError::Unauthorized { .. }));

        let err = engine
            .validate_documents(&Actor::agent("agent-666"), id)
            .await
            .expect_err("agent outside the transaction");
        assert!(matches!(err, EngineError::Unauthorized { .. }));
    }
}
