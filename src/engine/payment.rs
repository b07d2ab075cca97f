//! Payment and escrow milestones.
//!
//! An agent defines any number of named milestones while Reservation &
//! Escrow is active (reservation fee, earnest money, escrow top-up). Each
//! milestone runs its own proof loop: the client uploads a proof reference,
//! the agent confirms or rejects it, and a rejection sends the milestone
//! back to awaiting-upload with its audit row retained. `payment_confirmed`
//! is an aggregate: it is only set once every milestone on the transaction
//! is confirmed.

use crate::errors::EngineError;

use super::models::*;
use super::resolver::{self, Phase};
use super::snapshot::TransactionSnapshot;
use super::{ensure_reader, gate, load_authz, map_engine_err, now_rfc3339, snapshot, Engine};

/// Glob match for proof filenames, e.g. `receipt-*.pdf` or `deposit-?.jpg`.
/// An empty pattern accepts anything.
fn proof_matches(pattern: &str, file_ref: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches(file_ref),
        // Patterns are checked at milestone creation; an unparsable stored
        // value must not wedge the proof loop.
        Err(_) => true,
    }
}

impl Engine {
    /// Define a milestone on the reservation ledger. Agent-only, and only
    /// while Reservation & Escrow is the active phase.
    pub async fn create_milestone(
        &self,
        actor: &Actor,
        transaction_id: i64,
        label: String,
        amount_centavos: i64,
        proof_pattern: String,
    ) -> Result<TransactionSnapshot, EngineError> {
        if actor.role == ActorRole::Client {
            return Err(EngineError::unauthorized("only agents define milestones"));
        }
        if label.trim().is_empty() {
            return Err(EngineError::precondition("milestone label must not be empty"));
        }
        if amount_centavos <= 0 {
            return Err(EngineError::precondition("milestone amount must be positive"));
        }
        let proof_pattern = if proof_pattern.trim().is_empty() {
            "*".to_string()
        } else {
            proof_pattern
        };
        if let Err(e) = glob::Pattern::new(&proof_pattern) {
            return Err(EngineError::precondition(format!(
                "proof pattern '{}' is not valid: {}",
                proof_pattern, e
            )));
        }

        let actor = actor.clone();
        let now = now_rfc3339();
        self.db
            .call(move |db| {
                let (tx, access, progress) = load_authz(db, transaction_id)?;
                gate::ensure_unlocked(&tx)?;
                let active = resolver::active_phase(&progress);
                gate::authorize(&actor, &tx, Some(&access), Phase::Reservation, active)?;

                let milestone =
                    db.create_milestone(transaction_id, &label, amount_centavos, &proof_pattern, &now)?;
                db.touch_transaction(transaction_id, &now)?;
                tracing::info!(
                    transaction_id,
                    milestone_id = milestone.id,
                    label = %milestone.label,
                    "milestone created"
                );
                Ok(snapshot::assemble(db, transaction_id)?)
            })
            .await
            .map_err(map_engine_err)
    }

    /// Attach a payment proof to a milestone. The reference must match the
    /// milestone's expected filename pattern; a mismatch is a rejection the
    /// client can correct and retry, not a server fault.
    pub async fn submit_proof(
        &self,
        actor: &Actor,
        transaction_id: i64,
        milestone_id: i64,
        proof_ref: String,
    ) -> Result<TransactionSnapshot, EngineError> {
        if actor.role == ActorRole::Agent {
            return Err(EngineError::unauthorized("payment proofs come from the client"));
        }
        let actor = actor.clone();
        let now = now_rfc3339();
        self.db
            .call(move |db| {
                let (tx, access, progress) = load_authz(db, transaction_id)?;
                ensure_reader(&actor, &tx, &access)?;
                let milestone = db
                    .get_milestone(milestone_id)?
                    .filter(|m| m.transaction_id == transaction_id)
                    .ok_or_else(|| {
                        EngineError::not_found(format!("Milestone {}", milestone_id))
                    })?;

                // Same proof arriving twice is a replay, not new work.
                if milestone.proof_ref.as_deref() == Some(proof_ref.as_str())
                    && matches!(
                        milestone.status,
                        MilestoneStatus::Reviewing | MilestoneStatus::Confirmed
                    )
                {
                    return Ok(snapshot::assemble(db, transaction_id)?);
                }

                gate::ensure_unlocked(&tx)?;
                let active = resolver::active_phase(&progress);
                gate::authorize(&actor, &tx, Some(&access), Phase::Reservation, active)?;

                if !milestone.status.accepts_proof() {
                    return Err(EngineError::precondition(format!(
                        "milestone '{}' is {}, not awaiting proof",
                        milestone.label,
                        milestone.status.as_str()
                    ))
                    .into());
                }
                if !proof_matches(&milestone.proof_pattern, &proof_ref) {
                    return Err(EngineError::rejected(format!(
                        "proof '{}' does not match expected pattern '{}'",
                        proof_ref, milestone.proof_pattern
                    ))
                    .into());
                }

                db.set_milestone_proof(milestone_id, &proof_ref, &now)?;
                db.touch_transaction(transaction_id, &now)?;
                tracing::info!(transaction_id, milestone_id, "payment proof submitted");
                Ok(snapshot::assemble(db, transaction_id)?)
            })
            .await
            .map_err(map_engine_err)
    }

    /// Agent decision on a reviewing milestone. Confirming the last open
    /// milestone is what raises `payment_confirmed`; a rejection must say
    /// why, and reopens the milestone for re-upload.
    pub async fn decide_payment(
        &self,
        actor: &Actor,
        transaction_id: i64,
        milestone_id: i64,
        decision: ReviewDecision,
        reason: Option<String>,
    ) -> Result<TransactionSnapshot, EngineError> {
        if actor.role == ActorRole::Client {
            return Err(EngineError::unauthorized("only agents decide payments"));
        }
        if decision == ReviewDecision::Reject
            && reason.as_deref().map(str::trim).unwrap_or("").is_empty()
        {
            return Err(EngineError::precondition("a rejection must carry a reason"));
        }
        let actor = actor.clone();
        let now = now_rfc3339();
        self.db
            .call(move |db| {
                let (tx, access, progress) = load_authz(db, transaction_id)?;
                ensure_reader(&actor, &tx, &access)?;
                let milestone = db
                    .get_milestone(milestone_id)?
                    .filter(|m| m.transaction_id == transaction_id)
                    .ok_or_else(|| {
                        EngineError::not_found(format!("Milestone {}", milestone_id))
                    })?;

                // Replaying an identical decision is benign.
                let replayed = match decision {
                    ReviewDecision::Approve => milestone.status == MilestoneStatus::Confirmed,
                    ReviewDecision::Reject => milestone.status == MilestoneStatus::Rejected,
                };
                if replayed {
                    return Ok(snapshot::assemble(db, transaction_id)?);
                }

                gate::ensure_unlocked(&tx)?;
                let active = resolver::active_phase(&progress);
                gate::authorize(&actor, &tx, Some(&access), Phase::Reservation, active)?;

                if milestone.status != MilestoneStatus::Reviewing {
                    return Err(EngineError::precondition(format!(
                        "milestone '{}' is {}, not reviewing",
                        milestone.label,
                        milestone.status.as_str()
                    ))
                    .into());
                }

                let status = match decision {
                    ReviewDecision::Approve => MilestoneStatus::Confirmed,
                    ReviewDecision::Reject => MilestoneStatus::Rejected,
                };
                db.decide_milestone(milestone_id, status, decision, reason.as_deref(), &now)?;
                db.touch_transaction(transaction_id, &now)?;
                tracing::info!(
                    transaction_id,
                    milestone_id,
                    decision = decision.as_str(),
                    "payment decided"
                );

                if decision == ReviewDecision::Approve && db.all_milestones_confirmed(transaction_id)? {
                    gate::apply_flag(db, &tx, ProgressFlag::PaymentConfirmed, true, &now)?;
                }
                Ok(snapshot::assemble(db, transaction_id)?)
            })
            .await
            .map_err(map_engine_err)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::super::kyc::FixedAnalyzer;
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

    /// Transaction with an admitted client, still in phase 1.
    async fn seeded(engine: &Engine) -> i64 {
        let snap = engine
            .create_transaction(&agent(), "lot-12".into(), 25_000_00, "horizon-dev".into())
            .await
            .unwrap();
        let id = snap.transaction.id;
        engine.join(&client(), id, &snap.access.code).await.unwrap();
        engine.approve_access(&agent(), id).await.unwrap();
        id
    }

    #[test]
    fn test_proof_matches() {
        assert!(proof_matches("receipt-*.pdf", "receipt-001.pdf"));
        assert!(proof_matches("*.pdf", "deposit.pdf"));
        assert!(proof_matches("*", "anything-at-all"));
        assert!(proof_matches("", "anything-at-all"));
        assert!(proof_matches("exact.png", "exact.png"));
        assert!(proof_matches("deposit-?.pdf", "deposit-1.pdf"));
        assert!(proof_matches("scan-[0-9][0-9].png", "scan-07.png"));
        assert!(!proof_matches("deposit-?.pdf", "deposit-10.pdf"));
        assert!(!proof_matches("scan-[0-9][0-9].png", "scan-ab.png"));
        assert!(!proof_matches("receipt-*.pdf", "invoice-001.pdf"));
        assert!(!proof_matches("*.pdf", "deposit.png"));
        assert!(!proof_matches("exact.png", "exact.png.bak"));
    }

    #[tokio::test]
    async fn test_milestone_proof_and_confirm_flow() {
        let engine = test_engine();
        let id = seeded(&engine).await;

        let snap = engine
            .create_milestone(&agent(), id, "Reservation fee".into(), 25_000_00, "receipt-*.pdf".into())
            .await
            .unwrap();
        let mid = snap.milestones[0].id;
        assert_eq!(snap.milestones[0].status, MilestoneStatus::Pending);

        let snap = engine
            .submit_proof(&client(), id, mid, "receipt-001.pdf".into())
            .await
            .unwrap();
        assert_eq!(snap.milestones[0].status, MilestoneStatus::Reviewing);

        let snap = engine
            .decide_payment(&agent(), id, mid, ReviewDecision::Approve, None)
            .await
            .unwrap();
        assert_eq!(snap.milestones[0].status, MilestoneStatus::Confirmed);
        assert!(snap.progress.payment_confirmed);
        assert_eq!(snap.phase.phase.index(), 2);
    }

    #[tokio::test]
    async fn test_payment_confirmed_waits_for_every_milestone() {
        let engine = test_engine();
        let id = seeded(&engine).await;

        let snap = engine
            .create_milestone(&agent(), id, "Reservation fee".into(), 10_000_00, "*".into())
            .await
            .unwrap();
        let first = snap.milestones[0].id;
        let snap = engine
            .create_milestone(&agent(), id, "Earnest money".into(), 15_000_00, "*".into())
            .await
            .unwrap();
        let second = snap.milestones[1].id;

        engine
            .submit_proof(&client(), id, first, "fee.jpg".into())
            .await
            .unwrap();
        let snap = engine
            .decide_payment(&agent(), id, first, ReviewDecision::Approve, None)
            .await
            .unwrap();
        assert!(!snap.progress.payment_confirmed);
        assert_eq!(snap.phase.phase.index(), 1);

        engine
            .submit_proof(&client(), id, second, "earnest.jpg".into())
            .await
            .unwrap();
        let snap = engine
            .decide_payment(&agent(), id, second, ReviewDecision::Approve, None)
            .await
            .unwrap();
        assert!(snap.progress.payment_confirmed);
        assert_eq!(snap.phase.phase.index(), 2);
    }

    #[tokio::test]
    async fn test_rejection_loop_reopens_milestone() {
        let engine = test_engine();
        let id = seeded(&engine).await;

        let snap = engine
            .create_milestone(&agent(), id, "Reservation fee".into(), 10_000_00, "*".into())
            .await
            .unwrap();
        let mid = snap.milestones[0].id;
        engine
            .submit_proof(&client(), id, mid, "blurry-photo.jpg".into())
            .await
            .unwrap();

        let err = engine
            .decide_payment(&agent(), id, mid, ReviewDecision::Reject, None)
            .await
            .expect_err("rejection without reason");
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));

        let snap = engine
            .decide_payment(
                &agent(),
                id,
                mid,
                ReviewDecision::Reject,
                Some("amount unreadable".into()),
            )
            .await
            .unwrap();
        assert_eq!(snap.milestones[0].status, MilestoneStatus::Rejected);
        assert!(!snap.progress.payment_confirmed);
        assert_eq!(snap.phase.phase.index(), 1);
        assert_eq!(snap.payment_reviews.len(), 1);
        assert_eq!(snap.payment_reviews[0].reason.as_deref(), Some("amount unreadable"));

        // Rejected milestones accept a fresh proof.
        let snap = engine
            .submit_proof(&client(), id, mid, "clear-photo.jpg".into())
            .await
            .unwrap();
        assert_eq!(snap.milestones[0].status, MilestoneStatus::Reviewing);
    }

    #[tokio::test]
    async fn test_malformed_proof_pattern_is_refused_up_front() {
        let engine = test_engine();
        let id = seeded(&engine).await;

        let err = engine
            .create_milestone(&agent(), id, "Reservation fee".into(), 10_000_00, "receipt-[.pdf".into())
            .await
            .expect_err("unclosed character range");
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));

        let snap = engine.snapshot(&agent(), id).await.unwrap();
        assert!(snap.milestones.is_empty());
    }

    #[tokio::test]
    async fn test_proof_pattern_mismatch_is_retryable_rejection() {
        let engine = test_engine();
        let id = seeded(&engine).await;

        let snap = engine
            .create_milestone(&agent(), id, "Reservation fee".into(), 10_000_00, "receipt-*.pdf".into())
            .await
            .unwrap();
        let mid = snap.milestones[0].id;

        let err = engine
            .submit_proof(&client(), id, mid, "selfie.png".into())
            .await
            .expect_err("pattern mismatch");
        assert!(matches!(err, EngineError::ValidationRejected { .. }));
        assert!(err.is_retryable());

        let snap = engine.snapshot(&agent(), id).await.unwrap();
        assert_eq!(snap.milestones[0].status, MilestoneStatus::Pending);
    }

    #[tokio::test]
    async fn test_decisions_and_submissions_are_idempotent() {
        let engine = test_engine();
        let id = seeded(&engine).await;

        let snap = engine
            .create_milestone(&agent(), id, "Reservation fee".into(), 10_000_00, "*".into())
            .await
            .unwrap();
        let mid = snap.milestones[0].id;
        engine
            .submit_proof(&client(), id, mid, "fee.jpg".into())
            .await
            .unwrap();

        // Same proof again while reviewing: benign.
        let snap = engine
            .submit_proof(&client(), id, mid, "fee.jpg".into())
            .await
            .unwrap();
        assert_eq!(snap.milestones[0].status, MilestoneStatus::Reviewing);

        engine
            .decide_payment(&agent(), id, mid, ReviewDecision::Approve, None)
            .await
            .unwrap();
        // Replayed approval: benign, still exactly one audit row.
        let snap = engine
            .decide_payment(&agent(), id, mid, ReviewDecision::Approve, None)
            .await
            .unwrap();
        assert_eq!(snap.milestones[0].status, MilestoneStatus::Confirmed);
        assert_eq!(snap.payment_reviews.len(), 1);

        // A different proof after confirmation is novel work, and the phase
        // window has moved on.
        let err = engine
            .submit_proof(&client(), id, mid, "other.jpg".into())
            .await
            .expect_err("phase window closed");
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_replayed_writes_require_an_admitted_actor() {
        let engine = test_engine();
        let id = seeded(&engine).await;

        let snap = engine
            .create_milestone(&agent(), id, "Reservation fee".into(), 10_000_00, "*".into())
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

        // A client who never joined re-sends the proof already on file.
        let err = engine
            .submit_proof(&Actor::client("client-999"), id, mid, "fee.jpg".into())
            .await
            .expect_err("client outside the transaction");
        assert!(matches!(err, EngineError::Unauthorized { .. }));

        // An agent who does not own the transaction re-sends the decision.
        let err = engine
            .decide_payment(&Actor::agent("agent-666"), id, mid, ReviewDecision::Approve, None)
            .await
            .expect_err("agent outside the transaction");
        assert!(matches!(err, EngineError::Unauthorized { .. }));

        // The owning agent's replay stays benign.
        let snap = engine
            .decide_payment(&agent(), id, mid, ReviewDecision::Approve, None)
            .await
            .unwrap();
        assert_eq!(snap.milestones[0].status, MilestoneStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_milestones_close_with_the_phase_window() {
        let engine = test_engine();
        let id = seeded(&engine).await;

        let snap = engine
            .create_milestone(&agent(), id, "Reservation fee".into(), 10_000_00, "*".into())
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

        // Phase 2 is active; reservation-side writes are out of reach.
        let err = engine
            .create_milestone(&agent(), id, "Late fee".into(), 1_000_00, "*".into())
            .await
            .expect_err("phase window closed for new milestones");
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));

        let err = engine
            .submit_proof(&client(), id, mid, "again.jpg".into())
            .await
            .expect_err("clients act only in the active phase");
        assert!(matches!(err, EngineError::PreconditionFailed { .. }));

        let err = engine
            .create_milestone(&Actor::client("client-7"), id, "x".into(), 1, "*".into())
            .await
            .expect_err("clients cannot define milestones");
        assert!(matches!(err, EngineError::Unauthorized { .. }));
    }
}
