//! Snapshot assembly.
//!
//! Every mutating operation returns the resulting snapshot so pollers can
//! reconcile without an extra round trip. A snapshot is assembled while the
//! database mutex is held, so it is always an internally consistent picture
//! of one moment, never a mix of two writes.

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

use super::models::*;
use super::resolver::{self, PhaseView, SubStates};
use super::store::EngineDb;

/// The full state of one transaction: the aggregate, the flags, the resolved
/// phase view, and every milestone sub-state with its audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSnapshot {
    pub transaction: Transaction,
    pub progress: Progress,
    pub phase: PhaseView,
    pub access: ClientAccess,
    pub milestones: Vec<PaymentMilestone>,
    pub payment_reviews: Vec<PaymentReview>,
    pub kyc: KycRecord,
    pub documents: Vec<Document>,
    pub signing: Vec<SigningRecord>,
    pub signing_reviews: Vec<SigningReview>,
    pub handoff: HandoffRecord,
}

/// The light view fetched by the phase-critical poll loop: all eight flags,
/// the resolved phase, and the lock status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressView {
    pub status: TransactionStatus,
    pub progress: Progress,
    pub phase: PhaseView,
}

fn load_progress(db: &EngineDb, transaction_id: i64) -> Result<Progress, EngineError> {
    db.get_progress(transaction_id)?
        .ok_or_else(|| EngineError::not_found(format!("Progress for transaction {}", transaction_id)))
}

/// Assemble the full snapshot for one transaction.
pub fn assemble(db: &EngineDb, transaction_id: i64) -> Result<TransactionSnapshot, EngineError> {
    let transaction = db
        .get_transaction(transaction_id)?
        .ok_or_else(|| EngineError::not_found(format!("Transaction {}", transaction_id)))?;
    let progress = load_progress(db, transaction_id)?;
    let access = db
        .get_access(transaction_id)?
        .ok_or_else(|| EngineError::not_found(format!("Access for transaction {}", transaction_id)))?;
    let milestones = db.list_milestones(transaction_id)?;
    let payment_reviews = db.list_payment_reviews(transaction_id)?;
    let kyc = db
        .get_kyc(transaction_id)?
        .ok_or_else(|| EngineError::not_found(format!("KYC for transaction {}", transaction_id)))?;
    let documents = db.list_documents(transaction_id)?;
    let signing = db.list_signing_records(transaction_id)?;
    let signing_reviews = db.list_signing_reviews(transaction_id)?;
    let handoff = db
        .get_handoff(transaction_id)?
        .ok_or_else(|| EngineError::not_found(format!("Handoff for transaction {}", transaction_id)))?;

    let phase = resolver::resolve(
        &progress,
        &SubStates {
            milestones: &milestones,
            kyc: &kyc,
            documents: &documents,
            signing: &signing,
            handoff: &handoff,
        },
    );
    if !phase.warnings.is_empty() {
        tracing::warn!(
            transaction_id,
            warnings = ?phase.warnings,
            "progress flags violate causal ordering; resolved to lowest consistent phase"
        );
    }

    Ok(TransactionSnapshot {
        transaction,
        progress,
        phase,
        access,
        milestones,
        payment_reviews,
        kyc,
        documents,
        signing,
        signing_reviews,
        handoff,
    })
}

/// Assemble the light progress view for the fast poll loop.
pub fn assemble_progress(db: &EngineDb, transaction_id: i64) -> Result<ProgressView, EngineError> {
    // The sub-states still feed the resolver; only the payload is smaller.
    let snapshot = assemble(db, transaction_id)?;
    Ok(ProgressView {
        status: snapshot.transaction.status,
        progress: snapshot.progress,
        phase: snapshot.phase,
    })
}
