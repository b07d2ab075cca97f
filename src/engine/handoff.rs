//! Developer handoff and closing.
//!
//! Once the signed documents are in, the agent transmits the deal package
//! to the developer. Transmission is irreversible; completion is the one
//! transition allowed to fire without a human, on a fixed delay standing in
//! for the developer's acknowledgment. Completing the handoff releases the
//! agent's commission, assigns a receipt number, and locks the transaction
//! for good. Racing pollers may all call complete; every call after the
//! first is a no-op that reports the same final state.

use crate::errors::EngineError;

use super::models::*;
use super::resolver::{self, Phase};
use super::snapshot::TransactionSnapshot;
use super::{ensure_reader, gate, load_authz, map_engine_err, now_rfc3339, snapshot, Engine};

fn receipt_number() -> String {
    format!(
        "RCPT-{}",
        &uuid::Uuid::new_v4().simple().to_string()[..12].to_uppercase()
    )
}

impl Engine {
    /// Send the deal package to the developer. Requires the validated
    /// document set, and cannot be taken back.
    pub async fn transmit(
        &self,
        actor: &Actor,
        transaction_id: i64,
    ) -> Result<TransactionSnapshot, EngineError> {
        if actor.role == ActorRole::Client {
            return Err(EngineError::unauthorized("only agents transmit the package"));
        }
        let actor = actor.clone();
        let now = now_rfc3339();
        let (snap, newly_transmitting) = self
            .db
            .call(move |db| {
                let (tx, access, progress) = load_authz(db, transaction_id)?;
                ensure_reader(&actor, &tx, &access)?;
                let handoff = db.get_handoff(transaction_id)?.ok_or_else(|| {
                    EngineError::not_found(format!("Handoff for transaction {}", transaction_id))
                })?;

                // An in-flight or finished handoff makes this a replay.
                if handoff.status != HandoffStatus::Pending {
                    return Ok((snapshot::assemble(db, transaction_id)?, false));
                }

                gate::ensure_unlocked(&tx)?;
                let active = resolver::active_phase(&progress);
                gate::authorize(&actor, &tx, Some(&access), Phase::Handoff, active)?;

                if !progress.documents_signed {
                    return Err(EngineError::precondition(
                        "handoff waits for the validated document set",
                    )
                    .into());
                }

                let mut items: Vec<String> = db
                    .list_documents(transaction_id)?
                    .iter()
                    .map(|d| format!("Signed document: {}", d.title))
                    .collect();
                items.extend(
                    db.list_milestones(transaction_id)?
                        .iter()
                        .map(|m| format!("Payment receipt: {}", m.label)),
                );
                items.push("KYC dossier".to_string());

                db.start_handoff(transaction_id, &items, &now)?;
                db.touch_transaction(transaction_id, &now)?;
                tracing::info!(transaction_id, items = items.len(), "handoff transmitted");
                Ok((snapshot::assemble(db, transaction_id)?, true))
            })
            .await
            .map_err(map_engine_err)?;

        if newly_transmitting {
            self.schedule_completion(transaction_id);
        }
        Ok(snap)
    }

    /// Finish the handoff: raise the two closing flags, stamp the receipt,
    /// and lock the transaction. Safe to call any number of times once the
    /// package is transmitting.
    pub async fn complete_handoff(
        &self,
        actor: &Actor,
        transaction_id: i64,
    ) -> Result<TransactionSnapshot, EngineError> {
        let actor = actor.clone();
        let now = now_rfc3339();
        let receipt = receipt_number();
        self.db
            .call(move |db| {
                let (tx, access, _progress) = load_authz(db, transaction_id)?;
                ensure_reader(&actor, &tx, &access)?;
                let handoff = db.get_handoff(transaction_id)?.ok_or_else(|| {
                    EngineError::not_found(format!("Handoff for transaction {}", transaction_id))
                })?;

                match handoff.status {
                    HandoffStatus::Completed => Ok(snapshot::assemble(db, transaction_id)?),
                    HandoffStatus::Pending => Err(EngineError::precondition(
                        "no transmission in flight to complete",
                    )
                    .into()),
                    HandoffStatus::Transmitting => {
                        gate::apply_flag(db, &tx, ProgressFlag::DeveloperAccepted, true, &now)?;
                        gate::apply_flag(db, &tx, ProgressFlag::CommissionReleased, true, &now)?;
                        db.complete_handoff(transaction_id, &receipt, &now)?;
                        db.lock_transaction(transaction_id, &now)?;
                        db.touch_transaction(transaction_id, &now)?;
                        tracing::info!(transaction_id, receipt = %receipt, "handoff completed, transaction locked");
                        Ok(snapshot::assemble(db, transaction_id)?)
                    }
                }
            })
            .await
            .map_err(map_engine_err)
    }

    /// Fire the developer-acknowledgment stand-in after the configured delay.
    fn schedule_completion(&self, transaction_id: i64) {
        let engine = self.clone();
        let delay = self.config.handoff_completion_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = engine
                .complete_handoff(&Actor::system(), transaction_id)
                .await
            {
                tracing::warn!(transaction_id, error = %e, "scheduled handoff completion failed");
            }
        });
    }
}
