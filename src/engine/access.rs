//! Client admission: invite codes, join requests, and the agent's
//! approve/reject decision.
//!
//! A transaction carries exactly one access record. The agent hands the
//! current invite code to their buyer out of band; the buyer redeems it with
//! a join request, and the agent decides that request. Approval is what sets
//! the `client_joined` progress flag, so admission flows through the same
//! gate as every other lifecycle write. These operations deliberately ignore
//! the phase window: a buyer can be admitted late without blocking whatever
//! milestone is active, as long as the transaction is still open.

use anyhow::{Context, Result};
use std::time::Duration;

use crate::errors::EngineError;

use super::models::*;
use super::snapshot::TransactionSnapshot;
use super::{gate, map_engine_err, now_rfc3339, snapshot, Engine};

/// Short uppercase invite code, e.g. `7C2F91AB`.
pub fn generate_access_code() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_uppercase()
}

pub fn code_expiry(ttl: Duration) -> String {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(30));
    (chrono::Utc::now() + ttl).to_rfc3339()
}

fn code_expired(access: &ClientAccess) -> Result<bool> {
    let expires = chrono::DateTime::parse_from_rfc3339(&access.code_expires_at)
        .with_context(|| format!("Failed to parse code expiry '{}'", access.code_expires_at))?;
    Ok(expires < chrono::Utc::now())
}

fn load_access(db: &super::store::EngineDb, transaction_id: i64) -> Result<(Transaction, ClientAccess)> {
    let tx = db
        .get_transaction(transaction_id)?
        .ok_or_else(|| EngineError::not_found(format!("Transaction {}", transaction_id)))?;
    let access = db
        .get_access(transaction_id)?
        .ok_or_else(|| EngineError::not_found(format!("Access for transaction {}", transaction_id)))?;
    Ok((tx, access))
}

impl Engine {
    /// The access record, visible to the owning agent and to the client who
    /// holds it. A client with a still-pending request may watch their own
    /// request here even though the full snapshot is closed to them.
    pub async fn access_view(
        &self,
        actor: &Actor,
        transaction_id: i64,
    ) -> Result<ClientAccess, EngineError> {
        let actor = actor.clone();
        self.db
            .call(move |db| {
                let (tx, access) = load_access(db, transaction_id)?;
                let allowed = match actor.role {
                    ActorRole::System => true,
                    ActorRole::Agent => actor.id == tx.agent_id,
                    ActorRole::Client => {
                        access.client_id.as_deref() == Some(actor.id.as_str())
                            && access.status != AccessStatus::None
                    }
                };
                if !allowed {
                    return Err(EngineError::unauthorized(
                        "no access record visible for this actor",
                    )
                    .into());
                }
                Ok(access)
            })
            .await
            .map_err(map_engine_err)
    }

    /// Issue a fresh invite code, discarding any undecided join request. An
    /// already admitted client keeps their seat; the new code only governs
    /// future joins.
    pub async fn regenerate_code(
        &self,
        actor: &Actor,
        transaction_id: i64,
    ) -> Result<ClientAccess, EngineError> {
        let actor = actor.clone();
        let code = generate_access_code();
        let expires_at = code_expiry(self.config.access_code_ttl);
        self.db
            .call(move |db| {
                let (tx, access) = load_access(db, transaction_id)?;
                if actor.role == ActorRole::Client {
                    return Err(EngineError::unauthorized("only agents manage invite codes").into());
                }
                if actor.role == ActorRole::Agent && actor.id != tx.agent_id {
                    return Err(EngineError::unauthorized(format!(
                        "agent {} does not own transaction {}",
                        actor.id, tx.id
                    ))
                    .into());
                }
                gate::ensure_unlocked(&tx)?;
                if access.status == AccessStatus::Approved {
                    db.rotate_access_code(transaction_id, &code, &expires_at)?;
                } else {
                    db.reset_access_code(transaction_id, &code, &expires_at)?;
                }
                tracing::info!(transaction_id, "access code regenerated");
                db.get_access(transaction_id)?
                    .ok_or_else(|| {
                        EngineError::not_found(format!("Access for transaction {}", transaction_id))
                            .into()
                    })
            })
            .await
            .map_err(map_engine_err)
    }

    /// Redeem an invite code. Re-joining with the same client id is a benign
    /// replay; a second client cannot claim a seat that is pending or taken.
    pub async fn join(
        &self,
        actor: &Actor,
        transaction_id: i64,
        code: &str,
    ) -> Result<ClientAccess, EngineError> {
        if actor.role != ActorRole::Client {
            return Err(EngineError::unauthorized("only clients join transactions"));
        }
        let actor = actor.clone();
        let code = code.trim().to_uppercase();
        let now = now_rfc3339();
        self.db
            .call(move |db| {
                let (tx, access) = load_access(db, transaction_id)?;

                // Replay before anything else: the same client asking again
                // gets their current record back, even on a locked deal.
                if access.client_id.as_deref() == Some(actor.id.as_str())
                    && matches!(access.status, AccessStatus::Pending | AccessStatus::Approved)
                {
                    return Ok(access);
                }

                gate::ensure_unlocked(&tx)?;
                if access.code != code {
                    return Err(EngineError::unauthorized("invite code does not match").into());
                }
                if code_expired(&access)? {
                    return Err(EngineError::ExpiredAccess.into());
                }
                match (&access.client_id, access.status) {
                    // Seat held by someone else.
                    (Some(other), AccessStatus::Pending | AccessStatus::Approved)
                        if other != &actor.id =>
                    {
                        Err(EngineError::unauthorized(
                            "invite code already claimed by another client",
                        )
                        .into())
                    }
                    _ => {
                        db.record_join_request(transaction_id, &actor.id, &now)?;
                        tracing::info!(transaction_id, client_id = %actor.id, "join request recorded");
                        db.get_access(transaction_id)?.ok_or_else(|| {
                            EngineError::not_found(format!(
                                "Access for transaction {}",
                                transaction_id
                            ))
                            .into()
                        })
                    }
                }
            })
            .await
            .map_err(map_engine_err)
    }

    /// Admit the pending client. This is the write that sets `client_joined`.
    pub async fn approve_access(
        &self,
        actor: &Actor,
        transaction_id: i64,
    ) -> Result<TransactionSnapshot, EngineError> {
        self.decide_access(actor, transaction_id, AccessStatus::Approved)
            .await
    }

    /// Turn the pending client away. They may redeem a valid code again.
    pub async fn reject_access(
        &self,
        actor: &Actor,
        transaction_id: i64,
    ) -> Result<TransactionSnapshot, EngineError> {
        self.decide_access(actor, transaction_id, AccessStatus::Rejected)
            .await
    }

    async fn decide_access(
        &self,
        actor: &Actor,
        transaction_id: i64,
        decision: AccessStatus,
    ) -> Result<TransactionSnapshot, EngineError> {
        let actor = actor.clone();
        let now = now_rfc3339();
        self.db
            .call(move |db| {
                let (tx, access) = load_access(db, transaction_id)?;
                if actor.role == ActorRole::Client {
                    return Err(EngineError::unauthorized("only agents decide join requests").into());
                }
                if actor.role == ActorRole::Agent && actor.id != tx.agent_id {
                    return Err(EngineError::unauthorized(format!(
                        "agent {} does not own transaction {}",
                        actor.id, tx.id
                    ))
                    .into());
                }

                // Benign replay of the same decision.
                if access.status == decision {
                    return Ok(snapshot::assemble(db, transaction_id)?);
                }

                gate::ensure_unlocked(&tx)?;
                if access.status != AccessStatus::Pending {
                    return Err(EngineError::precondition(format!(
                        "no pending join request to decide (access is {})",
                        access.status.as_str()
                    ))
                    .into());
                }
                // Expiry never revokes an admitted client, but it does block
                // new approvals.
                if decision == AccessStatus::Approved && code_expired(&access)? {
                    return Err(EngineError::ExpiredAccess.into());
                }

                db.decide_access(transaction_id, decision, &now)?;
                if decision == AccessStatus::Approved {
                    gate::apply_flag(db, &tx, ProgressFlag::ClientJoined, true, &now)?;
                    db.touch_transaction(tx.id, &now)?;
                }
                tracing::info!(
                    transaction_id,
                    decision = decision.as_str(),
                    "join request decided"
                );
                Ok(snapshot::assemble(db, transaction_id)?)
            })
            .await
            .map_err(map_engine_err)
    }
}
