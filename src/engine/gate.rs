//! Authorization and invariant enforcement.
//!
//! Every Progress flag write routes through [`apply_flag`]; milestone modules
//! never reach the store's flag writer directly. The gate owns three rules:
//! role/ownership authorization with the per-role phase window, flag
//! monotonicity, and the causal ordering of the flag chain. A request that
//! violates any of them is rejected here and never touches the store.

use crate::errors::EngineError;

use super::models::*;
use super::resolver::Phase;
use super::store::EngineDb;

/// Reject mutations on a locked transaction.
pub fn ensure_unlocked(tx: &Transaction) -> Result<(), EngineError> {
    if tx.is_locked() {
        return Err(EngineError::terminal(format!(
            "transaction {} is locked",
            tx.id
        )));
    }
    Ok(())
}

/// Role-based authorization for one milestone action.
///
/// Clients need an approved access bound to their identity and may only act
/// in the active phase. Agents act on their own transactions, in the active
/// phase or the one immediately after it (pre-configuring the next phase is
/// allowed, skipping ahead further is not). System callers are in-process
/// and bypass role checks.
pub fn authorize(
    actor: &Actor,
    tx: &Transaction,
    access: Option<&ClientAccess>,
    action_phase: Phase,
    active: Phase,
) -> Result<(), EngineError> {
    match actor.role {
        ActorRole::System => Ok(()),
        ActorRole::Agent => {
            if actor.id != tx.agent_id {
                return Err(EngineError::unauthorized(format!(
                    "agent {} does not own transaction {}",
                    actor.id, tx.id
                )));
            }
            if action_phase == active || Some(action_phase) == active.next() {
                Ok(())
            } else {
                Err(EngineError::precondition(format!(
                    "{} actions are out of reach while {} is active",
                    action_phase, active
                )))
            }
        }
        ActorRole::Client => {
            let access = access.ok_or_else(|| {
                EngineError::unauthorized("no client access exists for this transaction")
            })?;
            if access.status != AccessStatus::Approved {
                return Err(EngineError::unauthorized(format!(
                    "client access is {}",
                    access.status.as_str()
                )));
            }
            if access.client_id.as_deref() != Some(actor.id.as_str()) {
                return Err(EngineError::unauthorized(format!(
                    "client {} is not admitted to transaction {}",
                    actor.id, tx.id
                )));
            }
            if action_phase != active {
                return Err(EngineError::precondition(format!(
                    "clients may only act in the active phase ({} is active, {} requested)",
                    active, action_phase
                )));
            }
            Ok(())
        }
    }
}

/// The causal prerequisite a flag needs before it may be set. Enforced here,
/// never assumed from caller input.
fn flag_prerequisite(progress: &Progress, flag: ProgressFlag) -> Result<(), String> {
    let unmet = match flag {
        ProgressFlag::KycCompleted if !(progress.payment_confirmed || progress.client_joined) => {
            Some("payment_confirmed or client_joined")
        }
        ProgressFlag::DocumentsSigned if !progress.kyc_completed => Some("kyc_completed"),
        ProgressFlag::DeveloperAccepted if !progress.documents_signed => Some("documents_signed"),
        ProgressFlag::CommissionReleased if !progress.developer_accepted => {
            Some("developer_accepted")
        }
        _ => None,
    };
    match unmet {
        Some(need) => Err(format!("{} requires {}", flag, need)),
        None => Ok(()),
    }
}

/// Apply one flag write through the gate.
///
/// Returns `Ok(true)` when the flag was newly set and `Ok(false)` for the
/// benign re-application of an already-set flag — concurrent writers racing
/// on the same flag all observe success and the flag lands in the same state
/// regardless of order. Already-set re-applies succeed even on a locked
/// transaction; a novel flag on a locked transaction is `AlreadyTerminal`.
pub fn apply_flag(
    db: &EngineDb,
    tx: &Transaction,
    flag: ProgressFlag,
    value: bool,
    now: &str,
) -> Result<bool, EngineError> {
    if !value {
        return Err(EngineError::precondition(format!(
            "progress flags are monotonic; {} cannot be cleared",
            flag
        )));
    }
    let progress = db
        .get_progress(tx.id)?
        .ok_or_else(|| EngineError::not_found(format!("Progress for transaction {}", tx.id)))?;
    if progress.get(flag) {
        return Ok(false);
    }
    ensure_unlocked(tx)?;
    flag_prerequisite(&progress, flag).map_err(EngineError::precondition)?;
    db.set_progress_flag(tx.id, flag, now)?;
    Ok(true)
}
