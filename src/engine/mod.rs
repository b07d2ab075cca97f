//! Transaction lifecycle engine.
//!
//! ## Overview
//!
//! Tracks a single real-estate deal through six ordered phases (Reservation &
//! Escrow → KYC → Document Signing → Developer Handoff → Commission Release →
//! Closed). The active phase is never stored: it is derived on every read
//! from eight boolean Progress flags, so the agent's and the client's
//! independently-polling views always converge on the same answer.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Agent / │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │  Client  │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! │  poller  │  3s/5s   │         │                                        │
//! └──────────┘          │         │ Engine::<operation>()                  │
//!                       │         v                                        │
//!                       │  access / payment / kyc / signing / handoff      │
//!                       │  (milestone modules, one sub-state machine each) │
//!                       │         │                                        │
//!                       │         │ gate::apply_flag()                     │
//!                       │         v                                        │
//!                       │  gate.rs ──> store.rs (SQLite via DbHandle)      │
//!                       │  resolver.rs (pure phase derivation)             │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                            |
//! |------------|-----------------------------------------------------------|
//! | `models`   | Shared types: `Transaction`, `Progress`, status enums     |
//! | `store`    | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)       |
//! | `resolver` | Pure flag-set → phase derivation + checklist              |
//! | `gate`     | Role/phase authorization, monotonic + causal flag writes  |
//! | `snapshot` | Assembles the full per-transaction state for pollers      |
//! | `poller`   | Pull-based reconciliation loop used by observer processes |
//!
//! ## Typical Request Flow (agent confirms a payment)
//!
//! 1. `POST /api/transactions/{id}/milestones/{milestone_id}/decision` lands
//!    in `api::decide_payment`.
//! 2. The handler resolves the actor from headers and calls `Engine::decide_payment()`.
//! 3. The engine loads the milestone inside one `DbHandle::call` closure,
//!    checks the replay/lock/authorization ladder, records the decision, and
//!    once every milestone is confirmed routes `payment_confirmed=true`
//!    through `gate::apply_flag()`.
//! 4. The closure assembles and returns the resulting snapshot; both pollers
//!    pick the phase change up on their next tick.

pub mod access;
pub mod api;
pub mod gate;
pub mod handoff;
pub mod kyc;
pub mod models;
pub mod payment;
pub mod poller;
pub mod resolver;
pub mod server;
pub mod signing;
pub mod snapshot;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use crate::errors::EngineError;

use self::kyc::IdentityAnalyzer;
use self::models::*;
use self::snapshot::{ProgressView, TransactionSnapshot};
use self::store::DbHandle;

/// Tunable engine behavior. Defaults match the deployed portal.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum biometric score counted as a pass.
    pub kyc_pass_threshold: i64,
    /// Delay between transmitting a handoff package and the simulated
    /// developer receipt that completes it.
    pub handoff_completion_delay: Duration,
    /// Lifetime of a freshly generated client access code.
    pub access_code_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kyc_pass_threshold: 70,
            handoff_completion_delay: Duration::from_secs(3),
            access_code_ttl: Duration::from_secs(30 * 60),
        }
    }
}

/// Facade over the lifecycle engine. Milestone operations live in their
/// module files (`access`, `payment`, `kyc`, `signing`, `handoff`) as
/// additional `impl Engine` blocks; this module carries construction and the
/// transaction-level operations.
#[derive(Clone)]
pub struct Engine {
    db: DbHandle,
    analyzer: Arc<dyn IdentityAnalyzer>,
    config: EngineConfig,
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Recover typed engine errors carried through the store's anyhow plumbing;
/// anything else is a storage fault.
fn map_engine_err(e: anyhow::Error) -> EngineError {
    match e.downcast::<EngineError>() {
        Ok(err) => err,
        Err(other) => EngineError::Storage(other),
    }
}

/// Load the rows every authorization decision needs. Missing rows mean the
/// transaction id itself is unknown.
fn load_authz(
    db: &store::EngineDb,
    transaction_id: i64,
) -> anyhow::Result<(Transaction, ClientAccess, Progress)> {
    let tx = db
        .get_transaction(transaction_id)?
        .ok_or_else(|| EngineError::not_found(format!("Transaction {}", transaction_id)))?;
    let access = db
        .get_access(transaction_id)?
        .ok_or_else(|| EngineError::not_found(format!("Access for transaction {}", transaction_id)))?;
    let progress = db
        .get_progress(transaction_id)?
        .ok_or_else(|| EngineError::not_found(format!("Progress for transaction {}", transaction_id)))?;
    Ok((tx, access, progress))
}

/// Snapshots only go to the system, the owning agent, or the admitted
/// client. Mutating operations run this before their replay short-circuits,
/// since a replay answers with the current state too.
fn ensure_reader(actor: &Actor, tx: &Transaction, access: &ClientAccess) -> Result<(), EngineError> {
    match actor.role {
        ActorRole::System => Ok(()),
        ActorRole::Agent => {
            if actor.id == tx.agent_id {
                Ok(())
            } else {
                Err(EngineError::unauthorized(format!(
                    "agent {} does not own transaction {}",
                    actor.id, tx.id
                )))
            }
        }
        ActorRole::Client => {
            if access.status == AccessStatus::Approved
                && access.client_id.as_deref() == Some(actor.id.as_str())
            {
                Ok(())
            } else {
                Err(EngineError::unauthorized(
                    "client access is not approved for this transaction",
                ))
            }
        }
    }
}

impl Engine {
    pub fn new(db: DbHandle, analyzer: Arc<dyn IdentityAnalyzer>, config: EngineConfig) -> Self {
        Self {
            db,
            analyzer,
            config,
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Transaction operations ────────────────────────────────────────

    /// Create a transaction with its empty progress record and a fresh
    /// client invite code.
    pub async fn create_transaction(
        &self,
        actor: &Actor,
        property_ref: String,
        value_centavos: i64,
        developer_ref: String,
    ) -> Result<TransactionSnapshot, EngineError> {
        if actor.role != ActorRole::Agent {
            return Err(EngineError::unauthorized("only agents create transactions"));
        }
        if property_ref.trim().is_empty() {
            return Err(EngineError::precondition("property reference must not be empty"));
        }
        if value_centavos <= 0 {
            return Err(EngineError::precondition("transaction value must be positive"));
        }

        let agent_id = actor.id.clone();
        let code = access::generate_access_code();
        let expires_at = access::code_expiry(self.config.access_code_ttl);
        let now = now_rfc3339();
        self.db
            .call(move |db| {
                let tx = db.create_transaction(
                    &property_ref,
                    value_centavos,
                    &developer_ref,
                    &agent_id,
                    &code,
                    &expires_at,
                    &now,
                )?;
                tracing::info!(
                    transaction_id = tx.id,
                    property_ref = %tx.property_ref,
                    agent_id = %tx.agent_id,
                    "transaction created"
                );
                Ok(snapshot::assemble(db, tx.id)?)
            })
            .await
            .map_err(map_engine_err)
    }

    /// Transactions owned by the calling agent.
    pub async fn list_transactions(&self, actor: &Actor) -> Result<Vec<Transaction>, EngineError> {
        if actor.role != ActorRole::Agent {
            return Err(EngineError::unauthorized("only agents list transactions"));
        }
        let agent_id = actor.id.clone();
        self.db
            .call(move |db| db.list_transactions_for_agent(&agent_id))
            .await
            .map_err(map_engine_err)
    }

    /// Full snapshot, readable by the owning agent, the admitted client, or
    /// in-process callers.
    pub async fn snapshot(
        &self,
        actor: &Actor,
        transaction_id: i64,
    ) -> Result<TransactionSnapshot, EngineError> {
        let actor = actor.clone();
        self.db
            .call(move |db| {
                let snap = snapshot::assemble(db, transaction_id)?;
                ensure_reader(&actor, &snap.transaction, &snap.access)?;
                Ok(snap)
            })
            .await
            .map_err(map_engine_err)
    }

    /// The light flags + phase view fetched by the fast poll loop.
    pub async fn progress_view(
        &self,
        actor: &Actor,
        transaction_id: i64,
    ) -> Result<ProgressView, EngineError> {
        let actor = actor.clone();
        self.db
            .call(move |db| {
                let tx = db
                    .get_transaction(transaction_id)?
                    .ok_or_else(|| EngineError::not_found(format!("Transaction {}", transaction_id)))?;
                let access = db.get_access(transaction_id)?.ok_or_else(|| {
                    EngineError::not_found(format!("Access for transaction {}", transaction_id))
                })?;
                ensure_reader(&actor, &tx, &access)?;
                Ok(snapshot::assemble_progress(db, transaction_id)?)
            })
            .await
            .map_err(map_engine_err)
    }

    /// Set one progress flag directly. Reserved for the owning agent and
    /// in-process callers; the flag write still goes through the gate, so
    /// monotonicity and causal ordering hold here too.
    pub async fn patch_progress(
        &self,
        actor: &Actor,
        transaction_id: i64,
        flag: ProgressFlag,
        value: bool,
    ) -> Result<TransactionSnapshot, EngineError> {
        if actor.role == ActorRole::Client {
            return Err(EngineError::unauthorized(
                "clients cannot set progress flags directly",
            ));
        }
        let actor = actor.clone();
        let now = now_rfc3339();
        self.db
            .call(move |db| {
                let tx = db
                    .get_transaction(transaction_id)?
                    .ok_or_else(|| EngineError::not_found(format!("Transaction {}", transaction_id)))?;
                if actor.role == ActorRole::Agent && actor.id != tx.agent_id {
                    return Err(EngineError::unauthorized(format!(
                        "agent {} does not own transaction {}",
                        actor.id, tx.id
                    ))
                    .into());
                }
                let newly = gate::apply_flag(db, &tx, flag, value, &now)?;
                if newly {
                    db.touch_transaction(tx.id, &now)?;
                    tracing::info!(transaction_id, flag = %flag, "progress flag set");
                }
                Ok(snapshot::assemble(db, transaction_id)?)
            })
            .await
            .map_err(map_engine_err)
    }
}
