use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{Connection, params};

use super::models::*;

/// Async-safe handle to the engine database.
///
/// Wraps `EngineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, preventing synchronous SQLite
/// I/O from tying up async worker threads. The mutex also serializes
/// lifecycle mutations: a closure passed to `call` observes and writes state
/// without interleaving with other requests.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<EngineDb>>,
}

impl DbHandle {
    pub fn new(db: EngineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&EngineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. Used in contexts where
    /// blocking is acceptable: startup initialization and tests. Callers must
    /// ensure this is NOT called from a hot async path to avoid blocking the
    /// tokio runtime.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, EngineDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

pub struct EngineDb {
    conn: Connection,
}

impl EngineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS transactions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    property_ref TEXT NOT NULL,
                    value_centavos INTEGER NOT NULL,
                    developer_ref TEXT NOT NULL,
                    agent_id TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'active',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS progress (
                    transaction_id INTEGER PRIMARY KEY REFERENCES transactions(id) ON DELETE CASCADE,
                    ra_uploaded INTEGER NOT NULL DEFAULT 0,
                    bis_uploaded INTEGER NOT NULL DEFAULT 0,
                    client_joined INTEGER NOT NULL DEFAULT 0,
                    payment_confirmed INTEGER NOT NULL DEFAULT 0,
                    kyc_completed INTEGER NOT NULL DEFAULT 0,
                    documents_signed INTEGER NOT NULL DEFAULT 0,
                    developer_accepted INTEGER NOT NULL DEFAULT 0,
                    commission_released INTEGER NOT NULL DEFAULT 0,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS client_access (
                    transaction_id INTEGER PRIMARY KEY REFERENCES transactions(id) ON DELETE CASCADE,
                    code TEXT NOT NULL,
                    code_expires_at TEXT NOT NULL,
                    client_id TEXT,
                    status TEXT NOT NULL DEFAULT 'none',
                    requested_at TEXT,
                    decided_at TEXT
                );

                CREATE TABLE IF NOT EXISTS payment_milestones (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    transaction_id INTEGER NOT NULL REFERENCES transactions(id) ON DELETE CASCADE,
                    label TEXT NOT NULL,
                    amount_centavos INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    proof_ref TEXT,
                    uploaded_at TEXT,
                    decided_at TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS payment_reviews (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    milestone_id INTEGER NOT NULL REFERENCES payment_milestones(id) ON DELETE CASCADE,
                    decision TEXT NOT NULL,
                    reason TEXT,
                    decided_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS kyc_records (
                    transaction_id INTEGER PRIMARY KEY REFERENCES transactions(id) ON DELETE CASCADE,
                    status TEXT NOT NULL DEFAULT 'pending',
                    id_ref TEXT,
                    selfie_ref TEXT,
                    analysis_score INTEGER,
                    agent_approved INTEGER NOT NULL DEFAULT 0,
                    attempt INTEGER NOT NULL DEFAULT 0,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS documents (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    transaction_id INTEGER NOT NULL REFERENCES transactions(id) ON DELETE CASCADE,
                    title TEXT NOT NULL,
                    required_roles TEXT NOT NULL DEFAULT '[\"buyer\"]',
                    acknowledged INTEGER NOT NULL DEFAULT 0,
                    acknowledged_at TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS signing_records (
                    document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                    signer_role TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'unsigned',
                    signature_ref TEXT,
                    signed_at TEXT,
                    PRIMARY KEY (document_id, signer_role)
                );

                CREATE TABLE IF NOT EXISTS signing_reviews (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    transaction_id INTEGER NOT NULL REFERENCES transactions(id) ON DELETE CASCADE,
                    action TEXT NOT NULL,
                    reason TEXT,
                    decided_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS handoff_records (
                    transaction_id INTEGER PRIMARY KEY REFERENCES transactions(id) ON DELETE CASCADE,
                    status TEXT NOT NULL DEFAULT 'pending',
                    package_items TEXT NOT NULL DEFAULT '[]',
                    transmitted_at TEXT,
                    receipt_number TEXT,
                    completed_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_transactions_agent ON transactions(agent_id);
                CREATE INDEX IF NOT EXISTS idx_milestones_transaction ON payment_milestones(transaction_id);
                CREATE INDEX IF NOT EXISTS idx_payment_reviews_milestone ON payment_reviews(milestone_id);
                CREATE INDEX IF NOT EXISTS idx_documents_transaction ON documents(transaction_id);
                CREATE INDEX IF NOT EXISTS idx_signing_reviews_transaction ON signing_reviews(transaction_id);
                ",
            )
            .context("Failed to create tables")?;

        // Additive migrations (defaults make them safe to re-run).
        // We only ignore "duplicate column" errors — any other error is propagated.
        match self.conn.execute(
            "ALTER TABLE payment_milestones ADD COLUMN proof_pattern TEXT NOT NULL DEFAULT '*'",
            [],
        ) {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to add proof_pattern column: {}", e)),
        }

        Ok(())
    }

    // ── Transactions ──────────────────────────────────────────────────

    /// Create a transaction together with its child rows: the empty progress
    /// record, the KYC and handoff sub-states, and the client access slot
    /// carrying the initial invite code. One SQLite transaction so a partial
    /// aggregate can never be observed.
    pub fn create_transaction(
        &self,
        property_ref: &str,
        value_centavos: i64,
        developer_ref: &str,
        agent_id: &str,
        access_code: &str,
        code_expires_at: &str,
        now: &str,
    ) -> Result<Transaction> {
        // Safety: DbHandle's Mutex already guarantees single-threaded access.
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        tx.execute(
            "INSERT INTO transactions (property_ref, value_centavos, developer_ref, agent_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?5)",
            params![property_ref, value_centavos, developer_ref, agent_id, now],
        )
        .context("Failed to insert transaction")?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO progress (transaction_id, updated_at) VALUES (?1, ?2)",
            params![id, now],
        )
        .context("Failed to insert progress row")?;
        tx.execute(
            "INSERT INTO client_access (transaction_id, code, code_expires_at) VALUES (?1, ?2, ?3)",
            params![id, access_code, code_expires_at],
        )
        .context("Failed to insert client access row")?;
        tx.execute(
            "INSERT INTO kyc_records (transaction_id, updated_at) VALUES (?1, ?2)",
            params![id, now],
        )
        .context("Failed to insert kyc row")?;
        tx.execute(
            "INSERT INTO handoff_records (transaction_id) VALUES (?1)",
            params![id],
        )
        .context("Failed to insert handoff row")?;

        tx.commit().context("Failed to commit transaction create")?;
        self.get_transaction(id)?
            .context("Transaction not found after insert")
    }

    pub fn get_transaction(&self, id: i64) -> Result<Option<Transaction>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, property_ref, value_centavos, developer_ref, agent_id, status, created_at, updated_at
                 FROM transactions WHERE id = ?1",
            )
            .context("Failed to prepare get_transaction")?;
        let mut rows = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .context("Failed to query transaction")?;
        match rows.next() {
            Some(row) => {
                let (id, property_ref, value_centavos, developer_ref, agent_id, status_str, created_at, updated_at) =
                    row.context("Failed to read transaction row")?;
                Ok(Some(Transaction {
                    id,
                    property_ref,
                    value_centavos,
                    developer_ref,
                    agent_id,
                    status: TransactionStatus::from_str(&status_str).map_err(|_| {
                        anyhow::anyhow!("invalid transaction status in database: '{}'", status_str)
                    })?,
                    created_at,
                    updated_at,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn list_transactions_for_agent(&self, agent_id: &str) -> Result<Vec<Transaction>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, property_ref, value_centavos, developer_ref, agent_id, status, created_at, updated_at
                 FROM transactions WHERE agent_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_transactions_for_agent")?;
        let rows = stmt
            .query_map(params![agent_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .context("Failed to query transactions")?;
        let mut transactions = Vec::new();
        for row in rows {
            let (id, property_ref, value_centavos, developer_ref, agent_id, status_str, created_at, updated_at) =
                row.context("Failed to read transaction row")?;
            transactions.push(Transaction {
                id,
                property_ref,
                value_centavos,
                developer_ref,
                agent_id,
                status: TransactionStatus::from_str(&status_str).map_err(|_| {
                    anyhow::anyhow!("invalid transaction status in database: '{}'", status_str)
                })?,
                created_at,
                updated_at,
            });
        }
        Ok(transactions)
    }

    pub fn touch_transaction(&self, id: i64, now: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE transactions SET updated_at = ?1 WHERE id = ?2",
                params![now, id],
            )
            .context("Failed to touch transaction")?;
        Ok(())
    }

    pub fn lock_transaction(&self, id: i64, now: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE transactions SET status = 'locked', updated_at = ?1 WHERE id = ?2",
                params![now, id],
            )
            .context("Failed to lock transaction")?;
        Ok(())
    }

    // ── Progress ──────────────────────────────────────────────────────

    pub fn get_progress(&self, transaction_id: i64) -> Result<Option<Progress>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT transaction_id, ra_uploaded, bis_uploaded, client_joined, payment_confirmed,
                        kyc_completed, documents_signed, developer_accepted, commission_released, updated_at
                 FROM progress WHERE transaction_id = ?1",
            )
            .context("Failed to prepare get_progress")?;
        let mut rows = stmt
            .query_map(params![transaction_id], |row| {
                Ok(Progress {
                    transaction_id: row.get(0)?,
                    ra_uploaded: row.get(1)?,
                    bis_uploaded: row.get(2)?,
                    client_joined: row.get(3)?,
                    payment_confirmed: row.get(4)?,
                    kyc_completed: row.get(5)?,
                    documents_signed: row.get(6)?,
                    developer_accepted: row.get(7)?,
                    commission_released: row.get(8)?,
                    updated_at: row.get(9)?,
                })
            })
            .context("Failed to query progress")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("Failed to read progress row")?)),
            None => Ok(None),
        }
    }

    /// Raise one milestone flag. The column name comes from the closed
    /// `ProgressFlag` set, never from caller input.
    pub fn set_progress_flag(&self, transaction_id: i64, flag: ProgressFlag, now: &str) -> Result<()> {
        let sql = format!(
            "UPDATE progress SET {} = 1, updated_at = ?1 WHERE transaction_id = ?2",
            flag.as_str()
        );
        self.conn
            .execute(&sql, params![now, transaction_id])
            .with_context(|| format!("Failed to set progress flag {}", flag))?;
        Ok(())
    }

    // ── Client access ─────────────────────────────────────────────────

    pub fn get_access(&self, transaction_id: i64) -> Result<Option<ClientAccess>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT transaction_id, code, code_expires_at, client_id, status, requested_at, decided_at
                 FROM client_access WHERE transaction_id = ?1",
            )
            .context("Failed to prepare get_access")?;
        let mut rows = stmt
            .query_map(params![transaction_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })
            .context("Failed to query client access")?;
        match rows.next() {
            Some(row) => {
                let (transaction_id, code, code_expires_at, client_id, status_str, requested_at, decided_at) =
                    row.context("Failed to read client access row")?;
                Ok(Some(ClientAccess {
                    transaction_id,
                    code,
                    code_expires_at,
                    client_id,
                    status: AccessStatus::from_str(&status_str).map_err(|_| {
                        anyhow::anyhow!("invalid access status in database: '{}'", status_str)
                    })?,
                    requested_at,
                    decided_at,
                }))
            }
            None => Ok(None),
        }
    }

    /// Replace the invite code and restart the admission window. Any
    /// undecided join request is discarded with it.
    pub fn reset_access_code(
        &self,
        transaction_id: i64,
        code: &str,
        code_expires_at: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE client_access
                 SET code = ?1, code_expires_at = ?2, client_id = NULL, status = 'none',
                     requested_at = NULL, decided_at = NULL
                 WHERE transaction_id = ?3",
                params![code, code_expires_at, transaction_id],
            )
            .context("Failed to reset access code")?;
        Ok(())
    }

    /// Swap in a new invite code without touching the client binding. Used
    /// once a client is already admitted.
    pub fn rotate_access_code(
        &self,
        transaction_id: i64,
        code: &str,
        code_expires_at: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE client_access SET code = ?1, code_expires_at = ?2 WHERE transaction_id = ?3",
                params![code, code_expires_at, transaction_id],
            )
            .context("Failed to rotate access code")?;
        Ok(())
    }

    pub fn record_join_request(
        &self,
        transaction_id: i64,
        client_id: &str,
        now: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE client_access
                 SET client_id = ?1, status = 'pending', requested_at = ?2, decided_at = NULL
                 WHERE transaction_id = ?3",
                params![client_id, now, transaction_id],
            )
            .context("Failed to record join request")?;
        Ok(())
    }

    pub fn decide_access(
        &self,
        transaction_id: i64,
        status: AccessStatus,
        now: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE client_access SET status = ?1, decided_at = ?2 WHERE transaction_id = ?3",
                params![status.as_str(), now, transaction_id],
            )
            .context("Failed to decide client access")?;
        Ok(())
    }

    // ── Payment milestones ────────────────────────────────────────────

    pub fn create_milestone(
        &self,
        transaction_id: i64,
        label: &str,
        amount_centavos: i64,
        proof_pattern: &str,
        now: &str,
    ) -> Result<PaymentMilestone> {
        self.conn
            .execute(
                "INSERT INTO payment_milestones (transaction_id, label, amount_centavos, proof_pattern, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![transaction_id, label, amount_centavos, proof_pattern, now],
            )
            .context("Failed to insert payment milestone")?;
        let id = self.conn.last_insert_rowid();
        self.get_milestone(id)?
            .context("Milestone not found after insert")
    }

    pub fn get_milestone(&self, id: i64) -> Result<Option<PaymentMilestone>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, transaction_id, label, amount_centavos, proof_pattern, status, proof_ref, uploaded_at, decided_at, created_at
                 FROM payment_milestones WHERE id = ?1",
            )
            .context("Failed to prepare get_milestone")?;
        let mut rows = stmt
            .query_map(params![id], |row| {
                Ok(MilestoneRow {
                    id: row.get(0)?,
                    transaction_id: row.get(1)?,
                    label: row.get(2)?,
                    amount_centavos: row.get(3)?,
                    proof_pattern: row.get(4)?,
                    status: row.get(5)?,
                    proof_ref: row.get(6)?,
                    uploaded_at: row.get(7)?,
                    decided_at: row.get(8)?,
                    created_at: row.get(9)?,
                })
            })
            .context("Failed to query milestone")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read milestone row")?;
                Ok(Some(r.into_milestone()?))
            }
            None => Ok(None),
        }
    }

    pub fn list_milestones(&self, transaction_id: i64) -> Result<Vec<PaymentMilestone>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, transaction_id, label, amount_centavos, proof_pattern, status, proof_ref, uploaded_at, decided_at, created_at
                 FROM payment_milestones WHERE transaction_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_milestones")?;
        let rows = stmt
            .query_map(params![transaction_id], |row| {
                Ok(MilestoneRow {
                    id: row.get(0)?,
                    transaction_id: row.get(1)?,
                    label: row.get(2)?,
                    amount_centavos: row.get(3)?,
                    proof_pattern: row.get(4)?,
                    status: row.get(5)?,
                    proof_ref: row.get(6)?,
                    uploaded_at: row.get(7)?,
                    decided_at: row.get(8)?,
                    created_at: row.get(9)?,
                })
            })
            .context("Failed to query milestones")?;
        let mut milestones = Vec::new();
        for row in rows {
            let r = row.context("Failed to read milestone row")?;
            milestones.push(r.into_milestone()?);
        }
        Ok(milestones)
    }

    pub fn set_milestone_proof(&self, id: i64, proof_ref: &str, now: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE payment_milestones
                 SET status = 'reviewing', proof_ref = ?1, uploaded_at = ?2, decided_at = NULL
                 WHERE id = ?3",
                params![proof_ref, now, id],
            )
            .context("Failed to attach milestone proof")?;
        Ok(())
    }

    /// Record a review decision and its audit row in one SQLite transaction.
    pub fn decide_milestone(
        &self,
        id: i64,
        status: MilestoneStatus,
        decision: ReviewDecision,
        reason: Option<&str>,
        now: &str,
    ) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "UPDATE payment_milestones SET status = ?1, decided_at = ?2 WHERE id = ?3",
            params![status.as_str(), now, id],
        )
        .context("Failed to update milestone decision")?;
        tx.execute(
            "INSERT INTO payment_reviews (milestone_id, decision, reason, decided_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, decision.as_str(), reason, now],
        )
        .context("Failed to insert payment review")?;
        tx.commit().context("Failed to commit milestone decision")?;
        Ok(())
    }

    /// True when the transaction has at least one milestone and every one of
    /// them is confirmed.
    pub fn all_milestones_confirmed(&self, transaction_id: i64) -> Result<bool> {
        let (total, confirmed): (i64, i64) = self
            .conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(status = 'confirmed'), 0)
                 FROM payment_milestones WHERE transaction_id = ?1",
                params![transaction_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to count milestones")?;
        Ok(total > 0 && total == confirmed)
    }

    pub fn list_payment_reviews(&self, transaction_id: i64) -> Result<Vec<PaymentReview>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT r.id, r.milestone_id, r.decision, r.reason, r.decided_at
                 FROM payment_reviews r
                 JOIN payment_milestones m ON m.id = r.milestone_id
                 WHERE m.transaction_id = ?1 ORDER BY r.id",
            )
            .context("Failed to prepare list_payment_reviews")?;
        let rows = stmt
            .query_map(params![transaction_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .context("Failed to query payment reviews")?;
        let mut reviews = Vec::new();
        for row in rows {
            let (id, milestone_id, decision_str, reason, decided_at) =
                row.context("Failed to read payment review row")?;
            reviews.push(PaymentReview {
                id,
                milestone_id,
                decision: ReviewDecision::from_str(&decision_str).map_err(|_| {
                    anyhow::anyhow!("invalid review decision in database: '{}'", decision_str)
                })?,
                reason,
                decided_at,
            });
        }
        Ok(reviews)
    }

    // ── KYC ───────────────────────────────────────────────────────────

    pub fn get_kyc(&self, transaction_id: i64) -> Result<Option<KycRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT transaction_id, status, id_ref, selfie_ref, analysis_score, agent_approved, attempt, updated_at
                 FROM kyc_records WHERE transaction_id = ?1",
            )
            .context("Failed to prepare get_kyc")?;
        let mut rows = stmt
            .query_map(params![transaction_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, String>(7)?,
                ))
            })
            .context("Failed to query kyc record")?;
        match rows.next() {
            Some(row) => {
                let (transaction_id, status_str, id_ref, selfie_ref, analysis_score, agent_approved, attempt, updated_at) =
                    row.context("Failed to read kyc row")?;
                Ok(Some(KycRecord {
                    transaction_id,
                    status: KycStatus::from_str(&status_str).map_err(|_| {
                        anyhow::anyhow!("invalid kyc status in database: '{}'", status_str)
                    })?,
                    id_ref,
                    selfie_ref,
                    analysis_score,
                    agent_approved,
                    attempt,
                    updated_at,
                }))
            }
            None => Ok(None),
        }
    }

    /// Record the id upload. Clears any score left over from a failed
    /// attempt; the new attempt starts unscored.
    pub fn record_kyc_id(
        &self,
        transaction_id: i64,
        id_ref: &str,
        status: KycStatus,
        now: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE kyc_records
                 SET id_ref = ?1, status = ?2, analysis_score = NULL, updated_at = ?3
                 WHERE transaction_id = ?4",
                params![id_ref, status.as_str(), now, transaction_id],
            )
            .context("Failed to record kyc id upload")?;
        Ok(())
    }

    pub fn record_kyc_selfie(
        &self,
        transaction_id: i64,
        selfie_ref: &str,
        status: KycStatus,
        now: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE kyc_records SET selfie_ref = ?1, status = ?2, updated_at = ?3 WHERE transaction_id = ?4",
                params![selfie_ref, status.as_str(), now, transaction_id],
            )
            .context("Failed to record kyc selfie upload")?;
        Ok(())
    }

    pub fn set_kyc_status(&self, transaction_id: i64, status: KycStatus, now: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE kyc_records SET status = ?1, updated_at = ?2 WHERE transaction_id = ?3",
                params![status.as_str(), now, transaction_id],
            )
            .context("Failed to set kyc status")?;
        Ok(())
    }

    /// Store an analysis outcome and bump the attempt counter.
    pub fn record_kyc_analysis(
        &self,
        transaction_id: i64,
        score: i64,
        status: KycStatus,
        now: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE kyc_records
                 SET analysis_score = ?1, status = ?2, attempt = attempt + 1, updated_at = ?3
                 WHERE transaction_id = ?4",
                params![score, status.as_str(), now, transaction_id],
            )
            .context("Failed to record kyc analysis")?;
        Ok(())
    }

    pub fn approve_kyc(&self, transaction_id: i64, now: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE kyc_records SET status = 'approved', agent_approved = 1, updated_at = ?1
                 WHERE transaction_id = ?2",
                params![now, transaction_id],
            )
            .context("Failed to approve kyc")?;
        Ok(())
    }

    // ── Documents and signing ─────────────────────────────────────────

    /// Create a document plus one signing record per required role, all in
    /// one SQLite transaction.
    pub fn create_document(
        &self,
        transaction_id: i64,
        title: &str,
        required_roles: &[SignerRole],
        now: &str,
    ) -> Result<Document> {
        let roles_json =
            serde_json::to_string(required_roles).context("Failed to serialize required roles")?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute(
            "INSERT INTO documents (transaction_id, title, required_roles, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![transaction_id, title, roles_json, now],
        )
        .context("Failed to insert document")?;
        let id = tx.last_insert_rowid();
        for role in required_roles {
            tx.execute(
                "INSERT INTO signing_records (document_id, signer_role) VALUES (?1, ?2)",
                params![id, role.as_str()],
            )
            .context("Failed to insert signing record")?;
        }
        tx.commit().context("Failed to commit document create")?;
        self.get_document(id)?
            .context("Document not found after insert")
    }

    pub fn get_document(&self, id: i64) -> Result<Option<Document>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, transaction_id, title, required_roles, acknowledged, acknowledged_at, created_at
                 FROM documents WHERE id = ?1",
            )
            .context("Failed to prepare get_document")?;
        let mut rows = stmt
            .query_map(params![id], |row| {
                Ok(DocumentRow {
                    id: row.get(0)?,
                    transaction_id: row.get(1)?,
                    title: row.get(2)?,
                    required_roles: row.get(3)?,
                    acknowledged: row.get(4)?,
                    acknowledged_at: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })
            .context("Failed to query document")?;
        match rows.next() {
            Some(row) => {
                let r = row.context("Failed to read document row")?;
                Ok(Some(r.into_document()?))
            }
            None => Ok(None),
        }
    }

    pub fn list_documents(&self, transaction_id: i64) -> Result<Vec<Document>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, transaction_id, title, required_roles, acknowledged, acknowledged_at, created_at
                 FROM documents WHERE transaction_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_documents")?;
        let rows = stmt
            .query_map(params![transaction_id], |row| {
                Ok(DocumentRow {
                    id: row.get(0)?,
                    transaction_id: row.get(1)?,
                    title: row.get(2)?,
                    required_roles: row.get(3)?,
                    acknowledged: row.get(4)?,
                    acknowledged_at: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })
            .context("Failed to query documents")?;
        let mut documents = Vec::new();
        for row in rows {
            let r = row.context("Failed to read document row")?;
            documents.push(r.into_document()?);
        }
        Ok(documents)
    }

    pub fn acknowledge_document(&self, id: i64, now: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE documents SET acknowledged = 1, acknowledged_at = ?1 WHERE id = ?2",
                params![now, id],
            )
            .context("Failed to acknowledge document")?;
        Ok(())
    }

    /// True when the transaction has at least one document and every one of
    /// them has been walked through by the client.
    pub fn all_documents_acknowledged(&self, transaction_id: i64) -> Result<bool> {
        let (total, acknowledged): (i64, i64) = self
            .conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(acknowledged), 0) FROM documents WHERE transaction_id = ?1",
                params![transaction_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to count documents")?;
        Ok(total > 0 && total == acknowledged)
    }

    pub fn get_signing_record(
        &self,
        document_id: i64,
        role: SignerRole,
    ) -> Result<Option<SigningRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT document_id, signer_role, status, signature_ref, signed_at
                 FROM signing_records WHERE document_id = ?1 AND signer_role = ?2",
            )
            .context("Failed to prepare get_signing_record")?;
        let mut rows = stmt
            .query_map(params![document_id, role.as_str()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .context("Failed to query signing record")?;
        match rows.next() {
            Some(row) => {
                let (document_id, role_str, status_str, signature_ref, signed_at) =
                    row.context("Failed to read signing record row")?;
                Ok(Some(SigningRecord {
                    document_id,
                    signer_role: SignerRole::from_str(&role_str).map_err(|_| {
                        anyhow::anyhow!("invalid signer role in database: '{}'", role_str)
                    })?,
                    status: SigningStatus::from_str(&status_str).map_err(|_| {
                        anyhow::anyhow!("invalid signing status in database: '{}'", status_str)
                    })?,
                    signature_ref,
                    signed_at,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn list_signing_records(&self, transaction_id: i64) -> Result<Vec<SigningRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT s.document_id, s.signer_role, s.status, s.signature_ref, s.signed_at
                 FROM signing_records s
                 JOIN documents d ON d.id = s.document_id
                 WHERE d.transaction_id = ?1 ORDER BY s.document_id, s.signer_role",
            )
            .context("Failed to prepare list_signing_records")?;
        let rows = stmt
            .query_map(params![transaction_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .context("Failed to query signing records")?;
        let mut records = Vec::new();
        for row in rows {
            let (document_id, role_str, status_str, signature_ref, signed_at) =
                row.context("Failed to read signing record row")?;
            records.push(SigningRecord {
                document_id,
                signer_role: SignerRole::from_str(&role_str).map_err(|_| {
                    anyhow::anyhow!("invalid signer role in database: '{}'", role_str)
                })?,
                status: SigningStatus::from_str(&status_str).map_err(|_| {
                    anyhow::anyhow!("invalid signing status in database: '{}'", status_str)
                })?,
                signature_ref,
                signed_at,
            });
        }
        Ok(records)
    }

    pub fn record_signature(
        &self,
        document_id: i64,
        role: SignerRole,
        signature_ref: &str,
        now: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE signing_records SET status = 'signed', signature_ref = ?1, signed_at = ?2
                 WHERE document_id = ?3 AND signer_role = ?4",
                params![signature_ref, now, document_id, role.as_str()],
            )
            .context("Failed to record signature")?;
        Ok(())
    }

    /// Move every signed record of the transaction into `submitted`.
    pub fn submit_signing_batch(&self, transaction_id: i64) -> Result<usize> {
        let count = self
            .conn
            .execute(
                "UPDATE signing_records SET status = 'submitted'
                 WHERE status = 'signed'
                   AND document_id IN (SELECT id FROM documents WHERE transaction_id = ?1)",
                params![transaction_id],
            )
            .context("Failed to submit signing batch")?;
        Ok(count)
    }

    /// Resolve a submitted batch (`validated` or `returned`) and record the
    /// audit row in one SQLite transaction.
    pub fn decide_signing_batch(
        &self,
        transaction_id: i64,
        to_status: SigningStatus,
        action: &str,
        reason: Option<&str>,
        now: &str,
    ) -> Result<usize> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let count = tx
            .execute(
                "UPDATE signing_records SET status = ?1
                 WHERE status = 'submitted'
                   AND document_id IN (SELECT id FROM documents WHERE transaction_id = ?2)",
                params![to_status.as_str(), transaction_id],
            )
            .context("Failed to update signing batch")?;
        tx.execute(
            "INSERT INTO signing_reviews (transaction_id, action, reason, decided_at) VALUES (?1, ?2, ?3, ?4)",
            params![transaction_id, action, reason, now],
        )
        .context("Failed to insert signing review")?;
        tx.commit().context("Failed to commit signing decision")?;
        Ok(count)
    }

    pub fn list_signing_reviews(&self, transaction_id: i64) -> Result<Vec<SigningReview>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, transaction_id, action, reason, decided_at
                 FROM signing_reviews WHERE transaction_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare list_signing_reviews")?;
        let rows = stmt
            .query_map(params![transaction_id], |row| {
                Ok(SigningReview {
                    id: row.get(0)?,
                    transaction_id: row.get(1)?,
                    action: row.get(2)?,
                    reason: row.get(3)?,
                    decided_at: row.get(4)?,
                })
            })
            .context("Failed to query signing reviews")?;
        let mut reviews = Vec::new();
        for row in rows {
            reviews.push(row.context("Failed to read signing review row")?);
        }
        Ok(reviews)
    }

    // ── Developer handoff ─────────────────────────────────────────────

    pub fn get_handoff(&self, transaction_id: i64) -> Result<Option<HandoffRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT transaction_id, status, package_items, transmitted_at, receipt_number, completed_at
                 FROM handoff_records WHERE transaction_id = ?1",
            )
            .context("Failed to prepare get_handoff")?;
        let mut rows = stmt
            .query_map(params![transaction_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .context("Failed to query handoff record")?;
        match rows.next() {
            Some(row) => {
                let (transaction_id, status_str, items_str, transmitted_at, receipt_number, completed_at) =
                    row.context("Failed to read handoff row")?;
                let package_items: Vec<String> = serde_json::from_str(&items_str)
                    .map_err(|e| anyhow::anyhow!("corrupt package_items JSON '{}': {}", items_str, e))?;
                Ok(Some(HandoffRecord {
                    transaction_id,
                    status: HandoffStatus::from_str(&status_str).map_err(|_| {
                        anyhow::anyhow!("invalid handoff status in database: '{}'", status_str)
                    })?,
                    package_items,
                    transmitted_at,
                    receipt_number,
                    completed_at,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn start_handoff(
        &self,
        transaction_id: i64,
        package_items: &[String],
        now: &str,
    ) -> Result<()> {
        let items_json =
            serde_json::to_string(package_items).context("Failed to serialize package items")?;
        self.conn
            .execute(
                "UPDATE handoff_records
                 SET status = 'transmitting', package_items = ?1, transmitted_at = ?2
                 WHERE transaction_id = ?3",
                params![items_json, now, transaction_id],
            )
            .context("Failed to start handoff")?;
        Ok(())
    }

    pub fn complete_handoff(
        &self,
        transaction_id: i64,
        receipt_number: &str,
        now: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE handoff_records
                 SET status = 'completed', receipt_number = ?1, completed_at = ?2
                 WHERE transaction_id = ?3",
                params![receipt_number, now, transaction_id],
            )
            .context("Failed to complete handoff")?;
        Ok(())
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Intermediate row struct for payment milestones before parsing the status
/// string into a typed value.
struct MilestoneRow {
    id: i64,
    transaction_id: i64,
    label: String,
    amount_centavos: i64,
    proof_pattern: String,
    status: String,
    proof_ref: Option<String>,
    uploaded_at: Option<String>,
    decided_at: Option<String>,
    created_at: String,
}

impl MilestoneRow {
    fn into_milestone(self) -> Result<PaymentMilestone> {
        let status = MilestoneStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse milestone status")?;
        Ok(PaymentMilestone {
            id: self.id,
            transaction_id: self.transaction_id,
            label: self.label,
            amount_centavos: self.amount_centavos,
            proof_pattern: self.proof_pattern,
            status,
            proof_ref: self.proof_ref,
            uploaded_at: self.uploaded_at,
            decided_at: self.decided_at,
            created_at: self.created_at,
        })
    }
}

/// Intermediate row struct for documents before parsing the required-roles
/// JSON into typed values.
struct DocumentRow {
    id: i64,
    transaction_id: i64,
    title: String,
    required_roles: String,
    acknowledged: bool,
    acknowledged_at: Option<String>,
    created_at: String,
}

impl DocumentRow {
    fn into_document(self) -> Result<Document> {
        let required_roles: Vec<SignerRole> = serde_json::from_str(&self.required_roles)
            .with_context(|| format!("corrupt required_roles JSON '{}'", self.required_roles))?;
        Ok(Document {
            id: self.id,
            transaction_id: self.transaction_id,
            title: self.title,
            required_roles,
            acknowledged: self.acknowledged,
            acknowledged_at: self.acknowledged_at,
            created_at: self.created_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> String {
        chrono::Utc::now().to_rfc3339()
    }

    fn seed_transaction(db: &EngineDb) -> Result<Transaction> {
        db.create_transaction(
            "lot-12-block-3",
            25_000_00,
            "horizon-dev",
            "agent-1",
            "CODE-1234",
            "2099-01-01T00:00:00+00:00",
            &now(),
        )
    }

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = EngineDb::new_in_memory()?;

        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('transactions', 'progress', 'client_access', 'payment_milestones', 'payment_reviews',
              'kyc_records', 'documents', 'signing_records', 'signing_reviews', 'handoff_records')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 10, "Expected 10 tables to exist");

        Ok(())
    }

    #[test]
    fn test_create_transaction_seeds_child_rows() -> Result<()> {
        let db = EngineDb::new_in_memory()?;
        let tx = seed_transaction(&db)?;

        assert!(tx.id > 0);
        assert_eq!(tx.status, TransactionStatus::Active);
        assert_eq!(tx.value_centavos, 25_000_00);

        let progress = db.get_progress(tx.id)?.expect("progress row should exist");
        assert!(progress.set_flags().is_empty());

        let access = db.get_access(tx.id)?.expect("access row should exist");
        assert_eq!(access.code, "CODE-1234");
        assert_eq!(access.status, AccessStatus::None);
        assert!(access.client_id.is_none());

        let kyc = db.get_kyc(tx.id)?.expect("kyc row should exist");
        assert_eq!(kyc.status, KycStatus::Pending);
        assert_eq!(kyc.attempt, 0);

        let handoff = db.get_handoff(tx.id)?.expect("handoff row should exist");
        assert_eq!(handoff.status, HandoffStatus::Pending);
        assert!(handoff.package_items.is_empty());

        Ok(())
    }

    #[test]
    fn test_set_progress_flag() -> Result<()> {
        let db = EngineDb::new_in_memory()?;
        let tx = seed_transaction(&db)?;

        db.set_progress_flag(tx.id, ProgressFlag::ClientJoined, &now())?;
        db.set_progress_flag(tx.id, ProgressFlag::PaymentConfirmed, &now())?;

        let progress = db.get_progress(tx.id)?.expect("progress row should exist");
        assert!(progress.client_joined);
        assert!(progress.payment_confirmed);
        assert!(!progress.kyc_completed);

        Ok(())
    }

    #[test]
    fn test_access_join_and_decide() -> Result<()> {
        let db = EngineDb::new_in_memory()?;
        let tx = seed_transaction(&db)?;

        db.record_join_request(tx.id, "client-9", &now())?;
        let access = db.get_access(tx.id)?.expect("access row should exist");
        assert_eq!(access.status, AccessStatus::Pending);
        assert_eq!(access.client_id.as_deref(), Some("client-9"));

        db.decide_access(tx.id, AccessStatus::Approved, &now())?;
        let access = db.get_access(tx.id)?.expect("access row should exist");
        assert_eq!(access.status, AccessStatus::Approved);
        assert!(access.decided_at.is_some());

        Ok(())
    }

    #[test]
    fn test_reset_access_code_discards_pending_join() -> Result<()> {
        let db = EngineDb::new_in_memory()?;
        let tx = seed_transaction(&db)?;

        db.record_join_request(tx.id, "client-9", &now())?;
        db.reset_access_code(tx.id, "CODE-5678", "2099-06-01T00:00:00+00:00")?;

        let access = db.get_access(tx.id)?.expect("access row should exist");
        assert_eq!(access.code, "CODE-5678");
        assert_eq!(access.status, AccessStatus::None);
        assert!(access.client_id.is_none());
        assert!(access.requested_at.is_none());

        Ok(())
    }

    #[test]
    fn test_milestone_proof_and_decision() -> Result<()> {
        let db = EngineDb::new_in_memory()?;
        let tx = seed_transaction(&db)?;

        let m = db.create_milestone(tx.id, "Reservation fee", 25_000_00, "receipt-*", &now())?;
        assert_eq!(m.status, MilestoneStatus::Pending);
        assert!(!db.all_milestones_confirmed(tx.id)?);

        db.set_milestone_proof(m.id, "receipt-001.pdf", &now())?;
        let m = db.get_milestone(m.id)?.expect("milestone should exist");
        assert_eq!(m.status, MilestoneStatus::Reviewing);
        assert_eq!(m.proof_ref.as_deref(), Some("receipt-001.pdf"));

        db.decide_milestone(
            m.id,
            MilestoneStatus::Rejected,
            ReviewDecision::Reject,
            Some("amount mismatch"),
            &now(),
        )?;
        let m = db.get_milestone(m.id)?.expect("milestone should exist");
        assert_eq!(m.status, MilestoneStatus::Rejected);

        db.set_milestone_proof(m.id, "receipt-002.pdf", &now())?;
        db.decide_milestone(m.id, MilestoneStatus::Confirmed, ReviewDecision::Approve, None, &now())?;
        assert!(db.all_milestones_confirmed(tx.id)?);

        let reviews = db.list_payment_reviews(tx.id)?;
        assert_eq!(reviews.len(), 2);
        assert_eq!(reviews[0].decision, ReviewDecision::Reject);
        assert_eq!(reviews[0].reason.as_deref(), Some("amount mismatch"));
        assert_eq!(reviews[1].decision, ReviewDecision::Approve);

        Ok(())
    }

    #[test]
    fn test_all_milestones_confirmed_requires_at_least_one() -> Result<()> {
        let db = EngineDb::new_in_memory()?;
        let tx = seed_transaction(&db)?;

        // No milestones at all never counts as confirmed.
        assert!(!db.all_milestones_confirmed(tx.id)?);

        Ok(())
    }

    #[test]
    fn test_kyc_upload_analysis_and_approval() -> Result<()> {
        let db = EngineDb::new_in_memory()?;
        let tx = seed_transaction(&db)?;

        db.record_kyc_id(tx.id, "passport.jpg", KycStatus::IdUploaded, &now())?;
        db.record_kyc_selfie(tx.id, "selfie.jpg", KycStatus::SelfieUploaded, &now())?;
        db.set_kyc_status(tx.id, KycStatus::Analyzing, &now())?;
        db.record_kyc_analysis(tx.id, 92, KycStatus::Passed, &now())?;

        let kyc = db.get_kyc(tx.id)?.expect("kyc row should exist");
        assert_eq!(kyc.status, KycStatus::Passed);
        assert_eq!(kyc.analysis_score, Some(92));
        assert_eq!(kyc.attempt, 1);
        assert!(!kyc.agent_approved);

        db.approve_kyc(tx.id, &now())?;
        let kyc = db.get_kyc(tx.id)?.expect("kyc row should exist");
        assert_eq!(kyc.status, KycStatus::Approved);
        assert!(kyc.agent_approved);

        Ok(())
    }

    #[test]
    fn test_document_create_seeds_signing_records() -> Result<()> {
        let db = EngineDb::new_in_memory()?;
        let tx = seed_transaction(&db)?;

        let doc = db.create_document(
            tx.id,
            "Contract to Sell",
            &[SignerRole::Buyer, SignerRole::Agent],
            &now(),
        )?;
        assert_eq!(doc.required_roles, vec![SignerRole::Buyer, SignerRole::Agent]);
        assert!(!doc.acknowledged);

        let records = db.list_signing_records(tx.id)?;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.status == SigningStatus::Unsigned));

        Ok(())
    }

    #[test]
    fn test_signing_batch_submit_and_return() -> Result<()> {
        let db = EngineDb::new_in_memory()?;
        let tx = seed_transaction(&db)?;
        let doc = db.create_document(tx.id, "Deed of Sale", &[SignerRole::Buyer], &now())?;

        db.record_signature(doc.id, SignerRole::Buyer, "sig-abc", &now())?;
        let rec = db
            .get_signing_record(doc.id, SignerRole::Buyer)?
            .expect("signing record should exist");
        assert_eq!(rec.status, SigningStatus::Signed);

        let submitted = db.submit_signing_batch(tx.id)?;
        assert_eq!(submitted, 1);

        let returned = db.decide_signing_batch(
            tx.id,
            SigningStatus::Returned,
            "return",
            Some("illegible signature"),
            &now(),
        )?;
        assert_eq!(returned, 1);

        let rec = db
            .get_signing_record(doc.id, SignerRole::Buyer)?
            .expect("signing record should exist");
        assert_eq!(rec.status, SigningStatus::Returned);

        let reviews = db.list_signing_reviews(tx.id)?;
        assert_eq!(reviews.len(), 1);
        assert_eq!(reviews[0].action, "return");
        assert_eq!(reviews[0].reason.as_deref(), Some("illegible signature"));

        Ok(())
    }

    #[test]
    fn test_handoff_lifecycle() -> Result<()> {
        let db = EngineDb::new_in_memory()?;
        let tx = seed_transaction(&db)?;

        let items = vec!["Contract to Sell".to_string(), "KYC summary".to_string()];
        db.start_handoff(tx.id, &items, &now())?;
        let handoff = db.get_handoff(tx.id)?.expect("handoff row should exist");
        assert_eq!(handoff.status, HandoffStatus::Transmitting);
        assert_eq!(handoff.package_items, items);
        assert!(handoff.transmitted_at.is_some());
        assert!(handoff.receipt_number.is_none());

        db.complete_handoff(tx.id, "RCPT-0001", &now())?;
        let handoff = db.get_handoff(tx.id)?.expect("handoff row should exist");
        assert_eq!(handoff.status, HandoffStatus::Completed);
        assert_eq!(handoff.receipt_number.as_deref(), Some("RCPT-0001"));
        assert!(handoff.completed_at.is_some());

        Ok(())
    }

    #[test]
    fn test_lock_transaction() -> Result<()> {
        let db = EngineDb::new_in_memory()?;
        let tx = seed_transaction(&db)?;

        db.lock_transaction(tx.id, &now())?;
        let tx = db.get_transaction(tx.id)?.expect("transaction should exist");
        assert!(tx.is_locked());

        Ok(())
    }
}
