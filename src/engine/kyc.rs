//! KYC and identity verification.
//!
//! The sub-state machine runs `pending → id_uploaded → selfie_uploaded →
//! analyzing → passed|failed → approved`. Scoring is delegated to an
//! external analysis service behind [`IdentityAnalyzer`]; a score at or
//! above the configured threshold is a pass. A pass is necessary but not
//! sufficient: only the agent's explicit approval raises `kyc_completed`,
//! whatever the score was. A failed attempt ends there, and the client
//! restarts by uploading documents again.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

use super::models::*;
use super::resolver::{self, Phase};
use super::snapshot::TransactionSnapshot;
use super::{ensure_reader, gate, load_authz, map_engine_err, now_rfc3339, snapshot, Engine};

/// Biometric/identity scorer.
///
/// Real implementation: [`HttpAnalyzer`], speaking to the external analysis
/// service. Deterministic stand-in for development and tests:
/// [`FixedAnalyzer`].
#[async_trait]
pub trait IdentityAnalyzer: Send + Sync {
    /// Score an id-document/selfie pair, 0..=100.
    async fn analyze(&self, id_ref: &str, selfie_ref: &str) -> Result<i64>;
}

#[derive(Debug, Serialize)]
struct AnalysisRequest<'a> {
    id_ref: &'a str,
    selfie_ref: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnalysisResponse {
    score: i64,
}

/// Calls the external analysis service over HTTP.
pub struct HttpAnalyzer {
    base_url: String,
}

impl HttpAnalyzer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl IdentityAnalyzer for HttpAnalyzer {
    async fn analyze(&self, id_ref: &str, selfie_ref: &str) -> Result<i64> {
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/analyze", self.base_url.trim_end_matches('/')))
            .json(&AnalysisRequest { id_ref, selfie_ref })
            .send()
            .await
            .context("Failed to send analysis request")?
            .error_for_status()
            .context("Analysis service returned error status")?
            .json::<AnalysisResponse>()
            .await
            .context("Failed to parse analysis response")?;
        Ok(resp.score)
    }
}

/// Returns the same score for every pair. Used when no analysis service is
/// configured, and by tests that need a known outcome.
pub struct FixedAnalyzer {
    score: i64,
}

impl FixedAnalyzer {
    pub fn new(score: i64) -> Self {
        Self { score }
    }
}

#[async_trait]
impl IdentityAnalyzer for FixedAnalyzer {
    async fn analyze(&self, _id_ref: &str, _selfie_ref: &str) -> Result<i64> {
        Ok(self.score)
    }
}

/// One KYC step. The wire shape is a tagged union so the endpoint carries
/// exactly one action and its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum KycAction {
    UploadId { file_ref: String },
    UploadSelfie { file_ref: String },
    StartAnalysis,
    AgentApprove,
}

impl KycAction {
    fn name(&self) -> &'static str {
        match self {
            KycAction::UploadId { .. } => "upload_id",
            KycAction::UploadSelfie { .. } => "upload_selfie",
            KycAction::StartAnalysis => "start_analysis",
            KycAction::AgentApprove => "agent_approve",
        }
    }
}

impl Engine {
    /// Advance the KYC state machine by one step.
    pub async fn kyc_action(
        &self,
        actor: &Actor,
        transaction_id: i64,
        action: KycAction,
    ) -> Result<TransactionSnapshot, EngineError> {
        tracing::debug!(transaction_id, action = action.name(), "kyc action");
        match action {
            KycAction::UploadId { file_ref } => {
                self.kyc_upload_id(actor, transaction_id, file_ref).await
            }
            KycAction::UploadSelfie { file_ref } => {
                self.kyc_upload_selfie(actor, transaction_id, file_ref).await
            }
            KycAction::StartAnalysis => self.kyc_start_analysis(actor, transaction_id).await,
            KycAction::AgentApprove => self.kyc_agent_approve(actor, transaction_id).await,
        }
    }

    async fn kyc_upload_id(
        &self,
        actor: &Actor,
        transaction_id: i64,
        file_ref: String,
    ) -> Result<TransactionSnapshot, EngineError> {
        let actor = actor.clone();
        let now = now_rfc3339();
        self.db
            .call(move |db| {
                let (tx, access, progress) = load_authz(db, transaction_id)?;
                ensure_reader(&actor, &tx, &access)?;
                let kyc = get_kyc(db, transaction_id)?;

                if kyc.status == KycStatus::IdUploaded && kyc.id_ref.as_deref() == Some(&file_ref) {
                    return Ok(snapshot::assemble(db, transaction_id)?);
                }

                gate::ensure_unlocked(&tx)?;
                let active = resolver::active_phase(&progress);
                gate::authorize(&actor, &tx, Some(&access), Phase::Kyc, active)?;

                // A failed attempt restarts here, and so does an analysis
                // stranded without a verdict. With a selfie on file the way
                // forward is analysis, not another id.
                if !matches!(
                    kyc.status,
                    KycStatus::Pending
                        | KycStatus::IdUploaded
                        | KycStatus::Failed
                        | KycStatus::Analyzing
                ) {
                    return Err(step_error("upload_id", kyc.status).into());
                }
                db.record_kyc_id(transaction_id, &file_ref, KycStatus::IdUploaded, &now)?;
                db.touch_transaction(transaction_id, &now)?;
                Ok(snapshot::assemble(db, transaction_id)?)
            })
            .await
            .map_err(map_engine_err)
    }

    async fn kyc_upload_selfie(
        &self,
        actor: &Actor,
        transaction_id: i64,
        file_ref: String,
    ) -> Result<TransactionSnapshot, EngineError> {
        let actor = actor.clone();
        let now = now_rfc3339();
        self.db
            .call(move |db| {
                let (tx, access, progress) = load_authz(db, transaction_id)?;
                ensure_reader(&actor, &tx, &access)?;
                let kyc = get_kyc(db, transaction_id)?;

                if kyc.status == KycStatus::SelfieUploaded
                    && kyc.selfie_ref.as_deref() == Some(&file_ref)
                {
                    return Ok(snapshot::assemble(db, transaction_id)?);
                }

                gate::ensure_unlocked(&tx)?;
                let active = resolver::active_phase(&progress);
                gate::authorize(&actor, &tx, Some(&access), Phase::Kyc, active)?;

                if !matches!(kyc.status, KycStatus::IdUploaded | KycStatus::SelfieUploaded) {
                    return Err(step_error("upload_selfie", kyc.status).into());
                }
                db.record_kyc_selfie(transaction_id, &file_ref, KycStatus::SelfieUploaded, &now)?;
                db.touch_transaction(transaction_id, &now)?;
                Ok(snapshot::assemble(db, transaction_id)?)
            })
            .await
            .map_err(map_engine_err)
    }

    /// Hand the uploaded pair to the analysis service. The sub-state flips
    /// to `analyzing` while the call is in flight; if the service cannot be
    /// reached the uploads are kept and the state returns to
    /// `selfie_uploaded` so the client can retry.
    async fn kyc_start_analysis(
        &self,
        actor: &Actor,
        transaction_id: i64,
    ) -> Result<TransactionSnapshot, EngineError> {
        let actor = actor.clone();
        let now = now_rfc3339();
        let staged = self
            .db
            .call(move |db| {
                let (tx, access, progress) = load_authz(db, transaction_id)?;
                ensure_reader(&actor, &tx, &access)?;
                let kyc = get_kyc(db, transaction_id)?;

                // Benign replays: analysis already running or already scored.
                if matches!(
                    kyc.status,
                    KycStatus::Analyzing | KycStatus::Passed | KycStatus::Approved
                ) {
                    return Ok(None);
                }

                gate::ensure_unlocked(&tx)?;
                let active = resolver::active_phase(&progress);
                gate::authorize(&actor, &tx, Some(&access), Phase::Kyc, active)?;

                if kyc.status != KycStatus::SelfieUploaded {
                    return Err(step_error("start_analysis", kyc.status).into());
                }
                let id_ref = kyc
                    .id_ref
                    .clone()
                    .ok_or_else(|| EngineError::precondition("no id document on file"))?;
                let selfie_ref = kyc
                    .selfie_ref
                    .clone()
                    .ok_or_else(|| EngineError::precondition("no selfie on file"))?;
                db.set_kyc_status(transaction_id, KycStatus::Analyzing, &now)?;
                Ok(Some((id_ref, selfie_ref)))
            })
            .await
            .map_err(map_engine_err)?;

        let Some((id_ref, selfie_ref)) = staged else {
            return self.assemble_snapshot(transaction_id).await;
        };

        // The external call happens outside the store lock.
        let outcome = self.analyzer.analyze(&id_ref, &selfie_ref).await;
        let threshold = self.config.kyc_pass_threshold;
        let now = now_rfc3339();
        match outcome {
            Ok(score) => {
                let status = if score >= threshold {
                    KycStatus::Passed
                } else {
                    KycStatus::Failed
                };
                tracing::info!(transaction_id, score, status = status.as_str(), "kyc analysis scored");
                self.db
                    .call(move |db| {
                        // The client may have restarted the attempt while the
                        // call was in flight; a stale verdict stays out of the
                        // record.
                        if get_kyc(db, transaction_id)?.status == KycStatus::Analyzing {
                            db.record_kyc_analysis(transaction_id, score, status, &now)?;
                            db.touch_transaction(transaction_id, &now)?;
                        }
                        Ok(snapshot::assemble(db, transaction_id)?)
                    })
                    .await
                    .map_err(map_engine_err)
            }
            Err(e) => {
                tracing::warn!(transaction_id, error = %e, "kyc analysis unavailable");
                self.db
                    .call(move |db| {
                        if get_kyc(db, transaction_id)?.status == KycStatus::Analyzing {
                            db.set_kyc_status(transaction_id, KycStatus::SelfieUploaded, &now)?;
                        }
                        Ok(())
                    })
                    .await
                    .map_err(map_engine_err)?;
                Err(EngineError::AnalyzerUnavailable(e))
            }
        }
    }

    async fn kyc_agent_approve(
        &self,
        actor: &Actor,
        transaction_id: i64,
    ) -> Result<TransactionSnapshot, EngineError> {
        if actor.role == ActorRole::Client {
            return Err(EngineError::unauthorized("only agents approve KYC"));
        }
        let actor = actor.clone();
        let now = now_rfc3339();
        self.db
            .call(move |db| {
                let (tx, access, progress) = load_authz(db, transaction_id)?;
                ensure_reader(&actor, &tx, &access)?;
                let kyc = get_kyc(db, transaction_id)?;

                if kyc.status == KycStatus::Approved {
                    return Ok(snapshot::assemble(db, transaction_id)?);
                }

                gate::ensure_unlocked(&tx)?;
                let active = resolver::active_phase(&progress);
                gate::authorize(&actor, &tx, Some(&access), Phase::Kyc, active)?;

                // A biometric pass is required, and never enough on its own.
                if kyc.status != KycStatus::Passed {
                    return Err(step_error("agent_approve", kyc.status).into());
                }
                db.approve_kyc(transaction_id, &now)?;
                gate::apply_flag(db, &tx, ProgressFlag::KycCompleted, true, &now)?;
                db.touch_transaction(transaction_id, &now)?;
                tracing::info!(transaction_id, "kyc approved");
                Ok(snapshot::assemble(db, transaction_id)?)
            })
            .await
            .map_err(map_engine_err)
    }

    async fn assemble_snapshot(&self, transaction_id: i64) -> Result<TransactionSnapshot, EngineError> {
        self.db
            .call(move |db| Ok(snapshot::assemble(db, transaction_id)?))
            .await
            .map_err(map_engine_err)
    }
}

fn get_kyc(db: &super::store::EngineDb, transaction_id: i64) -> Result<KycRecord> {
    db.get_kyc(transaction_id)?
        .ok_or_else(|| anyhow::Error::from(EngineError::not_found(format!(
            "KYC record for transaction {}",
            transaction_id
        ))))
}

fn step_error(step: &str, status: KycStatus) -> EngineError {
    EngineError::precondition(format!(
        "{} is not valid while KYC is {}",
        step,
        status.as_str()
    ))
}
