use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Roles an actor can present to the engine.
///
/// `System` is reserved for in-process callers (the handoff completion timer,
/// flag patches applied by backend jobs); it never corresponds to a signed-in
/// portal user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Client,
    Agent,
    System,
}

impl ActorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for ActorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActorRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Self::Client),
            "agent" => Ok(Self::Agent),
            "system" => Ok(Self::System),
            _ => Err(format!("Invalid actor role: {}", s)),
        }
    }
}

/// The identity a request acts as. Authentication itself is an external
/// collaborator; the engine only authorizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub role: ActorRole,
    pub id: String,
}

impl Actor {
    pub fn client(id: impl Into<String>) -> Self {
        Self {
            role: ActorRole::Client,
            id: id.into(),
        }
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            role: ActorRole::Agent,
            id: id.into(),
        }
    }

    pub fn system() -> Self {
        Self {
            role: ActorRole::System,
            id: "engine".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Active,
    Locked,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Locked => "locked",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "locked" => Ok(Self::Locked),
            _ => Err(format!("Invalid transaction status: {}", s)),
        }
    }
}

/// Root aggregate: one real-estate deal. Owned by the originating agent,
/// immutable once `Locked`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub property_ref: String,
    pub value_centavos: i64,
    pub developer_ref: String,
    pub agent_id: String,
    pub status: TransactionStatus,
    pub created_at: String,
    pub updated_at: String,
}

impl Transaction {
    pub fn is_locked(&self) -> bool {
        self.status == TransactionStatus::Locked
    }
}

/// The eight milestone flags the active phase is derived from.
///
/// Flags only ever flip false→true; the Gate rejects everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressFlag {
    RaUploaded,
    BisUploaded,
    ClientJoined,
    PaymentConfirmed,
    KycCompleted,
    DocumentsSigned,
    DeveloperAccepted,
    CommissionReleased,
}

impl ProgressFlag {
    pub const ALL: [ProgressFlag; 8] = [
        Self::RaUploaded,
        Self::BisUploaded,
        Self::ClientJoined,
        Self::PaymentConfirmed,
        Self::KycCompleted,
        Self::DocumentsSigned,
        Self::DeveloperAccepted,
        Self::CommissionReleased,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RaUploaded => "ra_uploaded",
            Self::BisUploaded => "bis_uploaded",
            Self::ClientJoined => "client_joined",
            Self::PaymentConfirmed => "payment_confirmed",
            Self::KycCompleted => "kyc_completed",
            Self::DocumentsSigned => "documents_signed",
            Self::DeveloperAccepted => "developer_accepted",
            Self::CommissionReleased => "commission_released",
        }
    }
}

impl std::fmt::Display for ProgressFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgressFlag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ra_uploaded" => Ok(Self::RaUploaded),
            "bis_uploaded" => Ok(Self::BisUploaded),
            "client_joined" => Ok(Self::ClientJoined),
            "payment_confirmed" => Ok(Self::PaymentConfirmed),
            "kyc_completed" => Ok(Self::KycCompleted),
            "documents_signed" => Ok(Self::DocumentsSigned),
            "developer_accepted" => Ok(Self::DeveloperAccepted),
            "commission_released" => Ok(Self::CommissionReleased),
            _ => Err(format!("Invalid progress flag: {}", s)),
        }
    }
}

/// The authoritative milestone record for one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub transaction_id: i64,
    pub ra_uploaded: bool,
    pub bis_uploaded: bool,
    pub client_joined: bool,
    pub payment_confirmed: bool,
    pub kyc_completed: bool,
    pub documents_signed: bool,
    pub developer_accepted: bool,
    pub commission_released: bool,
    pub updated_at: String,
}

impl Progress {
    pub fn get(&self, flag: ProgressFlag) -> bool {
        match flag {
            ProgressFlag::RaUploaded => self.ra_uploaded,
            ProgressFlag::BisUploaded => self.bis_uploaded,
            ProgressFlag::ClientJoined => self.client_joined,
            ProgressFlag::PaymentConfirmed => self.payment_confirmed,
            ProgressFlag::KycCompleted => self.kyc_completed,
            ProgressFlag::DocumentsSigned => self.documents_signed,
            ProgressFlag::DeveloperAccepted => self.developer_accepted,
            ProgressFlag::CommissionReleased => self.commission_released,
        }
    }

    /// Flags currently set, in declaration order.
    pub fn set_flags(&self) -> Vec<ProgressFlag> {
        ProgressFlag::ALL
            .into_iter()
            .filter(|f| self.get(*f))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessStatus {
    None,
    Pending,
    Approved,
    Rejected,
}

impl AccessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for AccessStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Invalid access status: {}", s)),
        }
    }
}

/// Admission record binding an external client to one transaction.
/// The access code is an opaque short-lived token; expiry blocks new joins
/// and approvals but never revokes an access that is already approved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientAccess {
    pub transaction_id: i64,
    pub code: String,
    pub code_expires_at: String,
    pub client_id: Option<String>,
    pub status: AccessStatus,
    pub requested_at: Option<String>,
    pub decided_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    Reviewing,
    Confirmed,
    Rejected,
}

impl MilestoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Reviewing => "reviewing",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
        }
    }

    /// A rejected milestone awaits a fresh proof, same as a pending one.
    pub fn accepts_proof(&self) -> bool {
        matches!(self, Self::Pending | Self::Rejected)
    }
}

impl std::fmt::Display for MilestoneStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MilestoneStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "reviewing" => Ok(Self::Reviewing),
            "confirmed" => Ok(Self::Confirmed),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Invalid milestone status: {}", s)),
        }
    }
}

/// One agent-defined escrow installment. Identity (label, amount, proof
/// pattern) is immutable after creation; rejection re-opens the same
/// milestone for upload rather than spawning a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentMilestone {
    pub id: i64,
    pub transaction_id: i64,
    pub label: String,
    pub amount_centavos: i64,
    pub proof_pattern: String,
    pub status: MilestoneStatus,
    pub proof_ref: Option<String>,
    pub uploaded_at: Option<String>,
    pub decided_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
}

impl ReviewDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }
}

impl FromStr for ReviewDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            _ => Err(format!("Invalid review decision: {}", s)),
        }
    }
}

/// Audit row for a payment decision. Rows are append-only: a rejection's
/// trail survives the milestone re-entering review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReview {
    pub id: i64,
    pub milestone_id: i64,
    pub decision: ReviewDecision,
    pub reason: Option<String>,
    pub decided_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KycStatus {
    Pending,
    IdUploaded,
    SelfieUploaded,
    Analyzing,
    Passed,
    Failed,
    Approved,
}

impl KycStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::IdUploaded => "id_uploaded",
            Self::SelfieUploaded => "selfie_uploaded",
            Self::Analyzing => "analyzing",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Approved => "approved",
        }
    }
}

impl std::fmt::Display for KycStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KycStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "id_uploaded" => Ok(Self::IdUploaded),
            "selfie_uploaded" => Ok(Self::SelfieUploaded),
            "analyzing" => Ok(Self::Analyzing),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            "approved" => Ok(Self::Approved),
            _ => Err(format!("Invalid KYC status: {}", s)),
        }
    }
}

/// Identity-verification sub-state. A biometric pass is necessary but never
/// sufficient: only the agent's explicit approval completes the phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KycRecord {
    pub transaction_id: i64,
    pub status: KycStatus,
    pub id_ref: Option<String>,
    pub selfie_ref: Option<String>,
    pub analysis_score: Option<i64>,
    pub agent_approved: bool,
    pub attempt: i64,
    pub updated_at: String,
}

/// Roles that must sign a given document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignerRole {
    Buyer,
    Agent,
}

impl SignerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buyer => "buyer",
            Self::Agent => "agent",
        }
    }
}

impl std::fmt::Display for SignerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignerRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buyer" => Ok(Self::Buyer),
            "agent" => Ok(Self::Agent),
            _ => Err(format!("Invalid signer role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningStatus {
    Unsigned,
    Signed,
    Submitted,
    Validated,
    Returned,
}

impl SigningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsigned => "unsigned",
            Self::Signed => "signed",
            Self::Submitted => "submitted",
            Self::Validated => "validated",
            Self::Returned => "returned",
        }
    }

    /// Unsigned records and records handed back by a validation return both
    /// accept a fresh signature.
    pub fn accepts_signature(&self) -> bool {
        matches!(self, Self::Unsigned | Self::Returned)
    }
}

impl std::fmt::Display for SigningStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SigningStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsigned" => Ok(Self::Unsigned),
            "signed" => Ok(Self::Signed),
            "submitted" => Ok(Self::Submitted),
            "validated" => Ok(Self::Validated),
            "returned" => Ok(Self::Returned),
            _ => Err(format!("Invalid signing status: {}", s)),
        }
    }
}

/// A contract document the client must walk through and the required roles
/// must sign. File content lives with the document-storage collaborator;
/// the engine only tracks the review/signature state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub transaction_id: i64,
    pub title: String,
    pub required_roles: Vec<SignerRole>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<String>,
    pub created_at: String,
}

/// One signature slot on a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigningRecord {
    pub document_id: i64,
    pub signer_role: SignerRole,
    pub status: SigningStatus,
    pub signature_ref: Option<String>,
    pub signed_at: Option<String>,
}

/// Audit row for a batch validation or return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigningReview {
    pub id: i64,
    pub transaction_id: i64,
    pub action: String,
    pub reason: Option<String>,
    pub decided_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffStatus {
    Pending,
    Transmitting,
    Completed,
}

impl HandoffStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Transmitting => "transmitting",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for HandoffStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandoffStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "transmitting" => Ok(Self::Transmitting),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid handoff status: {}", s)),
        }
    }
}

/// Developer-handoff sub-state. `package_items` is snapshotted at transmit
/// time; the receipt number is assigned on completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub transaction_id: i64,
    pub status: HandoffStatus,
    pub package_items: Vec<String>,
    pub transmitted_at: Option<String>,
    pub receipt_number: Option<String>,
    pub completed_at: Option<String>,
}
