//! Pure phase derivation.
//!
//! The active phase is never stored; every observer recomputes it from the
//! Progress flags and the milestone sub-states. Because `resolve` is a pure
//! function of its inputs, two pollers fed the same snapshot always agree,
//! with no coordination between them.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::models::*;

/// The six ordered lifecycle stages of a transaction.
///
/// Ordering follows the causal chain of the Progress flags, so `Phase`
/// comparisons express "further along" directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Reservation,
    Kyc,
    Signing,
    Handoff,
    Commission,
    Closed,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Self::Reservation,
        Self::Kyc,
        Self::Signing,
        Self::Handoff,
        Self::Commission,
        Self::Closed,
    ];

    /// 1-based index shown to users ("phase 2 of 6") and carried on the wire.
    pub fn index(&self) -> u8 {
        match self {
            Self::Reservation => 1,
            Self::Kyc => 2,
            Self::Signing => 3,
            Self::Handoff => 4,
            Self::Commission => 5,
            Self::Closed => 6,
        }
    }

    pub fn from_index(index: u8) -> Option<Phase> {
        Phase::ALL.into_iter().find(|p| p.index() == index)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Reservation => "Reservation & Escrow",
            Self::Kyc => "KYC Verification",
            Self::Signing => "Document Signing",
            Self::Handoff => "Developer Handoff",
            Self::Commission => "Commission Release",
            Self::Closed => "Closed",
        }
    }

    pub fn next(&self) -> Option<Phase> {
        Phase::from_index(self.index() + 1)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// On the wire a phase is its 1-based index, matching how both portal views
// title the step ("Phase 3 of 6").
impl Serialize for Phase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.index())
    }
}

impl<'de> Deserialize<'de> for Phase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let index = u8::deserialize(deserializer)?;
        Phase::from_index(index)
            .ok_or_else(|| D::Error::custom(format!("invalid phase index: {}", index)))
    }
}

/// Display standing of one phase relative to the active one.
///
/// `Review` marks an active phase whose sub-state is waiting on an external
/// decision (payment proof under review, biometric result awaiting agent
/// approval, submitted signatures, in-flight handoff). It is a display
/// override, not a seventh phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStanding {
    Pending,
    Active,
    Review,
    Complete,
}

impl PhaseStanding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Review => "review",
            Self::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub phase: Phase,
    pub name: String,
    pub standing: PhaseStanding,
}

/// One checklist entry for the active phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskItem {
    pub label: String,
    pub done: bool,
}

/// Result of a resolution pass: the active phase, per-phase standings, the
/// active phase's checklist, and any consistency warnings encountered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseView {
    pub phase: Phase,
    pub phases: Vec<PhaseSummary>,
    pub checklist: Vec<TaskItem>,
    pub warnings: Vec<String>,
}

/// Sub-state inputs to a resolution pass, borrowed from the snapshot being
/// assembled.
pub struct SubStates<'a> {
    pub milestones: &'a [PaymentMilestone],
    pub kyc: &'a KycRecord,
    pub documents: &'a [Document],
    pub signing: &'a [SigningRecord],
    pub handoff: &'a HandoffRecord,
}

/// Drop flags whose causal prerequisite is unmet, reporting one warning per
/// dropped flag. Evaluated in chain order so a broken link also clears
/// everything downstream of it.
fn effective_progress(progress: &Progress) -> (Progress, Vec<String>) {
    let mut p = progress.clone();
    let mut warnings = Vec::new();

    if p.kyc_completed && !(p.payment_confirmed || p.client_joined) {
        p.kyc_completed = false;
        warnings.push(
            "kyc_completed set without payment_confirmed or client_joined; ignoring".to_string(),
        );
    }
    if p.documents_signed && !p.kyc_completed {
        p.documents_signed = false;
        warnings.push("documents_signed set without kyc_completed; ignoring".to_string());
    }
    if p.developer_accepted && !p.documents_signed {
        p.developer_accepted = false;
        warnings.push("developer_accepted set without documents_signed; ignoring".to_string());
    }
    if p.commission_released && !p.developer_accepted {
        p.commission_released = false;
        warnings.push("commission_released set without developer_accepted; ignoring".to_string());
    }

    (p, warnings)
}

fn phase_of(p: &Progress) -> Phase {
    if p.commission_released {
        Phase::Closed
    } else if p.developer_accepted {
        Phase::Commission
    } else if p.documents_signed {
        Phase::Handoff
    } else if p.kyc_completed {
        Phase::Signing
    } else if p.payment_confirmed {
        Phase::Kyc
    } else {
        Phase::Reservation
    }
}

/// Active phase for gating decisions. Inconsistent flags resolve to the
/// lowest phase the intact prefix of the causal chain supports, never higher.
pub fn active_phase(progress: &Progress) -> Phase {
    let (effective, _) = effective_progress(progress);
    phase_of(&effective)
}

/// Whether the active phase is sitting in an externally-reviewed sub-state.
fn in_review(phase: Phase, sub: &SubStates) -> bool {
    match phase {
        Phase::Reservation => sub
            .milestones
            .iter()
            .any(|m| m.status == MilestoneStatus::Reviewing),
        Phase::Kyc => matches!(sub.kyc.status, KycStatus::Analyzing | KycStatus::Passed),
        Phase::Signing => sub
            .signing
            .iter()
            .any(|r| r.status == SigningStatus::Submitted),
        Phase::Handoff => sub.handoff.status == HandoffStatus::Transmitting,
        Phase::Commission | Phase::Closed => false,
    }
}

fn checklist_for(phase: Phase, progress: &Progress, sub: &SubStates) -> Vec<TaskItem> {
    let mut items = Vec::new();
    match phase {
        Phase::Reservation => {
            items.push(TaskItem {
                label: "Client joined the portal".to_string(),
                done: progress.client_joined,
            });
            items.push(TaskItem {
                label: "Reservation agreement uploaded".to_string(),
                done: progress.ra_uploaded,
            });
            items.push(TaskItem {
                label: "Buyer information sheet uploaded".to_string(),
                done: progress.bis_uploaded,
            });
            for m in sub.milestones {
                items.push(TaskItem {
                    label: format!("Payment confirmed: {}", m.label),
                    done: m.status == MilestoneStatus::Confirmed,
                });
            }
        }
        Phase::Kyc => {
            items.push(TaskItem {
                label: "Government ID uploaded".to_string(),
                done: sub.kyc.id_ref.is_some(),
            });
            items.push(TaskItem {
                label: "Selfie captured".to_string(),
                done: sub.kyc.selfie_ref.is_some(),
            });
            items.push(TaskItem {
                label: "Identity analysis passed".to_string(),
                done: matches!(sub.kyc.status, KycStatus::Passed | KycStatus::Approved),
            });
            items.push(TaskItem {
                label: "Agent approval".to_string(),
                done: sub.kyc.agent_approved,
            });
        }
        Phase::Signing => {
            for doc in sub.documents {
                let fully_signed = doc.required_roles.iter().all(|role| {
                    sub.signing.iter().any(|r| {
                        r.document_id == doc.id
                            && r.signer_role == *role
                            && !matches!(r.status, SigningStatus::Unsigned | SigningStatus::Returned)
                    })
                });
                items.push(TaskItem {
                    label: format!("Review and sign: {}", doc.title),
                    done: doc.acknowledged && fully_signed,
                });
            }
            items.push(TaskItem {
                label: "Signatures submitted for validation".to_string(),
                done: !sub.signing.is_empty()
                    && sub.signing.iter().all(|r| {
                        matches!(r.status, SigningStatus::Submitted | SigningStatus::Validated)
                    }),
            });
            items.push(TaskItem {
                label: "Agent validation".to_string(),
                done: progress.documents_signed,
            });
        }
        Phase::Handoff => {
            items.push(TaskItem {
                label: "Handoff package transmitted".to_string(),
                done: sub.handoff.status != HandoffStatus::Pending,
            });
            items.push(TaskItem {
                label: "Developer receipt confirmed".to_string(),
                done: sub.handoff.status == HandoffStatus::Completed,
            });
        }
        Phase::Commission => {
            items.push(TaskItem {
                label: "Commission released".to_string(),
                done: progress.commission_released,
            });
        }
        Phase::Closed => {}
    }
    items
}

/// Resolve the active phase, per-phase standings, and the active checklist.
///
/// Pure and deterministic. Flags violating the causal chain never advance the
/// phase; they produce warnings and the resolution falls back to the lowest
/// phase the remaining flags support.
pub fn resolve(progress: &Progress, sub: &SubStates) -> PhaseView {
    let (effective, warnings) = effective_progress(progress);
    let phase = phase_of(&effective);
    let review = in_review(phase, sub);

    let phases = Phase::ALL
        .into_iter()
        .map(|p| {
            let standing = if phase == Phase::Closed || p < phase {
                PhaseStanding::Complete
            } else if p > phase {
                PhaseStanding::Pending
            } else if review {
                PhaseStanding::Review
            } else {
                PhaseStanding::Active
            };
            PhaseSummary {
                phase: p,
                name: p.name().to_string(),
                standing,
            }
        })
        .collect();

    let checklist = checklist_for(phase, &effective, sub);

    PhaseView {
        phase,
        phases,
        checklist,
        warnings,
    }
}
