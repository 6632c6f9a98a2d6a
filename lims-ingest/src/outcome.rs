//! Per-message results
//!
//! Every message ends in exactly one [`Verdict`]. Accepted messages carry a
//! report of what happened to each entity; stale records and deferred links
//! are normal entries in that report.

use lims_common::events::EntityKind;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{IngestError, RejectReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityOutcome {
    Created,
    Updated,
    /// Incoming `last_updated` was older than or equal to the stored one
    StaleIgnored,
}

impl EntityOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityOutcome::Created => "created",
            EntityOutcome::Updated => "updated",
            EntityOutcome::StaleIgnored => "stale",
        }
    }

    pub fn wrote(self) -> bool {
        !matches!(self, EntityOutcome::StaleIgnored)
    }
}

/// What the linker did with one sample/study reference on a well
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkOutcome {
    Attached,
    /// Target not ingested yet; an obligation was recorded
    Deferred,
    /// Payload sent an empty reference
    Cleared,
    /// Payload carried no reference, or the well was stale
    Untouched,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WellReport {
    pub label: String,
    pub guid: Uuid,
    pub outcome: EntityOutcome,
    pub sample: LinkOutcome,
    pub study: LinkOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlateReport {
    pub guid: Uuid,
    pub external_id: String,
    pub outcome: EntityOutcome,
    pub wells: Vec<WellReport>,
}

impl PlateReport {
    pub fn wells_written(&self) -> usize {
        self.wells.iter().filter(|w| w.outcome.wrote()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceReport {
    pub kind: EntityKind,
    pub guid: Uuid,
    pub external_id: String,
    pub outcome: EntityOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "entity", rename_all = "lowercase")]
pub enum Report {
    Plate(PlateReport),
    Reference(ReferenceReport),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum Verdict {
    Accepted(Report),
    Rejected {
        external_id: Option<String>,
        reason: RejectReason,
        detail: String,
    },
}

impl Verdict {
    pub fn rejected(external_id: Option<&str>, err: &IngestError) -> Self {
        Verdict::Rejected {
            external_id: external_id.map(str::to_string),
            reason: err.reject_reason(),
            detail: err.to_string(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Verdict::Accepted(_))
    }

    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            Verdict::Accepted(_) => None,
            Verdict::Rejected { reason, .. } => Some(*reason),
        }
    }

    pub fn plate_report(&self) -> Option<&PlateReport> {
        match self {
            Verdict::Accepted(Report::Plate(report)) => Some(report),
            _ => None,
        }
    }

    pub fn reference_report(&self) -> Option<&ReferenceReport> {
        match self {
            Verdict::Accepted(Report::Reference(report)) => Some(report),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_verdict_serializes_reason_code() {
        let err = IngestError::validation("well", "S02", "cost_code");
        let verdict = Verdict::rejected(Some("1123"), &err);

        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["verdict"], "rejected");
        assert_eq!(json["reason"], "VALIDATION_ERROR");
        assert_eq!(json["external_id"], "1123");
        assert!(!verdict.is_accepted());
    }

    #[test]
    fn test_accepted_verdict_nests_report() {
        let verdict = Verdict::Accepted(Report::Reference(ReferenceReport {
            kind: EntityKind::Sample,
            guid: Uuid::new_v4(),
            external_id: "u1".to_string(),
            outcome: EntityOutcome::StaleIgnored,
        }));

        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["verdict"], "accepted");
        assert_eq!(json["entity"], "reference");
        assert_eq!(json["outcome"], "stale_ignored");
        assert!(verdict.reference_report().is_some());
        assert!(verdict.plate_report().is_none());
    }

    #[test]
    fn test_wells_written_skips_stale() {
        let well = |outcome| WellReport {
            label: "S01".to_string(),
            guid: Uuid::new_v4(),
            outcome,
            sample: LinkOutcome::Untouched,
            study: LinkOutcome::Untouched,
        };
        let report = PlateReport {
            guid: Uuid::new_v4(),
            external_id: "1123".to_string(),
            outcome: EntityOutcome::StaleIgnored,
            wells: vec![well(EntityOutcome::Created), well(EntityOutcome::StaleIgnored)],
        };
        assert_eq!(report.wells_written(), 1);
    }
}
