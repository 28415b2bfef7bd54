//! The five pipeline units and their canonical names.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the five logical analysis stages of the contract pipeline.
///
/// The declaration order is the canonical pipeline order and is used as the
/// stable tie-break wherever units are listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// Extracts clauses and document structure from the contract text.
    Analyzer,
    /// Scores the extracted clauses for risk.
    RiskAssessor,
    /// Looks up comparable precedents for the extracted clauses.
    PrecedentResearcher,
    /// Drafts redlines for the risky clauses.
    Negotiator,
    /// Drafts the outbound communication summarising the negotiation position.
    Communicator,
}

impl UnitKind {
    /// All units in canonical pipeline order.
    pub const ALL: [UnitKind; 5] = [
        UnitKind::Analyzer,
        UnitKind::RiskAssessor,
        UnitKind::PrecedentResearcher,
        UnitKind::Negotiator,
        UnitKind::Communicator,
    ];

    /// Canonical unit name.
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitKind::Analyzer => "analyzer",
            UnitKind::RiskAssessor => "risk_assessor",
            UnitKind::PrecedentResearcher => "precedent_researcher",
            UnitKind::Negotiator => "negotiator",
            UnitKind::Communicator => "communicator",
        }
    }

    /// Key under which this unit's output is stored and handed to dependents.
    pub fn output_key(&self) -> &'static str {
        match self {
            UnitKind::Analyzer => "analysis_results",
            UnitKind::RiskAssessor => "risk_results",
            UnitKind::PrecedentResearcher => "precedent_results",
            UnitKind::Negotiator => "negotiation_results",
            UnitKind::Communicator => "communication_results",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown unit name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown unit: {0}")]
pub struct UnknownUnit(pub String);

impl FromStr for UnitKind {
    type Err = UnknownUnit;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UnitKind::ALL
            .iter()
            .copied()
            .find(|unit| unit.as_str() == s)
            .ok_or_else(|| UnknownUnit(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip_through_from_str() {
        for unit in UnitKind::ALL {
            assert_eq!(unit.as_str().parse::<UnitKind>().unwrap(), unit);
        }
    }

    #[test]
    fn test_unknown_name_is_rejected() {
        let err = "summarizer".parse::<UnitKind>().unwrap_err();
        assert_eq!(err, UnknownUnit("summarizer".to_string()));
    }

    #[test]
    fn test_serde_uses_snake_case_names() {
        let json = serde_json::to_string(&UnitKind::PrecedentResearcher).unwrap();
        assert_eq!(json, "\"precedent_researcher\"");
    }

    #[test]
    fn test_output_keys_are_distinct() {
        let mut keys: Vec<_> = UnitKind::ALL.iter().map(|u| u.output_key()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 5);
    }
}
