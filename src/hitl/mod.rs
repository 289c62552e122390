// HITL Engine (C5) — confidence computation, tier routing, and the
// event-driven approval wait.
//
// Confidence/tier formulas are given directly by spec §4.5; the
// `RESULT_TTL_SECONDS = 3600` constant is pinned by
// `examples/original_source/agents/hitl/__init__.py`.

pub mod approval;
pub mod task_manager;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    fn adjustment(self) -> i32 {
        match self {
            RiskLevel::Low => 0,
            RiskLevel::Medium => 10,
            RiskLevel::High => 20,
            RiskLevel::Critical => 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApprovalLevel {
    Auto,
    Quick,
    Full,
}

pub const DEFAULT_CONFIDENCE_SCORE: i32 = 70;

/// `calculate_confidence` — maps a known approval type to a base score
/// (default `DEFAULT_CONFIDENCE_SCORE` if unknown), subtracts the risk
/// adjustment, clamps to `[0, 100]`.
pub fn calculate_confidence(
    approval_type: &str,
    risk_level: RiskLevel,
    base_scores: &HashMap<String, i32>,
) -> i32 {
    let base = base_scores
        .get(approval_type)
        .copied()
        .unwrap_or(DEFAULT_CONFIDENCE_SCORE);
    (base - risk_level.adjustment()).clamp(0, 100)
}

/// Per-tool configuration. `0 <= quick_threshold <= auto_threshold <= 100`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HitlConfig {
    pub approval_type: String,
    pub risk_level: RiskLevel,
    pub auto_threshold: i32,
    pub quick_threshold: i32,
}

/// `score >= auto_threshold` -> AUTO; `quick_threshold <= score <
/// auto_threshold` -> QUICK; else FULL.
pub fn determine_approval_level(score: i32, config: &HitlConfig) -> ApprovalLevel {
    if score >= config.auto_threshold {
        ApprovalLevel::Auto
    } else if score >= config.quick_threshold {
        ApprovalLevel::Quick
    } else {
        ApprovalLevel::Full
    }
}

/// A tool declares its HITL policy by implementing this trait instead of
/// the Python decorator-at-call-site pattern (§9 redesign note).
pub trait HitlTool {
    fn hitl_config(&self) -> Option<HitlConfig>;
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HitlResult {
    pub approval_level: ApprovalLevel,
    pub confidence_score: i32,
    pub approved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores() -> HashMap<String, i32> {
        let mut m = HashMap::new();
        m.insert("delete_file".to_string(), 50);
        m.insert("read_file".to_string(), 95);
        m
    }

    #[test]
    fn confidence_subtracts_risk_and_clamps() {
        assert_eq!(calculate_confidence("delete_file", RiskLevel::Critical, &scores()), 20);
        assert_eq!(calculate_confidence("read_file", RiskLevel::Low, &scores()), 95);
        assert_eq!(calculate_confidence("unknown_tool", RiskLevel::Critical, &scores()), 40);
    }

    #[test]
    fn confidence_never_goes_below_zero() {
        let mut m = HashMap::new();
        m.insert("x".to_string(), 10);
        assert_eq!(calculate_confidence("x", RiskLevel::Critical, &m), 0);
    }

    #[test]
    fn tier_boundaries_are_inclusive_on_the_low_end() {
        let config = HitlConfig {
            approval_type: "x".into(),
            risk_level: RiskLevel::Low,
            auto_threshold: 80,
            quick_threshold: 40,
        };
        assert_eq!(determine_approval_level(80, &config), ApprovalLevel::Auto);
        assert_eq!(determine_approval_level(79, &config), ApprovalLevel::Quick);
        assert_eq!(determine_approval_level(40, &config), ApprovalLevel::Quick);
        assert_eq!(determine_approval_level(39, &config), ApprovalLevel::Full);
    }
}
