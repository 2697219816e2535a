use crate::core::{ScoreBreakdown, Severity};

/// Composite score (0-100) from the four sub-scores.
pub fn compute_total(breakdown: &ScoreBreakdown) -> u8 {
    breakdown.sum().min(100) as u8
}

pub fn score_to_severity(score: u8) -> Option<Severity> {
    Severity::from_score(score)
}
