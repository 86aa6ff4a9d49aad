//! Summaries over a session's grading history.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::validation::{MistakeType, ValidationResult};

/// What the grading history says about the learner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearningInsights {
    /// Observations about recurring mistakes.
    pub insights: Vec<String>,
    /// Suggested follow-up practice.
    pub recommendations: Vec<String>,
    /// How often each mistake occurred.
    pub mistake_frequency: BTreeMap<MistakeType, usize>,
    /// Number of graded actions.
    pub total_validations: usize,
}

/// Analyzes a session's grading history.
#[must_use]
pub fn insights(history: &[ValidationResult]) -> LearningInsights {
    let mut mistake_frequency = BTreeMap::new();
    for mistake in history.iter().filter_map(|result| result.mistake_type) {
        *mistake_frequency.entry(mistake).or_insert(0) += 1;
    }

    let mut insights = Vec::new();
    let mut recommendations = Vec::new();

    if mistake_frequency.contains_key(&MistakeType::WrongDirection) {
        insights.push("Sometimes confuses addition and subtraction directions".to_string());
        recommendations.push("Practice more direction awareness exercises".to_string());
    }
    if mistake_frequency.contains_key(&MistakeType::SkippingNumbers) {
        insights.push("Tends to skip steps when counting".to_string());
        recommendations.push("Emphasize a one-step-at-a-time approach".to_string());
    }

    LearningInsights {
        insights,
        recommendations,
        mistake_frequency,
        total_validations: history.len(),
    }
}

/// Number of mistakes in a grading history.
#[must_use]
pub fn count_mistakes(history: &[ValidationResult]) -> usize {
    history.iter().filter(|result| result.mistake_type.is_some()).count()
}

/// Closing message for a solved problem, scaled by how many mistakes it took.
#[must_use]
pub fn success_message(problem: &str, mistakes: usize) -> String {
    match mistakes {
        0 => format!("Perfect! You solved {problem} with no mistakes!"),
        1 => format!("Great job! You solved {problem} and learned from one small mistake!"),
        _ => format!("Well done! You kept trying and solved {problem} successfully!"),
    }
}
