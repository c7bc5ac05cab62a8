use std::collections::BTreeMap;

use super::execution::SuccessCriteria;

/// Longest phrase prefix used in a criterion name.
const PHRASE_KEY_CHARS: usize = 20;

/// What was observed during one execution, as input to criteria evaluation.
#[derive(Debug, Clone, Default)]
pub struct Observation<'a> {
    pub exit_code: Option<i64>,
    pub stdout: &'a str,
    pub stderr: &'a str,
    pub runtime_secs: f64,
    /// Only set by strategies that run a health check.
    pub health_check_passed: Option<bool>,
    /// Only set by strategies that count tests.
    pub test_pass_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CriteriaOutcome {
    pub success: bool,
    pub criteria_met: BTreeMap<String, bool>,
}

fn phrase_key(prefix: &str, phrase: &str) -> String {
    let short: String = phrase.chars().take(PHRASE_KEY_CHARS).collect();
    format!("{}_{}", prefix, short)
}

/// Evaluate `criteria` against an observation.
///
/// Every configured predicate must hold; predicates that are not configured
/// are not recorded. Without criteria the run must exit with code 0.
/// Predicates about health checks and test pass rate are only recorded when
/// the observation carries that data.
pub fn evaluate(criteria: Option<&SuccessCriteria>, obs: &Observation<'_>) -> CriteriaOutcome {
    let mut met = BTreeMap::new();

    let Some(criteria) = criteria else {
        let ok = obs.exit_code == Some(0);
        met.insert("exit_code_0".to_string(), ok);
        return CriteriaOutcome {
            success: ok,
            criteria_met: met,
        };
    };

    if let Some(expected) = criteria.exit_code {
        met.insert("exit_code_match".to_string(), obs.exit_code == Some(expected));
    }
    if let Some(disallowed) = &criteria.exit_code_not {
        let allowed = obs.exit_code.is_some_and(|code| !disallowed.contains(&code));
        met.insert("exit_code_allowed".to_string(), allowed);
    }

    for phrase in criteria.stdout_contains.iter().flatten() {
        met.insert(phrase_key("stdout_contains", phrase), obs.stdout.contains(phrase.as_str()));
    }
    for phrase in criteria.stdout_not_contains.iter().flatten() {
        met.insert(
            phrase_key("stdout_not_contains", phrase),
            !obs.stdout.contains(phrase.as_str()),
        );
    }

    if criteria.stderr_empty == Some(true) {
        met.insert("stderr_empty".to_string(), obs.stderr.trim().is_empty());
    }
    for phrase in criteria.stderr_contains.iter().flatten() {
        met.insert(phrase_key("stderr_contains", phrase), obs.stderr.contains(phrase.as_str()));
    }

    if let Some(min) = criteria.runs_for_at_least {
        met.insert("min_runtime".to_string(), obs.runtime_secs >= min);
    }

    if criteria.health_check_passes == Some(true)
        && let Some(passed) = obs.health_check_passed
    {
        met.insert("health_check_passes".to_string(), passed);
    }
    if let (Some(threshold), Some(rate)) = (criteria.test_pass_rate, obs.test_pass_rate) {
        met.insert("test_pass_rate".to_string(), rate >= threshold);
    }

    CriteriaOutcome {
        success: met.values().all(|ok| *ok),
        criteria_met: met,
    }
}
