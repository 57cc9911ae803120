//! Structured model response contracts and fail-closed parsing.
//!
//! The loop consumes three kinds of model output, each parsed into a typed
//! contract before any routing decision is made. Malformed output never
//! panics and never silently succeeds: plans reject with a correctable
//! error, reflections collapse to `Escalate`, verdicts collapse to
//! not-satisfied.
//!
//! ## Contract schemas
//!
//! ```text
//! plan:       {"steps": [{"description", "tool_name"?, "parameters"?}]}
//!             (a bare step array is also accepted)
//! reflection: {"decision": "proceed" | "retry_step" | "replan" | "escalate",
//!              "reason"?}
//! verdict:    {"satisfied": bool, "reason"?}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::task::Step;

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

/// Error returned when a planning reply cannot be turned into steps.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanParseError {
    #[error("plan reply is not valid JSON: {0}")]
    Invalid(String),
    #[error("plan has no steps")]
    EmptyPlan,
}

#[derive(Deserialize)]
struct RawStep {
    description: String,
    #[serde(default, alias = "tool")]
    tool_name: Option<String>,
    #[serde(default)]
    parameters: Value,
}

#[derive(Deserialize)]
struct PlanEnvelope {
    steps: Vec<RawStep>,
}

/// Parse a planning reply into an ordered step list.
///
/// Accepts either `{"steps": [...]}` or a bare step array, with or without
/// a surrounding code fence. Step indexes are assigned here; anything the
/// model put in an `index` field is ignored. Plans longer than `max_steps`
/// are truncated.
pub fn parse_plan(raw: &str, max_steps: usize) -> Result<Vec<Step>, PlanParseError> {
    let json_str = extract_json_block(raw).unwrap_or(raw);

    let raw_steps = serde_json::from_str::<PlanEnvelope>(json_str)
        .map(|envelope| envelope.steps)
        .or_else(|_| serde_json::from_str::<Vec<RawStep>>(json_str))
        .map_err(|e| PlanParseError::Invalid(e.to_string()))?;

    if raw_steps.is_empty() {
        return Err(PlanParseError::EmptyPlan);
    }
    if raw_steps.len() > max_steps {
        warn!(
            planned = raw_steps.len(),
            kept = max_steps,
            "plan exceeds step limit, truncating"
        );
    }

    Ok(raw_steps
        .into_iter()
        .take(max_steps)
        .enumerate()
        .map(|(index, raw)| {
            let parameters = if raw.parameters.is_null() {
                Value::Object(serde_json::Map::new())
            } else {
                raw.parameters
            };
            Step::new(index, raw.description, raw.tool_name, parameters)
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Reflections
// ---------------------------------------------------------------------------

/// What the model wants the loop to do after a step outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionDecision {
    /// The step outcome is acceptable; move on.
    Proceed,
    /// Try the same step again.
    RetryStep,
    /// The plan no longer fits; go back to planning.
    Replan,
    /// A human should look at this.
    Escalate,
}

impl std::fmt::Display for ReflectionDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Proceed => write!(f, "proceed"),
            Self::RetryStep => write!(f, "retry_step"),
            Self::Replan => write!(f, "replan"),
            Self::Escalate => write!(f, "escalate"),
        }
    }
}

/// Typed reflection outcome.
#[derive(Debug, Clone, Deserialize)]
pub struct Reflection {
    pub decision: ReflectionDecision,
    #[serde(default)]
    pub reason: Option<String>,
}

impl Reflection {
    /// Fail-closed reflection for unparseable output.
    fn fail_closed() -> Self {
        Self {
            decision: ReflectionDecision::Escalate,
            reason: Some("unparseable reflection reply".into()),
        }
    }
}

/// Parse a reflection reply. Never fails: anything that does not match the
/// contract escalates.
pub fn parse_reflection(raw: &str) -> Reflection {
    let json_str = extract_json_block(raw).unwrap_or(raw);
    serde_json::from_str::<Reflection>(json_str).unwrap_or_else(|e| {
        warn!(error = %e, "reflection reply failed contract parse");
        Reflection::fail_closed()
    })
}

// ---------------------------------------------------------------------------
// Verdicts
// ---------------------------------------------------------------------------

/// Typed verification outcome.
#[derive(Debug, Clone, Deserialize)]
pub struct Verdict {
    pub satisfied: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

impl Verdict {
    fn fail_closed() -> Self {
        Self {
            satisfied: false,
            reason: Some("unparseable verdict reply".into()),
        }
    }
}

/// Parse a verification reply. Never fails: anything that does not match
/// the contract counts as not satisfied.
pub fn parse_verdict(raw: &str) -> Verdict {
    let json_str = extract_json_block(raw).unwrap_or(raw);
    serde_json::from_str::<Verdict>(json_str).unwrap_or_else(|e| {
        warn!(error = %e, "verdict reply failed contract parse");
        Verdict::fail_closed()
    })
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Try to extract a JSON block from a reply that may contain surrounding text.
fn extract_json_block(text: &str) -> Option<&str> {
    // Look for ```json ... ``` fenced blocks
    if let Some(start) = text.find("```json") {
        let json_start = start + 7;
        if let Some(end) = text[json_start..].find("```") {
            return Some(text[json_start..json_start + end].trim());
        }
    }

    // Otherwise slice from the first opening bracket to the matching kind
    // of closing bracket at the end. Plans may be bare arrays.
    match (text.find('{'), text.find('[')) {
        (Some(o), Some(a)) => {
            if a < o {
                slice_between(text, a, ']')
            } else {
                slice_between(text, o, '}')
            }
        }
        (Some(o), None) => slice_between(text, o, '}'),
        (None, Some(a)) => slice_between(text, a, ']'),
        (None, None) => None,
    }
}

fn slice_between(text: &str, start: usize, close: char) -> Option<&str> {
    let end = text.rfind(close)?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::StepStatus;

    // -- Plan parsing --

    #[test]
    fn test_parse_plan_envelope_form() {
        let raw = r#"{
            "steps": [
                {"description": "Search the docs", "tool_name": "web_search",
                 "parameters": {"query": "tokio select"}},
                {"description": "Summarize the findings"}
            ]
        }"#;
        let steps = parse_plan(raw, 16).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].index, 0);
        assert_eq!(steps[0].tool_name.as_deref(), Some("web_search"));
        assert_eq!(steps[0].parameters["query"], "tokio select");
        assert_eq!(steps[0].status, StepStatus::Pending);
        assert!(steps[1].tool_name.is_none());
    }

    #[test]
    fn test_parse_plan_bare_array_form() {
        let raw = r#"[{"description": "a"}, {"description": "b"}]"#;
        let steps = parse_plan(raw, 16).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].index, 1);
    }

    #[test]
    fn test_parse_plan_fenced_with_prose() {
        let raw = "Here is my plan:\n```json\n{\"steps\": [{\"description\": \"do it\"}]}\n```\nReady.";
        let steps = parse_plan(raw, 16).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].description, "do it");
    }

    #[test]
    fn test_parse_plan_accepts_tool_alias() {
        let raw = r#"{"steps": [{"description": "look up", "tool": "web_search"}]}"#;
        let steps = parse_plan(raw, 16).unwrap();
        assert_eq!(steps[0].tool_name.as_deref(), Some("web_search"));
    }

    #[test]
    fn test_parse_plan_defaults_parameters_to_object() {
        let raw = r#"{"steps": [{"description": "no params", "tool_name": "ping"}]}"#;
        let steps = parse_plan(raw, 16).unwrap();
        assert!(steps[0].parameters.is_object());
    }

    #[test]
    fn test_parse_plan_truncates_at_limit() {
        let raw = r#"[{"description": "a"}, {"description": "b"}, {"description": "c"}]"#;
        let steps = parse_plan(raw, 2).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].description, "b");
    }

    #[test]
    fn test_parse_plan_empty_rejected() {
        match parse_plan(r#"{"steps": []}"#, 16) {
            Err(PlanParseError::EmptyPlan) => {}
            other => panic!("expected EmptyPlan, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_plan_malformed_rejected() {
        match parse_plan("I cannot produce a plan right now.", 16) {
            Err(PlanParseError::Invalid(_)) => {}
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    // -- Reflection parsing --

    #[test]
    fn test_parse_reflection_all_variants() {
        for (text, expected) in [
            ("proceed", ReflectionDecision::Proceed),
            ("retry_step", ReflectionDecision::RetryStep),
            ("replan", ReflectionDecision::Replan),
            ("escalate", ReflectionDecision::Escalate),
        ] {
            let raw = format!(r#"{{"decision": "{text}", "reason": "because"}}"#);
            let reflection = parse_reflection(&raw);
            assert_eq!(reflection.decision, expected);
            assert_eq!(reflection.reason.as_deref(), Some("because"));
        }
    }

    #[test]
    fn test_parse_reflection_reason_optional() {
        let reflection = parse_reflection(r#"{"decision": "proceed"}"#);
        assert_eq!(reflection.decision, ReflectionDecision::Proceed);
        assert!(reflection.reason.is_none());
    }

    #[test]
    fn test_parse_reflection_garbage_escalates() {
        let reflection = parse_reflection("the step went fine I think");
        assert_eq!(reflection.decision, ReflectionDecision::Escalate);
    }

    #[test]
    fn test_parse_reflection_unknown_decision_escalates() {
        let reflection = parse_reflection(r#"{"decision": "shrug"}"#);
        assert_eq!(reflection.decision, ReflectionDecision::Escalate);
    }

    // -- Verdict parsing --

    #[test]
    fn test_parse_verdict_satisfied() {
        let verdict = parse_verdict(r#"{"satisfied": true, "reason": "all steps produced output"}"#);
        assert!(verdict.satisfied);
    }

    #[test]
    fn test_parse_verdict_fenced() {
        let verdict = parse_verdict("```json\n{\"satisfied\": false, \"reason\": \"step 2 errored\"}\n```");
        assert!(!verdict.satisfied);
        assert_eq!(verdict.reason.as_deref(), Some("step 2 errored"));
    }

    #[test]
    fn test_parse_verdict_garbage_is_not_satisfied() {
        let verdict = parse_verdict("looks good to me!");
        assert!(!verdict.satisfied);
    }

    // -- JSON extraction --

    #[test]
    fn test_extract_json_block_fenced() {
        let text = "Here:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(extract_json_block(text), Some("{\"a\": 1}"));
    }

    #[test]
    fn test_extract_json_block_braces() {
        let text = "Sure. {\"a\": 1} That's it.";
        assert_eq!(extract_json_block(text), Some("{\"a\": 1}"));
    }

    #[test]
    fn test_extract_json_block_array_before_object() {
        let text = "Plan: [{\"description\": \"a\"}, {\"description\": \"b\"}] done";
        assert_eq!(
            extract_json_block(text),
            Some("[{\"description\": \"a\"}, {\"description\": \"b\"}]")
        );
    }

    #[test]
    fn test_extract_json_block_none() {
        assert_eq!(extract_json_block("no json here"), None);
    }
}
