//! Prompt builders for the planning, reasoning, reflection, and
//! verification exchanges.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever instruction content
//! changes. This enables tracing which prompt version produced a given
//! reply, useful for debugging regressions in loop behavior.
//!
//! Every prompt that expects structured output restates the exact JSON
//! contract from [`crate::contracts`]; the parsers there are fail-closed,
//! so the instructions carry the burden of keeping replies parseable.

use gateway::ToolSignature;

use crate::task::Step;

/// Prompt version. Bump on any instruction content change.
pub const PROMPT_VERSION: &str = "1.3.0";

/// Ask the model to turn the goal into an ordered step plan.
///
/// `revision` carries the reason a previous attempt came back here, so a
/// replan after reflection or a failed verification sees what to correct.
pub fn planning(goal: &str, tools: &[ToolSignature], revision: Option<&str>) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!("# Goal\n{goal}\n\n"));

    if let Some(reason) = revision {
        prompt.push_str(&format!(
            "## Revision\nThe previous plan did not get there: {reason}\n\
             Produce a corrected plan that addresses this.\n\n"
        ));
    }

    if tools.is_empty() {
        prompt.push_str("## Available Tools\nNone. Every step must be pure reasoning.\n\n");
    } else {
        prompt.push_str("## Available Tools\n");
        for tool in tools {
            prompt.push_str(&format!("- `{}`: {}\n", tool.name, tool.description));
        }
        prompt.push('\n');
    }

    prompt.push_str(
        "## Instructions\n\
         Break the goal into the smallest ordered list of steps that reaches it. \
         A step that calls a tool names it in `tool_name` and fills `parameters` \
         to match that tool's schema; a step without `tool_name` is answered by \
         you directly.\n\n\
         Respond with STRICT JSON only, no surrounding prose:\n\
         ```json\n\
         {\"steps\": [{\"description\": \"...\", \"tool_name\": \"...\", \"parameters\": {}}]}\n\
         ```\n\
         Omit `tool_name` and `parameters` for pure-reasoning steps.\n",
    );

    prompt
}

/// Follow-up after a plan reply that failed the JSON contract.
pub fn plan_correction(error: &str) -> String {
    format!(
        "Your plan could not be parsed: {error}\n\
         Re-emit the plan as STRICT JSON matching \
         {{\"steps\": [{{\"description\", \"tool_name\"?, \"parameters\"?}}]}}. \
         Output the JSON object and nothing else."
    )
}

/// One pure-reasoning step: the model answers the step directly.
pub fn reasoning_step(step: &Step) -> String {
    format!(
        "# Step {}\n{}\n\n\
         Work this step using the conversation so far. Respond with your \
         result in plain text.",
        step.index + 1,
        step.description
    )
}

/// Ask the model what to do after a step outcome.
///
/// `outcome` is a short rendering of the result or error the step produced.
pub fn reflection(step: &Step, outcome: &str) -> String {
    format!(
        "# Reflection\n\
         Step {} (`{}`) finished with this outcome:\n{}\n\n\
         Decide how to continue:\n\
         - `proceed`: the outcome is good enough, move to the next step\n\
         - `retry_step`: the same step is worth another attempt\n\
         - `replan`: the plan no longer fits, rebuild it\n\
         - `escalate`: a human needs to look at this\n\n\
         Respond with STRICT JSON only:\n\
         ```json\n\
         {{\"decision\": \"proceed|retry_step|replan|escalate\", \"reason\": \"...\"}}\n\
         ```",
        step.index + 1,
        step.description,
        outcome
    )
}

/// Ask the model whether the transcript satisfies the goal.
pub fn verification(goal: &str) -> String {
    format!(
        "# Verification\n\
         Original goal:\n{goal}\n\n\
         Judge whether the conversation above actually satisfies the goal. \
         Be strict: partial or unverified results are not satisfied.\n\n\
         Respond with STRICT JSON only:\n\
         ```json\n\
         {{\"satisfied\": true, \"reason\": \"...\"}}\n\
         ```"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_tool() -> ToolSignature {
        ToolSignature {
            name: "web_search".into(),
            description: "Search the web".into(),
            parameters: json!({"type": "object"}),
        }
    }

    #[test]
    fn test_planning_lists_tools() {
        let prompt = planning("find the capital of France", &[sample_tool()], None);
        assert!(prompt.contains("# Goal"));
        assert!(prompt.contains("`web_search`: Search the web"));
        assert!(prompt.contains("STRICT JSON"));
        assert!(!prompt.contains("## Revision"));
    }

    #[test]
    fn test_planning_without_tools() {
        let prompt = planning("goal", &[], None);
        assert!(prompt.contains("None. Every step must be pure reasoning."));
    }

    #[test]
    fn test_planning_revision_carries_reason() {
        let prompt = planning("goal", &[], Some("verdict: summary missed the numbers"));
        assert!(prompt.contains("## Revision"));
        assert!(prompt.contains("summary missed the numbers"));
    }

    #[test]
    fn test_reasoning_step_is_one_indexed() {
        let step = Step::new(0, "summarize the findings", None, json!({}));
        let prompt = reasoning_step(&step);
        assert!(prompt.contains("# Step 1"));
        assert!(prompt.contains("summarize the findings"));
    }

    #[test]
    fn test_reflection_names_the_decisions() {
        let step = Step::new(2, "fetch the page", Some("http_get".into()), json!({}));
        let prompt = reflection(&step, "error: connection refused");
        for needle in ["`proceed`", "`retry_step`", "`replan`", "`escalate`"] {
            assert!(prompt.contains(needle), "missing {needle}");
        }
        assert!(prompt.contains("connection refused"));
    }

    #[test]
    fn test_verification_restates_goal() {
        let prompt = verification("book the flight");
        assert!(prompt.contains("book the flight"));
        assert!(prompt.contains("\"satisfied\""));
    }
}
