//! The task loop: plan, execute, reflect, verify.
//!
//! One [`TaskRunner::run`] call drives a task from `Queued` to a terminal
//! state:
//!
//! ```text
//! Queued → Planning → Executing ⇄ WaitingOnHuman
//!             ↑  ↑        ↓
//!             ↑  └─ (replan)
//!             ↑           ↓
//!             └──── Verifying → Complete
//!          (any non-terminal) → Failed | Aborted
//! ```
//!
//! Planning and reflection exchanges are out of band: their prompts and
//! replies never land in the transcript. The transcript records only the
//! opening message, one exchange pair per executed step, the final verdict,
//! and any closing error block. Inference always goes through the fallback
//! router; tool dispatch always goes through the tool gateway.
//!
//! The abort token is checked when each suspension point resumes. A call
//! that was in flight when abort arrived completes, but its result is
//! discarded and nothing further is issued.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gateway::harmony;
use gateway::{
    ContentBlock, FallbackRouter, GatewayError, Message, ModelVariant, OrchestrationEvent, Role,
    SharedEventBus, ToolGateway,
};

use crate::config::LoopConfig;
use crate::contracts::{self, Reflection, ReflectionDecision};
use crate::prompts;
use crate::state_machine::{StateMachine, TaskState};
use crate::task::{HumanDecision, StepStatus, Task, TaskFailure, TaskStore};

/// Reflection-driven replans allowed before the task gives up. The
/// post-verification replanning cycle is separate and always exactly one.
const MAX_REPLANS: u32 = 8;

// ---------------------------------------------------------------------------
// Phase outcomes
// ---------------------------------------------------------------------------

enum PlanPhase {
    Planned,
    Failed(TaskFailure),
    Aborted,
}

enum ExecPhase {
    AllDone,
    Replan(String),
    Checkpoint(String),
    Failed(TaskFailure),
    Aborted,
}

enum HumanPhase {
    Resume(&'static str),
    Aborted,
}

enum VerifyPhase {
    Satisfied,
    Unsatisfied(String),
    Failed(TaskFailure),
    Aborted,
}

/// Result of one step attempt. An error result from a tool is a normal
/// outcome here, not an `Err` on the call path.
enum StepOutcome {
    Success(Value),
    Failure(TaskFailure),
    Aborted,
}

/// Result of one out-of-band inference exchange.
enum Ask {
    Reply(String),
    Unavailable(String),
    Aborted,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Drives tasks through the loop. One runner serves any number of
/// concurrent `run` calls; each call owns its task's working copy and
/// commits it to the store after every state change.
pub struct TaskRunner {
    config: LoopConfig,
    router: Arc<FallbackRouter>,
    tools: Arc<ToolGateway>,
    events: SharedEventBus,
    store: Arc<TaskStore>,
}

impl TaskRunner {
    pub fn new(
        config: LoopConfig,
        router: Arc<FallbackRouter>,
        tools: Arc<ToolGateway>,
        events: SharedEventBus,
        store: Arc<TaskStore>,
    ) -> Self {
        Self {
            config,
            router,
            tools,
            events,
            store,
        }
    }

    /// Run one task end to end and return its final record. The returned
    /// task is terminal; inspect `status` and `failure` for the outcome.
    pub async fn run(&self, goal: impl Into<String>, model: ModelVariant) -> anyhow::Result<Task> {
        let mut task = Task::new(goal);
        let mut machine = StateMachine::new();
        let (cancel, mut decisions) = self.store.register(&task);

        info!(task_id = %task.id, model = %model, goal = %task.goal_preview(), "task accepted");
        self.events.publish(OrchestrationEvent::TaskCreated {
            task_id: task.id.clone(),
            goal_preview: task.goal_preview(),
            timestamp: Utc::now(),
        });

        // The opening message is the only one that carries tool signatures.
        task.transcript.push(harmony::opening_message(
            task.goal.clone(),
            self.tools.signatures(),
        ));

        self.transition(&mut task, &mut machine, TaskState::Planning, "task accepted")?;

        let mut replan_reason: Option<String> = None;
        let mut replans_used: u32 = 0;
        let mut verify_replan_used = false;

        while !machine.is_terminal() {
            match machine.current() {
                TaskState::Planning => {
                    match self
                        .plan_phase(&mut task, model, replan_reason.take(), &cancel)
                        .await
                    {
                        PlanPhase::Planned => {
                            self.transition(&mut task, &mut machine, TaskState::Executing, "plan parsed")?;
                        }
                        PlanPhase::Failed(failure) => self.fail(&mut task, &mut machine, failure)?,
                        PlanPhase::Aborted => self.do_abort(&mut task, &mut machine)?,
                    }
                }

                TaskState::Executing => match self.exec_phase(&mut task, model, &cancel).await {
                    ExecPhase::AllDone => {
                        self.transition(&mut task, &mut machine, TaskState::Verifying, "all steps done")?;
                    }
                    ExecPhase::Replan(reason) => {
                        if replans_used >= MAX_REPLANS {
                            self.fail(
                                &mut task,
                                &mut machine,
                                TaskFailure {
                                    tag: "replan_exhausted".into(),
                                    description: format!(
                                        "replanned {replans_used} times without finishing; last reason: {reason}"
                                    ),
                                },
                            )?;
                        } else {
                            replans_used += 1;
                            replan_reason = Some(reason.clone());
                            self.transition(
                                &mut task,
                                &mut machine,
                                TaskState::Planning,
                                &format!("replan: {reason}"),
                            )?;
                        }
                    }
                    ExecPhase::Checkpoint(reason) => {
                        self.transition(&mut task, &mut machine, TaskState::WaitingOnHuman, &reason)?;
                        self.events.publish(OrchestrationEvent::CheckpointRaised {
                            task_id: task.id.clone(),
                            reason,
                            timestamp: Utc::now(),
                        });
                    }
                    ExecPhase::Failed(failure) => self.fail(&mut task, &mut machine, failure)?,
                    ExecPhase::Aborted => self.do_abort(&mut task, &mut machine)?,
                },

                TaskState::WaitingOnHuman => {
                    match self.human_phase(&mut task, &mut decisions, &cancel).await {
                        HumanPhase::Resume(reason) => {
                            self.transition(&mut task, &mut machine, TaskState::Executing, reason)?;
                        }
                        HumanPhase::Aborted => self.do_abort(&mut task, &mut machine)?,
                    }
                }

                TaskState::Verifying => match self.verify_phase(&mut task, model, &cancel).await {
                    VerifyPhase::Satisfied => {
                        self.transition(&mut task, &mut machine, TaskState::Complete, "goal satisfied")?;
                    }
                    VerifyPhase::Unsatisfied(reason) => {
                        if verify_replan_used {
                            self.fail(
                                &mut task,
                                &mut machine,
                                TaskFailure {
                                    tag: "verification_failed".into(),
                                    description: reason,
                                },
                            )?;
                        } else {
                            verify_replan_used = true;
                            replan_reason = Some(reason.clone());
                            self.transition(
                                &mut task,
                                &mut machine,
                                TaskState::Planning,
                                &format!("verdict: {reason}"),
                            )?;
                        }
                    }
                    VerifyPhase::Failed(failure) => self.fail(&mut task, &mut machine, failure)?,
                    VerifyPhase::Aborted => self.do_abort(&mut task, &mut machine)?,
                },

                state => anyhow::bail!("task loop reached {state} unexpectedly"),
            }
        }

        info!(task_id = %task.id, status = %machine.current(), "task finished: {}", machine.summary());
        task.touch();
        self.store.update(&task);
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    /// Ask for a plan and parse it fail-closed. A reply that fails the
    /// contract gets exactly one correction exchange.
    async fn plan_phase(
        &self,
        task: &mut Task,
        model: ModelVariant,
        revision: Option<String>,
        cancel: &CancellationToken,
    ) -> PlanPhase {
        let signatures = self.tools.signatures();
        let prompt = prompts::planning(&task.goal, &signatures, revision.as_deref());

        let reply = match self.ask(task, model, &prompt, cancel).await {
            Ask::Reply(text) => text,
            Ask::Unavailable(description) => {
                return PlanPhase::Failed(TaskFailure {
                    tag: "inference_unavailable".into(),
                    description,
                })
            }
            Ask::Aborted => return PlanPhase::Aborted,
        };

        let parse_error = match contracts::parse_plan(&reply, self.config.max_plan_steps) {
            Ok(steps) => {
                debug!(task_id = %task.id, steps = steps.len(), "plan accepted");
                task.plan = steps;
                self.store.update(task);
                return PlanPhase::Planned;
            }
            Err(e) => e,
        };

        warn!(task_id = %task.id, error = %parse_error, "plan failed contract, correcting once");
        let correction = prompts::plan_correction(&parse_error.to_string());
        let reply = match self.ask(task, model, &correction, cancel).await {
            Ask::Reply(text) => text,
            Ask::Unavailable(description) => {
                return PlanPhase::Failed(TaskFailure {
                    tag: "inference_unavailable".into(),
                    description,
                })
            }
            Ask::Aborted => return PlanPhase::Aborted,
        };

        match contracts::parse_plan(&reply, self.config.max_plan_steps) {
            Ok(steps) => {
                debug!(task_id = %task.id, steps = steps.len(), "corrected plan accepted");
                task.plan = steps;
                self.store.update(task);
                PlanPhase::Planned
            }
            Err(e) => PlanPhase::Failed(TaskFailure {
                tag: "planning_failed".into(),
                description: format!("plan failed the contract twice: {e}"),
            }),
        }
    }

    /// Work through pending steps strictly in index order, reflecting after
    /// every attempt.
    async fn exec_phase(
        &self,
        task: &mut Task,
        model: ModelVariant,
        cancel: &CancellationToken,
    ) -> ExecPhase {
        while let Some(index) = task.next_pending_step() {
            {
                let step = &mut task.plan[index];
                step.status = StepStatus::Running;
                step.attempts += 1;
            }
            self.events.publish(OrchestrationEvent::StepStarted {
                task_id: task.id.clone(),
                step_index: index,
                tool: task.plan[index].tool_name.clone(),
                attempt: task.plan[index].attempts,
                timestamp: Utc::now(),
            });
            self.store.update(task);

            let outcome = if task.plan[index].is_tool_step() {
                self.run_tool_step(task, index, cancel).await
            } else {
                self.run_reasoning_step(task, index, model, cancel).await
            };

            let step_result = match outcome {
                StepOutcome::Aborted => return ExecPhase::Aborted,
                StepOutcome::Success(payload) => Ok(payload),
                StepOutcome::Failure(failure) => Err(failure),
            };

            let outcome_text = match &step_result {
                Ok(payload) => format!("ok: {payload}"),
                Err(failure) => format!("error[{}]: {}", failure.tag, failure.description),
            };
            {
                let step = &mut task.plan[index];
                match &step_result {
                    Ok(payload) => {
                        step.result = Some(payload.clone());
                        step.last_error = None;
                    }
                    Err(failure) => {
                        step.status = StepStatus::Error;
                        step.last_error = Some(failure.description.clone());
                    }
                }
            }
            self.events.publish(OrchestrationEvent::StepFinished {
                task_id: task.id.clone(),
                step_index: index,
                ok: step_result.is_ok(),
                timestamp: Utc::now(),
            });
            self.store.update(task);

            let prompt = prompts::reflection(&task.plan[index], &outcome_text);
            let reflection = match self.ask(task, model, &prompt, cancel).await {
                Ask::Aborted => return ExecPhase::Aborted,
                Ask::Unavailable(description) => {
                    warn!(task_id = %task.id, step = index, "reflection unavailable, escalating");
                    Reflection {
                        decision: ReflectionDecision::Escalate,
                        reason: Some(description),
                    }
                }
                Ask::Reply(text) => contracts::parse_reflection(&text),
            };
            debug!(
                task_id = %task.id,
                step = index,
                decision = %reflection.decision,
                "reflection"
            );

            match reflection.decision {
                ReflectionDecision::Proceed => {
                    // An error the model accepts is closed out as done.
                    task.plan[index].status = StepStatus::Done;
                    self.store.update(task);
                }
                ReflectionDecision::RetryStep => {
                    let attempts = task.plan[index].attempts;
                    if attempts >= self.config.step_retry_budget {
                        let failure = step_result.err().unwrap_or_else(|| TaskFailure {
                            tag: "retry_exhausted".into(),
                            description: format!("step {} exhausted its retry budget", index + 1),
                        });
                        if self.config.checkpoint_enabled {
                            return ExecPhase::Checkpoint(format!(
                                "step {} out of retries: {}",
                                index + 1,
                                failure.description
                            ));
                        }
                        return ExecPhase::Failed(failure);
                    }
                    task.plan[index].status = StepStatus::Pending;
                    self.store.update(task);

                    let backoff = step_backoff(&self.config, attempts);
                    debug!(task_id = %task.id, step = index, ?backoff, "retrying step after backoff");
                    tokio::time::sleep(backoff).await;
                    if cancel.is_cancelled() {
                        return ExecPhase::Aborted;
                    }
                }
                ReflectionDecision::Replan => {
                    return ExecPhase::Replan(
                        reflection
                            .reason
                            .unwrap_or_else(|| "reflection requested a new plan".into()),
                    );
                }
                ReflectionDecision::Escalate => {
                    let reason = reflection
                        .reason
                        .unwrap_or_else(|| "reflection escalated".into());
                    if self.config.checkpoint_enabled {
                        return ExecPhase::Checkpoint(reason);
                    }
                    return ExecPhase::Failed(TaskFailure {
                        tag: "escalated".into(),
                        description: reason,
                    });
                }
            }
        }

        ExecPhase::AllDone
    }

    /// Dispatch one tool step and append its exchange pair. Unknown tools
    /// and tool-reported errors both land in the transcript as error
    /// results; the reflection decides what happens next.
    async fn run_tool_step(
        &self,
        task: &mut Task,
        index: usize,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let (name, parameters) = {
            let step = &task.plan[index];
            (
                step.tool_name.clone().unwrap_or_default(),
                step.parameters.clone(),
            )
        };

        let call = harmony::build_tool_call(name.clone(), parameters.clone());
        let result = self.tools.call(&name, parameters).await;
        if cancel.is_cancelled() {
            return StepOutcome::Aborted;
        }

        let (result_message, tag) = match result {
            Ok(message) => {
                let tag = message.is_error_result().then_some("tool_error");
                (message, tag)
            }
            Err(GatewayError::UnknownTool(_)) => (
                harmony::build_tool_result(
                    &name,
                    Err(format!("no tool named {name} is registered")),
                ),
                Some("unknown_tool"),
            ),
        };

        let payload = message_payload(&result_message);
        let description = error_description(&result_message);
        task.transcript.push(call);
        task.transcript.push(result_message);

        match tag {
            None => StepOutcome::Success(payload.unwrap_or(Value::Null)),
            Some(tag) => StepOutcome::Failure(TaskFailure {
                tag: tag.into(),
                description,
            }),
        }
    }

    /// Run one pure-reasoning step. The prompt and reply are appended
    /// together only once the reply is in hand, so a failed or discarded
    /// attempt leaves no dangling user message.
    async fn run_reasoning_step(
        &self,
        task: &mut Task,
        index: usize,
        model: ModelVariant,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let prompt = prompts::reasoning_step(&task.plan[index]);
        match self.ask(task, model, &prompt, cancel).await {
            Ask::Aborted => StepOutcome::Aborted,
            Ask::Unavailable(description) => StepOutcome::Failure(TaskFailure {
                tag: "inference_unavailable".into(),
                description,
            }),
            Ask::Reply(text) => {
                task.transcript.push(harmony::build_user_message(prompt));
                task.transcript
                    .push(harmony::build_assistant_message(text.clone()));
                StepOutcome::Success(Value::String(text))
            }
        }
    }

    /// Park on the decision channel until a human answers or an abort
    /// arrives. Nothing else is held while waiting.
    async fn human_phase(
        &self,
        task: &mut Task,
        decisions: &mut mpsc::Receiver<HumanDecision>,
        cancel: &CancellationToken,
    ) -> HumanPhase {
        let decision = tokio::select! {
            _ = cancel.cancelled() => return HumanPhase::Aborted,
            decision = decisions.recv() => match decision {
                // Channel gone means the store entry was dropped out from
                // under a parked task; treat it as an abort.
                None => return HumanPhase::Aborted,
                Some(decision) => decision,
            },
        };

        self.events.publish(OrchestrationEvent::CheckpointResolved {
            task_id: task.id.clone(),
            decision: decision.label().to_string(),
            timestamp: Utc::now(),
        });

        match decision {
            HumanDecision::Approve => {
                // The step that raised the checkpoint restarts with a fresh
                // budget.
                if let Some(index) = task.next_pending_step() {
                    let step = &mut task.plan[index];
                    step.status = StepStatus::Pending;
                    step.attempts = 0;
                    step.last_error = None;
                }
                self.store.update(task);
                HumanPhase::Resume("human approved")
            }
            HumanDecision::Edit { steps } => {
                let keep = task.next_pending_step().unwrap_or(task.plan.len());
                task.plan.truncate(keep);
                for (offset, mut step) in steps.into_iter().enumerate() {
                    step.index = keep + offset;
                    step.status = StepStatus::Pending;
                    step.attempts = 0;
                    step.result = None;
                    step.last_error = None;
                    task.plan.push(step);
                }
                self.store.update(task);
                HumanPhase::Resume("human edited the plan")
            }
            HumanDecision::Abort => HumanPhase::Aborted,
        }
    }

    /// Ask the model for a verdict against the transcript. The verdict
    /// reply is the one verification message that lands in the transcript.
    async fn verify_phase(
        &self,
        task: &mut Task,
        model: ModelVariant,
        cancel: &CancellationToken,
    ) -> VerifyPhase {
        let prompt = prompts::verification(&task.goal);
        match self.ask(task, model, &prompt, cancel).await {
            Ask::Aborted => VerifyPhase::Aborted,
            Ask::Unavailable(description) => VerifyPhase::Failed(TaskFailure {
                tag: "inference_unavailable".into(),
                description,
            }),
            Ask::Reply(text) => {
                task.transcript
                    .push(harmony::build_assistant_message(text.clone()));
                self.store.update(task);
                let verdict = contracts::parse_verdict(&text);
                if verdict.satisfied {
                    VerifyPhase::Satisfied
                } else {
                    VerifyPhase::Unsatisfied(
                        verdict
                            .reason
                            .unwrap_or_else(|| "goal not satisfied".into()),
                    )
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    /// One out-of-band exchange: current transcript plus a throwaway user
    /// message, routed with fallback. The transcript itself is untouched.
    async fn ask(
        &self,
        task: &Task,
        model: ModelVariant,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Ask {
        let mut messages = task.transcript.clone();
        messages.push(harmony::build_user_message(prompt));
        let wire = harmony::wire_request(messages, self.settings());

        let result = self.router.infer(&wire, model).await;
        if cancel.is_cancelled() {
            return Ask::Aborted;
        }
        match result {
            Ok(message) => Ask::Reply(message.first_text().unwrap_or_default().to_string()),
            Err(e) => Ask::Unavailable(e.to_string()),
        }
    }

    fn settings(&self) -> serde_json::Map<String, Value> {
        let mut settings = serde_json::Map::new();
        settings.insert("temperature".into(), json!(self.config.temperature));
        settings.insert("max_tokens".into(), json!(self.config.max_tokens));
        settings
    }

    fn transition(
        &self,
        task: &mut Task,
        machine: &mut StateMachine,
        to: TaskState,
        reason: &str,
    ) -> anyhow::Result<()> {
        let from = machine.current();
        machine.advance(to, Some(reason))?;
        task.status = to;
        task.transitions = machine.transitions().to_vec();
        task.touch();
        self.events.publish(OrchestrationEvent::TaskStateChanged {
            task_id: task.id.clone(),
            from: from.to_string(),
            to: to.to_string(),
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        self.store.update(task);
        Ok(())
    }

    /// Record the failure pair on the task and in the transcript, then
    /// transition to `Failed`.
    fn fail(
        &self,
        task: &mut Task,
        machine: &mut StateMachine,
        failure: TaskFailure,
    ) -> anyhow::Result<()> {
        warn!(task_id = %task.id, tag = %failure.tag, "task failed: {}", failure.description);
        task.transcript.push(Message {
            role: Role::Assistant,
            content: vec![ContentBlock::error(
                Some(failure.tag.clone()),
                failure.description.clone(),
            )],
            tools: Vec::new(),
        });
        let reason = failure.tag.clone();
        task.failure = Some(failure);
        self.transition(task, machine, TaskState::Failed, &reason)
    }

    fn do_abort(&self, task: &mut Task, machine: &mut StateMachine) -> anyhow::Result<()> {
        info!(task_id = %task.id, "task aborted");
        self.transition(task, machine, TaskState::Aborted, "abort requested")
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Exponential backoff for step retries: base doubling per prior attempt,
/// capped.
fn step_backoff(config: &LoopConfig, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(16);
    config
        .step_backoff_base
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(config.step_backoff_cap)
}

/// First structured or text payload in a message.
fn message_payload(message: &Message) -> Option<Value> {
    message.content.iter().find_map(|block| match block {
        ContentBlock::Json { data } => Some(data.clone()),
        ContentBlock::Text { text } => Some(Value::String(text.clone())),
        _ => None,
    })
}

/// Description carried by the first error block, if any.
fn error_description(message: &Message) -> String {
    message
        .content
        .iter()
        .find_map(|block| match block {
            ContentBlock::Error { description, .. } => Some(description.clone()),
            _ => None,
        })
        .unwrap_or_else(|| "tool reported an error".into())
}
