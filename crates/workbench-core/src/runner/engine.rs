// Classic run engine: plan once, execute steps sequentially, pause on
// approvals, patch between steps, review with the critic, emit a report.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};

use workbench_store::{StepUpdate, TaskUpdate};
use workbench_tools::ToolContext;
use workbench_types::{
    ApprovalStatus, EngineEvent, Plan, Skill, StepStatus, TaskStatus, Workspace,
};

use crate::permissions::{scope_for_tool, PolicyMode};
use crate::roles;

use super::{
    approval_chat_text, collect_artifacts, render_prompt_template, write_classic_report, Runner,
};

/// Worker entry point. Every pause path returns `Ok`; anything else marks the
/// task failed unless it was canceled in the meantime.
pub(crate) async fn run_classic(runner: &Arc<Runner>, task_id: &str) {
    if let Err(err) = run_classic_inner(runner, task_id).await {
        if runner.is_canceled(task_id).await {
            return;
        }
        tracing::error!(task_id, "classic run failed: {err:#}");
        let _ = runner
            .store
            .update_task(task_id, TaskUpdate::failed(format!("{err:#}")))
            .await;
        runner.policy.clear_task_grants(task_id).await;
    }
}

struct RunContext {
    workspace: Workspace,
    skill: Skill,
    ws_root: PathBuf,
    artifacts_dir: PathBuf,
    skill_prompt: String,
    tools_summary: String,
    model: String,
}

async fn load_run_context(runner: &Runner, task_id: &str) -> anyhow::Result<RunContext> {
    let task = runner.store.get_task(task_id).await?;
    let workspace = runner.store.get_workspace(&task.workspace_id).await?;
    let skill = runner.store.get_skill(&task.skill_id).await?;
    let ws_root = PathBuf::from(&workspace.path);
    let artifacts_dir = runner.settings.task_artifacts_dir(task_id);

    let vars = [
        ("task_id", task_id.to_string()),
        ("workspace_root", ws_root.display().to_string()),
        (
            "outputs_dir",
            ws_root.join("outputs").join(task_id).display().to_string(),
        ),
        ("artifacts_dir", artifacts_dir.display().to_string()),
    ];
    let skill_prompt = render_prompt_template(&skill.system_prompt, &vars);

    let specs = runner.tools.list_specs(&skill.allowed_tools).await;
    let tools_summary = specs
        .iter()
        .map(|s| format!("- {}: {}", s.name, s.description))
        .collect::<Vec<_>>()
        .join("\n");
    let model = runner.settings.model_for(task.mode);

    Ok(RunContext {
        workspace,
        skill,
        ws_root,
        artifacts_dir,
        skill_prompt,
        tools_summary,
        model,
    })
}

async fn run_classic_inner(runner: &Arc<Runner>, task_id: &str) -> anyhow::Result<()> {
    let store = &runner.store;
    let task = store.get_task(task_id).await?;
    if task.status == TaskStatus::Canceled {
        return Ok(());
    }
    let ctx = load_run_context(runner, task_id).await?;
    let allowed_tools = ctx.skill.allowed_tools.clone();

    // Plan once; a resumed task keeps its persisted plan and step table.
    if task.plan.is_none() {
        if runner.is_canceled(task_id).await {
            return Ok(());
        }
        store
            .update_task(task_id, TaskUpdate::status(TaskStatus::Planning))
            .await?;
        let plan = roles::generate_plan(
            runner.provider.as_ref(),
            &ctx.model,
            &task.goal,
            &allowed_tools,
            &ctx.tools_summary,
            &ctx.skill_prompt,
        )
        .await
        .map_err(|err| anyhow::anyhow!("planning failed: {err}"))?;

        store.delete_steps(task_id).await?;
        store.insert_plan_steps(task_id, &plan.steps, 0).await?;
        store
            .update_task(
                task_id,
                TaskUpdate {
                    status: Some(TaskStatus::Running),
                    plan: Some(plan),
                    current_step: Some(0),
                    ..TaskUpdate::default()
                },
            )
            .await?;
    } else {
        if runner.is_canceled(task_id).await {
            return Ok(());
        }
        store
            .update_task(task_id, TaskUpdate::status(TaskStatus::Running))
            .await?;
    }

    for _critic_iter in 0..roles::MAX_CRITIC_ITERATIONS {
        if runner.is_canceled(task_id).await {
            return Ok(());
        }
        let task = store.get_task(task_id).await?;
        let plan = task.plan.clone().unwrap_or(Plan {
            summary: "Run".to_string(),
            artifacts: Vec::new(),
            steps: Vec::new(),
        });
        let mut steps = store.list_steps(task_id).await?;
        let mut idx = task.current_step;

        while (idx as usize) < steps.len() {
            if runner.is_canceled(task_id).await {
                return Ok(());
            }
            let step = steps[idx as usize].clone();

            if step.status == StepStatus::Succeeded {
                idx += 1;
                store
                    .update_task(
                        task_id,
                        TaskUpdate {
                            current_step: Some(idx),
                            ..TaskUpdate::default()
                        },
                    )
                    .await?;
                continue;
            }

            if step.status == StepStatus::WaitingApproval {
                let approval = store.latest_approval_for_step(&step.id).await?;
                if approval.map(|a| a.status) == Some(ApprovalStatus::Approved) {
                    store
                        .update_step(&step.id, StepUpdate::status(StepStatus::Pending))
                        .await?;
                } else {
                    if !runner.is_canceled(task_id).await {
                        store
                            .update_task(task_id, TaskUpdate::status(TaskStatus::WaitingApproval))
                            .await?;
                    }
                    return Ok(());
                }
            }

            store
                .update_step(
                    &step.id,
                    StepUpdate {
                        status: Some(StepStatus::Running),
                        error: Some(None),
                        ..StepUpdate::default()
                    },
                )
                .await?;

            let tool_spec = runner.tools.get_spec(&step.tool).await;
            let Some(tool_spec) = tool_spec else {
                let message = format!("unknown tool: {}", step.tool);
                fail_step_and_task(runner, task_id, &step.id, &message).await?;
                return Ok(());
            };

            let decision = runner
                .policy
                .decide(
                    &ctx.workspace.id,
                    &step.tool,
                    task_id,
                    step.requires_approval,
                    Some(tool_spec.risky),
                )
                .await?;

            match decision.mode {
                PolicyMode::Deny => {
                    let scope = scope_for_tool(&step.tool);
                    let message = format!("Denied by policy ({}).", scope.as_str());
                    fail_step_and_task(runner, task_id, &step.id, &message).await?;
                    return Ok(());
                }
                PolicyMode::RequireApproval => {
                    let approval = store.latest_approval_for_step(&step.id).await?;
                    if approval.map(|a| a.status) != Some(ApprovalStatus::Approved) {
                        pause_for_approval(runner, task_id, &step.id, &step.tool).await?;
                        return Ok(());
                    }
                    // Already approved for this exact step; run unattended.
                    store
                        .update_step(
                            &step.id,
                            StepUpdate {
                                requires_approval: Some(false),
                                ..StepUpdate::default()
                            },
                        )
                        .await?;
                }
                PolicyMode::Auto => {
                    if step.requires_approval {
                        store
                            .update_step(
                                &step.id,
                                StepUpdate {
                                    requires_approval: Some(false),
                                    ..StepUpdate::default()
                                },
                            )
                            .await?;
                    }
                }
            }

            let tool_ctx = ToolContext {
                workspace_root: ctx.ws_root.clone(),
                artifacts_dir: ctx.artifacts_dir.join(&step.id),
                task_id: task_id.to_string(),
                step_id: step.id.clone(),
            };
            let result = match runner.tools.run_tool(&tool_ctx, &step.tool, step.args.clone()).await
            {
                Ok(result) => result,
                Err(err) => {
                    fail_step_and_task(runner, task_id, &step.id, &err.to_string()).await?;
                    return Ok(());
                }
            };

            store
                .update_step(
                    &step.id,
                    StepUpdate {
                        status: Some(StepStatus::Succeeded),
                        result: Some(result.clone()),
                        ..StepUpdate::default()
                    },
                )
                .await?;
            idx += 1;
            if runner.is_canceled(task_id).await {
                return Ok(());
            }
            store
                .update_task(
                    task_id,
                    TaskUpdate {
                        status: Some(TaskStatus::Running),
                        current_step: Some(idx),
                        ..TaskUpdate::default()
                    },
                )
                .await?;

            // Optional plan patch from the executor role; best-effort.
            let patch = roles::propose_patch(
                runner.provider.as_ref(),
                &ctx.model,
                &task.goal,
                &plan,
                idx,
                &[result],
                &ctx.tools_summary,
                &ctx.skill_prompt,
            )
            .await;
            if let Some(patch) = patch {
                match roles::apply_patch(store, task_id, &patch).await {
                    Ok(()) => {
                        let seq = store
                            .append_event(
                                task_id,
                                None,
                                "agent_event",
                                json!({"event": {"type": "plan.patched", "reason": patch.reason,
                                       "added": patch.add_steps.len(), "removed": patch.remove_steps.len(),
                                       "replace_from": patch.replace_steps_from_idx}}),
                            )
                            .await?;
                        store.bus().publish(EngineEvent::new(
                            "event_log",
                            json!({"task_id": task_id, "type": "agent_event", "seq": seq}),
                        ));
                    }
                    Err(err) => {
                        tracing::warn!(task_id, "executor patch rejected: {err}");
                    }
                }
            }
            steps = store.list_steps(task_id).await?;
        }

        // All steps ran for this critic iteration.
        let steps = store.list_steps(task_id).await?;
        let artifacts = collect_artifacts(&ctx.artifacts_dir);
        let report = write_classic_report(
            &ctx.ws_root,
            task_id,
            &task.goal,
            &plan,
            &steps,
            &artifacts,
        )?;
        store
            .update_task(
                task_id,
                TaskUpdate {
                    output_path: Some(report.markdown.display().to_string()),
                    ..TaskUpdate::default()
                },
            )
            .await?;

        let verdict = roles::critic_review(
            runner.provider.as_ref(),
            &ctx.model,
            &task.goal,
            &plan,
            &Value::Array(artifacts),
            &ctx.skill_prompt,
        )
        .await
        .map_err(|err| anyhow::anyhow!("critic review failed: {err}"))?;

        if verdict.ok {
            if runner.is_canceled(task_id).await {
                return Ok(());
            }
            store
                .update_task(
                    task_id,
                    TaskUpdate {
                        status: Some(TaskStatus::Succeeded),
                        error: Some(None),
                        ..TaskUpdate::default()
                    },
                )
                .await?;
            runner.policy.clear_task_grants(task_id).await;
            return Ok(());
        }

        if verdict.fix_steps.is_empty() {
            anyhow::bail!("Critic reported issues but provided no fix steps.");
        }
        roles::apply_patch(store, task_id, &roles::append_patch("critic_fix", verdict.fix_steps))
            .await?;
        if runner.is_canceled(task_id).await {
            return Ok(());
        }
        store
            .update_task(task_id, TaskUpdate::status(TaskStatus::Running))
            .await?;
    }

    anyhow::bail!("Exceeded critic iterations; run did not converge.");
}

async fn fail_step_and_task(
    runner: &Runner,
    task_id: &str,
    step_id: &str,
    message: &str,
) -> anyhow::Result<()> {
    runner
        .store
        .update_step(
            step_id,
            StepUpdate {
                status: Some(StepStatus::Failed),
                error: Some(Some(message.to_string())),
                ..StepUpdate::default()
            },
        )
        .await?;
    if !runner.is_canceled(task_id).await {
        runner
            .store
            .update_task(task_id, TaskUpdate::failed(message))
            .await?;
    }
    runner.policy.clear_task_grants(task_id).await;
    Ok(())
}

/// Create the approval row, surface it on the chat timeline and the bus, and
/// park the task. The worker returns; the approval decision spawns a fresh
/// one that re-reads persisted state.
pub(crate) async fn pause_for_approval(
    runner: &Runner,
    task_id: &str,
    step_id: &str,
    tool: &str,
) -> anyhow::Result<()> {
    let store = &runner.store;
    let scope = scope_for_tool(tool);
    let approval = store.create_approval(task_id, step_id).await?;

    store
        .append_chat_message(task_id, Some(step_id), "system", &approval_chat_text(tool, scope))
        .await?;
    let seq = store
        .append_event(
            task_id,
            Some(step_id),
            "approval_requested",
            json!({"tool": tool, "scope": scope.as_str(), "approval_id": approval.id.clone()}),
        )
        .await?;
    store.bus().publish(EngineEvent::new(
        "approval_requested",
        json!({"task_id": task_id, "step_id": step_id, "tool": tool,
               "scope": scope.as_str(), "approval_id": approval.id, "seq": seq}),
    ));

    store
        .update_step(
            step_id,
            StepUpdate {
                status: Some(StepStatus::WaitingApproval),
                requires_approval: Some(true),
                ..StepUpdate::default()
            },
        )
        .await?;
    store
        .update_task(task_id, TaskUpdate::status(TaskStatus::WaitingApproval))
        .await?;
    Ok(())
}
