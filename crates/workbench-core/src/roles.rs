// LLM roles: planner, executor (plan patcher), critic.
// All three speak strict JSON over an OpenAI-compatible chat boundary.

use serde_json::Value;

use workbench_providers::{ChatMessage, ChatProvider, ChatRequest};
use workbench_store::Store;
use workbench_types::{CriticVerdict, Plan, PlanPatch, PlanStep};

pub const MAX_PLAN_STEPS: usize = 25;
pub const MAX_CRITIC_ITERATIONS: usize = 3;

pub const PLANNER_SYSTEM: &str = r#"You are an expert autonomous agent planner.

You must create a step-by-step executable plan for the user's goal.
Your plan must be STRICT JSON (no markdown, no backticks), matching this schema:

{
  "summary": "short summary",
  "artifacts": [{"path":"relative/output/path.ext","description":"what it contains"}],
  "steps": [
     {
       "name": "short step name",
       "tool": "tool_name",
       "args": { ... },
       "requires_approval": true|false
     }
  ]
}

Rules:
- Use only tools from the provided ALLOWED_TOOLS list.
- Prefer fewer steps, but DO NOT skip critical steps.
- All file paths must be relative to the workspace root.
- If an action could modify files, execute shell commands, or click/submit in browser, set requires_approval=true.
- If you need to produce a report, output Markdown and also an HTML version.
"#;

pub const EXECUTOR_SYSTEM: &str = r#"You are an expert autonomous agent executor.

You will be given:
- the plan JSON
- the current step index
- tool results so far

You must decide if the plan is still valid and may propose a patch ONLY if needed.
Any patch must be STRICT JSON:

{
  "patch": {
     "reason": "...",
     "add_steps": [ ... same step schema ... ],
     "replace_steps_from_idx": null | integer,
     "remove_steps": [integer, ...]
  }
}

If no patch is needed, output STRICT JSON: {"patch": null}

Constraints:
- Use only ALLOWED_TOOLS.
- Do not exceed 25 total steps after patch.
"#;

pub const CRITIC_SYSTEM: &str = r#"You are a rigorous reviewer (critic) for an autonomous agent run.

You will be given the goal, plan, and produced artifacts.
You must:
1) Check whether the artifacts fully satisfy the goal.
2) If incomplete, propose additional steps to fix, in STRICT JSON:
   {"ok": false, "issues": ["..."], "fix_steps":[ ... step schema ... ]}
3) If complete, output:
   {"ok": true, "issues": [], "fix_steps":[]}

Constraints:
- Use only ALLOWED_TOOLS.
- Prefer minimal fix steps.
"#;

/// Pull the first JSON object out of a model reply. Models wrap JSON in prose
/// or fences often enough that a brace-window scan is worth it.
pub fn extract_json(text: &str) -> anyhow::Result<Value> {
    let trimmed = text.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Ok(serde_json::from_str(trimmed)?);
    }
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    if let (Some(start), Some(end)) = (start, end) {
        if end > start {
            return Ok(serde_json::from_str(&trimmed[start..=end])?);
        }
    }
    anyhow::bail!("no JSON object found in model output");
}

fn role_system(base: &str, skill_system_prompt: &str, tools_summary: &str) -> String {
    let mut out = base.to_string();
    if !skill_system_prompt.trim().is_empty() {
        out.push_str("\n\nSKILL_CONTEXT:\n");
        out.push_str(skill_system_prompt.trim());
    }
    out.push_str("\n\nALLOWED_TOOLS:\n");
    out.push_str(tools_summary);
    out
}

fn validate_plan(mut plan: Plan, allowed_tools: &[String]) -> anyhow::Result<Plan> {
    if plan.steps.is_empty() {
        anyhow::bail!("plan must include non-empty steps");
    }
    for step in &plan.steps {
        if step.tool.trim().is_empty() {
            anyhow::bail!("each step must include a tool");
        }
        if !allowed_tools.is_empty() && !allowed_tools.contains(&step.tool) {
            anyhow::bail!("step tool not allowed: {}", step.tool);
        }
        if step.args.is_null() {
            anyhow::bail!("each step must include args");
        }
    }
    if plan.summary.trim().is_empty() {
        plan.summary = "Run".to_string();
    }
    Ok(plan)
}

/// Generate a plan for the goal. On a JSON parse failure, one repair call is
/// made; a second failure is a planning error.
pub async fn generate_plan(
    provider: &dyn ChatProvider,
    model: &str,
    goal: &str,
    allowed_tools: &[String],
    tools_summary: &str,
    skill_system_prompt: &str,
) -> anyhow::Result<Plan> {
    let system = role_system(PLANNER_SYSTEM, skill_system_prompt, tools_summary);
    let user = format!("GOAL:\n{goal}\n\nReturn only strict JSON as specified.");
    let messages = vec![ChatMessage::system(system.clone()), ChatMessage::user(user.clone())];
    let response = provider
        .chat(ChatRequest::new(model, messages).json())
        .await?;

    let value = match extract_json(&response.content) {
        Ok(value) => value,
        Err(_) => {
            let repair = vec![
                ChatMessage::system(system),
                ChatMessage::user(user),
                ChatMessage::assistant(response.content.clone()),
                ChatMessage::system(
                    "You output invalid JSON. Output ONLY valid JSON for the plan schema. No markdown."
                        .to_string(),
                ),
            ];
            let second = provider.chat(ChatRequest::new(model, repair).json()).await?;
            extract_json(&second.content)
                .map_err(|_| anyhow::anyhow!("planner returned unparseable JSON twice"))?
        }
    };

    let plan: Plan = serde_json::from_value(value)
        .map_err(|e| anyhow::anyhow!("planner JSON does not match the plan schema: {e}"))?;
    validate_plan(plan, allowed_tools)
}

/// Ask the executor role for a plan patch. Patching is best-effort: any
/// parse or shape failure yields `None`.
pub async fn propose_patch(
    provider: &dyn ChatProvider,
    model: &str,
    goal: &str,
    plan: &Plan,
    current_step_idx: i64,
    recent_results: &[Value],
    tools_summary: &str,
    skill_system_prompt: &str,
) -> Option<PlanPatch> {
    let system = role_system(EXECUTOR_SYSTEM, skill_system_prompt, tools_summary);
    let tail: Vec<&Value> = recent_results.iter().rev().take(3).rev().collect();
    let user = serde_json::json!({
        "goal": goal,
        "current_step_idx": current_step_idx,
        "plan": plan,
        "recent_results": tail,
    });
    let messages = vec![
        ChatMessage::system(system),
        ChatMessage::user(user.to_string()),
    ];
    let response = provider
        .chat(ChatRequest::new(model, messages).json())
        .await
        .ok()?;
    let value = extract_json(&response.content).ok()?;
    let patch = value.get("patch")?;
    if patch.is_null() {
        return None;
    }
    serde_json::from_value(patch.clone()).ok()
}

/// Run the critic over the finished plan. Invalid JSON here fails the task.
pub async fn critic_review(
    provider: &dyn ChatProvider,
    model: &str,
    goal: &str,
    plan: &Plan,
    artifacts: &Value,
    skill_system_prompt: &str,
) -> anyhow::Result<CriticVerdict> {
    let mut system = CRITIC_SYSTEM.to_string();
    if !skill_system_prompt.trim().is_empty() {
        system.push_str("\n\nSKILL_CONTEXT:\n");
        system.push_str(skill_system_prompt.trim());
    }
    let user = serde_json::json!({"goal": goal, "plan": plan, "artifacts": artifacts});
    let messages = vec![
        ChatMessage::system(system),
        ChatMessage::user(user.to_string()),
    ];
    let response = provider
        .chat(ChatRequest::new(model, messages).json())
        .await?;
    let value = extract_json(&response.content)?;
    Ok(serde_json::from_value(value)?)
}

/// Apply a plan patch to the step table: remove listed idxs, then either
/// replace from an index or append after the current maximum. A patch that
/// would push the plan past the step cap is rejected before any deletion.
pub async fn apply_patch(
    store: &Store,
    task_id: &str,
    patch: &PlanPatch,
) -> anyhow::Result<()> {
    let steps = store.list_steps(task_id).await?;
    let surviving = steps
        .iter()
        .filter(|s| !patch.remove_steps.contains(&s.idx))
        .filter(|s| match patch.replace_steps_from_idx {
            Some(from) => s.idx < from,
            None => true,
        })
        .count();
    if surviving + patch.add_steps.len() > MAX_PLAN_STEPS {
        anyhow::bail!("plan exceeds {MAX_PLAN_STEPS} steps after patch");
    }

    for idx in &patch.remove_steps {
        store.delete_step_at_idx(task_id, *idx).await?;
    }
    if let Some(from) = patch.replace_steps_from_idx {
        store.delete_steps_from_idx(task_id, from).await?;
        store.insert_plan_steps(task_id, &patch.add_steps, from).await?;
    } else {
        let start = store.max_step_idx(task_id).await?.map(|m| m + 1).unwrap_or(0);
        store.insert_plan_steps(task_id, &patch.add_steps, start).await?;
    }
    Ok(())
}

/// Append-only patch used when the critic proposes fix steps.
pub fn append_patch(reason: &str, fix_steps: Vec<PlanStep>) -> PlanPatch {
    PlanPatch {
        reason: reason.to_string(),
        add_steps: fix_steps,
        replace_steps_from_idx: None,
        remove_steps: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use workbench_store::EventBus;
    use workbench_types::Mode;

    #[test]
    fn extract_json_handles_fenced_output() {
        let value = extract_json("```json\n{\"ok\": true}\n```").unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn extract_json_rejects_prose() {
        assert!(extract_json("I could not produce a plan.").is_err());
    }

    #[test]
    fn plan_validation_enforces_allowlist() {
        let plan: Plan = serde_json::from_value(json!({
            "summary": "",
            "steps": [{"name": "s", "tool": "shell.exec", "args": {"command": "ls"}}]
        }))
        .unwrap();
        let err = validate_plan(plan.clone(), &["filesystem.list".to_string()]).unwrap_err();
        assert!(err.to_string().contains("not allowed"));

        let ok = validate_plan(plan, &[]).unwrap();
        assert_eq!(ok.summary, "Run");
    }

    #[test]
    fn plan_validation_rejects_empty_steps() {
        let plan: Plan = serde_json::from_value(json!({"summary": "x", "steps": []})).unwrap();
        assert!(validate_plan(plan, &[]).is_err());
    }

    async fn store_with_task(step_count: usize) -> (Store, String, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("wb.db"), EventBus::new())
            .await
            .unwrap();
        let ws = store.create_workspace("W", "/tmp/w").await.unwrap();
        let skill = store
            .create_skill("S", None, None, "p", &[], Mode::Fast)
            .await
            .unwrap();
        let task = store
            .create_task(&ws.id, &skill.id, "goal", Mode::Fast, None)
            .await
            .unwrap();
        let steps: Vec<PlanStep> = (0..step_count)
            .map(|i| PlanStep {
                name: format!("s{i}"),
                tool: "filesystem.list".to_string(),
                args: json!({}),
                requires_approval: false,
            })
            .collect();
        store.insert_plan_steps(&task.id, &steps, 0).await.unwrap();
        (store, task.id, dir)
    }

    fn step(name: &str) -> PlanStep {
        PlanStep {
            name: name.to_string(),
            tool: "filesystem.list".to_string(),
            args: json!({}),
            requires_approval: false,
        }
    }

    #[tokio::test]
    async fn append_patch_adds_after_max_idx() {
        let (store, task_id, _dir) = store_with_task(2).await;
        apply_patch(&store, &task_id, &append_patch("fix", vec![step("added")]))
            .await
            .unwrap();
        let steps = store.list_steps(&task_id).await.unwrap();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[2].idx, 2);
        assert_eq!(steps[2].name, "added");
    }

    #[tokio::test]
    async fn remove_then_replace_applies_in_order() {
        let (store, task_id, _dir) = store_with_task(5).await;
        let patch = PlanPatch {
            reason: "rework tail".to_string(),
            add_steps: vec![step("n1"), step("n2")],
            replace_steps_from_idx: Some(3),
            remove_steps: vec![1],
        };
        apply_patch(&store, &task_id, &patch).await.unwrap();
        let steps = store.list_steps(&task_id).await.unwrap();
        // idx 1 removed, idxs 3..4 replaced by two new steps at 3 and 4.
        let idxs: Vec<i64> = steps.iter().map(|s| s.idx).collect();
        assert_eq!(idxs, vec![0, 2, 3, 4]);
        assert_eq!(steps[2].name, "n1");
        assert_eq!(steps[3].name, "n2");
    }

    #[tokio::test]
    async fn patch_beyond_cap_is_rejected_without_mutation() {
        let (store, task_id, _dir) = store_with_task(24).await;
        let patch = append_patch("too big", vec![step("a"), step("b")]);
        let err = apply_patch(&store, &task_id, &patch).await.unwrap_err();
        assert!(err.to_string().contains("exceeds 25 steps"));
        assert_eq!(store.count_steps(&task_id).await.unwrap(), 24);

        // Exactly at the cap is fine.
        let ok = append_patch("fits", vec![step("a")]);
        apply_patch(&store, &task_id, &ok).await.unwrap();
        assert_eq!(store.count_steps(&task_id).await.unwrap(), 25);
    }
}
