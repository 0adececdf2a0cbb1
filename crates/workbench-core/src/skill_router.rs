use std::time::Duration;

use serde_json::json;

use workbench_providers::{ChatMessage, ChatProvider, ChatRequest};
use workbench_types::Skill;

const ROUTER_TIMEOUT: Duration = Duration::from_secs(4);

fn normalize(s: &str) -> String {
    s.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Offline routing fallback: score skills by keyword overlap against
/// name/description/source. Keyword groups cover English and Chinese goals.
pub fn heuristic_choose(goal: &str, skills: &[Skill]) -> String {
    let g = normalize(goal);
    if g.is_empty() {
        return skills[0].id.clone();
    }

    let keyword_groups: &[(&[&str], i64)] = &[
        (
            &[
                "research", "report", "paper", "survey", "search", "crawl", "调研", "研究",
                "论文", "报告", "检索",
            ],
            3,
        ),
        (
            &["file", "folder", "cleanup", "organize", "整理", "归档", "文件", "目录"],
            3,
        ),
        (
            &["media", "image", "audio", "video", "生成", "配音", "图片", "视频", "音频"],
            2,
        ),
        (
            &["code", "build", "debug", "repo", "项目", "代码", "修复", "开发"],
            2,
        ),
    ];

    let mut best = (skills[0].id.clone(), -1i64);
    for skill in skills {
        let text = normalize(&format!(
            "{} {} {}",
            skill.name,
            skill.description.as_deref().unwrap_or(""),
            skill.source_file.as_deref().unwrap_or("")
        ));
        let mut score = 0i64;
        for (keys, weight) in keyword_groups {
            for key in *keys {
                if g.contains(key) && text.contains(key) {
                    score += weight;
                }
            }
        }
        for token in g
            .split(|c: char| !c.is_alphanumeric() && !is_cjk(c))
            .filter(|t| t.chars().count() >= 2)
        {
            if text.contains(token) {
                score += 1;
            }
        }
        if score > best.1 {
            best = (skill.id.clone(), score);
        }
    }
    best.0
}

fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

/// Choose the best skill for a goal: an LLM JSON classifier when a provider
/// is available, keyword overlap otherwise. Never blocks task creation on a
/// routing failure.
pub async fn choose_skill_id(
    provider: Option<&dyn ChatProvider>,
    model: &str,
    goal: &str,
    skills: &[Skill],
    hint: Option<&str>,
) -> anyhow::Result<String> {
    if skills.is_empty() {
        anyhow::bail!("no skills available");
    }
    if skills.len() == 1 {
        return Ok(skills[0].id.clone());
    }

    let Some(provider) = provider else {
        return Ok(heuristic_choose(goal, skills));
    };

    let options: Vec<_> = skills
        .iter()
        .map(|s| {
            json!({
                "id": s.id,
                "name": s.name,
                "description": s.description.as_deref().unwrap_or(""),
            })
        })
        .collect();
    let system = "You are a router that selects the best skill for the user's goal.\n\
                  Pick exactly ONE skill id from the provided list.\n\
                  Return ONLY JSON: {\"skill_id\": \"...\", \"reason\": \"...\"}\n\
                  Do not include any other keys.";
    let mut user = json!({"goal": goal, "skills": options});
    if let Some(hint) = hint {
        user["hint"] = json!(hint);
    }

    let request = ChatRequest::new(
        model,
        vec![
            ChatMessage::system(system.to_string()),
            ChatMessage::user(user.to_string()),
        ],
    )
    .json()
    .with_timeout(ROUTER_TIMEOUT);

    match provider.chat(request).await {
        Ok(response) => {
            if let Ok(value) = crate::roles::extract_json(&response.content) {
                let skill_id = value
                    .get("skill_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .trim()
                    .to_string();
                if skills.iter().any(|s| s.id == skill_id) {
                    return Ok(skill_id);
                }
            }
            Ok(heuristic_choose(goal, skills))
        }
        Err(_) => Ok(heuristic_choose(goal, skills)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workbench_types::{now_iso, Mode};

    fn skill(id: &str, name: &str, description: &str) -> Skill {
        Skill {
            id: id.to_string(),
            name: name.to_string(),
            description: Some(description.to_string()),
            source_file: None,
            system_prompt: String::new(),
            allowed_tools: Vec::new(),
            default_mode: Mode::Fast,
            created_at: now_iso(),
            enabled: true,
        }
    }

    #[test]
    fn research_goal_routes_to_research_skill() {
        let skills = vec![
            skill("a", "File organizer", "cleanup folders"),
            skill("b", "Deep research", "research reports and papers"),
        ];
        assert_eq!(heuristic_choose("write a research report on RISC-V", &skills), "b");
    }

    #[test]
    fn cjk_goal_routes_by_keyword_group() {
        let skills = vec![
            skill("a", "文件整理", "整理 归档 文件"),
            skill("b", "Deep research", "research 调研 报告"),
        ];
        assert_eq!(heuristic_choose("帮我整理下载目录的文件", &skills), "a");
    }

    #[test]
    fn unmatched_goal_falls_back_to_first_skill() {
        let skills = vec![skill("a", "Alpha", ""), skill("b", "Beta", "")];
        assert_eq!(heuristic_choose("zzzz qqqq", &skills), "a");
    }

    #[tokio::test]
    async fn single_skill_short_circuits() {
        let skills = vec![skill("only", "Only", "")];
        let id = choose_skill_id(None, "m", "anything", &skills, None)
            .await
            .unwrap();
        assert_eq!(id, "only");
    }

    #[tokio::test]
    async fn no_skills_is_an_error() {
        assert!(choose_skill_id(None, "m", "goal", &[], None).await.is_err());
    }
}
