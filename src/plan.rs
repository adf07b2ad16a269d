//! 计划构建：意图 + 工具目录 → 有序步骤列表
//!
//! 任务意图走 LLM 规划（目录格式化进提示词，输出严格 JSON 经 repair_json
//! 修复）；代码意图或规划失败走兜底：单步 execute_python，代码由 LLM 生成。
//! 构建永不失败，最坏情况也给出一个可执行的单步计划。

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::AgentError;
use crate::intent::{Intent, IntentKind};
use crate::jsonfix::repair_json;
use crate::llm::{ChatMessage, LlmClient};
use crate::session::ToolDescriptor;

/// 计划中的一步：工具名、参数与人类可读描述
#[derive(Debug, Clone)]
pub struct Step {
    pub tool: String,
    pub args: Value,
    pub description: String,
}

/// 执行计划
#[derive(Debug, Clone)]
pub struct Plan {
    pub summary: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    plan: String,
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    #[serde(default)]
    tool: String,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    description: String,
}

/// 计划构建器
pub struct PlanBuilder {
    llm: Arc<dyn LlmClient>,
}

impl PlanBuilder {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 为意图构建计划；失败时回落到单步代码计划，不向上冒错
    pub async fn build(&self, intent: &Intent, catalog: &[ToolDescriptor]) -> Plan {
        match intent.kind {
            IntentKind::Code => self.code_plan(&intent.raw_query).await,
            IntentKind::Task => match self.task_plan(intent, catalog).await {
                Ok(plan) => plan,
                Err(e) => {
                    tracing::warn!(error = %e, "task planning failed, falling back to code plan");
                    self.code_plan(&intent.raw_query).await
                }
            },
        }
    }

    async fn task_plan(
        &self,
        intent: &Intent,
        catalog: &[ToolDescriptor],
    ) -> Result<Plan, AgentError> {
        let entities = intent
            .entities
            .iter()
            .map(|(k, v)| format!("- {}: {}", k, v))
            .collect::<Vec<_>>()
            .join("\n");

        let system = format!(
            r#"你是一个任务规划器。根据用户需求和可用工具，输出严格的 JSON（不要任何额外文字、不要 Markdown 代码块）：
{{"plan": "计划的一句话概述", "steps": [{{"tool": "工具名", "args": {{...}}, "description": "这一步做什么"}}]}}

可用工具：
{}

规则：
- tool 必须是上面列出的工具之一
- args 必须符合该工具的参数定义
- 步骤按执行顺序排列，能合并的操作合并成一步"#,
            format_catalog(catalog)
        );

        let user = if entities.is_empty() {
            intent.raw_query.clone()
        } else {
            format!("{}\n\n已识别的参数：\n{}", intent.raw_query, entities)
        };

        let messages = [ChatMessage::system(system), ChatMessage::user(user)];
        let raw = self
            .llm
            .complete(&messages)
            .await
            .map_err(AgentError::Planning)?;

        let repaired = repair_json(&raw);
        let parsed: RawPlan = serde_json::from_str(&repaired)
            .map_err(|e| AgentError::JsonFormat(e.to_string()))?;

        // 空计划或缺工具名的步骤视为规划失败
        if parsed.steps.is_empty() || parsed.steps.iter().any(|s| s.tool.is_empty()) {
            return Err(AgentError::Planning(
                "计划为空或存在缺工具名的步骤".to_string(),
            ));
        }

        let steps = parsed
            .steps
            .into_iter()
            .map(|s| Step {
                tool: s.tool,
                args: if s.args.is_null() { json!({}) } else { s.args },
                description: s.description,
            })
            .collect();

        Ok(Plan {
            summary: parsed.plan,
            steps,
        })
    }

    /// 兜底路径：让 LLM 生成 Python 代码，包成单步 execute_python 计划
    async fn code_plan(&self, query: &str) -> Plan {
        let messages = [
            ChatMessage::system(
                "你是一个 Python 代码生成器。根据用户需求输出可直接运行的 Python 代码，\
                 只输出代码本身，不要解释、不要 Markdown 代码块。用 print 输出结果。",
            ),
            ChatMessage::user(query),
        ];

        let code = match self.llm.complete(&messages).await {
            Ok(text) => strip_code_fences(&text),
            Err(e) => {
                tracing::warn!(error = %e, "code generation failed");
                format!("print({:?})", format!("无法生成代码: {}", e))
            }
        };

        Plan {
            summary: "执行生成的 Python 代码".to_string(),
            steps: vec![Step {
                tool: "execute_python".to_string(),
                args: json!({"code": code}),
                description: "执行生成的 Python 代码".to_string(),
            }],
        }
    }
}

/// 把工具目录格式化进提示词：名称、说明、参数名/类型/是否必填
fn format_catalog(catalog: &[ToolDescriptor]) -> String {
    if catalog.is_empty() {
        return "（无可用工具）".to_string();
    }
    catalog
        .iter()
        .map(|tool| {
            let mut lines = vec![format!("- {}: {}", tool.name, tool.description)];
            let required: Vec<&str> = tool
                .parameters
                .get("required")
                .and_then(|r| r.as_array())
                .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
                .unwrap_or_default();
            if let Some(props) = tool.parameters.get("properties").and_then(|p| p.as_object()) {
                for (name, schema) in props {
                    let ty = schema.get("type").and_then(|t| t.as_str()).unwrap_or("any");
                    let req = if required.contains(&name.as_str()) {
                        "必填"
                    } else {
                        "可选"
                    };
                    lines.push(format!("    {} ({}, {})", name, ty, req));
                }
            }
            lines.join("\n")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// 剥掉 LLM 偶尔仍会包上的 Markdown 代码块
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let inner: Vec<&str> = trimmed
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect();
    inner.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::IntentKind;
    use crate::llm::MockLlmClient;
    use std::collections::BTreeMap;

    fn intent(kind: IntentKind, query: &str) -> Intent {
        Intent {
            kind,
            raw_query: query.to_string(),
            entities: BTreeMap::new(),
            confidence: 0.9,
        }
    }

    fn catalog() -> Vec<ToolDescriptor> {
        vec![ToolDescriptor {
            name: "file_operations".to_string(),
            description: "文件操作".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "operation": {"type": "string"},
                    "path": {"type": "string"}
                },
                "required": ["operation", "path"]
            }),
        }]
    }

    #[tokio::test]
    async fn task_intent_produces_multi_step_plan() {
        let llm = MockLlmClient::scripted([r#"{
            "plan": "创建两个文件",
            "steps": [
                {"tool": "file_operations", "args": {"operation": "create", "path": "a.txt"}, "description": "创建 a.txt"},
                {"tool": "file_operations", "args": {"operation": "create", "path": "b.txt"}, "description": "创建 b.txt"}
            ]
        }"#]);
        let builder = PlanBuilder::new(Arc::new(llm));
        let plan = builder
            .build(&intent(IntentKind::Task, "创建 a.txt 和 b.txt"), &catalog())
            .await;
        assert_eq!(plan.summary, "创建两个文件");
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].tool, "file_operations");
    }

    #[tokio::test]
    async fn code_intent_wraps_generated_code() {
        let llm = MockLlmClient::scripted(["```python\nprint(1 + 1)\n```"]);
        let builder = PlanBuilder::new(Arc::new(llm));
        let plan = builder.build(&intent(IntentKind::Code, "算 1+1"), &catalog()).await;
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].tool, "execute_python");
        assert_eq!(plan.steps[0].args["code"], "print(1 + 1)");
    }

    #[tokio::test]
    async fn unparseable_plan_falls_back_to_code_step() {
        // 第一条应答规划失败，第二条用于兜底的代码生成
        let llm = MockLlmClient::scripted(["这不是 JSON", "print('fallback')"]);
        let builder = PlanBuilder::new(Arc::new(llm));
        let plan = builder
            .build(&intent(IntentKind::Task, "做点什么"), &catalog())
            .await;
        assert_eq!(plan.summary, "执行生成的 Python 代码");
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].args["code"], "print('fallback')");
    }

    #[tokio::test]
    async fn empty_step_list_is_rejected() {
        let llm = MockLlmClient::scripted([r#"{"plan": "空计划", "steps": []}"#, "print('x')"]);
        let builder = PlanBuilder::new(Arc::new(llm));
        let plan = builder
            .build(&intent(IntentKind::Task, "做点什么"), &catalog())
            .await;
        assert_eq!(plan.steps[0].tool, "execute_python");
    }

    #[tokio::test]
    async fn planning_failures_are_typed() {
        let llm = MockLlmClient::scripted([r#"{"plan": "空", "steps": []}"#, "不是 JSON"]);
        let builder = PlanBuilder::new(Arc::new(llm));
        let i = intent(IntentKind::Task, "做点什么");

        let err = builder.task_plan(&i, &catalog()).await.unwrap_err();
        assert!(matches!(err, AgentError::Planning(_)));

        let err = builder.task_plan(&i, &catalog()).await.unwrap_err();
        assert!(matches!(err, AgentError::JsonFormat(_)));
    }

    #[test]
    fn catalog_formatting_lists_params() {
        let text = format_catalog(&catalog());
        assert!(text.contains("file_operations"));
        assert!(text.contains("operation (string, 必填)"));
    }
}
