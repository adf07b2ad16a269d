//! 意图解析：自然语言 → 结构化意图
//!
//! LLM 返回严格 JSON（intent/entities/confidence），经 repair_json 修复后
//! 解析。解析失败不报错，回落到保守默认（task/空实体/0.5）；置信度低于
//! 0.5 一律按代码请求处理，走生成代码的兜底路径。

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::core::AgentError;
use crate::jsonfix::repair_json;
use crate::llm::{ChatMessage, LlmClient};

/// 意图类别：明确的任务描述，或需要生成代码的模糊请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentKind {
    Task,
    Code,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::Task => "task",
            IntentKind::Code => "code",
        }
    }
}

/// 解析后的意图
#[derive(Debug, Clone)]
pub struct Intent {
    pub kind: IntentKind,
    pub raw_query: String,
    pub entities: BTreeMap<String, String>,
    pub confidence: f32,
}

#[derive(Debug, Deserialize)]
struct RawIntent {
    #[serde(default)]
    intent: String,
    #[serde(default)]
    entities: BTreeMap<String, serde_json::Value>,
    #[serde(default = "default_confidence")]
    confidence: f32,
}

fn default_confidence() -> f32 {
    0.5
}

const INTENT_SYSTEM_PROMPT: &str = r#"你是一个意图解析器。分析用户输入，输出严格的 JSON（不要任何额外文字、不要 Markdown 代码块）：
{"intent": "task" 或 "code", "entities": {"键": "值"}, "confidence": 0.0 到 1.0 的数字}

规则：
- 用户描述了一个明确的桌面任务（创建文件、整理文件夹、运行命令等）→ "task"
- 用户的请求模糊、开放，或显式要求写/跑代码 → "code"
- entities 放你识别出的关键参数（文件名、路径、命令等）
- confidence 表示你对分类的把握"#;

/// 意图解析器：持 LLM 客户端，解析永不失败
pub struct IntentResolver {
    llm: Arc<dyn LlmClient>,
}

impl IntentResolver {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 解析用户输入为意图；任何失败都回落到保守默认，不向上冒错
    pub async fn resolve(&self, query: &str) -> Intent {
        let messages = [
            ChatMessage::system(INTENT_SYSTEM_PROMPT),
            ChatMessage::user(query),
        ];

        let raw = match self.llm.complete(&messages).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "intent completion failed, using fallback");
                return fallback_intent(query);
            }
        };

        let parsed = match parse_raw_intent(&raw) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "intent unparseable after repair, using fallback");
                return fallback_intent(query);
            }
        };

        let mut kind = match parsed.intent.as_str() {
            "task" => IntentKind::Task,
            _ => IntentKind::Code,
        };
        let confidence = parsed.confidence.clamp(0.0, 1.0);
        // 低置信度一律走代码兜底，拿不准时宁可生成代码也不乱编计划
        if confidence < 0.5 {
            tracing::debug!(confidence, "low confidence, downgrading to code intent");
            kind = IntentKind::Code;
        }

        let entities = parsed
            .entities
            .into_iter()
            .map(|(k, v)| {
                let s = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, s)
            })
            .collect();

        Intent {
            kind,
            raw_query: query.to_string(),
            entities,
            confidence,
        }
    }
}

/// 修复后仍不可解析的输出报 JsonFormat（调用方回退，不上抛给最终用户）
fn parse_raw_intent(raw: &str) -> Result<RawIntent, AgentError> {
    let repaired = repair_json(raw);
    serde_json::from_str(&repaired).map_err(|e| AgentError::JsonFormat(e.to_string()))
}

fn fallback_intent(query: &str) -> Intent {
    Intent {
        kind: IntentKind::Task,
        raw_query: query.to_string(),
        entities: BTreeMap::new(),
        confidence: 0.5,
    }
}
