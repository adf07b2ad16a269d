//! 编排过程事件：进度、确认请求与中断通过事件通道推送给前端
//!
//! 事件通道取代回调式 UI 通知，编排核心不感知任何展示技术。

use serde::Serialize;

/// 单次请求内的过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// 开始解析用户意图
    ResolvingIntent { query: String },
    /// 意图解析完成
    IntentResolved { kind: String, confidence: f32 },
    /// 任务计划生成完成
    PlanReady { summary: String, step_count: usize },
    /// 开始执行第 index 步（从 1 计）
    StepStarted {
        index: usize,
        total: usize,
        tool: String,
        description: String,
    },
    /// 步骤完成
    StepCompleted { index: usize, summary: String },
    /// 步骤失败（partial-failure：后续步骤仍会执行）
    StepFailed { index: usize, reason: String },
    /// 需要人工确认（危险操作）
    ElicitationRequested { message: String },
    /// 沙箱/工具的流式输出片段
    OutputChunk { text: String },
    /// 请求在步骤边界被中断
    Interrupted { completed_steps: usize },
    /// 整个计划执行完成
    Completed { summary: String },
    /// 错误
    Error { text: String },
}
