//! 确认协调器：危险操作的人机 confirm/decline 握手
//!
//! 状态机：Idle → Pending(message) → {Approved, Declined, TimedOut→Declined}。
//! 每个请求恰好一次决议：挂起的步骤通过 oneshot future 在原执行上下文恢复，
//! 应答则来自另一条控制路径（人机输入）。超时自动拒绝并清除 Pending。

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::core::events::ProgressEvent;
use crate::core::AgentError;

type EventSender = tokio::sync::mpsc::UnboundedSender<ProgressEvent>;

/// 确认协调器：同一会话同时至多一个待确认请求
pub struct ElicitationCoordinator {
    pending: Mutex<Option<oneshot::Sender<bool>>>,
    timeout: Duration,
    event_tx: Mutex<Option<EventSender>>,
}

impl ElicitationCoordinator {
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            pending: Mutex::new(None),
            timeout: Duration::from_secs(timeout_secs),
            event_tx: Mutex::new(None),
        }
    }

    /// 安装事件通道（ElicitationRequested 的出口）
    pub fn set_event_sender(&self, tx: EventSender) {
        *self.event_tx.lock().unwrap() = Some(tx);
    }

    /// 发起确认请求并阻塞等待应答；超时返回 false（视为拒绝）。
    /// 已有待确认请求时违反 1:1 不变量，报 Elicitation 错误。
    pub async fn request(&self, message: &str) -> Result<bool, AgentError> {
        let rx = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_some() {
                return Err(AgentError::Elicitation(
                    "已有待确认请求未应答".to_string(),
                ));
            }
            let (tx, rx) = oneshot::channel();
            *pending = Some(tx);
            rx
        };

        if let Some(tx) = self.event_tx.lock().unwrap().as_ref() {
            let _ = tx.send(ProgressEvent::ElicitationRequested {
                message: message.to_string(),
            });
        }
        tracing::info!(message = %message, "elicitation requested");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(approved)) => Ok(approved),
            // 发送端被丢弃（resolve 路径竞争失败）按拒绝处理
            Ok(Err(_)) => Ok(false),
            Err(_) => {
                // 超时：清除 Pending，之后迟到的 resolve 是 no-op
                self.pending.lock().unwrap().take();
                tracing::warn!("elicitation timed out, declining");
                Ok(false)
            }
        }
    }

    /// 应答当前待确认请求；没有待确认（或已决议）时为 no-op，返回 false
    pub fn resolve(&self, approved: bool) -> bool {
        let sender = self.pending.lock().unwrap().take();
        match sender {
            Some(tx) => tx.send(approved).is_ok(),
            None => false,
        }
    }

    /// 是否有待确认请求
    pub fn has_pending(&self) -> bool {
        self.pending.lock().unwrap().is_some()
    }
}
