//! 沙箱执行器：在受限解释器子进程里执行代码串
//!
//! 隔离手段是导入层 deny-list（替换内建 __import__），不是 OS 级沙箱：
//! 进程控制、网络、序列化、低层 IPC、凭据工具类模块被拒绝导入，其余模块
//! （含 os、pathlib 等文件模块）放行。stdout/stderr 按行流式回调给调用方，
//! 交付尽力而为。执行中的任何异常都被捕获为 error 字段返回，不越过边界。
//! 无强制 wall-clock 超时，长任务交给上层中断机制处理。

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

/// 禁止导入的模块（deny-list；子模块按前缀同样拦截）
const DENIED_MODULES: &[&str] = &[
    // 进程派生与 shell
    "subprocess",
    "shutil",
    // 网络
    "socket",
    "http",
    "urllib",
    "ftplib",
    "telnetlib",
    // 序列化与底层
    "pickle",
    "marshal",
    "ctypes",
    "importlib",
    // 并发与 IPC
    "multiprocessing",
    "threading",
    "concurrent",
    "signal",
    "select",
    "selectors",
    "pty",
    "fcntl",
    "resource",
    // 凭据/散列工具
    "hashlib",
    "hmac",
    "secrets",
    // 存储与显示
    "sqlite3",
    "dbm",
    "webbrowser",
    "platform",
    "getpass",
];

/// 执行结果：output 为已捕获的标准输出，error 为异常/退出信息（二者可同时非空）
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub output: String,
    pub error: String,
}

/// 沙箱执行器：持解释器路径，execute 永不返回 Err
pub struct SandboxExecutor {
    interpreter: String,
}

impl SandboxExecutor {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }

    /// 拼出 harness 源码：deny-list 导入过滤前奏 + 用户代码
    ///
    /// 真实 __import__ 与黑名单闭包在守卫内部捕获，前奏随后删除自己的
    /// 全部顶层绑定，用户命名空间里拿不到绕过句柄。
    fn harness_source(code: &str) -> String {
        let deny_set = DENIED_MODULES
            .iter()
            .map(|m| format!("'{}'", m))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            r#"import builtins as _b
def _install_guard(real, deny):
    def _guarded_import(name, *args, **kwargs):
        root = name.split('.')[0]
        if root in deny:
            raise ImportError("模块 '%s' 被禁止在沙箱中导入（安全限制）" % name)
        return real(name, *args, **kwargs)
    return _guarded_import
_b.__import__ = _install_guard(_b.__import__, {{{deny_set}}})
del _b, _install_guard
{code}"#
        )
    }

    /// 执行代码串，stdout/stderr 逐行回调 on_output；异常与非零退出进 error 字段
    pub async fn execute(
        &self,
        code: &str,
        on_output: Option<mpsc::UnboundedSender<String>>,
    ) -> ExecutionOutcome {
        let harness = Self::harness_source(code);

        // -I 隔离模式：忽略用户 site-packages 与环境变量注入
        let mut child = match Command::new(&self.interpreter)
            .args(["-I", "-u", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                return ExecutionOutcome {
                    output: String::new(),
                    error: format!("解释器启动失败: {}", e),
                }
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(harness.as_bytes()).await {
                tracing::warn!(error = %e, "sandbox stdin write failed");
            }
            drop(stdin); // 关闭写端，解释器开始执行
        }

        // stdout/stderr 在独立任务中逐行读取，不阻塞编排控制流
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_tx = on_output.clone();
        let stdout_task = tokio::spawn(async move {
            let mut collected = String::new();
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    collected.push_str(&line);
                    collected.push('\n');
                    if let Some(tx) = &out_tx {
                        // 消费端关闭时静默丢弃，不中止执行
                        let _ = tx.send(line);
                    }
                }
            }
            collected
        });
        let err_tx = on_output;
        let stderr_task = tokio::spawn(async move {
            let mut collected = String::new();
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    collected.push_str(&line);
                    collected.push('\n');
                    if let Some(tx) = &err_tx {
                        let _ = tx.send(line);
                    }
                }
            }
            collected
        });

        let status = child.wait().await;
        let output = stdout_task.await.unwrap_or_default();
        let mut error = stderr_task.await.unwrap_or_default();

        match status {
            Ok(s) if s.success() => {}
            Ok(s) => {
                if error.is_empty() {
                    error = format!("执行错误: 退出码 {:?}", s.code());
                }
            }
            Err(e) => {
                error = format!("执行错误: {}\n{}", e, error);
            }
        }

        ExecutionOutcome { output, error }
    }
}
