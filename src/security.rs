//! 安全分类器：工具调用与代码串的 deny-list 检查
//!
//! 语法层面的已知危险形状匹配，不做语义分析：没有命中只代表「默认放行」，
//! 不代表「验证安全」。命中后的最后防线是人工确认握手（elicitation）。
//! 分类是纯函数，无副作用、不触网不读盘，可在分发路径上同步内联执行。

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

/// 分类结论：clear=true 放行；否则 reason 携带给人看的危险描述
#[derive(Debug, Clone, Serialize)]
pub struct SecurityVerdict {
    pub clear: bool,
    pub reason: Option<String>,
}

impl SecurityVerdict {
    pub fn clear() -> Self {
        Self {
            clear: true,
            reason: None,
        }
    }

    pub fn flagged(reason: impl Into<String>) -> Self {
        Self {
            clear: false,
            reason: Some(reason.into()),
        }
    }
}

/// 硬危险调用：无论确认与否都必须标记（进程派生、动态求值、序列化、网络）
const HARD_DENY_KEYWORDS: &[&str] = &[
    "os.system",
    "subprocess",
    "eval(",
    "exec(",
    "__import__",
    "compile(",
    "pickle",
    "marshal",
    "socket",
    "urllib",
    "requests",
    "http.client",
    "https.client",
];

/// 文件删除操作关键字
const DELETE_KEYWORDS: &[&str] = &[
    "os.remove",
    "os.unlink",
    "os.rmdir",
    "os.removedirs",
    "shutil.rmtree",
    ".unlink",
    ".rmdir",
];

/// 目录列举/创建操作关键字
const DIR_KEYWORDS: &[&str] = &["os.mkdir", "os.makedirs", "os.listdir", "os.walk"];

/// open() 的写模式字面量
const WRITE_MODES: &[&str] = &["'w'", "\"w\"", "'a'", "\"a\"", "'x'", "\"x\""];

/// 危险系统命令签名（递归删除、格式化、关机重启、提权）
fn destructive_command_patterns() -> &'static Vec<Regex> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"\brm\s+-rf",
            r"\brm\s+-fr",
            r"\bformat\s+",
            r"\bdel\s+/f\s+/s\s+/q",
            r"remove-item\s+-recurse\s+-force",
            r"\bshutdown\b",
            r"\breboot\b",
            r"\bhalt\b",
            r"\bpoweroff\b",
            r"\bsudo\s+",
            r"\bsu\s+",
            r"\bpasswd\s+",
            r"\bmkfs\b",
            r"\bdd\s+if=",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// 安全分类器：仅持有配置层叠加的危险命令表，其余全部为常量 deny-list
pub struct SecurityClassifier {
    dangerous_commands: Vec<String>,
}

impl SecurityClassifier {
    pub fn new(dangerous_commands: Vec<String>) -> Self {
        let dangerous_commands = dangerous_commands
            .into_iter()
            .map(|c| c.to_lowercase())
            .collect();
        Self { dangerous_commands }
    }

    /// 按工具名分派：execute_python 查 code 参数，system_command 查 command 参数，
    /// 其余工具默认放行（乐观策略）
    pub fn classify(&self, tool: &str, args: &serde_json::Value) -> SecurityVerdict {
        match tool {
            "execute_python" => {
                let code = args.get("code").and_then(|v| v.as_str()).unwrap_or("");
                self.classify_code(code)
            }
            "system_command" => {
                let command = args.get("command").and_then(|v| v.as_str()).unwrap_or("");
                self.classify_command(command)
            }
            _ => SecurityVerdict::clear(),
        }
    }

    /// 代码串分类，按优先级：硬危险调用 → 写模式 open → 文件删除 → 目录操作
    pub fn classify_code(&self, code: &str) -> SecurityVerdict {
        let lower = code.to_lowercase();

        for keyword in HARD_DENY_KEYWORDS {
            if lower.contains(keyword) {
                return SecurityVerdict::flagged(format!(
                    "检测到危险操作: {}，是否确认执行？",
                    keyword
                ));
            }
        }

        if lower.contains("open(") {
            if let Some(mode) = WRITE_MODES.iter().find(|m| lower.contains(**m)) {
                let files = extract_literal_paths(code, &["open("]);
                return if files.is_empty() {
                    SecurityVerdict::flagged(format!(
                        "检测到文件写入操作（模式 {}），是否确认执行？",
                        mode
                    ))
                } else {
                    SecurityVerdict::flagged(format!(
                        "检测到文件写入操作（模式 {}），要写入的文件: {}，是否确认执行？",
                        mode,
                        files.join(", ")
                    ))
                };
            }
        }

        let delete_ops: Vec<&str> = DELETE_KEYWORDS
            .iter()
            .copied()
            .filter(|op| lower.contains(*op))
            .collect();
        if !delete_ops.is_empty() {
            let files = extract_literal_paths(code, &delete_ops);
            return if files.is_empty() {
                SecurityVerdict::flagged("检测到文件删除操作，是否确认执行？")
            } else {
                SecurityVerdict::flagged(format!(
                    "检测到文件删除操作，要删除的文件: {}，是否确认执行？",
                    files.join(", ")
                ))
            };
        }

        for op in DIR_KEYWORDS {
            if lower.contains(op) {
                let dirs = extract_literal_paths(code, &[op]);
                return if dirs.is_empty() {
                    SecurityVerdict::flagged("检测到目录操作，是否确认执行？")
                } else {
                    SecurityVerdict::flagged(format!(
                        "检测到目录操作，操作的目录: {}，是否确认执行？",
                        dirs.join(", ")
                    ))
                };
            }
        }

        SecurityVerdict::clear()
    }

    /// 系统命令分类：内置破坏性签名 + 配置叠加表，大小写不敏感
    pub fn classify_command(&self, command: &str) -> SecurityVerdict {
        let lower = command.to_lowercase();

        for pattern in destructive_command_patterns() {
            if pattern.is_match(&lower) {
                return SecurityVerdict::flagged(format!(
                    "检测到危险系统命令: {}，是否确认执行？",
                    pattern.as_str()
                ));
            }
        }

        for dangerous in &self.dangerous_commands {
            if lower.contains(dangerous) {
                return SecurityVerdict::flagged(format!(
                    "检测到危险命令: {}，是否确认执行？",
                    dangerous
                ));
            }
        }

        SecurityVerdict::clear()
    }
}

/// 提取指定操作调用里的字面路径参数：引号字符串优先，否则记变量名；
/// 去重、过滤写模式字面量，最多返回 5 个
fn extract_literal_paths(code: &str, operations: &[&str]) -> Vec<String> {
    static SINGLE: OnceLock<Regex> = OnceLock::new();
    static DOUBLE: OnceLock<Regex> = OnceLock::new();
    static IDENT: OnceLock<Regex> = OnceLock::new();
    let single = SINGLE.get_or_init(|| Regex::new(r"'([^'\\]*(?:\\.[^'\\]*)*)'").unwrap());
    let double = DOUBLE.get_or_init(|| Regex::new(r#""([^"\\]*(?:\\.[^"\\]*)*)""#).unwrap());
    let ident = IDENT.get_or_init(|| Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\b").unwrap());

    let filter_keywords = ["w", "a", "x", "r", "rb", "wb"];
    let mut paths: Vec<String> = Vec::new();

    for op in operations {
        let pattern = if op.contains('(') {
            format!(r"{}\s*([^)]*)", regex::escape(op))
        } else {
            format!(r"{}\s*\(\s*([^)]*)\s*\)", regex::escape(op))
        };
        let Ok(re) = Regex::new(&pattern) else {
            continue;
        };
        for cap in re.captures_iter(code) {
            let inner = cap.get(1).map(|m| m.as_str()).unwrap_or("");
            let mut found_literal = false;
            for m in single.captures_iter(inner).chain(double.captures_iter(inner)) {
                let path = m.get(1).map(|p| p.as_str()).unwrap_or("");
                if !path.is_empty() && !filter_keywords.contains(&path) {
                    found_literal = true;
                    if !paths.iter().any(|p| p == path) {
                        paths.push(path.to_string());
                    }
                }
            }
            if !found_literal {
                for m in ident.captures_iter(inner) {
                    let var = m.get(1).map(|v| v.as_str()).unwrap_or("");
                    if var.is_empty()
                        || ["True", "False", "None"].contains(&var)
                        || filter_keywords.contains(&var)
                    {
                        continue;
                    }
                    let tagged = format!("{} (变量)", var);
                    if !paths.iter().any(|p| p == &tagged) {
                        paths.push(tagged);
                    }
                }
            }
        }
    }

    paths.truncate(5);
    paths
}
