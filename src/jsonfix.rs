//! JSON 修复：生成后端的结构化输出常带各种缺陷
//!
//! 所有「字符串手术」集中在 repair_json 一个函数里，业务逻辑只见修复后的
//! 字符串。能处理：markdown 围栏、行内 // 注释、JSON 块外杂文、尾逗号、
//! 未闭合的字符串 / 方括号 / 花括号。修不动的输入原样返回，由调用方回退。

/// 修复常见 JSON 缺陷后返回新字符串（尽力而为，不保证可解析）
pub fn repair_json(raw: &str) -> String {
    let s = strip_fences(raw);
    let s = strip_line_comments(&s);
    let s = extract_json_block(&s);
    let s = close_unterminated_string(&s);
    let s = strip_trailing_commas(&s);
    balance_brackets(&s)
}

/// 剥除 ```json ... ``` 或 ``` ... ``` 围栏
fn strip_fences(s: &str) -> String {
    let mut t = s.trim();
    if let Some(rest) = t.strip_prefix("```json") {
        t = rest;
    } else if let Some(rest) = t.strip_prefix("```") {
        t = rest;
    }
    if let Some(rest) = t.strip_suffix("```") {
        t = rest;
    }
    t.trim().to_string()
}

/// 去掉行尾 // 注释（字符串字面量内的 // 保留）
fn strip_line_comments(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for line in s.lines() {
        let mut in_str = false;
        let mut escaped = false;
        let mut cut = line.len();
        let bytes = line.as_bytes();
        for i in 0..bytes.len() {
            let c = bytes[i];
            if escaped {
                escaped = false;
                continue;
            }
            match c {
                b'\\' if in_str => escaped = true,
                b'"' => in_str = !in_str,
                b'/' if !in_str && i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                    cut = i;
                    break;
                }
                _ => {}
            }
        }
        out.push_str(&line[..cut]);
        out.push('\n');
    }
    out.trim().to_string()
}

/// 截取首个 '{' 到（可能缺失的）末个 '}' 之间的块，丢弃块外杂文
fn extract_json_block(s: &str) -> String {
    let Some(start) = s.find('{') else {
        return s.trim().to_string();
    };
    match s.rfind('}') {
        Some(end) if end >= start => s[start..=end].to_string(),
        // 右花括号缺失：取到末尾，交给 balance_brackets 补齐
        _ => s[start..].trim_end().to_string(),
    }
}

/// 末尾处于未闭合字符串内时补一个引号
fn close_unterminated_string(s: &str) -> String {
    let mut in_str = false;
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_str => escaped = true,
            '"' => in_str = !in_str,
            _ => {}
        }
    }
    if in_str {
        let mut out = s.to_string();
        out.push('"');
        out
    } else {
        s.to_string()
    }
}

/// 去掉 ,} 与 ,] 形式的尾逗号（跳过字符串内内容）
fn strip_trailing_commas(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_str = false;
    let mut escaped = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if escaped {
            escaped = false;
            out.push(c);
            i += 1;
            continue;
        }
        match c {
            '\\' if in_str => {
                escaped = true;
                out.push(c);
            }
            '"' => {
                in_str = !in_str;
                out.push(c);
            }
            ',' if !in_str => {
                // 向前看第一个非空白字符
                let mut j = i + 1;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                    // 丢弃该逗号
                } else {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
        i += 1;
    }
    out
}

/// 按栈补平未闭合的 { 与 [；多余的闭括号丢弃
fn balance_brackets(s: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut out = String::with_capacity(s.len());
    let mut in_str = false;
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            escaped = false;
            out.push(c);
            continue;
        }
        match c {
            '\\' if in_str => {
                escaped = true;
                out.push(c);
            }
            '"' => {
                in_str = !in_str;
                out.push(c);
            }
            '{' | '[' if !in_str => {
                stack.push(c);
                out.push(c);
            }
            '}' if !in_str => {
                if stack.last() == Some(&'{') {
                    stack.pop();
                    out.push(c);
                }
                // 不匹配的 } 丢弃
            }
            ']' if !in_str => {
                if stack.last() == Some(&'[') {
                    stack.pop();
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    while let Some(open) = stack.pop() {
        out.push(if open == '{' { '}' } else { ']' });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parses(s: &str) -> serde_json::Value {
        serde_json::from_str(&repair_json(s)).expect("repaired output should parse")
    }

    #[test]
    fn valid_json_survives_unchanged() {
        let src = r#"{"plan": "创建文件", "steps": [{"tool": "file_operations", "args": {"operation": "create"}}]}"#;
        assert_eq!(repair_json(src), src);
        let v = parses(src);
        assert_eq!(v["steps"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn strips_markdown_fences() {
        let v = parses("```json\n{\"intent\": \"task\"}\n```");
        assert_eq!(v["intent"], "task");
    }

    #[test]
    fn strips_bare_fences() {
        let v = parses("```\n{\"intent\": \"task\"}\n```");
        assert_eq!(v["intent"], "task");
    }

    #[test]
    fn strips_line_comments() {
        let v = parses("{\"a\": 1, // 说明\n\"b\": 2}");
        assert_eq!(v["b"], 2);
    }

    #[test]
    fn comment_like_inside_string_kept() {
        let v = parses(r#"{"url": "http://x//y"}"#);
        assert_eq!(v["url"], "http://x//y");
    }

    #[test]
    fn removes_trailing_comma_in_object() {
        let v = parses(r#"{"a": 1, "b": 2,}"#);
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn removes_trailing_comma_in_array() {
        let v = parses(r#"{"steps": [1, 2, 3,]}"#);
        assert_eq!(v["steps"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn closes_missing_brace() {
        let v = parses(r#"{"plan": "x", "steps": [{"tool": "execute_python"}]"#);
        assert_eq!(v["steps"][0]["tool"], "execute_python");
    }

    #[test]
    fn closes_missing_bracket() {
        let v = parses(r#"{"steps": [{"tool": "a"}, {"tool": "b"}"#);
        assert_eq!(v["steps"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn drops_extra_closing_brace() {
        let v = parses(r#"{"a": 1}}"#);
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn closes_unterminated_string() {
        let v = parses(r#"{"plan": "未完"#);
        assert_eq!(v["plan"], "未完");
    }

    #[test]
    fn discards_prose_around_block() {
        let v = parses("好的，结果如下：\n{\"intent\": \"task\"}\n以上。");
        assert_eq!(v["intent"], "task");
    }

    #[test]
    fn step_list_preserved_through_repair() {
        // 一个尾逗号 + 一个缺失花括号，步骤列表语义不变
        let broken = r#"{"plan": "p", "steps": [{"tool": "t1", "args": {},}, {"tool": "t2", "args": {}}]"#;
        let v = parses(broken);
        let steps = v["steps"].as_array().unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1]["tool"], "t2");
    }

    #[test]
    fn hopeless_input_returned_asis() {
        assert_eq!(repair_json("完全不是 JSON"), "完全不是 JSON");
    }
}
