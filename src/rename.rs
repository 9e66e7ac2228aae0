//! File-name rewriting: glob patterns with back-references, applied at
//! ingest (`rename <set>`) and just before send (`trans_rename <set>`).
//!
//! 规则文件按节组织，节名即选项里引用的规则集名：
//! ```text
//! [lower]
//! *.TXT    %1.txt
//! report_* archive_%1
//! ```
//! `*` 与 `?` 都是捕获组，替换串用 `%1`..`%9` 引用，`%%` 转义百分号。

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};

/// Translate one glob pattern into an anchored regex where every wildcard is
/// a capture group.
fn glob_to_regex(pat: &str) -> Result<regex::Regex, regex::Error> {
    let mut s = String::with_capacity(pat.len() + 8);
    s.push('^');
    for c in pat.chars() {
        match c {
            '*' => s.push_str("(.*)"),
            '?' => s.push_str("(.)"),
            c => s.push_str(&regex::escape(&c.to_string())),
        }
    }
    s.push('$');
    regex::Regex::new(&s)
}

/// Match `pat` (glob, `*`/`?`) against `text`, collecting what every
/// wildcard consumed, in order. `*` is greedy.
pub fn match_captures(pat: &str, text: &str) -> Option<Vec<String>> {
    let re = glob_to_regex(pat).ok()?;
    let caps = re.captures(text)?;
    Some(
        caps.iter()
            .skip(1)
            .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
            .collect(),
    )
}

fn apply_replacement(repl: &str, caps: &[String]) -> String {
    let mut out = String::with_capacity(repl.len());
    let mut chars = repl.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('%') => {
                out.push('%');
                chars.next();
            }
            Some(d) if d.is_ascii_digit() => {
                let idx = d.to_digit(10).unwrap() as usize;
                chars.next();
                if idx >= 1
                    && let Some(cap) = caps.get(idx - 1)
                {
                    out.push_str(cap);
                }
                // %0 and out-of-range refs expand to nothing
            }
            _ => out.push('%'),
        }
    }
    out
}

/// One `{pattern -> replacement}` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameRule {
    pub pattern: String,
    pub replacement: String,
}

/// Ordered rule set; the first matching pattern wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenameRuleSet {
    pub rules: Vec<RenameRule>,
}

impl RenameRuleSet {
    /// Rewrite `name`, or None when no pattern matches.
    pub fn apply(&self, name: &str) -> Option<String> {
        for rule in &self.rules {
            if let Some(caps) = match_captures(&rule.pattern, name) {
                return Some(apply_replacement(&rule.replacement, &caps));
            }
        }
        None
    }
}

/// All named rule sets from `etc/rename.rule`.
#[derive(Debug, Clone, Default)]
pub struct RenameRules {
    sets: HashMap<String, RenameRuleSet>,
}

impl RenameRules {
    pub fn load(path: &Path) -> Result<RenameRules> {
        if !path.exists() {
            return Ok(RenameRules::default());
        }
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("读取 rename 规则失败: {}", path.display()))?;
        Ok(Self::parse(&data))
    }

    pub fn parse(data: &str) -> RenameRules {
        let mut sets: HashMap<String, RenameRuleSet> = HashMap::new();
        let mut current: Option<String> = None;
        for raw in data.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                let name = line[1..line.len() - 1].trim().to_string();
                sets.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }
            let Some(ref set_name) = current else {
                tracing::warn!("[amg] rename 规则行缺少节名，忽略: '{}'", line);
                continue;
            };
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(pat), Some(repl)) => {
                    sets.get_mut(set_name).expect("section exists").rules.push(RenameRule {
                        pattern: pat.to_string(),
                        replacement: repl.to_string(),
                    });
                }
                _ => {
                    tracing::warn!("[amg] rename 规则行不完整，忽略: '{}'", line);
                }
            }
        }
        RenameRules { sets }
    }

    pub fn get(&self, name: &str) -> Option<&RenameRuleSet> {
        self.sets.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}
