//! Argument sanitation (spec §4.2).
//!
//! Run once per call, before dispatch: strips leaked XML/HTML tags from
//! every string argument (a common LLM output artifact), then applies a
//! `bash`-specific narrative-prose guard.

use serde_json::{Map, Value};

/// Recursively strips XML/HTML-looking tags (`<tag>`, `</tag>`, `<tag/>`)
/// from every string value in a JSON tree. Tags inside a heredoc body are
/// left alone — heredoc detection happens separately in
/// [`sanitize_bash_command`], which runs after this pass.
pub fn strip_leaked_tags(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(strip_tags_from_string(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_leaked_tags).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, strip_leaked_tags(v)))
                .collect(),
        ),
        other => other,
    }
}

fn strip_tags_from_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.char_indices().peekable();
    let mut in_tag = false;
    let mut tag_start = 0usize;
    let bytes = s.as_bytes();

    while let Some((i, c)) = chars.next() {
        if !in_tag && c == '<' && looks_like_tag_open(bytes, i) {
            in_tag = true;
            tag_start = i;
            continue;
        }
        if in_tag {
            if c == '>' {
                in_tag = false;
            }
            continue;
        }
        let _ = tag_start;
        out.push(c);
    }
    out
}

/// Heuristic: `<` starts a tag only if followed by `/`, an ASCII letter, or
/// `!`/`?` and the tag closes with `>` before the next `<` or end of
/// string. Cheap lookahead rather than full HTML parsing — the goal is to
/// catch leaked `<tool_call>`/`<result>`-style scaffolding, not validate
/// markup.
fn looks_like_tag_open(bytes: &[u8], at: usize) -> bool {
    let rest = &bytes[at + 1..];
    let Some(&next) = rest.first() else {
        return false;
    };
    if !(next.is_ascii_alphabetic() || next == b'/' || next == b'!' || next == b'?') {
        return false;
    }
    rest.iter().take(200).any(|&b| b == b'>')
}

/// The first line's heredoc token (`<<EOF`, `<<'SQL'`, `<<-PY`), if any.
fn heredoc_token(first_line: &str) -> Option<String> {
    let idx = first_line.find("<<")?;
    let after = &first_line[idx + 2..];
    let after = after.trim_start_matches('-');
    let token: String = after
        .trim_start()
        .trim_matches(|c| c == '\'' || c == '"')
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if token.is_empty() { None } else { Some(token) }
}

/// Result of sanitizing a bash command argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BashSanitizeOutcome {
    /// Command passed through unchanged (or only trailing prose trimmed).
    Ok(String),
    /// Command was entirely narrative prose / Markdown with no real
    /// shell content; refuse execution.
    Refused { reason: String },
}

/// Applies the `bash`-specific guard from spec §4.2: refuse or truncate
/// commands whose trailing text is clearly narrative prose (CJK
/// characters) or Markdown bullet formatting, while preserving heredoc
/// bodies intact when the first line contains a heredoc token.
pub fn sanitize_bash_command(command: &str) -> BashSanitizeOutcome {
    let first_line = command.lines().next().unwrap_or("");
    if let Some(token) = heredoc_token(first_line) {
        // Heredoc body must be preserved verbatim; only trim trailing
        // narrative prose that appears *after* the terminating token line.
        if let Some(end_idx) = find_heredoc_end(command, &token) {
            let (body, trailer) = command.split_at(end_idx);
            let trimmed_trailer = trim_narrative_suffix(trailer);
            return BashSanitizeOutcome::Ok(format!("{body}{trimmed_trailer}"));
        }
        return BashSanitizeOutcome::Ok(command.to_string());
    }

    if is_entirely_narrative(command) {
        return BashSanitizeOutcome::Refused {
            reason: "command body looks like narrative prose, not a shell command".into(),
        };
    }

    BashSanitizeOutcome::Ok(trim_narrative_suffix(command).to_string())
}

fn find_heredoc_end(command: &str, token: &str) -> Option<usize> {
    let needle = format!("\n{token}");
    let idx = command.find(&needle)?;
    let after_token = idx + needle.len();
    // Include the terminator line itself in the preserved body.
    let rest = &command[after_token..];
    let line_end = rest.find('\n').map(|i| after_token + i).unwrap_or(command.len());
    Some(line_end)
}

fn trim_narrative_suffix(trailer: &str) -> &str {
    // A trailing paragraph that is pure CJK/bullet prose carries no shell
    // meaning; keep everything up to (not including) it.
    if let Some(idx) = trailer.find(|c: char| is_cjk(c)) {
        let candidate = &trailer[..idx];
        if is_entirely_narrative(&trailer[idx..]) {
            return candidate;
        }
    }
    trailer
}

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x3040..=0x30FF | 0xAC00..=0xD7A3)
}

fn is_entirely_narrative(s: &str) -> bool {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return false;
    }
    let cjk_count = trimmed.chars().filter(|c| is_cjk(*c)).count();
    let markdown_bullets = trimmed
        .lines()
        .filter(|l| {
            let l = l.trim_start();
            l.starts_with("- ") || l.starts_with("* ") || l.starts_with("1. ")
        })
        .count();
    let total_lines = trimmed.lines().count().max(1);
    let cjk_ratio = cjk_count as f64 / trimmed.chars().count().max(1) as f64;
    cjk_ratio > 0.3 || markdown_bullets * 2 >= total_lines
}
