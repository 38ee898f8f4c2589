//! The Anti-Pattern Detector (spec §4.3): pure functions over tracked
//! per-run counters that return either a system-message string or a
//! sentinel (`None` / `HardLimit` / `EscalateToUser`). The loop controller
//! decides how to act on each signal; this module never mutates history or
//! emits events itself.

use std::collections::HashMap;

use agentloop_tool::ToolKind;
use regex::Regex;
use std::sync::OnceLock;

use crate::config::LoopConfig;

/// What a detector check returns. Mirrors spec §4.3's "pure functions...
/// return either a system-message string or a sentinel" contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectorSignal {
    /// Nothing to report.
    None,
    /// Inject this system message and continue.
    Nudge(String),
    /// Stop further work immediately (read-only stall hard limit).
    HardLimit,
    /// Inject an escalation notice instructing the model to stop and
    /// report (repeated-failure strike 4+).
    EscalateToUser(String),
}

impl DetectorSignal {
    pub fn is_none(&self) -> bool {
        matches!(self, DetectorSignal::None)
    }
}

/// Per-run classification of one iteration's tool activity (spec §4.3
/// "Progress-state checkpoint").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationClass {
    /// Every tool call this iteration was read-only.
    Exploring,
    /// At least one call wrote a file.
    Modifying,
    /// Mutating-classified calls (e.g. `bash`) ran but nothing was
    /// written — a test/compile/verification step.
    Verifying,
}

/// Declared alternative for a tool that has repeatedly failed, surfaced on
/// strike 2 (spec §4.3).
fn alternative_for(tool_name: &str) -> Option<(&'static str, &'static str)> {
    match tool_name {
        "edit_file" => Some(("write_file", "rewriting the whole file sidesteps a bad patch target")),
        "read_file" => Some(("bash cat", "a raw shell read bypasses read_file's own parsing")),
        "glob" => Some(("bash find", "find supports patterns glob's matcher may be rejecting")),
        "web_fetch" => Some(("bash curl", "curl surfaces the raw HTTP error web_fetch is swallowing")),
        _ => None,
    }
}

/// Tracks the counters the detector's checks consult across a run. Owned
/// by the Loop Controller's per-run state, mutated only from the
/// controller's own flow of control (spec §5).
#[derive(Debug, Clone, Default)]
pub struct AntiPatternState {
    consecutive_read_ops: u32,
    has_written_file: bool,
    warned_before_write: bool,
    warned_after_write: bool,
    failure_strikes: HashMap<String, u32>,
    exact_repeat: HashMap<String, (u32, Option<String>)>,
    call_signatures: HashMap<String, u32>,
    consecutive_exploring: u32,
}

impl AntiPatternState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_written_file(&self) -> bool {
        self.has_written_file
    }

    pub fn consecutive_read_ops(&self) -> u32 {
        self.consecutive_read_ops
    }
}

/// Stateful wrapper around [`AntiPatternState`] plus the policy numbers
/// (spec §9: nudge thresholds are configured, not hard-coded).
pub struct AntiPatternDetector<'a> {
    state: &'a mut AntiPatternState,
    config: &'a LoopConfig,
}

impl<'a> AntiPatternDetector<'a> {
    pub fn new(state: &'a mut AntiPatternState, config: &'a LoopConfig) -> Self {
        Self { state, config }
    }

    /// Read-only stall tracking (spec §4.3). Call once per dispatched tool
    /// call, in execution order.
    pub fn record_tool_kind(&mut self, kind: ToolKind) -> DetectorSignal {
        match kind {
            ToolKind::Mutating => {
                // A mutating call isn't necessarily a *write*; the caller
                // also calls `record_write` when a file was actually
                // touched. Mutating calls still reset the read streak —
                // they're doing *something* other than passively reading.
                self.state.consecutive_read_ops = 0;
                DetectorSignal::None
            }
            ToolKind::ParallelSafe => {
                self.state.consecutive_read_ops += 1;
                self.read_only_stall_signal()
            }
        }
    }

    /// Marks that a file write has occurred this run (spec §3's
    /// `hasWrittenFile`). Call from the modified-file tracker.
    pub fn record_write(&mut self) {
        self.state.has_written_file = true;
        self.state.consecutive_read_ops = 0;
    }

    fn read_only_stall_signal(&mut self) -> DetectorSignal {
        let ops = self.state.consecutive_read_ops;
        if ops >= self.config.read_only_hard_limit {
            return DetectorSignal::HardLimit;
        }
        if !self.state.has_written_file {
            if ops >= self.config.read_only_warn_before_write && !self.state.warned_before_write {
                self.state.warned_before_write = true;
                return DetectorSignal::Nudge(format!(
                    "You have made {ops} consecutive read-only calls without writing anything. \
                     If you have enough information, make the change now."
                ));
            }
        } else if ops >= self.config.read_only_warn_after_write && !self.state.warned_after_write {
            self.state.warned_after_write = true;
            return DetectorSignal::Nudge(format!(
                "You have made {ops} consecutive read-only calls since your last write. \
                 Confirm you still need more context before continuing to explore."
            ));
        }
        DetectorSignal::None
    }

    /// Repeated-failure escalation (spec §4.3, "4 strikes on same tool
    /// name"). Call once per tool result, keyed by tool name.
    pub fn record_failure(&mut self, tool_name: &str, success: bool) -> DetectorSignal {
        if success {
            self.state.failure_strikes.remove(tool_name);
            self.clear_exact_repeat_for(tool_name);
            return DetectorSignal::None;
        }
        let strikes = self.state.failure_strikes.entry(tool_name.to_string()).or_insert(0);
        *strikes += 1;
        match *strikes {
            n if n < self.config.repeated_failure_strikes.saturating_sub(2).max(1) && n == 1 => {
                DetectorSignal::Nudge(format!(
                    "`{tool_name}` failed. Check its parameters and preconditions before retrying."
                ))
            }
            2 => {
                if let Some((alt, rationale)) = alternative_for(tool_name) {
                    DetectorSignal::Nudge(format!(
                        "`{tool_name}` has failed twice. Consider switching strategy — \
                         try `{alt}` instead ({rationale})."
                    ))
                } else {
                    DetectorSignal::Nudge(format!(
                        "`{tool_name}` has failed twice. Consider switching strategy — \
                         a different tool or approach may avoid whatever `{tool_name}` is hitting."
                    ))
                }
            }
            3 => DetectorSignal::Nudge(format!(
                "`{tool_name}` has failed three times. Stop; re-read the current state; \
                 question your assumptions before trying again."
            )),
            n if n >= self.config.repeated_failure_strikes => {
                DetectorSignal::EscalateToUser(format!(
                    "`{tool_name}` has failed {n} times in a row. Stop attempting this action \
                     and report the failure to the user instead of retrying further."
                ))
            }
            1 => DetectorSignal::Nudge(format!(
                "`{tool_name}` failed. Check its parameters and preconditions before retrying."
            )),
            _ => DetectorSignal::None,
        }
    }

    /// Exact-arguments-and-same-error repetition (spec §4.3, default cap
    /// 3). `signature` should uniquely identify `(tool_name, arguments)`.
    pub fn record_exact_repeat(
        &mut self,
        tool_name: &str,
        signature: &str,
        success: bool,
        error: Option<&str>,
    ) -> DetectorSignal {
        if success {
            self.clear_exact_repeat_for(tool_name);
            return DetectorSignal::None;
        }
        let key = format!("{tool_name}:{signature}");
        let entry = self.state.exact_repeat.entry(key).or_insert((0, None));
        let same_error = entry.1.as_deref() == error;
        if same_error {
            entry.0 += 1;
        } else {
            entry.0 = 1;
            entry.1 = error.map(str::to_string);
        }
        if entry.0 > self.config.exact_args_repeat_cap {
            DetectorSignal::Nudge(format!(
                "You've retried `{tool_name}` with the exact same arguments and gotten the same \
                 error {} times. Repeating it again will not help — change the arguments or the \
                 approach.",
                entry.0
            ))
        } else {
            DetectorSignal::None
        }
    }

    fn clear_exact_repeat_for(&mut self, tool_name: &str) {
        let prefix = format!("{tool_name}:");
        self.state.exact_repeat.retain(|key, _| !key.starts_with(&prefix));
    }

    /// Duplicate-call detection (spec §4.3). `signature` should uniquely
    /// identify `(tool_name, arguments)`; `kind` distinguishes the softer
    /// "cached result" hint (read-only only) from the harder "you're
    /// looping" warning (any kind).
    pub fn record_duplicate(&mut self, signature: &str, kind: ToolKind) -> DetectorSignal {
        let count = self.state.call_signatures.entry(signature.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        if count >= self.config.duplicate_call_warning_count {
            return DetectorSignal::Nudge(format!(
                "This exact call has now run {count} times with the same arguments. \
                 You appear to be looping — try a different approach."
            ));
        }
        if count == 2 && kind == ToolKind::ParallelSafe {
            return DetectorSignal::Nudge(
                "You already made this exact read-only call once this run; the result \
                 is unlikely to have changed. Reuse the earlier observation instead of \
                 repeating the call."
                    .to_string(),
            );
        }
        DetectorSignal::None
    }

    /// Progress-state checkpoint (spec §4.3): classify the iteration's
    /// tool activity and, once `exploring_streak_limit` consecutive
    /// `Exploring` iterations have passed, demand a write.
    pub fn record_iteration(&mut self, class: IterationClass) -> DetectorSignal {
        if class == IterationClass::Exploring {
            self.state.consecutive_exploring += 1;
            if self.state.consecutive_exploring >= self.config.exploring_streak_limit {
                self.state.consecutive_exploring = 0;
                return DetectorSignal::Nudge(
                    "You've spent several iterations exploring without making any change. \
                     Make a concrete edit now, or explain why none is needed."
                        .to_string(),
                );
            }
        } else {
            self.state.consecutive_exploring = 0;
        }
        DetectorSignal::None
    }
}

/// Classifies a batch of dispatched tool calls into an [`IterationClass`]
/// (spec §4.3).
pub fn classify_iteration(kinds: &[ToolKind], any_write_occurred: bool) -> IterationClass {
    if any_write_occurred {
        IterationClass::Modifying
    } else if kinds.iter().all(|k| *k == ToolKind::ParallelSafe) {
        IterationClass::Exploring
    } else {
        IterationClass::Verifying
    }
}

/// A tool call synthesized from matching the model's text response
/// against a textual-tool-call pattern (spec §4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedToolCall {
    pub name: String,
    /// `None` when the pattern matched but carried no usable arguments —
    /// the controller should fall back to a format-correction nudge
    /// rather than force-executing.
    pub arguments: Option<serde_json::Value>,
}

struct Inverse {
    prefix: &'static str,
    tool: &'static str,
    arg_key: &'static str,
}

const INVERSE_PATTERNS: &[Inverse] = &[
    Inverse { prefix: "Ran: ", tool: "bash", arg_key: "command" },
    Inverse { prefix: "Edited ", tool: "edit_file", arg_key: "path" },
    Inverse { prefix: "Read ", tool: "read_file", arg_key: "path" },
    Inverse { prefix: "Created ", tool: "write_file", arg_key: "path" },
    Inverse { prefix: "Found files matching: ", tool: "glob", arg_key: "pattern" },
    Inverse { prefix: "Searched for: ", tool: "grep", arg_key: "pattern" },
    Inverse { prefix: "Listed: ", tool: "list_directory", arg_key: "path" },
    Inverse { prefix: "Fetched: ", tool: "web_fetch", arg_key: "url" },
];

fn called_tool_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)^Called\s+([a-zA-Z_][a-zA-Z0-9_]*)\((.*)\)\s*$"#).unwrap())
}

fn intent_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)I(?:'ll| will) (?:call|use|invoke) the `?([a-zA-Z_][a-zA-Z0-9_]*)`? tool"#)
            .unwrap()
    })
}

fn json_tool_call_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\{\s*"name"\s*:\s*"([a-zA-Z_][a-zA-Z0-9_]*)"\s*,\s*"arguments"\s*:\s*(\{.*\})\s*\}"#)
            .unwrap()
    })
}

/// Heuristic textual-tool-call detection (spec §4.3). Returns the first
/// matching pattern, in the priority order the spec lists: history-format
/// inverses, `Called tool(...)`, intent phrasing, then a raw JSON-shaped
/// call.
pub fn detect_textual_tool_call(text: &str) -> Option<DetectedToolCall> {
    let trimmed = text.trim();

    for inverse in INVERSE_PATTERNS {
        if let Some(rest) = trimmed.strip_prefix(inverse.prefix) {
            let rest = rest.trim();
            if rest.is_empty() {
                return Some(DetectedToolCall { name: inverse.tool.to_string(), arguments: None });
            }
            let mut map = serde_json::Map::new();
            map.insert(inverse.arg_key.to_string(), serde_json::Value::String(rest.to_string()));
            return Some(DetectedToolCall {
                name: inverse.tool.to_string(),
                arguments: Some(serde_json::Value::Object(map)),
            });
        }
    }

    if let Some(caps) = called_tool_regex().captures(trimmed) {
        let name = caps[1].to_string();
        let args_text = caps[2].trim();
        let arguments = parse_loose_args(args_text);
        return Some(DetectedToolCall { name, arguments });
    }

    if let Some(caps) = intent_regex().captures(trimmed) {
        return Some(DetectedToolCall { name: caps[1].to_string(), arguments: None });
    }

    if let Some(caps) = json_tool_call_regex().captures(trimmed) {
        let name = caps[1].to_string();
        let arguments = serde_json::from_str::<serde_json::Value>(&caps[2]).ok();
        return Some(DetectedToolCall { name, arguments });
    }

    None
}

/// Parses a `key: "value", key2: "value2"` or raw-JSON-object style
/// argument list out of a `Called tool(...)` match. Best-effort: returns
/// `None` when it can't be made sense of, so the controller falls back to
/// a format-correction nudge.
fn parse_loose_args(args_text: &str) -> Option<serde_json::Value> {
    if args_text.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(args_text) {
        return Some(value);
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&format!("{{{args_text}}}")) {
        return Some(value);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LoopConfig {
        LoopConfig::default()
    }

    #[test]
    fn read_only_stall_warns_then_hard_limits() {
        let cfg = config();
        let mut state = AntiPatternState::new();
        let mut detector = AntiPatternDetector::new(&mut state, &cfg);
        let mut last = DetectorSignal::None;
        for _ in 0..14 {
            last = detector.record_tool_kind(ToolKind::ParallelSafe);
        }
        assert!(matches!(last, DetectorSignal::Nudge(_)));
        let hard = detector.record_tool_kind(ToolKind::ParallelSafe);
        assert_eq!(hard, DetectorSignal::HardLimit);
    }

    #[test]
    fn write_resets_the_before_write_threshold_but_tracks_after_write() {
        let cfg = config();
        let mut state = AntiPatternState::new();
        let mut detector = AntiPatternDetector::new(&mut state, &cfg);
        for _ in 0..4 {
            detector.record_tool_kind(ToolKind::ParallelSafe);
        }
        detector.record_write();
        assert!(state.has_written_file());
        let mut last = DetectorSignal::None;
        for _ in 0..10 {
            last = detector.record_tool_kind(ToolKind::ParallelSafe);
        }
        assert!(matches!(last, DetectorSignal::Nudge(_)));
    }

    #[test]
    fn repeated_failure_escalates_through_four_strikes() {
        let cfg = config();
        let mut state = AntiPatternState::new();
        let mut detector = AntiPatternDetector::new(&mut state, &cfg);
        let s1 = detector.record_failure("bash", false);
        let s2 = detector.record_failure("bash", false);
        let s3 = detector.record_failure("bash", false);
        let s4 = detector.record_failure("bash", false);
        assert!(matches!(s1, DetectorSignal::Nudge(_)));
        assert!(matches!(s2, DetectorSignal::Nudge(ref m) if m.contains("switch")));
        assert!(matches!(s3, DetectorSignal::Nudge(ref m) if m.contains("Stop")));
        assert!(matches!(s4, DetectorSignal::EscalateToUser(_)));
    }

    #[test]
    fn strike_two_names_the_declared_alternative() {
        let cfg = config();
        let mut state = AntiPatternState::new();
        let mut detector = AntiPatternDetector::new(&mut state, &cfg);
        detector.record_failure("edit_file", false);
        let signal = detector.record_failure("edit_file", false);
        assert!(matches!(signal, DetectorSignal::Nudge(ref m) if m.contains("write_file")));
    }

    #[test]
    fn success_clears_failure_strikes() {
        let cfg = config();
        let mut state = AntiPatternState::new();
        let mut detector = AntiPatternDetector::new(&mut state, &cfg);
        detector.record_failure("bash", false);
        detector.record_failure("bash", false);
        detector.record_failure("bash", true);
        let signal = detector.record_failure("bash", false);
        assert!(matches!(signal, DetectorSignal::Nudge(ref m) if !m.contains("switch")));
    }

    #[test]
    fn exact_repeat_warns_past_cap() {
        let cfg = config();
        let mut state = AntiPatternState::new();
        let mut detector = AntiPatternDetector::new(&mut state, &cfg);
        let mut last = DetectorSignal::None;
        for _ in 0..4 {
            last = detector.record_exact_repeat("bash", "ls /nope", false, Some("not found"));
        }
        assert!(matches!(last, DetectorSignal::Nudge(_)));
    }

    #[test]
    fn exact_repeat_resets_on_different_error() {
        let cfg = config();
        let mut state = AntiPatternState::new();
        let mut detector = AntiPatternDetector::new(&mut state, &cfg);
        detector.record_exact_repeat("bash", "ls", false, Some("err a"));
        detector.record_exact_repeat("bash", "ls", false, Some("err a"));
        let signal = detector.record_exact_repeat("bash", "ls", false, Some("err b"));
        assert_eq!(signal, DetectorSignal::None);
    }

    #[test]
    fn duplicate_read_only_call_hints_on_second() {
        let cfg = config();
        let mut state = AntiPatternState::new();
        let mut detector = AntiPatternDetector::new(&mut state, &cfg);
        assert_eq!(
            detector.record_duplicate("read_file:a.ts", ToolKind::ParallelSafe),
            DetectorSignal::None
        );
        assert!(matches!(
            detector.record_duplicate("read_file:a.ts", ToolKind::ParallelSafe),
            DetectorSignal::Nudge(_)
        ));
    }

    #[test]
    fn duplicate_any_kind_warns_at_cap() {
        let cfg = config();
        let mut state = AntiPatternState::new();
        let mut detector = AntiPatternDetector::new(&mut state, &cfg);
        detector.record_duplicate("bash:ls", ToolKind::Mutating);
        detector.record_duplicate("bash:ls", ToolKind::Mutating);
        let signal = detector.record_duplicate("bash:ls", ToolKind::Mutating);
        assert!(matches!(signal, DetectorSignal::Nudge(ref m) if m.contains("looping")));
    }

    #[test]
    fn progress_checkpoint_nudges_after_streak() {
        let cfg = config();
        let mut state = AntiPatternState::new();
        let mut detector = AntiPatternDetector::new(&mut state, &cfg);
        assert_eq!(detector.record_iteration(IterationClass::Exploring), DetectorSignal::None);
        assert_eq!(detector.record_iteration(IterationClass::Exploring), DetectorSignal::None);
        assert!(matches!(
            detector.record_iteration(IterationClass::Exploring),
            DetectorSignal::Nudge(_)
        ));
    }

    #[test]
    fn progress_checkpoint_resets_on_modifying() {
        let cfg = config();
        let mut state = AntiPatternState::new();
        let mut detector = AntiPatternDetector::new(&mut state, &cfg);
        detector.record_iteration(IterationClass::Exploring);
        detector.record_iteration(IterationClass::Exploring);
        detector.record_iteration(IterationClass::Modifying);
        assert_eq!(detector.record_iteration(IterationClass::Exploring), DetectorSignal::None);
    }

    #[test]
    fn classify_iteration_prioritizes_write_over_kind() {
        assert_eq!(
            classify_iteration(&[ToolKind::ParallelSafe], true),
            IterationClass::Modifying
        );
        assert_eq!(
            classify_iteration(&[ToolKind::ParallelSafe, ToolKind::ParallelSafe], false),
            IterationClass::Exploring
        );
        assert_eq!(classify_iteration(&[ToolKind::Mutating], false), IterationClass::Verifying);
    }

    #[test]
    fn detects_ran_inverse_pattern() {
        let detected = detect_textual_tool_call("Ran: ls -la").unwrap();
        assert_eq!(detected.name, "bash");
        assert_eq!(detected.arguments.unwrap()["command"], "ls -la");
    }

    #[test]
    fn detects_edited_inverse_pattern() {
        let detected = detect_textual_tool_call("Edited src/lib.rs").unwrap();
        assert_eq!(detected.name, "edit_file");
        assert_eq!(detected.arguments.unwrap()["path"], "src/lib.rs");
    }

    #[test]
    fn detects_called_tool_with_json_args() {
        let detected = detect_textual_tool_call(r#"Called bash({"command": "ls"})"#).unwrap();
        assert_eq!(detected.name, "bash");
        assert_eq!(detected.arguments.unwrap()["command"], "ls");
    }

    #[test]
    fn detects_intent_phrasing_without_arguments() {
        let detected = detect_textual_tool_call("I'll call the read_file tool to check it.").unwrap();
        assert_eq!(detected.name, "read_file");
        assert!(detected.arguments.is_none());
    }

    #[test]
    fn detects_raw_json_shaped_call() {
        let detected =
            detect_textual_tool_call(r#"{"name": "glob", "arguments": {"pattern": "*.rs"}}"#).unwrap();
        assert_eq!(detected.name, "glob");
        assert_eq!(detected.arguments.unwrap()["pattern"], "*.rs");
    }

    #[test]
    fn plain_text_does_not_match_any_pattern() {
        assert!(detect_textual_tool_call("The answer is 42.").is_none());
    }
}
