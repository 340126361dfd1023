//! Stack-trace frame extraction for Node, Python, and Java traces.

use regex::Regex;
use std::sync::LazyLock;

/// One extracted frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
    pub function: Option<String>,
}

// `at fn (file:line:col)` and `at file:line:col`
static NODE_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*at\s+(?:(?P<func>[\w$.<>\[\] ]+)\s+\()?(?P<file>[^():\s]+):(?P<line>\d+):(?P<col>\d+)\)?")
        .expect("node frame pattern")
});

// `File "x.py", line 12, in handler`
static PYTHON_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*File "(?P<file>[^"]+)", line (?P<line>\d+)(?:, in (?P<func>\S+))?"#)
        .expect("python frame pattern")
});

// `at com.acme.Widget.render(Widget.java:42)`
static JAVA_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*at\s+(?P<func>[\w$.]+)\((?P<file>[\w$]+\.java):(?P<line>\d+)\)")
        .expect("java frame pattern")
});

/// Extract frames from a failure log, innermost first as they appear.
/// Frames from the runtime's own internals are dropped.
#[must_use]
pub fn parse_stack_trace(log: &str) -> Vec<StackFrame> {
    let mut frames = Vec::new();

    for capture in JAVA_FRAME.captures_iter(log) {
        frames.push(StackFrame {
            file: capture["file"].to_string(),
            line: capture["line"].parse().unwrap_or(0),
            column: None,
            function: Some(capture["func"].to_string()),
        });
    }

    for capture in PYTHON_FRAME.captures_iter(log) {
        frames.push(StackFrame {
            file: capture["file"].to_string(),
            line: capture["line"].parse().unwrap_or(0),
            column: None,
            function: capture.name("func").map(|m| m.as_str().to_string()),
        });
    }

    for capture in NODE_FRAME.captures_iter(log) {
        let file = capture["file"].to_string();
        if file.starts_with("node:") || file.contains("internal/") {
            continue;
        }
        frames.push(StackFrame {
            file,
            line: capture["line"].parse().unwrap_or(0),
            column: capture["col"].parse().ok(),
            function: capture
                .name("func")
                .map(|m| m.as_str().trim().to_string()),
        });
    }

    frames
}
