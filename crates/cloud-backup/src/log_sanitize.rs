//! Cleans text captured from external tools before it reaches the log.

use std::process::Command;

const MAX_LINE_CHARS: usize = 2048;
const MAX_SUMMARY_CHARS: usize = 4096;

enum Escape {
    Start,
    Csi,
    Osc,
    OscEsc,
    String,
    StringEsc,
}

/// Strips ANSI escape sequences, control and bidi formatting characters, and
/// truncates overly long lines.
pub fn sanitize_log_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut escape: Option<Escape> = None;
    let mut count = 0usize;

    for c in input.chars() {
        if let Some(state) = escape.take() {
            escape = match (state, c) {
                (Escape::Start, '[') => Some(Escape::Csi),
                (Escape::Start, ']') => Some(Escape::Osc),
                (Escape::Start, 'P' | 'X' | '^' | '_') => Some(Escape::String),
                (Escape::Start, _) => None,
                (Escape::Csi, c) if ('@'..='~').contains(&c) => None,
                (Escape::Csi, _) => Some(Escape::Csi),
                (Escape::Osc, '\x07') => None,
                (Escape::Osc, '\x1b') => Some(Escape::OscEsc),
                (Escape::Osc, _) => Some(Escape::Osc),
                (Escape::OscEsc, '\\') => None,
                (Escape::OscEsc, '\x1b') => Some(Escape::OscEsc),
                (Escape::OscEsc, _) => Some(Escape::Osc),
                (Escape::String, '\x1b') => Some(Escape::StringEsc),
                (Escape::String, _) => Some(Escape::String),
                (Escape::StringEsc, '\\') => None,
                (Escape::StringEsc, '\x1b') => Some(Escape::StringEsc),
                (Escape::StringEsc, _) => Some(Escape::String),
            };
            continue;
        }

        match c {
            '\x1b' => {
                escape = Some(Escape::Start);
                continue;
            }
            '\r' | '\n' => continue,
            '\t' => out.push(' '),
            c if c.is_control() || is_format_control(c) => continue,
            c => out.push(c),
        }
        count += 1;
        if count >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}

/// Collapses multi-line tool output into one loggable line, `a | b | c`.
pub fn summarize_output(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let mut out = String::new();
    for line in text.lines() {
        let line = sanitize_log_line(line);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push_str(" | ");
        }
        out.push_str(line);
        if out.len() >= MAX_SUMMARY_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}

/// Program and arguments of `cmd`, for logs and error messages. The
/// environment is never included; it may carry credentials.
pub fn command_line(cmd: &Command) -> String {
    let mut out = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        let arg = arg.to_string_lossy();
        out.push(' ');
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            out.push_str(&format!("{arg:?}"));
        } else {
            out.push_str(&arg);
        }
    }
    sanitize_log_line(&out)
}

fn is_format_control(c: char) -> bool {
    c == '\u{061C}'
        || c == '\u{200E}'
        || c == '\u{200F}'
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}
