//! Pure parsers for jdb's textual output.
//!
//! jdb interleaves prompts, asynchronous event reports and the debuggee's own output on one
//! stream. A prompt is a trailing, newline-less `> ` (no current thread) or `<thread>[<n>] `.
//! Event reports may share a line with a prompt (`> Breakpoint hit: ...`), so every line is
//! inspected with any leading prompts stripped.

use std::sync::OnceLock;

use regex::Regex;

use crate::{BreakpointStatus, RunState, StackFrame, StopLocation};

const BREAKPOINT_HIT: &str = "Breakpoint hit:";
const STEP_COMPLETED: &str = "Step completed:";
const EXCEPTION_OCCURRED: &str = "Exception occurred:";
const APPLICATION_EXITED: &str = "The application exited";
const APPLICATION_DISCONNECTED: &str = "The application has been disconnected";

/// Line prefixes jdb uses when it rejects a command.
const ERROR_PREFIXES: &[&str] = &[
    "Unrecognized command",
    "Unable to set",
    "No thread specified",
    "Nothing suspended",
    "Current thread isnt suspended",
    "Current thread not set",
    "Invalid",
    "Command '",
];

fn prompt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|\n)(?:> |[^\s\[\]]+\[\d+\] )$").expect("prompt regex should compile")
    })
}

fn leading_prompt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:> |[^\s\[\]]+\[\d+\] )+").expect("leading prompt regex should compile")
    })
}

fn location_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#""thread=([^"]*)",\s*([^\s(]+)\(\),\s*line=([\d,.]+)"#)
            .expect("location regex should compile")
    })
}

fn frame_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*\[(\d+)\]\s+(\S+)\s+\(([^)]*)\)").expect("frame regex should compile")
    })
}

/// Whether `text` ends in a prompt, i.e. jdb is waiting for the next command.
pub fn ends_with_prompt(text: &str) -> bool {
    prompt_re().is_match(text)
}

fn strip_prompts(line: &str) -> &str {
    let line = line.trim_end_matches('\r');
    match leading_prompt_re().find(line) {
        Some(m) => &line[m.end()..],
        None => line,
    }
}

/// Lines of `text` with leading prompts removed, paired with their byte offset.
fn lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0;
    text.split('\n').map(move |raw| {
        let start = offset;
        offset += raw.len() + 1;
        (start, strip_prompts(raw))
    })
}

/// The first line reporting that jdb rejected a command.
pub fn command_error(text: &str) -> Option<&str> {
    lines(text)
        .map(|(_, line)| line.trim())
        .find(|line| ERROR_PREFIXES.iter().any(|prefix| line.starts_with(prefix)))
}

fn parse_location(line: &str) -> Option<StopLocation> {
    let caps = location_re().captures(line)?;
    let line_no = caps[3].replace([',', '.'], "").parse().ok()?;
    Some(StopLocation {
        thread: caps[1].to_string(),
        method: caps[2].to_string(),
        line: line_no,
    })
}

fn parse_exception(rest: &str) -> RunState {
    let rest = rest.trim_start();
    let exception = rest
        .split(|c: char| c.is_whitespace() || c == '"')
        .next()
        .unwrap_or_default()
        .to_string();
    // The throw location follows the caught/uncaught marker.
    let location = rest.find('"').and_then(|idx| parse_location(&rest[idx..]));
    if rest.contains("(uncaught)") {
        RunState::UncaughtException {
            exception,
            location,
        }
    } else {
        RunState::CaughtException {
            exception,
            location,
        }
    }
}

/// Lines jdb prints around `run` before the target reaches its first event.
const PREAMBLE_PREFIXES: &[&str] = &[
    "run ",
    "Set uncaught",
    "Set deferred",
    "VM Started",
    "Initializing jdb",
];

/// The first line before the first prompt that is neither blank nor `run` preamble.
///
/// Text after the first prompt belongs to the running debuggee and is not inspected.
fn unrecognized_reply(text: &str) -> Option<&str> {
    for raw in text.split('\n') {
        let raw = raw.trim_end_matches('\r');
        if leading_prompt_re().is_match(raw) {
            return None;
        }
        let line = raw.trim();
        if line.is_empty() || PREAMBLE_PREFIXES.iter().any(|prefix| line.starts_with(prefix)) {
            continue;
        }
        return Some(line);
    }
    None
}

/// Find the first run-state report in `text`, with the byte offset of its line.
fn find_run_state(text: &str) -> Option<(usize, RunState)> {
    for (offset, line) in lines(text) {
        let line = line.trim_start();
        if let Some(rest) = line.strip_prefix(BREAKPOINT_HIT) {
            return Some((
                offset,
                RunState::BreakpointHit {
                    location: parse_location(rest),
                },
            ));
        }
        if let Some(rest) = line.strip_prefix(STEP_COMPLETED) {
            return Some((
                offset,
                RunState::StepCompleted {
                    location: parse_location(rest),
                },
            ));
        }
        if let Some(rest) = line.strip_prefix(EXCEPTION_OCCURRED) {
            return Some((offset, parse_exception(rest)));
        }
        if line.starts_with(APPLICATION_EXITED) || line.starts_with(APPLICATION_DISCONNECTED) {
            return Some((offset, RunState::Terminated));
        }
    }
    None
}

/// Whether the accumulated reply to a run command (`run`, `cont`, `step`, `next`, `step up`)
/// is complete.
///
/// Stops are complete once jdb prints the prompt that follows the event report. Exit reports
/// are complete immediately because the process is about to go away. Any other reply (a
/// rejection or a message this parser does not know) is complete once a prompt follows it; a
/// bare prompt or the `run` preamble alone is not.
pub fn run_reply_complete(text: &str) -> bool {
    match find_run_state(text) {
        Some((_, RunState::Terminated)) => true,
        Some((offset, _)) => ends_with_prompt(&text[offset..]),
        None => {
            (command_error(text).is_some() || unrecognized_reply(text).is_some())
                && ends_with_prompt(text)
        }
    }
}

/// Interpret a complete reply to a run command.
///
/// Returns `Err` with jdb's message when the command was rejected or the reply is not one this
/// parser knows. Only a bare prompt (with or without the `run` preamble) means
/// [`RunState::Running`].
pub fn parse_run_state(text: &str) -> Result<RunState, String> {
    if let Some((_, state)) = find_run_state(text) {
        return Ok(state);
    }
    if let Some(err) = command_error(text) {
        return Err(err.to_string());
    }
    match unrecognized_reply(text) {
        Some(line) => Err(format!("unrecognized reply: {line:?}")),
        None => Ok(RunState::Running),
    }
}

/// Interpret a complete reply to `clear <unit>:<line>`.
///
/// A breakpoint jdb no longer knows about is already cleared, so `Not found` is not an error.
pub fn parse_clear(text: &str) -> Result<(), String> {
    if let Some(err) = command_error(text) {
        return Err(err.to_string());
    }
    for (_, line) in lines(text) {
        let line = line.trim_start();
        if line.starts_with("Removed:") || line.starts_with("Not found:") {
            return Ok(());
        }
    }
    Err(format!("unrecognized reply to clear: {:?}", text.trim()))
}

/// Interpret a complete reply to `stop at <unit>:<line>`.
pub fn parse_stop_at(text: &str) -> Result<BreakpointStatus, String> {
    if let Some(err) = command_error(text) {
        return Err(err.to_string());
    }
    for (_, line) in lines(text) {
        let line = line.trim_start();
        if line.starts_with("Set breakpoint") {
            return Ok(BreakpointStatus::Set);
        }
        if line.starts_with("Deferring breakpoint") {
            return Ok(BreakpointStatus::Deferred);
        }
    }
    Err(format!("unrecognized reply to stop at: {:?}", text.trim()))
}

fn parse_frame(line: &str) -> Option<StackFrame> {
    let caps = frame_re().captures(line)?;
    let number: usize = caps[1].parse().ok()?;
    let qualified = &caps[2];
    let (unit, member) = match qualified.rsplit_once('.') {
        Some((unit, member)) => (unit.to_string(), member.to_string()),
        None => (String::new(), qualified.to_string()),
    };

    let position = caps[3].trim();
    let (file, line) = match position.rsplit_once(':') {
        Some((file, line)) => (
            Some(file.to_string()),
            line.replace([',', '.'], "").parse().ok(),
        ),
        None if position.ends_with(".java") => (Some(position.to_string()), None),
        // `native method`, `pc 12`
        None => (None, None),
    };

    Some(StackFrame {
        index: number.saturating_sub(1),
        unit,
        member,
        file,
        line,
    })
}

/// Interpret a complete reply to `where`.
pub fn parse_where(text: &str) -> Result<Vec<StackFrame>, String> {
    if let Some(err) = command_error(text) {
        return Err(err.to_string());
    }

    let mut frames = Vec::new();
    let mut unrecognized = None;
    for (_, line) in lines(text) {
        if line.trim().is_empty() {
            continue;
        }
        match parse_frame(line) {
            Some(frame) => frames.push(frame),
            None => unrecognized = unrecognized.or(Some(line)),
        }
    }

    match (frames.is_empty(), unrecognized) {
        (true, Some(line)) => Err(format!("unrecognized stack frame line: {:?}", line.trim())),
        _ => Ok(frames),
    }
}

/// Decode a chunk of backend output, carrying an incomplete trailing UTF-8 sequence over to
/// the next chunk.
pub(crate) fn decode_utf8_chunk(carry: &mut Vec<u8>, bytes: &[u8]) -> String {
    carry.extend_from_slice(bytes);
    let valid = match std::str::from_utf8(carry) {
        Ok(_) => carry.len(),
        Err(err) if err.error_len().is_none() => err.valid_up_to(),
        Err(_) => {
            let text = String::from_utf8_lossy(carry).into_owned();
            carry.clear();
            return text;
        }
    };
    let text = String::from_utf8_lossy(&carry[..valid]).into_owned();
    carry.drain(..valid);
    text
}
