//! Wire format of the analysis server.
//!
//! Requests are tab-separated command lines:
//!
//! ```text
//! LINT\t<file name>\n<document text>\nEND\n
//! SET\tCLASSPATH\t<entries joined by the platform separator>\n
//! SET\tJDK\t<path>\n
//! KILL
//! ```
//!
//! A `LINT` reply is a JSON array of `{line, position, message, type?}` records. The server is
//! inconsistent about numbers, so `line` and `position` are accepted either as JSON numbers or
//! as numeric strings.

use std::path::{Path, PathBuf};

use lsp_types::{Diagnostic, DiagnosticSeverity, Position, Range};
use serde::{Deserialize, Deserializer};

#[cfg(windows)]
pub const CLASSPATH_SEPARATOR: &str = ";";
#[cfg(not(windows))]
pub const CLASSPATH_SEPARATOR: &str = ":";

pub const DIAGNOSTIC_SOURCE: &str = "java";

pub fn lint_command(file_name: &str, text: &str) -> String {
    let mut command = String::with_capacity(text.len() + file_name.len() + 16);
    command.push_str("LINT\t");
    command.push_str(file_name);
    command.push('\n');
    command.push_str(text);
    command.push('\n');
    command.push_str("END\n");
    command
}

pub fn set_classpath_command<P: AsRef<Path>>(entries: &[P]) -> String {
    let joined = entries
        .iter()
        .map(|entry| entry.as_ref().display().to_string())
        .collect::<Vec<_>>()
        .join(CLASSPATH_SEPARATOR);
    format!("SET\tCLASSPATH\t{joined}\n")
}

pub fn set_jdk_command(path: &Path) -> String {
    format!("SET\tJDK\t{}\n", path.display())
}

pub const KILL_COMMAND: &str = "KILL";

/// One finding reported by the analysis server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LintRecord {
    /// 1-based line.
    #[serde(deserialize_with = "number_or_string")]
    pub line: u32,
    /// 0-based column.
    #[serde(deserialize_with = "number_or_string")]
    pub position: u32,
    pub message: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl LintRecord {
    pub fn severity(&self) -> DiagnosticSeverity {
        match self.kind.as_deref() {
            Some("WARNING") | Some("MANDATORY_WARNING") => DiagnosticSeverity::WARNING,
            _ => DiagnosticSeverity::ERROR,
        }
    }

    /// Zero-width diagnostic at the reported position.
    pub fn to_diagnostic(&self) -> Diagnostic {
        let at = Position {
            line: self.line.saturating_sub(1),
            character: self.position,
        };
        Diagnostic {
            range: Range { start: at, end: at },
            severity: Some(self.severity()),
            source: Some(DIAGNOSTIC_SOURCE.to_string()),
            message: self.message.clone(),
            ..Diagnostic::default()
        }
    }
}

fn number_or_string<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Text(String),
    }

    let value = match Raw::deserialize(deserializer)? {
        Raw::Int(value) => value,
        Raw::Float(value) if value.is_finite() => value.trunc() as i64,
        Raw::Float(_) => return Err(D::Error::custom("expected a finite number")),
        Raw::Text(text) => {
            let trimmed = text.trim();
            match trimmed.parse::<i64>() {
                Ok(value) => value,
                Err(_) => match trimmed.parse::<f64>() {
                    Ok(value) if value.is_finite() => value.trunc() as i64,
                    _ => return Err(D::Error::custom("expected a numeric string")),
                },
            }
        }
    };
    Ok(value.clamp(0, i64::from(u32::MAX)) as u32)
}

/// Parse a complete `LINT` reply. Line breaks inside the reply are not significant; an empty
/// reply means "no findings".
pub fn parse_reply(reply: &str) -> Result<Vec<LintRecord>, serde_json::Error> {
    if reply.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(reply)
}

pub fn to_diagnostics(records: &[LintRecord]) -> Vec<Diagnostic> {
    records.iter().map(LintRecord::to_diagnostic).collect()
}

/// The file name the analysis server expects for a document URI: the last path segment,
/// percent-decoded.
pub fn file_name_for_uri(uri: &str) -> String {
    let without_suffix = uri
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let segment = without_suffix.rsplit('/').next().unwrap_or_default();
    percent_decode(segment)
}

/// Local path of a `file:` URI.
pub fn path_for_uri(uri: &str) -> Option<PathBuf> {
    let rest = uri.strip_prefix("file://")?;
    let path = rest.split(['?', '#']).next().unwrap_or_default();
    let path = path.strip_prefix("localhost").unwrap_or(path);
    if path.is_empty() {
        return None;
    }
    Some(PathBuf::from(percent_decode(path)))
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|digit| digit as u8)
}
