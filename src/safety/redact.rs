//! Log-line redaction for `DEBUG_REDACTED_MODE`.
//!
//! Every line the orchestrator emits (and every error message it persists)
//! can be run through [`Redactor::redact`], which masks values that look
//! like API keys, bearer tokens, passwords, and IPv4 addresses. The worker
//! containers are the only place raw log content exists; the orchestrator
//! itself must never leak it.

use std::io::{self, Write};
use std::sync::Arc;

use regex::Regex;

/// A compiled set of redaction patterns.
pub struct Redactor {
    patterns: Vec<(Regex, &'static str)>,
}

impl Redactor {
    pub fn new() -> Self {
        let patterns = vec![
            (
                Regex::new(r#"(?i)api[_-]?key["']?\s*[=:]\s*[^\s"',]+"#).expect("static pattern"),
                "[REDACTED_API_KEY]",
            ),
            (
                Regex::new(r#"(?i)authorization["']?\s*[=:]\s*bearer\s+[^\s"',]+"#)
                    .expect("static pattern"),
                "[REDACTED_AUTH]",
            ),
            (
                Regex::new(r#"(?i)token["']?\s*[=:]\s*[^\s"',]+"#).expect("static pattern"),
                "[REDACTED_TOKEN]",
            ),
            (
                Regex::new(r#"(?i)password["']?\s*[=:]\s*[^\s"',]+"#).expect("static pattern"),
                "[REDACTED_PASSWORD]",
            ),
            (
                Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("static pattern"),
                "[REDACTED_IP]",
            ),
        ];
        Self { patterns }
    }

    /// Mask every matching span in `text`.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (pattern, replacement) in &self.patterns {
            out = pattern.replace_all(&out, *replacement).into_owned();
        }
        out
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new()
    }
}

/// `MakeWriter` for `tracing_subscriber::fmt` that redacts each buffered
/// line before it reaches stderr. Installed only when `DEBUG_REDACTED_MODE`
/// is on; otherwise the plain stderr writer is used.
#[derive(Clone)]
pub struct RedactingMakeWriter {
    redactor: Arc<Redactor>,
}

impl RedactingMakeWriter {
    pub fn new(redactor: Arc<Redactor>) -> Self {
        Self { redactor }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter {
    type Writer = RedactingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            redactor: Arc::clone(&self.redactor),
            buf: Vec::new(),
        }
    }
}

pub struct RedactingWriter {
    redactor: Arc<Redactor>,
    buf: Vec<u8>,
}

impl Write for RedactingWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&self.buf);
        let redacted = self.redactor.redact(&line);
        self.buf.clear();
        io::stderr().write_all(redacted.as_bytes())
    }
}

impl Drop for RedactingWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_api_keys_and_tokens() {
        let r = Redactor::new();
        let line = r.redact("request failed: api_key=sk-abc123 token: tkn-9 retrying");
        assert!(line.contains("[REDACTED_API_KEY]"));
        assert!(line.contains("[REDACTED_TOKEN]"));
        assert!(!line.contains("sk-abc123"));
        assert!(!line.contains("tkn-9"));
    }

    #[test]
    fn masks_bearer_auth() {
        let r = Redactor::new();
        let line = r.redact("authorization: bearer eyJhbGciOi");
        assert_eq!(line, "[REDACTED_AUTH]");
    }

    #[test]
    fn masks_ipv4_addresses() {
        let r = Redactor::new();
        let line = r.redact("probe of 192.168.1.44 failed");
        assert_eq!(line, "probe of [REDACTED_IP] failed");
    }

    #[test]
    fn leaves_clean_lines_untouched() {
        let r = Redactor::new();
        let line = "run 7f3a dispatched to host unraid";
        assert_eq!(r.redact(line), line);
    }
}
