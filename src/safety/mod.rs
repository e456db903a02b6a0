//! Output-boundary safety: log redaction.

pub mod redact;

pub use redact::{RedactingMakeWriter, Redactor};
