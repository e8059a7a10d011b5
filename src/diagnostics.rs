//! 4.J Diagnostics: a fixed-size ring buffer of redacted events, plus a
//! snapshot builder that redacts every line of a multi-section report.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::config::DIAGNOSTICS_RING_CAPACITY;
use crate::model::{DiagnosticEntry, DiagnosticLevel};

/// Internal placeholder used while redacting, swapped for the final
/// human-readable marker once every secret has been replaced. Using a
/// private, unlikely-to-occur sentinel first (rather than replacing directly
/// with the visible marker) stops one secret's replacement from being
/// re-matched by a later, shorter secret.
const SENTINEL: &str = "\u{1}MOUNTKEEPD_REDACTED\u{1}";
const REDACTED_MARKER: &str = "[REDACTED]";

pub struct Diagnostics {
    capacity: usize,
    entries: Mutex<VecDeque<DiagnosticEntry>>,
    secrets: Mutex<Vec<String>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::with_capacity(DIAGNOSTICS_RING_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { capacity, entries: Mutex::new(VecDeque::with_capacity(capacity)), secrets: Mutex::new(Vec::new()) }
    }

    /// Register a literal that must never appear in diagnostics output. The
    /// redactor receives this before any subsequent `append`/`snapshot`
    /// call, per the secrets-funneling design note.
    pub fn register_secret(&self, secret: impl Into<String>) {
        let secret = secret.into();
        if secret.is_empty() {
            return;
        }
        let mut secrets = self.secrets.lock().unwrap();
        if !secrets.iter().any(|s| s == &secret) {
            secrets.push(secret);
        }
    }

    pub fn append(&self, level: DiagnosticLevel, category: impl Into<String>, message: impl Into<String>) {
        let sanitized = sanitize_single_line(&message.into());
        let secrets = self.secrets.lock().unwrap().clone();
        let redacted = redact(&sanitized, &secrets);

        let entry = DiagnosticEntry { timestamp: SystemTime::now(), level, category: category.into(), message: redacted };
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn entries(&self) -> Vec<DiagnosticEntry> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Build a multi-section plain-text report. Every line of every section
    /// is redacted independently against the registered secrets plus
    /// `extra_secrets` supplied for this call only (e.g. a password entered
    /// in a draft field that never made it into the cache).
    pub fn snapshot(&self, sections: &[(&str, String)], extra_secrets: &[String]) -> String {
        let mut secrets = self.secrets.lock().unwrap().clone();
        secrets.extend(extra_secrets.iter().cloned());

        let mut report = String::new();
        for (title, body) in sections {
            report.push_str("== ");
            report.push_str(title);
            report.push_str(" ==\n");
            for line in body.lines() {
                report.push_str(&redact(line, &secrets));
                report.push('\n');
            }
            report.push('\n');
        }

        report.push_str("== Diagnostics Log ==\n");
        for entry in self.entries() {
            let line = format!("[{:?}] {}: {}", entry.level, entry.category, entry.message);
            report.push_str(&redact(&line, &secrets));
            report.push('\n');
        }

        report
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}

fn sanitize_single_line(s: &str) -> String {
    s.replace(['\n', '\r'], " ").trim().to_string()
}

/// Literal, case-sensitive replacement of every secret in `text`, longest
/// secret first so a short secret that happens to be a substring of a
/// longer one never leaves a fragment of the longer one exposed.
pub fn redact(text: &str, secrets: &[String]) -> String {
    let mut ordered: Vec<&str> = secrets.iter().map(|s| s.as_str()).filter(|s| !s.is_empty()).collect();
    ordered.sort_by_key(|s| std::cmp::Reverse(s.len()));

    let mut out = text.to_string();
    for secret in ordered {
        if out.contains(secret) {
            out = out.replace(secret, SENTINEL);
        }
    }
    out.replace(SENTINEL, REDACTED_MARKER)
}
