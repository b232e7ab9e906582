//! Verbose trace output and secret redaction.
//!
//! The diagnostic sink is the user-facing stream (think `curl -v`); internal
//! events go through `tracing` regardless. Anything written to a sink or
//! attached to an error passes through [`redact_header`] or [`sanitize_url`].

use std::io::Write;
use std::sync::{Arc, Mutex, OnceLock};

use http::HeaderMap;
use regex::Regex;
use url::Url;

/// Placeholder written in place of secrets
pub const REDACTED: &str = "REDACTED";

/// Write-only stream for trace lines and security warnings
pub trait DiagnosticSink: Send + Sync {
    /// Write one line (without trailing newline)
    fn write_line(&self, line: &str);
}

/// Sink writing to standard error
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl DiagnosticSink for StderrSink {
    fn write_line(&self, line: &str) {
        let stderr = std::io::stderr();
        let mut handle = stderr.lock();
        let _ = writeln!(handle, "{}", line);
    }
}

/// Sink collecting lines in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the lines written so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl DiagnosticSink for MemorySink {
    fn write_line(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

/// Diagnostic handle shared by the engine's components
#[derive(Clone, Default)]
pub struct Diagnostics {
    sink: Option<Arc<dyn DiagnosticSink>>,
    verbose: bool,
}

impl Diagnostics {
    /// Create diagnostics writing to `sink`; trace lines only when `verbose`
    pub fn new(sink: Arc<dyn DiagnosticSink>, verbose: bool) -> Self {
        Self {
            sink: Some(sink),
            verbose,
        }
    }

    /// Diagnostics that never write anything
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Whether trace lines are written
    pub fn is_verbose(&self) -> bool {
        self.verbose && self.sink.is_some()
    }

    /// Write a trace line when verbose
    pub fn trace(&self, line: impl AsRef<str>) {
        if !self.verbose {
            return;
        }
        if let Some(sink) = &self.sink {
            sink.write_line(line.as_ref());
        }
    }

    /// Write a security warning; independent of verbosity
    pub fn warn(&self, line: impl AsRef<str>) {
        tracing::warn!("{}", line.as_ref());
        if let Some(sink) = &self.sink {
            sink.write_line(&format!("Warning: {}", line.as_ref()));
        }
    }

    /// Trace every header with `prefix`, redacting sensitive values
    pub fn trace_headers(&self, prefix: &str, headers: &HeaderMap) {
        if !self.is_verbose() {
            return;
        }
        for (name, value) in headers {
            let value = value.to_str().unwrap_or("<binary>");
            self.trace(format!(
                "{} {}: {}",
                prefix,
                name,
                redact_header(name.as_str(), value)
            ));
        }
    }
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("sink", &self.sink.is_some())
            .field("verbose", &self.verbose)
            .finish()
    }
}

/// Whether a header carries credentials
pub fn is_sensitive_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    matches!(
        name.as_str(),
        "authorization" | "proxy-authorization" | "cookie" | "set-cookie"
    ) || name.contains("api-key")
        || name.contains("apikey")
        || name.contains("api_key")
        || name.contains("token")
        || name.contains("secret")
}

/// Value to print for a header, with credentials removed.
///
/// Authorization-style values keep their scheme (`Bearer REDACTED`).
pub fn redact_header(name: &str, value: &str) -> String {
    if !is_sensitive_header(name) {
        return value.to_string();
    }
    let lower = name.to_ascii_lowercase();
    if lower == "authorization" || lower == "proxy-authorization" {
        if let Some((scheme, _)) = value.split_once(' ') {
            return format!("{} {}", scheme, REDACTED);
        }
    }
    REDACTED.to_string()
}

fn secret_param() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(token|key|secret|password|passwd|signature|sig|auth|credential)")
            .expect("static pattern")
    })
}

/// Render a URL for logs and errors without credentials or secret query values
pub fn sanitize_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return sanitize_unparsed(raw);
    };
    if url.password().is_some() {
        let _ = url.set_password(Some(REDACTED));
    }
    if url.query().is_some() {
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| {
                if secret_param().is_match(&k) {
                    (k.into_owned(), REDACTED.to_string())
                } else {
                    (k.into_owned(), v.into_owned())
                }
            })
            .collect();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    url.to_string()
}

/// Same as [`sanitize_url`] for a parsed URL
pub fn sanitize(url: &Url) -> String {
    sanitize_url(url.as_str())
}

fn sanitize_unparsed(raw: &str) -> String {
    // Keep the shape for diagnosis, drop anything that could be user-info.
    match raw.split_once('@') {
        Some((_, rest)) => format!("{}@{}", REDACTED, rest),
        None => raw.to_string(),
    }
}
