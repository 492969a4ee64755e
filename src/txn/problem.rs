//! # Problems recorded on a transaction.
//!
//! Tasks and controllers report [`Problem`]s while executing or validating.
//! The highest [`Severity`] decides what the transaction may still do:
//!
//! ```text
//! INFO / WARNING  → prepare succeeds, commit allowed
//! ERROR           → reported during validation: prepare fails, rollback only
//! CRITICAL        → commit refused (CannotCommit), rollback only
//! ```

use std::fmt;
use std::sync::Arc;

/// Problem severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Returns a short stable label for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// A single problem: severity, message, optional subject and cause.
#[derive(Debug, Clone)]
pub struct Problem {
    severity: Severity,
    message: String,
    subject: Option<Arc<str>>,
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Problem {
    /// Creates a problem with the given severity.
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            subject: None,
            cause: None,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self::new(Severity::Critical, message)
    }

    /// Names what the problem is about (a service or task name).
    pub fn with_subject(mut self, subject: impl Into<Arc<str>>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Attaches the underlying cause.
    pub fn with_cause(mut self, cause: Arc<dyn std::error::Error + Send + Sync>) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn cause(&self) -> Option<&Arc<dyn std::error::Error + Send + Sync>> {
        self.cause.as_ref()
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ", self.severity)?;
        if let Some(subject) = &self.subject {
            write!(f, "{subject}: ")?;
        }
        f.write_str(&self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " ({cause})")?;
        }
        Ok(())
    }
}

/// Snapshot of every problem recorded on a transaction, in report order.
#[derive(Debug, Clone, Default)]
pub struct ProblemReport {
    problems: Vec<Problem>,
}

impl ProblemReport {
    pub(crate) fn new(problems: Vec<Problem>) -> Self {
        Self { problems }
    }

    /// Highest severity in the report, `None` when empty.
    pub fn max_severity(&self) -> Option<Severity> {
        self.problems.iter().map(Problem::severity).max()
    }

    /// True if any problem is at least `severity`.
    pub fn has_at_least(&self, severity: Severity) -> bool {
        self.problems.iter().any(|p| p.severity >= severity)
    }

    pub fn problems(&self) -> &[Problem] {
        &self.problems
    }

    pub fn iter(&self) -> impl Iterator<Item = &Problem> {
        self.problems.iter()
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }
}

impl fmt::Display for ProblemReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.problems.is_empty() {
            return f.write_str("no problems");
        }
        for (i, p) in self.problems.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{p}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severities_are_ordered() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }

    #[test]
    fn report_tracks_max_severity() {
        let report = ProblemReport::new(vec![
            Problem::warning("missing dependency").with_subject("db"),
            Problem::error("start failed").with_subject("cache"),
        ]);
        assert_eq!(report.max_severity(), Some(Severity::Error));
        assert!(report.has_at_least(Severity::Error));
        assert!(!report.has_at_least(Severity::Critical));
        assert_eq!(
            report.to_string(),
            "[WARNING] db: missing dependency; [ERROR] cache: start failed"
        );
    }

    #[test]
    fn empty_report() {
        let report = ProblemReport::default();
        assert!(report.is_empty());
        assert_eq!(report.max_severity(), None);
        assert_eq!(report.to_string(), "no problems");
    }
}
