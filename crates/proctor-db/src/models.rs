use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Passed,
    Failed,
    Canceled,
}

impl ExecutionStatus {
    /// Whether this status is terminal (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = ExecutionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(ExecutionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutionStatus`] string.
#[derive(Debug, Clone)]
pub struct ExecutionStatusParseError(pub String);

impl fmt::Display for ExecutionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid execution status: {:?}", self.0)
    }
}

impl std::error::Error for ExecutionStatusParseError {}

// ---------------------------------------------------------------------------

/// Severity level of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for LogLevel {
    type Err = LogLevelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(LogLevelParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`LogLevel`] string.
#[derive(Debug, Clone)]
pub struct LogLevelParseError(pub String);

impl fmt::Display for LogLevelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid log level: {:?}", self.0)
    }
}

impl std::error::Error for LogLevelParseError {}

// ---------------------------------------------------------------------------

/// Which collaborator produced a generated test artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ArtifactProvider {
    Model,
    Fallback,
}

impl fmt::Display for ArtifactProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Model => "model",
            Self::Fallback => "fallback",
        };
        f.write_str(s)
    }
}

impl FromStr for ArtifactProvider {
    type Err = ArtifactProviderParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "model" => Ok(Self::Model),
            "fallback" => Ok(Self::Fallback),
            other => Err(ArtifactProviderParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ArtifactProvider`] string.
#[derive(Debug, Clone)]
pub struct ArtifactProviderParseError(pub String);

impl fmt::Display for ArtifactProviderParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid artifact provider: {:?}", self.0)
    }
}

impl std::error::Error for ArtifactProviderParseError {}

// ---------------------------------------------------------------------------

/// Format of a materialized report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    Html,
    Json,
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Html => "html",
            Self::Json => "json",
        };
        f.write_str(s)
    }
}

impl FromStr for ReportType {
    type Err = ReportTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "html" => Ok(Self::Html),
            "json" => Ok(Self::Json),
            other => Err(ReportTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ReportType`] string.
#[derive(Debug, Clone)]
pub struct ReportTypeParseError(pub String);

impl fmt::Display for ReportTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid report type: {:?}", self.0)
    }
}

impl std::error::Error for ReportTypeParseError {}

// ---------------------------------------------------------------------------

/// Severity attached to an optimizer recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RecommendationSeverity {
    Low,
    Medium,
    High,
}

impl fmt::Display for RecommendationSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

impl FromStr for RecommendationSeverity {
    type Err = RecommendationSeverityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(RecommendationSeverityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RecommendationSeverity`] string.
#[derive(Debug, Clone)]
pub struct RecommendationSeverityParseError(pub String);

impl fmt::Display for RecommendationSeverityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid recommendation severity: {:?}", self.0)
    }
}

impl std::error::Error for RecommendationSeverityParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// One attempted run of a test artifact.
///
/// `id` is a caller-visible string so that externally submitted execution
/// ids (from the REST surface) and internally generated ones share a column.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Execution {
    pub id: String,
    pub status: ExecutionStatus,
    pub progress: f64,
    pub api_id: Option<String>,
    pub test_file_path: Option<String>,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Metadata for a generated test artifact.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TestArtifact {
    pub id: Uuid,
    pub title: String,
    pub file_path: String,
    pub provider: ArtifactProvider,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A per-execution report row written by the executor, pointing at the
/// artifact the run produced.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionReport {
    pub id: Uuid,
    pub execution_id: String,
    pub artifact_path: String,
    pub status: ExecutionStatus,
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A durable summary materialized by the reporter.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TestReport {
    pub id: Uuid,
    pub execution_id: String,
    pub report_type: ReportType,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
}

/// A structured log row persisted by the logger agent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LogEntryRow {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub context: serde_json::Value,
    pub source_type: String,
    pub source_instance: String,
    pub source_node: String,
    pub tags: Vec<String>,
    pub correlation_id: Option<String>,
}

/// An optimizer recommendation.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Recommendation {
    pub id: Uuid,
    pub execution_id: String,
    pub kind: String,
    pub severity: RecommendationSeverity,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_status_display_roundtrip() {
        let variants = [
            ExecutionStatus::Queued,
            ExecutionStatus::Running,
            ExecutionStatus::Passed,
            ExecutionStatus::Failed,
            ExecutionStatus::Canceled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: ExecutionStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn execution_status_invalid() {
        let result = "bogus".parse::<ExecutionStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn execution_status_terminality() {
        assert!(!ExecutionStatus::Queued.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Passed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Canceled.is_terminal());
    }

    #[test]
    fn log_level_display_roundtrip() {
        let variants = [
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: LogLevel = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn log_level_warning_alias() {
        assert_eq!("warning".parse::<LogLevel>().ok(), Some(LogLevel::Warn));
    }

    #[test]
    fn log_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn artifact_provider_display_roundtrip() {
        let variants = [ArtifactProvider::Model, ArtifactProvider::Fallback];
        for v in &variants {
            let s = v.to_string();
            let parsed: ArtifactProvider = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn artifact_provider_invalid() {
        let result = "cloud".parse::<ArtifactProvider>();
        assert!(result.is_err());
    }

    #[test]
    fn report_type_display_roundtrip() {
        let variants = [ReportType::Html, ReportType::Json];
        for v in &variants {
            let s = v.to_string();
            let parsed: ReportType = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn report_type_invalid() {
        let result = "xml".parse::<ReportType>();
        assert!(result.is_err());
    }

    #[test]
    fn recommendation_severity_display_roundtrip() {
        let variants = [
            RecommendationSeverity::Low,
            RecommendationSeverity::Medium,
            RecommendationSeverity::High,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: RecommendationSeverity = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn recommendation_severity_ordering() {
        assert!(RecommendationSeverity::Low < RecommendationSeverity::Medium);
        assert!(RecommendationSeverity::Medium < RecommendationSeverity::High);
    }
}
