//! Container logs, served under `/logs/pod/{pod}/container/{container}`
use chrono::{DateTime, Utc};
use overlook_core::{Error, LogSource};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// One logged line
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the line was logged, missing when the line carried no readable timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// The line itself
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl LogEntry {
    /// Split a timestamp-prefixed line
    pub fn parse(line: &str) -> Self {
        let parsed = line.split_once(' ').and_then(|(stamp, message)| {
            DateTime::parse_from_rfc3339(stamp)
                .ok()
                .map(|ts| (ts.with_timezone(&Utc), message))
        });
        match parsed {
            Some((timestamp, message)) => Self {
                timestamp: Some(timestamp),
                message: message.to_string(),
            },
            None => Self {
                timestamp: None,
                message: line.to_string(),
            },
        }
    }
}

/// Log lines of one container
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogResponse {
    /// Lines in the order they were logged
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<LogEntry>,
}

impl LogResponse {
    /// Parse raw log text, skipping blank lines
    pub fn parse(raw: &str) -> Self {
        Self {
            entries: raw
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(LogEntry::parse)
                .collect(),
        }
    }
}

/// Read the logs of a container through `source`
#[instrument(skip(source))]
pub async fn container_logs(
    source: &dyn LogSource,
    namespace: &str,
    pod: &str,
    container: &str,
) -> Result<LogResponse, Error> {
    for (what, value) in [("namespace", namespace), ("pod", pod), ("container", container)] {
        if value.is_empty() {
            return Err(Error::InvalidTarget(format!("{what} is required")));
        }
    }
    let raw = source.logs(namespace, pod, container).await?;
    let logs = LogResponse::parse(&raw);
    debug!(entries = logs.entries.len(), "read container logs");
    Ok(logs)
}
