use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::error::ConfigError;

/// Server-side archiving instruction for a submission and its sub-objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchivePolicy {
    /// Never archive.
    #[default]
    None,
    /// Archive the submitted file when an alert condition is met.
    FileOnAlert,
    /// Archive the file and all its sub-objects when an alert condition is met.
    AllOnAlert,
    /// Archive every submitted file.
    AllTheFiles,
    /// Archive every submitted file and all its sub-objects.
    AllTheThings,
}

impl ArchivePolicy {
    pub const ALL: [ArchivePolicy; 5] = [
        ArchivePolicy::None,
        ArchivePolicy::FileOnAlert,
        ArchivePolicy::AllOnAlert,
        ArchivePolicy::AllTheFiles,
        ArchivePolicy::AllTheThings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArchivePolicy::None => "none",
            ArchivePolicy::FileOnAlert => "file-on-alert",
            ArchivePolicy::AllOnAlert => "all-on-alert",
            ArchivePolicy::AllTheFiles => "all-the-files",
            ArchivePolicy::AllTheThings => "all-the-things",
        }
    }
}

impl fmt::Display for ArchivePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchivePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArchivePolicy::ALL
            .into_iter()
            .find(|policy| policy.as_str() == s)
            .ok_or_else(|| ConfigError::InvalidArchivePolicy(s.to_string()))
    }
}

/// One file plus the metadata the server needs to scan it.
///
/// A request is built once per file and consumed by a single [`Session`](super::Session).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRequest {
    pub sample_name: String,
    pub source: String,
    pub archive_policy: ArchivePolicy,
    pub suppress_report: bool,
    pub full: bool,
    pub payload: Vec<u8>,
}

impl SubmissionRequest {
    /// Builds a request, validating the archive option as it was supplied by the user.
    pub fn new(
        sample_name: impl Into<String>,
        source: impl Into<String>,
        archive_policy: &str,
        suppress_report: bool,
        full: bool,
        payload: Vec<u8>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            sample_name: sample_name.into(),
            source: source.into(),
            archive_policy: archive_policy.parse()?,
            suppress_report,
            full,
            payload,
        })
    }

    /// Whether the server will send a report back for this request.
    pub fn expects_report(&self) -> bool {
        !self.suppress_report
    }

    /// Whether sub-objects will follow the report.
    pub fn expects_subobjects(&self) -> bool {
        self.full && self.expects_report()
    }
}
