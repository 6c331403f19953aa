//! Batch submission driver.
//!
//! The [`Client`] runs one [`Session`] per file, sequentially, each over a fresh
//! connection. A failed file is reported and the batch moves on.
use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info};

use crate::{
    config::ClientConfig,
    protocol::{
        ArchivePolicy, Connector, DirectorySink, ServerEndpoint, ServerPool, Session,
        SubObjectOutcome, SubObjectSink, SubmissionRequest, TcpConnector,
        error::{ConfigError, ProtocolError},
    },
    report::{Reporter, reporter_for},
};

pub const DEFAULT_SOURCE: &str = "Analyst";

/// Per-batch submission settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitOptions {
    pub source: String,
    pub archive_policy: ArchivePolicy,
    pub suppress_report: bool,
    pub full: bool,
    /// Remove the local file once it has been sent.
    pub delete_after_send: bool,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            archive_policy: ArchivePolicy::None,
            suppress_report: false,
            full: false,
            delete_after_send: false,
        }
    }
}

/// A request plus the local file it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub request: SubmissionRequest,
    pub path: Option<PathBuf>,
    pub delete_after_send: bool,
}

impl Submission {
    pub fn from_bytes(
        sample_name: impl Into<String>,
        payload: Vec<u8>,
        options: &SubmitOptions,
    ) -> Self {
        Self {
            request: SubmissionRequest {
                sample_name: sample_name.into(),
                source: options.source.clone(),
                archive_policy: options.archive_policy,
                suppress_report: options.suppress_report,
                full: options.full,
                payload,
            },
            path: None,
            delete_after_send: false,
        }
    }

    /// Reads `path`, naming the sample after the file's base name.
    pub fn from_path(path: impl AsRef<Path>, options: &SubmitOptions) -> Result<Self, ProtocolError> {
        let path = path.as_ref();
        let payload = fs::read(path).map_err(|source| ProtocolError::SourceFile {
            path: path.to_path_buf(),
            source,
        })?;
        let sample_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let mut submission = Self::from_bytes(sample_name, payload, options);
        submission.path = Some(path.to_path_buf());
        submission.delete_after_send = options.delete_after_send;
        Ok(submission)
    }
}

/// What a successful submission produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionOutcome {
    pub host: ServerEndpoint,
    /// `None` when the report was suppressed.
    pub report: Option<Vec<u8>>,
    pub subobjects: SubObjectOutcome,
}

pub struct Client<C: Connector = TcpConnector, S: SubObjectSink = DirectorySink> {
    pool: ServerPool,
    connector: C,
    sink: S,
    reporter: Box<dyn Reporter>,
}

impl Client {
    /// Builds a TCP client that dumps sub-objects under the current directory.
    pub fn new(config: &ClientConfig, suppress_report: bool) -> Result<Self, ConfigError> {
        Ok(Self::with_parts(
            config.server_pool()?,
            TcpConnector::from(&config.timeouts),
            DirectorySink::new("."),
            reporter_for(config, suppress_report),
        ))
    }
}

impl<C: Connector, S: SubObjectSink> Client<C, S> {
    pub fn with_parts(pool: ServerPool, connector: C, sink: S, reporter: Box<dyn Reporter>) -> Self {
        Self {
            pool,
            connector,
            sink,
            reporter,
        }
    }

    /// Submits one file. Failures are reported before being returned.
    pub fn submit(&mut self, submission: Submission) -> Result<SubmissionOutcome, ProtocolError> {
        let sample_name = submission.request.sample_name.clone();
        let res = self.run(submission);

        if let Err(e) = &res {
            self.reporter
                .error(&format!("there was a problem submitting {sample_name}: {e}"));
        }
        res
    }

    /// Submits every file in order, carrying on past failures.
    pub fn submit_batch<I>(&mut self, submissions: I) -> Vec<Result<SubmissionOutcome, ProtocolError>>
    where
        I: IntoIterator<Item = Submission>,
    {
        submissions
            .into_iter()
            .map(|submission| self.submit(submission))
            .collect()
    }

    /// Reads and submits every path in order, carrying on past unreadable files.
    pub fn submit_paths<I, P>(
        &mut self,
        paths: I,
        options: &SubmitOptions,
    ) -> Vec<Result<SubmissionOutcome, ProtocolError>>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        paths
            .into_iter()
            .map(|path| match Submission::from_path(path, options) {
                Ok(submission) => self.submit(submission),
                Err(e) => {
                    self.reporter.error(&e.to_string());
                    Err(e)
                }
            })
            .collect()
    }

    fn run(&mut self, submission: Submission) -> Result<SubmissionOutcome, ProtocolError> {
        let Submission {
            request,
            path,
            delete_after_send,
        } = submission;

        let mut session = Session::new(&self.connector, self.reporter.as_mut());
        let host = session.open(&self.pool, &mut rand::rng())?;
        let written = session.submit(&request);

        // The local copy goes whether or not the write made it.
        if delete_after_send {
            if let Some(path) = &path {
                match fs::remove_file(path) {
                    Ok(()) => debug!("removed {}", path.display()),
                    Err(e) => session
                        .reporter()
                        .error(&format!("failed to remove {}: {e}", path.display())),
                }
            }
        }
        written?;

        if !request.expects_report() {
            info!("submitted {} to {host}, report suppressed", request.sample_name);
            return Ok(SubmissionOutcome {
                host,
                report: None,
                subobjects: SubObjectOutcome::NotRequested,
            });
        }

        let report = session.await_report()?;
        let subobjects = if request.full {
            session.await_subobjects(&report, &mut self.sink)?
        } else {
            SubObjectOutcome::NotRequested
        };

        Ok(SubmissionOutcome {
            host,
            report: Some(report),
            subobjects,
        })
    }
}
