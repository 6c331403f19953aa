pub mod client;
pub mod config;
pub mod protocol;
pub mod report;

pub use client::{Client, Submission, SubmissionOutcome, SubmitOptions};
pub use config::ClientConfig;
pub use protocol::{
    ArchivePolicy, ServerEndpoint, ServerPool, Session, SubmissionRequest,
    error::{ConfigError, FrameError, ProtocolError},
};
pub use report::Reporter;
