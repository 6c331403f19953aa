//! FSF client-server communication protocol.
//!
//! This module defines the wire protocol spoken between an FSF client and an FSF
//! scanning server: how a submission is framed, how the scan report is read back
//! and how the trailing stream of extracted sub-objects is drained.
//!
//! # Overview
//!
//! A submission is a single exchange over a fresh TCP connection:
//!
//! 1. A [`ServerPool`] is shuffled and each endpoint is tried once until one accepts.
//! 2. The [`SubmissionRequest`] is framed and written to the connection.
//! 3. Unless the report is suppressed, one length-prefixed report frame is read.
//! 4. When the full dump is requested, the sub-object stream is drained into a sink.
//!
//! # Binary Format
//!
//! - Every length is a 4-byte, big-endian unsigned integer.
//! - The outbound submission is `[length][FSF_RPC][body]`, the body being six fields
//!   joined with the literal `FSF_RPC` delimiter.
//! - The sub-object stream opens with a 4-byte status; `Null` means no sub-objects follow.
//!
//! The delimiter is not escaped. A sample name or source containing `FSF_RPC` shifts
//! field boundaries on the server; only the trailing payload may safely contain it.
//!
//! # Key Components
//!
//! - [`ProtocolTransport`]: Frame level reads and writes over any `Read + Write` stream.
//! - [`Session`]: Connect-and-submit state machine owning one connection.
//! - [`select_order`]: Randomised failover order over the configured pool.
//! - [`drain_subobjects`]: Reader for the trailing sub-object stream.
mod frame;
mod request;
mod selector;
mod session;
mod stream;
mod transport;

pub use frame::{
    DELIMITER, FRAME_MARKER, HEADER_SIZE, decode_frame_header, decode_submission,
    encode_frame_header, encode_submission, read_exact_payload,
};
pub use request::{ArchivePolicy, SubmissionRequest};
pub use selector::{ServerEndpoint, ServerPool, select_order};
pub use session::{Connector, Session, SessionState, TcpConnector, dump_dir_name};
pub use stream::{
    DirectorySink, NO_SUBOBJECTS, StreamState, SubObjectOutcome, SubObjectSink, content_name,
    drain_subobjects,
};
pub use transport::ProtocolTransport;

pub mod error {
    use std::{io, path::PathBuf};

    use thiserror::Error;

    use super::ServerEndpoint;

    /// Failures while framing or unframing bytes.
    #[derive(Debug, Error)]
    pub enum FrameError {
        #[error("malformed frame header: expected 4 bytes, got {len}")]
        MalformedHeader { len: usize },

        #[error("connection closed after {received} of {expected} bytes")]
        ConnectionClosed { expected: usize, received: usize },

        #[error("frame does not carry the FSF_RPC marker")]
        InvalidMarker,

        #[error("malformed submission: {0}")]
        MalformedSubmission(String),

        #[error("failed to encode frame header: {0}")]
        Encode(#[from] bincode::error::EncodeError),

        #[error("frame IO error: {0}")]
        Io(#[from] io::Error),
    }

    impl FrameError {
        /// Whether the peer closed the stream before the expected bytes arrived.
        pub fn is_closed(&self) -> bool {
            matches!(self, FrameError::ConnectionClosed { .. })
        }
    }

    /// Invalid client configuration; always raised before any connection attempt.
    #[derive(Debug, Error)]
    pub enum ConfigError {
        #[error(
            "invalid archive option '{0}'; expected 'none', 'file-on-alert', 'all-on-alert', 'all-the-files' or 'all-the-things'"
        )]
        InvalidArchivePolicy(String),

        #[error("no FSF servers configured")]
        EmptyServerPool,

        #[error("failed to read config '{path}': {source}")]
        Read {
            path: PathBuf,
            #[source]
            source: io::Error,
        },

        #[error("failed to parse config: {0}")]
        Parse(#[from] serde_json::Error),
    }

    #[derive(Debug, Error)]
    pub enum ProtocolError {
        #[error("configuration error: {0}")]
        Configuration(#[from] ConfigError),

        #[error("there was a problem connecting to {endpoint}: {source}")]
        Connection {
            endpoint: ServerEndpoint,
            #[source]
            source: io::Error,
        },

        #[error("there are no servers available to send files to ({attempted} tried)")]
        NoServerAvailable { attempted: usize },

        #[error("there was a problem sending file to {endpoint}: {source}")]
        Write {
            endpoint: ServerEndpoint,
            #[source]
            source: FrameError,
        },

        #[error("there was a problem getting the report from {endpoint}: {source}")]
        ReportRead {
            endpoint: ServerEndpoint,
            #[source]
            source: FrameError,
        },

        #[error("failed to read sub-object stream: {0}")]
        SubObjectRead(#[source] FrameError),

        #[error("sub-object stream ended after {written} objects: {source}")]
        TruncatedSubObjectStream {
            written: usize,
            #[source]
            source: FrameError,
        },

        #[error("failed to write sub-object '{name}': {source}")]
        Sink {
            name: String,
            #[source]
            source: io::Error,
        },

        #[error("cannot {operation} while session is {state:?}")]
        InvalidState {
            operation: &'static str,
            state: super::SessionState,
        },

        #[error("failed to access source file '{path}': {source}")]
        SourceFile {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
    }
}
