//! Reader for the sub-object stream that follows a scan report.
//!
//! After the report, a server asked for a full dump sends a 4-byte status. [`NO_SUBOBJECTS`]
//! ends the exchange. Any other status is followed by a sequence of
//! `[remaining count][length][payload]` records, the last of which announces zero remaining.
use std::{
    fs,
    io::{self, Read, Write},
    path::PathBuf,
};

use log::{debug, info};
use md5::{Digest, Md5};

use super::{ProtocolTransport, error::ProtocolError};

/// Status sent by the server when the submission produced no sub-objects.
pub const NO_SUBOBJECTS: [u8; 4] = *b"Null";

/// Where a sub-object stream stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// The server reported that no sub-objects exist.
    Empty,
    /// Objects are flowing. `remaining` is the count announced with the last object
    /// read, `None` before the first one.
    Streaming { remaining: Option<u32> },
}

impl StreamState {
    pub fn from_status(status: [u8; 4]) -> Self {
        if status == NO_SUBOBJECTS {
            StreamState::Empty
        } else {
            StreamState::Streaming { remaining: None }
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            StreamState::Empty
                | StreamState::Streaming {
                    remaining: Some(0)
                }
        )
    }
}

/// Result of the sub-object phase of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubObjectOutcome {
    /// No full dump was asked for, or no report was read.
    NotRequested,
    /// The server had nothing to send.
    Empty,
    /// Objects written in the order received, named by content hash.
    Dumped {
        directory: String,
        objects: Vec<String>,
    },
}

/// Destination for extracted sub-objects.
pub trait SubObjectSink {
    fn write_object(&mut self, directory: &str, name: &str, bytes: &[u8]) -> io::Result<()>;
}

impl<F> SubObjectSink for F
where
    F: FnMut(&str, &str, &[u8]) -> io::Result<()>,
{
    fn write_object(&mut self, directory: &str, name: &str, bytes: &[u8]) -> io::Result<()> {
        self(directory, name, bytes)
    }
}

/// Writes sub-objects to `root/<directory>/<name>`, creating the directory on first use.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SubObjectSink for DirectorySink {
    fn write_object(&mut self, directory: &str, name: &str, bytes: &[u8]) -> io::Result<()> {
        let dir = self.root.join(directory);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(name), bytes)
    }
}

/// Hex md5 digest used to name a sub-object.
pub fn content_name(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

/// Drains the sub-object stream into `sink`, stopping when the server announces zero remaining.
pub fn drain_subobjects<T, S>(
    transport: &mut ProtocolTransport<T>,
    directory: &str,
    sink: &mut S,
) -> Result<SubObjectOutcome, ProtocolError>
where
    T: Read + Write,
    S: SubObjectSink + ?Sized,
{
    let status = transport
        .read_word()
        .map_err(ProtocolError::SubObjectRead)?;
    let mut state = StreamState::from_status(status);
    if state == StreamState::Empty {
        info!("no sub-objects were returned from scanner");
        return Ok(SubObjectOutcome::Empty);
    }

    let mut objects = Vec::new();
    while !state.is_finished() {
        let truncated = |source: super::error::FrameError, written: usize| {
            if source.is_closed() {
                ProtocolError::TruncatedSubObjectStream { written, source }
            } else {
                ProtocolError::SubObjectRead(source)
            }
        };

        let remaining = transport
            .read_u32()
            .map_err(|e| truncated(e, objects.len()))?;
        let data = transport
            .read_frame()
            .map_err(|e| truncated(e, objects.len()))?;

        let name = content_name(&data);
        sink.write_object(directory, &name, &data)
            .map_err(|source| ProtocolError::Sink {
                name: name.clone(),
                source,
            })?;
        debug!("sub-object {name} ({} bytes), {remaining} remaining", data.len());

        objects.push(name);
        state = StreamState::Streaming {
            remaining: Some(remaining),
        };
    }

    info!(
        "{} sub-objects successfully written to: {directory}",
        objects.len()
    );
    Ok(SubObjectOutcome::Dumped {
        directory: directory.to_string(),
        objects,
    })
}
