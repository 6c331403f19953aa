//! Framing for FSF protocol messages.
//!
//! Every message exchanged with the server is a frame: a 4-byte big-endian length
//! followed by exactly that many bytes. The outbound submission additionally carries
//! the [`FRAME_MARKER`] between its length and its body.
use std::io::{ErrorKind, Read};

use bincode::{
    config::{BigEndian, Configuration, Fixint},
    decode_from_slice, encode_into_slice,
};
use log::trace;

use super::{ArchivePolicy, SubmissionRequest, error::FrameError};

/// Literal placed between every pair of submission fields.
pub const DELIMITER: &[u8] = b"FSF_RPC";
/// Literal identifying an outbound submission frame.
pub const FRAME_MARKER: &[u8] = b"FSF_RPC";
/// Size of every length prefix and count on the wire.
pub const HEADER_SIZE: usize = size_of::<u32>();

const SUBMISSION_FIELDS: usize = 6;
const READ_CHUNK: usize = 64 * 1024;

fn wire_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

fn encode_bool(value: bool) -> &'static [u8] {
    if value { &b"True"[..] } else { &b"False"[..] }
}

fn decode_bool(field: &[u8], name: &str) -> Result<bool, FrameError> {
    match field {
        b"True" => Ok(true),
        b"False" => Ok(false),
        other => Err(FrameError::MalformedSubmission(format!(
            "{name} must be 'True' or 'False', got '{}'",
            String::from_utf8_lossy(other)
        ))),
    }
}

/// Encodes `length` as a 4-byte big-endian prefix.
pub fn encode_frame_header(length: usize) -> Result<[u8; HEADER_SIZE], FrameError> {
    let length = u32::try_from(length).map_err(|_| {
        FrameError::MalformedSubmission(format!("{length} bytes do not fit a frame"))
    })?;

    let mut header = [0u8; HEADER_SIZE];
    encode_into_slice(length, &mut header, wire_config())?;
    Ok(header)
}

/// Interprets the first 4 bytes of `bytes` as a big-endian length.
pub fn decode_frame_header(bytes: &[u8]) -> Result<u32, FrameError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FrameError::MalformedHeader { len: bytes.len() });
    }

    let (length, _) = decode_from_slice::<u32, _>(&bytes[..HEADER_SIZE], wire_config())
        .map_err(|_| FrameError::MalformedHeader { len: bytes.len() })?;
    Ok(length)
}

/// Reads exactly `length` bytes, looping over short reads.
pub fn read_exact_payload<R: Read>(reader: &mut R, length: usize) -> Result<Vec<u8>, FrameError> {
    let mut data = Vec::new();
    read_payload_into(reader, length, &mut data)?;
    Ok(data)
}

/// Appends `length` bytes to `data`. The buffer grows with the bytes received, never
/// with the length the peer announced.
fn read_payload_into<R: Read>(
    reader: &mut R,
    length: usize,
    data: &mut Vec<u8>,
) -> Result<(), FrameError> {
    let mut chunk = [0u8; READ_CHUNK];
    let mut received = 0;

    while received < length {
        let want = (length - received).min(READ_CHUNK);
        match reader.read(&mut chunk[..want]) {
            Ok(0) => {
                return Err(FrameError::ConnectionClosed {
                    expected: length,
                    received,
                });
            }
            Ok(n) => {
                data.extend_from_slice(&chunk[..n]);
                received += n;
                trace!("read {received}/{length} bytes");
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(FrameError::Io(e)),
        }
    }

    Ok(())
}

/// Serializes a submission into the bytes written to the server.
///
/// The layout is `[length][FSF_RPC][body]` where `length` counts only the body.
pub fn encode_submission(request: &SubmissionRequest) -> Result<Vec<u8>, FrameError> {
    let fields: [&[u8]; SUBMISSION_FIELDS] = [
        request.sample_name.as_bytes(),
        request.source.as_bytes(),
        request.archive_policy.as_str().as_bytes(),
        encode_bool(request.suppress_report),
        encode_bool(request.full),
        &request.payload,
    ];
    let body = fields.join(DELIMITER);
    let header = encode_frame_header(body.len())?;

    let mut buffer = Vec::with_capacity(HEADER_SIZE + FRAME_MARKER.len() + body.len());
    buffer.extend_from_slice(&header);
    buffer.extend_from_slice(FRAME_MARKER);
    buffer.extend_from_slice(&body);
    Ok(buffer)
}

/// Splits `body` on the delimiter into at most `limit` fields; the last field keeps
/// any remaining delimiters.
fn split_fields(body: &[u8], limit: usize) -> Vec<&[u8]> {
    let mut fields = Vec::with_capacity(limit);
    let mut rest = body;

    while fields.len() + 1 < limit {
        match rest
            .windows(DELIMITER.len())
            .position(|window| window == DELIMITER)
        {
            Some(at) => {
                fields.push(&rest[..at]);
                rest = &rest[at + DELIMITER.len()..];
            }
            None => break,
        }
    }

    fields.push(rest);
    fields
}

/// Parses a frame produced by [`encode_submission`].
///
/// The payload may contain the delimiter; the text fields may not.
pub fn decode_submission(frame: &[u8]) -> Result<SubmissionRequest, FrameError> {
    let length = decode_frame_header(frame)? as usize;
    let rest = frame[HEADER_SIZE..]
        .strip_prefix(FRAME_MARKER)
        .ok_or(FrameError::InvalidMarker)?;

    if rest.len() != length {
        return Err(FrameError::MalformedSubmission(format!(
            "length prefix says {length} bytes, frame carries {}",
            rest.len()
        )));
    }

    let fields = split_fields(rest, SUBMISSION_FIELDS);
    let [sample_name, source, archive, suppress_report, full, payload] = fields[..] else {
        return Err(FrameError::MalformedSubmission(format!(
            "expected {SUBMISSION_FIELDS} fields, found {}",
            fields.len()
        )));
    };

    let text = |field: &[u8], name: &str| {
        String::from_utf8(field.to_vec())
            .map_err(|_| FrameError::MalformedSubmission(format!("{name} is not valid UTF-8")))
    };
    let archive_policy: ArchivePolicy = text(archive, "archive policy")?
        .parse()
        .map_err(|e| FrameError::MalformedSubmission(format!("{e}")))?;

    Ok(SubmissionRequest {
        sample_name: text(sample_name, "sample name")?,
        source: text(source, "source")?,
        archive_policy,
        suppress_report: decode_bool(suppress_report, "suppress_report")?,
        full: decode_bool(full, "full")?,
        payload: payload.to_vec(),
    })
}
