use std::io::{Read, Write};

use log::trace;

use super::{
    HEADER_SIZE, SubmissionRequest, decode_frame_header, encode_submission, error::FrameError,
    read_exact_payload,
};

/// Frame level reads and writes over a bidirectional byte stream.
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self { stream }
    }

    pub fn write_submission(&mut self, request: &SubmissionRequest) -> Result<(), FrameError> {
        let buffer = encode_submission(request)?;
        self.stream.write_all(&buffer)?;
        self.stream.flush()?;
        trace!("wrote {} byte submission", buffer.len());
        Ok(())
    }

    /// Reads a raw 4-byte word such as the sub-object status.
    pub fn read_word(&mut self) -> Result<[u8; HEADER_SIZE], FrameError> {
        let bytes = read_exact_payload(&mut self.stream, HEADER_SIZE)?;
        let mut word = [0u8; HEADER_SIZE];
        word.copy_from_slice(&bytes);
        Ok(word)
    }

    pub fn read_u32(&mut self) -> Result<u32, FrameError> {
        decode_frame_header(&self.read_word()?)
    }

    /// Reads one length-prefixed frame and returns its payload.
    pub fn read_frame(&mut self) -> Result<Vec<u8>, FrameError> {
        let length = self.read_u32()? as usize;
        trace!("reading {length} byte frame");
        read_exact_payload(&mut self.stream, length)
    }

    pub fn into_inner(self) -> T {
        self.stream
    }
}
