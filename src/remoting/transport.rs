//! Content-Length framing of JSON messages.

use crate::error::Error;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{BufRead, BufReader, Read, Write};

/// Maximum accepted frame payload, anything larger is a protocol violation.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub struct FrameReader<R: Read> {
    reader: BufReader<R>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }

    /// Read a single message. Returns [`Error::Disconnected`] if the stream is closed
    /// between frames.
    pub fn read_message<T: DeserializeOwned>(&mut self) -> Result<T, Error> {
        let mut content_length: Option<usize> = None;
        loop {
            let mut line = String::new();
            let read_n = match self.reader.read_line(&mut line) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => 0,
                Err(e) => return Err(e.into()),
            };
            if read_n == 0 {
                return Err(Error::Disconnected);
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if content_length.is_some() {
                    break;
                }
                continue;
            }
            if let Some(v) = line.strip_prefix("Content-Length:") {
                let len = v
                    .trim()
                    .parse()
                    .map_err(|_| Error::Protocol(format!("bad Content-Length header: {v}")))?;
                content_length = Some(len);
            }
        }

        let len = content_length.unwrap_or_default();
        if len > MAX_FRAME_LEN {
            return Err(Error::Protocol(format!("frame of {len} bytes is too large")));
        }
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)?;
        Ok(serde_json::from_slice(&buf)?)
    }
}

pub struct FrameWriter<W: Write> {
    writer: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a single message (with Content-Length framing).
    pub fn write_message<T: Serialize>(&mut self, message: &T) -> Result<(), Error> {
        let payload = serde_json::to_vec(message)?;
        write!(self.writer, "Content-Length: {}\r\n\r\n", payload.len())?;
        self.writer.write_all(&payload)?;
        self.writer.flush()?;
        Ok(())
    }
}
