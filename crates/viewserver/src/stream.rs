use std::cell::RefCell;
use std::io::{BufRead, Write};
use std::rc::Rc;

use serde_json::Value;
use tracing::{debug, error};

use crate::error::ViewServerError;

/// Newline-delimited JSON framing over a pair of byte streams.
///
/// This API is synchronous and line-oriented: the engine is the child side of
/// the pipe and processes exactly one frame at a time.
pub trait FrameIo {
    /// Blocks until a complete newline-terminated line is available and
    /// decodes it as JSON.
    ///
    /// Returns the frame together with its byte length including the newline,
    /// or `None` at end of stream. Malformed JSON is a `json_decode` fatal.
    fn read_frame(&mut self) -> Result<Option<(Value, usize)>, ViewServerError>;

    /// Encodes `frame` as JSON, appends a newline and flushes.
    ///
    /// Write failures are swallowed: they mean the host died, and the next
    /// `read_frame` will see end-of-stream and terminate the engine cleanly.
    fn write_frame(&mut self, frame: &Value) -> Result<(), ViewServerError>;
}

/// Shared handle to the engine's frame stream.
///
/// The list sub-protocol pulls rows from inside user-code callbacks, so the
/// stream is shared between the main loop and the evaluator's capability
/// hooks. The engine is single-threaded; `Rc<RefCell<..>>` is the ownership
/// model, not a synchronization primitive.
pub type SharedIo = Rc<RefCell<dyn FrameIo>>;

/// [`FrameIo`] over any buffered reader/writer pair.
pub struct LineStream<R, W> {
    reader: R,
    writer: W,
    buffer: String,
}

impl<R, W> LineStream<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        LineStream {
            reader,
            writer,
            buffer: String::new(),
        }
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }
}

impl<R: BufRead, W: Write> FrameIo for LineStream<R, W> {
    fn read_frame(&mut self) -> Result<Option<(Value, usize)>, ViewServerError> {
        self.buffer.clear();
        let len = self
            .reader
            .read_line(&mut self.buffer)
            .map_err(|err| ViewServerError::fatal("json_decode", err.to_string()))?;
        if len == 0 {
            return Ok(None);
        }
        let line = self.buffer.trim_end_matches(['\n', '\r']);
        let frame = serde_json::from_str(line).map_err(|err| {
            error!(%line, "failed to decode input frame");
            ViewServerError::fatal("json_decode", err.to_string())
        })?;
        Ok(Some((frame, len)))
    }

    fn write_frame(&mut self, frame: &Value) -> Result<(), ViewServerError> {
        let encoded = serde_json::to_string(frame).map_err(|err| {
            error!("failed to encode output frame");
            ViewServerError::fatal("json_encode", err.to_string())
        })?;
        let written = self
            .writer
            .write_all(encoded.as_bytes())
            .and_then(|()| self.writer.write_all(b"\n"))
            .and_then(|()| self.writer.flush());
        if let Err(err) = written {
            // The host tore the pipe down mid-write; the next read sees EOF.
            debug!(error = %err, "output stream closed while writing frame");
        }
        Ok(())
    }
}
