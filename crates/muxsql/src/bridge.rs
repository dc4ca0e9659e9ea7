//! Bridges an established stream to a subprocess.
//!
//! Client `Data` goes to the child's stdin, buffered until `fin`. The child's
//! stdout is newline-delimited: a forwarder thread sends every record back as
//! one `Data` frame, so N emitted records arrive as N frames in order.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::process::Child;
use std::thread;

use bytes::BytesMut;
use muxsql_frame::{code, Message};
use muxsql_mux::{HandlerError, Stream, StreamHandler, Transition};
use tracing::{debug, info, warn};

const INPUT_BUFFER: usize = 64 * 1024;
const READ_BUFFER: usize = 16 * 1024;
/// Records longer than this are forwarded in pieces.
const MAX_RECORD: usize = 1024 * 1024;

/// Stream handler that owns the write side of a subprocess.
pub struct ProcessPipe {
    stream_id: u32,
    input: Option<BufWriter<Box<dyn Write + Send>>>,
}

impl ProcessPipe {
    /// Take the child's stdin and stdout and start forwarding.
    ///
    /// The forwarder reaps the child once its stdout reaches EOF.
    pub fn spawn(mut child: Child, stream: &Stream) -> Result<Self, HandlerError> {
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            reap(&mut child);
            return Err(HandlerError::internal("engine process has no piped stdio"));
        };
        Self::from_parts(Box::new(stdin), stdout, stream, Some(child))
            .map_err(|err| HandlerError::internal(format!("could not start forwarder: {err}")))
    }

    /// Bridge arbitrary endpoints.
    pub fn from_parts(
        input: Box<dyn Write + Send>,
        output: impl Read + Send + 'static,
        stream: &Stream,
        child: Option<Child>,
    ) -> io::Result<Self> {
        let forward_stream = stream.clone();
        thread::Builder::new()
            .name(format!("muxsql-forward-{}", stream.id()))
            .spawn(move || forward(output, forward_stream, child))?;
        debug!(stream = stream.id(), "process pipe opened");

        Ok(Self {
            stream_id: stream.id(),
            input: Some(BufWriter::with_capacity(INPUT_BUFFER, input)),
        })
    }

    fn write_data(&mut self, payload: &[u8], fin: bool) -> io::Result<()> {
        let Some(input) = self.input.as_mut() else {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "process input already closed",
            ));
        };
        input.write_all(payload)?;
        if fin {
            input.flush()?;
        }
        Ok(())
    }
}

impl StreamHandler for ProcessPipe {
    fn handle_message(
        &mut self,
        message: Message,
        _stream: &Stream,
    ) -> Result<Transition, HandlerError> {
        match message {
            Message::Data { payload, fin } => {
                self.write_data(&payload, fin).map_err(|err| {
                    HandlerError::internal(format!("write to process stdin: {err}"))
                })?;
                Ok(Transition::Stay)
            }
            other => {
                debug!(stream = self.stream_id, message = other.name(), "request on bridged stream");
                self.close();
                Err(HandlerError::unexpected(
                    "unexpected request on established connection",
                ))
            }
        }
    }

    /// Drop stdin without flushing; the child sees EOF and is left to exit.
    fn close(&mut self) {
        if let Some(writer) = self.input.take() {
            let (stdin, unflushed) = writer.into_parts();
            if let Ok(buffered) = unflushed {
                if !buffered.is_empty() {
                    debug!(
                        stream = self.stream_id,
                        bytes = buffered.len(),
                        "discarding unflushed input"
                    );
                }
            }
            drop(stdin);
            debug!(stream = self.stream_id, "process pipe closed");
        }
    }
}

impl Drop for ProcessPipe {
    fn drop(&mut self) {
        self.close();
    }
}

fn forward(output: impl Read, stream: Stream, child: Option<Child>) {
    let mut reader = BufReader::with_capacity(READ_BUFFER, output);
    let mut record = BytesMut::new();
    loop {
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(stream = stream.id(), error = %err, "reading process output failed");
                break;
            }
        };
        if available.is_empty() {
            break;
        }
        let window = &available[..available.len().min(MAX_RECORD - record.len())];
        let (taken, complete) = match window.iter().position(|&b| b == b'\n') {
            Some(end) => (end + 1, true),
            None => (window.len(), false),
        };
        record.extend_from_slice(&window[..taken]);
        reader.consume(taken);

        if complete || record.len() >= MAX_RECORD {
            emit(&stream, &mut record, false);
        }
    }

    // The last record only ends at EOF.
    if !record.is_empty() {
        emit(&stream, &mut record, true);
    }
    if !stream.is_closed() {
        stream.error(code::INTERNAL, "Unexpected EOF");
    }

    if let Some(mut child) = child {
        match child.wait() {
            Ok(status) => info!(stream = stream.id(), %status, "engine process exited"),
            Err(err) => warn!(stream = stream.id(), error = %err, "could not reap engine process"),
        }
    }
}

// A closed stream still drains, so the child never blocks on a full pipe.
fn emit(stream: &Stream, record: &mut BytesMut, fin: bool) {
    let payload = record.split().freeze();
    if stream.is_closed() {
        return;
    }
    if let Err(err) = stream.send_data(payload, fin) {
        debug!(stream = stream.id(), error = %err, "dropping process output");
    }
}

fn reap(child: &mut Child) {
    if let Err(err) = child.kill() {
        debug!(error = %err, "engine process already gone");
    }
    if let Err(err) = child.wait() {
        warn!(error = %err, "could not reap engine process");
    }
}
