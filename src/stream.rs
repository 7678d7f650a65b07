//! Stream multiplexing between a sandbox process and its owning session.
//!
//! Output chunks are pushed onto the session's unbounded event queue, so a slow client never
//! stalls the readers or the exit watcher. Input lines go through a channel to a dedicated
//! writer task that owns the child's stdin.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::protocol::{EventSender, ServerEvent};

const READ_CHUNK_SIZE: usize = 4096;

/// Delivery point for one run's `program-output` events.
///
/// Once closed, every later send is dropped. Closing happens under the same lock as sending, so
/// nothing produced by the run can appear after its terminal notice.
#[derive(Debug)]
pub struct OutputSink {
    run_id: String,
    tx: Mutex<Option<EventSender>>,
}

impl OutputSink {
    pub fn new(run_id: impl Into<String>, tx: EventSender) -> Self {
        Self {
            run_id: run_id.into(),
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Forward a chunk. Returns false if the sink is closed or the session is gone.
    pub fn send(&self, output: impl Into<String>) -> bool {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx
                .send(ServerEvent::ProgramOutput {
                    output: output.into(),
                    run_id: self.run_id.clone(),
                })
                .is_ok(),
            None => false,
        }
    }

    /// Emit a final notice (if any) and stop accepting output.
    pub fn close(&self, notice: Option<&str>) {
        let mut guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        if let (Some(tx), Some(notice)) = (guard.as_ref(), notice) {
            let _ = tx.send(ServerEvent::ProgramOutput {
                output: notice.to_string(),
                run_id: self.run_id.clone(),
            });
        }
        *guard = None;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }
}

/// Copy `reader` into `sink` chunk by chunk until EOF, a read error, or the sink closes.
pub fn spawn_output_forwarder<R>(
    reader: R,
    sink: Arc<OutputSink>,
    stream: &'static str,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = reader;
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut decoder = Utf8Decoder::default();
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    trace!(stream, bytes = n, "Program output");
                    let chunk = decoder.decode(&buf[..n]);
                    if !chunk.is_empty() && !sink.send(chunk) {
                        return;
                    }
                }
                Err(e) => {
                    debug!(stream, "Read error on program output: {}", e);
                    break;
                }
            }
        }
        if let Some(rest) = decoder.finish() {
            sink.send(rest);
        }
    })
}

/// Incremental UTF-8 decoding that holds back a character split across reads.
///
/// Invalid sequences become U+FFFD; an incomplete one is only replaced if the stream ends on it.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let consumed = self.pending.len() - rest.len();
        self.pending.drain(..consumed);
        out
    }

    /// Whatever is still held back, decoded lossily.
    pub fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.pending).into_owned())
        }
    }
}

/// Sending half of a run's stdin. Dropping it closes the program's stdin.
pub type InputSender = mpsc::UnboundedSender<String>;

/// Spawn the task that owns the child's stdin and writes each queued line followed by `\n`.
pub fn spawn_input_writer<W>(writer: W) -> (InputSender, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let handle = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(line) = rx.recv().await {
            let mut data = line.into_bytes();
            data.push(b'\n');
            if let Err(e) = writer.write_all(&data).await {
                debug!("Program stdin closed: {}", e);
                break;
            }
            if writer.flush().await.is_err() {
                break;
            }
        }
    });
    (tx, handle)
}
