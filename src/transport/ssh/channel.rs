//! Per-channel plumbing: the buffered stream adapter the engine runs over and the ordered
//! steps that end a channel.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
    time::Duration,
};

use russh::{ChannelId, CryptoVec, server::Handle};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter, ReadHalf, WriteHalf};
use tracing::debug;

use crate::protocol::ProtocolError;

/// Extended-data type code for stderr.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

const SUCCESS_LINGER: Duration = Duration::from_millis(200);
const FAILURE_LINGER: Duration = Duration::from_millis(100);

/// Split a channel stream into buffered read and write halves of `capacity` bytes each.
///
/// Every write is flushed to the channel before it completes, so a pkt-line never sits in
/// the buffer while the engine waits on the client.
pub fn split_buffered<S>(
    stream: S,
    capacity: usize,
) -> (BufReader<ReadHalf<S>>, FlushingWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (reader, writer) = tokio::io::split(stream);
    (
        BufReader::with_capacity(capacity, reader),
        FlushingWriter::new(BufWriter::with_capacity(capacity, writer)),
    )
}

/// A [`BufWriter`] that flushes after each accepted write.
#[derive(Debug)]
pub struct FlushingWriter<W> {
    inner: BufWriter<W>,
    /// Bytes taken by a write whose flush has not completed yet.
    accepted: Option<usize>,
}

impl<W: AsyncWrite> FlushingWriter<W> {
    pub fn new(inner: BufWriter<W>) -> Self {
        Self {
            inner,
            accepted: None,
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for FlushingWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let written = match this.accepted {
            Some(n) => n,
            None => {
                let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
                this.accepted = Some(n);
                n
            }
        };
        let flushed = ready!(Pin::new(&mut this.inner).poll_flush(cx));
        this.accepted = None;
        Poll::Ready(flushed.map(|()| written))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationStep {
    /// Diagnostic text on stderr.
    Stderr(String),
    ExitStatus(u32),
    Eof,
    /// Give the client time to drain before the close.
    Pause(Duration),
    Close,
}

/// Ordered steps that end an exec'd channel.
///
/// A successful exchange ends with a plain EOF and no exit status; a failed one reports the
/// error on stderr and exits with status 1 before closing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationPlan {
    steps: Vec<TerminationStep>,
}

impl TerminationPlan {
    pub fn success() -> Self {
        Self {
            steps: vec![
                TerminationStep::Eof,
                TerminationStep::Pause(SUCCESS_LINGER),
                TerminationStep::Close,
            ],
        }
    }

    pub fn failure(message: impl std::fmt::Display) -> Self {
        Self {
            steps: vec![
                TerminationStep::Stderr(format!("error: {message}\n")),
                TerminationStep::ExitStatus(1),
                TerminationStep::Eof,
                TerminationStep::Pause(FAILURE_LINGER),
                TerminationStep::Close,
            ],
        }
    }

    pub fn for_outcome(outcome: &Result<(), ProtocolError>) -> Self {
        match outcome {
            Ok(()) => Self::success(),
            Err(e) => Self::failure(e),
        }
    }

    pub fn steps(&self) -> &[TerminationStep] {
        &self.steps
    }

    /// Run the steps against `channel`. A peer that is already gone is not an error.
    pub async fn execute(self, handle: &Handle, channel: ChannelId) {
        for step in self.steps {
            let delivered = match step {
                TerminationStep::Stderr(text) => handle
                    .extended_data(
                        channel,
                        SSH_EXTENDED_DATA_STDERR,
                        CryptoVec::from_slice(text.as_bytes()),
                    )
                    .await
                    .is_ok(),
                TerminationStep::ExitStatus(code) => {
                    handle.exit_status_request(channel, code).await.is_ok()
                }
                TerminationStep::Eof => handle.eof(channel).await.is_ok(),
                TerminationStep::Pause(delay) => {
                    tokio::time::sleep(delay).await;
                    true
                }
                TerminationStep::Close => handle.close(channel).await.is_ok(),
            };
            if !delivered {
                debug!(?channel, "peer went away during channel termination");
                return;
            }
        }
    }
}
