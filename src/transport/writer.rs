//! Dedicated writer task for stream-socket connections.
//!
//! Senders hand finished messages to an mpsc channel; one task drains it
//! and writes each message behind its length prefix. Ready messages are
//! batched into a single vectored write.
//!
//! ```text
//! Task 1 ─┐
//! Task 2 ─┼─► mpsc::Sender<Bytes> ─► Writer Task ─► socket
//! Task N ─┘
//! ```

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::framing::{encode_length, LENGTH_PREFIX_SIZE};
use crate::error::{Result, RpcError};

/// Channel capacity for queued outbound messages.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum messages to batch in a single write.
const MAX_BATCH_SIZE: usize = 64;

struct Outbound {
    length: [u8; LENGTH_PREFIX_SIZE],
    body: Bytes,
}

impl Outbound {
    fn size(&self) -> usize {
        LENGTH_PREFIX_SIZE + self.body.len()
    }
}

/// Handle for queueing messages. Dropping every handle stops the task.
#[derive(Clone)]
pub(crate) struct WriterHandle {
    tx: mpsc::Sender<Outbound>,
}

impl WriterHandle {
    pub async fn send(&self, body: Bytes) -> Result<()> {
        let frame = Outbound {
            length: encode_length(body.len()),
            body,
        };
        self.tx
            .send(frame)
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }
}

/// Spawn the writer task over `writer`.
pub(crate) fn spawn_writer_task<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
    let task = tokio::spawn(writer_loop(rx, writer));
    (WriterHandle { tx }, task)
}

async fn writer_loop<W>(mut rx: mpsc::Receiver<Outbound>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }
        let result = write_batch(&mut writer, &batch).await;
        batch.clear();
        result?;
    }
    // Every handle dropped.
    let _ = writer.shutdown().await;
    Ok(())
}

async fn write_batch<W>(writer: &mut W, batch: &[Outbound]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = batch.iter().map(Outbound::size).sum();
    let mut written = 0;
    while written < total {
        let slices = remaining_slices(batch, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(RpcError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        written += n;
    }
    writer.flush().await?;
    Ok(())
}

/// Slices covering everything after the first `skip` bytes of `batch`.
fn remaining_slices(batch: &[Outbound], skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;
    for frame in batch {
        for part in [&frame.length[..], &frame.body[..]] {
            let end = offset + part.len();
            if skip < end && !part.is_empty() {
                slices.push(IoSlice::new(&part[skip.saturating_sub(offset)..]));
            }
            offset = end;
        }
    }
    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::framing::LengthDelimited;
    use tokio::io::{duplex, AsyncReadExt};

    fn outbound(body: &'static [u8]) -> Outbound {
        Outbound {
            length: encode_length(body.len()),
            body: Bytes::from_static(body),
        }
    }

    #[test]
    fn test_remaining_slices_skip() {
        let batch = [outbound(b"abc"), outbound(b"de")];
        assert_eq!(remaining_slices(&batch, 0).len(), 4);

        // inside the first length prefix
        let slices = remaining_slices(&batch, 2);
        assert_eq!(slices[0].len(), 2);
        assert_eq!(slices.len(), 4);

        // past the whole first frame and half the second prefix
        let slices = remaining_slices(&batch, 9);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), 2);
        assert_eq!(&slices[1][..], b"de");
    }

    #[tokio::test]
    async fn test_writer_frames_messages() {
        let (client, mut server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client);
        handle.send(Bytes::from_static(b"hello")).await.unwrap();
        handle.send(Bytes::from_static(b"world!")).await.unwrap();
        drop(handle);
        task.await.unwrap().unwrap();

        let mut raw = Vec::new();
        server.read_to_end(&mut raw).await.unwrap();
        let mut framer = LengthDelimited::new(1024);
        let messages = framer.push(&raw).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(&messages[0][..], b"hello");
        assert_eq!(&messages[1][..], b"world!");
    }
}
