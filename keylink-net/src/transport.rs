//! Local transport: length-prefixed packet reads and a writer task per connection.

use std::io;

use keylink_core::wire::{self, LEN_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::event::SessionError;

/// Read one framed packet. `Ok(None)` when the peer closed cleanly between frames.
pub(crate) async fn read_packet<R>(reader: &mut R) -> Result<Option<Vec<u8>>, SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = wire::frame_len(len_buf)?;
    let mut packet = vec![0u8; len];
    reader.read_exact(&mut packet).await?;
    Ok(Some(packet))
}

/// Writer task input.
#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Vec<u8>),
    /// Refuse further frames, write the ones already queued, then shut the socket down.
    Shutdown,
}

/// Drain already-framed packets into the socket until shutdown, the channel closes, or a write fails.
pub(crate) fn spawn_writer<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Outbound>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Frame(frame) => {
                    if let Err(e) = writer.write_all(&frame).await {
                        debug!(error = %e, "write failed, stopping writer");
                        return;
                    }
                }
                Outbound::Shutdown => rx.close(),
            }
        }
        let _ = writer.flush().await;
        let _ = writer.shutdown().await;
    })
}
