//! Typed duplex channel over any byte stream.
//!
//! A reader task decodes inbound frames into `In` values and a writer task
//! encodes `Out` values into frames. Dropping every sender ends the writer,
//! which shuts the stream down so the peer observes EOF.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::codec::{decode, encode, read_frame, write_frame};
use crate::types::{Error, Result};

/// Frame kinds and limits for one side of a channel.
#[derive(Debug, Clone, Copy)]
pub struct FrameConfig {
    /// Kind byte expected on inbound frames.
    pub inbound_kind: u8,
    /// Kind byte written on outbound frames.
    pub outbound_kind: u8,
    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,
}

/// Handles for one endpoint of a framed channel.
#[derive(Debug)]
pub struct FramedEndpoint<In, Out> {
    pub outbound: mpsc::UnboundedSender<Out>,
    pub inbound: mpsc::UnboundedReceiver<Result<In>>,
    pub reader: JoinHandle<()>,
    pub writer: JoinHandle<()>,
}

/// Split `stream` and spawn its reader and writer tasks on the current runtime.
pub fn spawn<S, In, Out>(stream: S, config: FrameConfig) -> FramedEndpoint<In, Out>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Out>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Result<In>>();

    let reader = tokio::spawn(async move {
        loop {
            let frame = match read_frame(&mut read_half, config.max_frame_bytes).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break, // clean EOF
                Err(e) => {
                    let _ = in_tx.send(Err(Error::Io(e)));
                    break;
                }
            };

            let (kind, payload) = frame;
            if kind != config.inbound_kind {
                let _ = in_tx.send(Err(Error::codec(format!(
                    "Unexpected frame kind: 0x{:02X}",
                    kind
                ))));
                break;
            }

            let decoded = decode::<In>(&payload);
            let failed = decoded.is_err();
            if in_tx.send(decoded).is_err() || failed {
                break;
            }
        }
    });

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let payload = match encode(&message) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::error!("framed_encode_failed: {}", e);
                    continue;
                }
            };
            if let Err(e) = write_frame(&mut write_half, config.outbound_kind, &payload).await {
                tracing::debug!("framed_write_failed: {}", e);
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    FramedEndpoint {
        outbound: out_tx,
        inbound: in_rx,
        reader,
        writer,
    }
}
