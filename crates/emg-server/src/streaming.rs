//! One connection's acquisition → filter → capture → send loop

use crate::session_table::SessionTable;
use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use emg_core::{EmgError, EmgResult, SessionId, SignalMatrix};
use emg_processing::{FilterPipeline, SafeFilter};
use emg_source::SignalSource;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Frames pushed to the client as JSON text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    Meta {
        fs: f64,
        channels: usize,
        session_id: SessionId,
    },
    Data {
        raw: SignalMatrix,
        env: SignalMatrix,
    },
}

/// Outbound half of a client connection
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: &StreamFrame) -> EmgResult<()>;

    /// Close normally; errors are ignored by the loop
    async fn close(&mut self) -> EmgResult<()>;
}

#[async_trait]
impl FrameSink for SplitSink<WebSocket, Message> {
    async fn send_frame(&mut self, frame: &StreamFrame) -> EmgResult<()> {
        let json = serde_json::to_string(frame)
            .map_err(|e| EmgError::disconnected(format!("cannot encode frame: {}", e)))?;
        self.send(Message::Text(json.into()))
            .await
            .map_err(|e| EmgError::disconnected(format!("websocket send failed: {}", e)))
    }

    async fn close(&mut self) -> EmgResult<()> {
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: Utf8Bytes::from_static(""),
        };
        self.send(Message::Close(Some(frame)))
            .await
            .map_err(|e| EmgError::disconnected(format!("websocket close failed: {}", e)))
    }
}

#[async_trait]
impl FrameSink for mpsc::Sender<StreamFrame> {
    async fn send_frame(&mut self, frame: &StreamFrame) -> EmgResult<()> {
        self.send(frame.clone())
            .await
            .map_err(|_| EmgError::disconnected("receiver dropped"))
    }

    async fn close(&mut self) -> EmgResult<()> {
        Ok(())
    }
}

/// Why a streaming loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    ClientClosed,
    SendFailed,
    SourceLost,
    /// Saved or discarded while the loop was live
    Finalized,
    Shutdown,
}

/// Everything a loop needs besides its sink
#[derive(Clone)]
pub struct StreamContext {
    pub table: Arc<SessionTable>,
    pub source: Arc<dyn SignalSource>,
    pub filter: Arc<SafeFilter<FilterPipeline>>,
    pub chunk_size: usize,
    pub interval: Duration,
}

/// Marks the session abandoned however the loop exits
struct AbandonGuard<'a> {
    table: &'a SessionTable,
    id: &'a SessionId,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        self.table.mark_abandoned(self.id);
    }
}

pub struct StreamingSession {
    ctx: StreamContext,
    id: SessionId,
    sample_rate: f64,
    channels: usize,
}

impl StreamingSession {
    /// Register a new pending session for a freshly accepted connection
    pub fn open(ctx: StreamContext, is_taken: impl Fn(&SessionId) -> bool) -> Self {
        let sample_rate = ctx.source.sample_rate();
        let channels = ctx.source.channel_count();
        let id = ctx.table.open(channels, sample_rate, is_taken);
        Self {
            ctx,
            id,
            sample_rate,
            channels,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Send `meta`, then one `data` frame per tick until something ends the loop.
    ///
    /// `closed` resolves when the client goes away.
    pub async fn run<S, F>(self, sink: &mut S, closed: F, cancel: CancellationToken) -> StreamEnd
    where
        S: FrameSink,
        F: Future<Output = ()> + Send,
    {
        let ctx = &self.ctx;
        let _guard = AbandonGuard {
            table: &ctx.table,
            id: &self.id,
        };

        let meta = StreamFrame::Meta {
            fs: self.sample_rate,
            channels: self.channels,
            session_id: self.id.clone(),
        };
        if let Err(e) = sink.send_frame(&meta).await {
            warn!(session_id = %self.id, error = %e, "Could not send meta frame");
            return StreamEnd::SendFailed;
        }
        if ctx.table.mark_streaming(&self.id).is_err() {
            let _ = sink.close().await;
            return StreamEnd::Finalized;
        }

        let mut ticker = interval(ctx.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(closed);

        let end = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = sink.close().await;
                    break StreamEnd::Shutdown;
                }
                _ = &mut closed => break StreamEnd::ClientClosed,
                _ = ticker.tick() => {}
            }

            let chunk = match ctx.source.read_chunk(ctx.chunk_size) {
                Ok(chunk) => chunk,
                Err(e) => {
                    error!(session_id = %self.id, error = %e, "Signal source lost, ending stream");
                    let _ = sink.close().await;
                    break StreamEnd::SourceLost;
                }
            };

            let filtered = ctx.filter.process(&chunk, self.sample_rate);

            match ctx.table.append(&self.id, &filtered.raw, &filtered.env) {
                Ok(rows) => debug!(session_id = %self.id, rows, "Chunk captured"),
                Err(EmgError::NotFound { .. }) => {
                    let _ = sink.close().await;
                    break StreamEnd::Finalized;
                }
                Err(e) => {
                    error!(session_id = %self.id, error = %e, "Chunk does not fit the session");
                    let _ = sink.close().await;
                    break StreamEnd::SourceLost;
                }
            }

            let frame = StreamFrame::Data {
                raw: filtered.raw,
                env: filtered.env,
            };
            if let Err(e) = sink.send_frame(&frame).await {
                debug!(session_id = %self.id, error = %e, "Send failed");
                break StreamEnd::SendFailed;
            }
        };

        info!(session_id = %self.id, reason = ?end, "Stream ended");
        end
    }
}
