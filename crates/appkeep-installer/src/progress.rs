use std::io;
use std::sync::Arc;
use std::time::Duration;

use appkeep_core::{ProgressEvent, KEEPALIVE_FRAME};
use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::context::{CancelReason, OperationContext};

/// Destination for an operation's progress events.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Delivers one event. Returns `false` once the consumer is gone or a
    /// terminal event has already been delivered.
    async fn send(&self, event: ProgressEvent) -> bool;
}

struct ChannelState<W> {
    writer: W,
    attached: bool,
    terminal_sent: bool,
    last_percent: u8,
}

impl<W> ChannelState<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, frame: &str, ctx: &OperationContext) -> bool {
        let written = async {
            self.writer.write_all(frame.as_bytes()).await?;
            self.writer.flush().await
        }
        .await;
        match written {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(error = %err, "progress stream disconnected");
                self.attached = false;
                ctx.cancel(CancelReason::Disconnected);
                false
            }
        }
    }
}

/// Serializes progress events as frames onto a byte stream.
///
/// Percentages are clamped so they never decrease, at most one terminal
/// event is written, and a keep-alive frame is written on every interval
/// while the channel is open. A failed write, or a peer signal reporting
/// the consumer gone, detaches the channel and cancels the operation.
pub struct ProgressChannel<W> {
    state: Arc<Mutex<ChannelState<W>>>,
    ctx: OperationContext,
    keepalive: Option<JoinHandle<()>>,
    peer_watch: Option<JoinHandle<()>>,
}

impl<W> ProgressChannel<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn open(writer: W, ctx: OperationContext, keepalive_interval: Duration) -> Self {
        let state = Arc::new(Mutex::new(ChannelState {
            writer,
            attached: true,
            terminal_sent: false,
            last_percent: 0,
        }));
        let keepalive = (!keepalive_interval.is_zero()).then(|| {
            tokio::spawn(keepalive_loop(
                Arc::clone(&state),
                ctx.clone(),
                keepalive_interval,
            ))
        });
        Self {
            state,
            ctx,
            keepalive,
            peer_watch: None,
        }
    }

    /// Watches `closed` for the consumer going away between writes. The
    /// peer is gone once the signal turns `true` or its sender is dropped.
    pub fn watch_peer(&mut self, closed: watch::Receiver<bool>) {
        if let Some(previous) = self.peer_watch.take() {
            previous.abort();
        }
        self.peer_watch = Some(tokio::spawn(peer_watch_loop(
            Arc::clone(&self.state),
            self.ctx.clone(),
            closed,
        )));
    }

    pub async fn is_attached(&self) -> bool {
        self.state.lock().await.attached
    }

    /// Ends the stream. Writes a `Completed` event first when no terminal
    /// event has been sent, then returns the writer.
    pub async fn close(mut self) -> io::Result<W> {
        for handle in [self.keepalive.take(), self.peer_watch.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
            let _ = handle.await;
        }
        {
            let mut state = self.state.lock().await;
            if state.attached && !state.terminal_sent {
                let event = ProgressEvent::completed("Operation completed");
                if let Ok(frame) = event.to_frame() {
                    if state.write_frame(&frame, &self.ctx).await {
                        state.terminal_sent = true;
                    }
                }
            }
            if state.attached {
                if let Err(err) = state.writer.shutdown().await {
                    tracing::debug!(error = %err, "failed to shut down progress stream");
                }
            }
        }
        let state = Arc::clone(&self.state);
        drop(self);
        let state = Arc::try_unwrap(state)
            .map_err(|_| io::Error::other("progress stream still shared"))?;
        Ok(state.into_inner().writer)
    }
}

#[async_trait]
impl<W> ProgressSink for ProgressChannel<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, event: ProgressEvent) -> bool {
        let mut state = self.state.lock().await;
        if !state.attached || state.terminal_sent {
            return false;
        }

        let event = match event {
            ProgressEvent::Progress {
                percent,
                message,
                details,
            } => {
                let percent = percent.min(100).max(state.last_percent);
                ProgressEvent::Progress {
                    percent,
                    message,
                    details,
                }
            }
            terminal => terminal,
        };
        let frame = match event.to_frame() {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode progress event");
                return false;
            }
        };
        if !state.write_frame(&frame, &self.ctx).await {
            return false;
        }

        if let Some(percent) = event.percent() {
            state.last_percent = percent;
        }
        if event.is_terminal() {
            state.terminal_sent = true;
        }
        true
    }
}

impl<W> Drop for ProgressChannel<W> {
    fn drop(&mut self) {
        for handle in [self.keepalive.take(), self.peer_watch.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

async fn keepalive_loop<W>(
    state: Arc<Mutex<ChannelState<W>>>,
    ctx: OperationContext,
    interval: Duration,
) where
    W: AsyncWrite + Unpin + Send,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let mut state = state.lock().await;
        if !state.attached || state.terminal_sent {
            return;
        }
        if !state.write_frame(KEEPALIVE_FRAME, &ctx).await {
            return;
        }
    }
}

async fn peer_watch_loop<W>(
    state: Arc<Mutex<ChannelState<W>>>,
    ctx: OperationContext,
    mut closed: watch::Receiver<bool>,
) {
    let gone = async {
        loop {
            if *closed.borrow_and_update() {
                return;
            }
            if closed.changed().await.is_err() {
                return;
            }
        }
    };
    tokio::select! {
        _ = gone => {}
        _ = ctx.cancelled() => return,
    }
    tracing::debug!("progress stream peer went away");
    state.lock().await.attached = false;
    ctx.cancel(CancelReason::Disconnected);
}

/// Sends a progress event on behalf of an operation step. A detached sink
/// cancels the operation and surfaces as its cancellation error.
pub async fn emit(
    sink: &dyn ProgressSink,
    ctx: &OperationContext,
    event: ProgressEvent,
) -> Result<(), crate::error::OperationError> {
    ctx.check()?;
    if !sink.send(event).await {
        ctx.cancel(CancelReason::Disconnected);
        return Err(ctx.cancellation_error());
    }
    Ok(())
}
