use crate::app::registry::{ConnectionHandle, Control};
use crate::app::session::{self, ConnectionContext, SessionState};
use crate::app::AppState;
use comcore_proto::{kinds, Frame, LineAssembler};
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

/// Runs one client connection to completion: a reader task feeds the
/// per-connection request queue, a writer task drains the frame channel,
/// and this pump processes exactly one request at a time. Control messages
/// (forced logout, shutdown) preempt queued requests.
pub async fn serve<S>(stream: S, state: Arc<AppState>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let id = state.allocate_connection_id();
    let (read_half, write_half) = tokio::io::split(stream);
    let (frames_tx, frames_rx) = mpsc::unbounded_channel::<Frame>();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Control>();
    let (lines_tx, mut lines_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(write_frames(write_half, frames_rx));
    tokio::spawn(read_lines(read_half, lines_tx));
    state
        .register_connection(
            id,
            ConnectionHandle {
                frames: frames_tx.clone(),
                control: control_tx.clone(),
            },
        )
        .await;
    debug!(connection = id, "connection opened");

    let mut ctx = ConnectionContext {
        id,
        frames: frames_tx,
        control: control_tx,
        session: SessionState::LoggedOut,
        pending: Vec::new(),
    };
    loop {
        tokio::select! {
            biased;
            control = control_rx.recv() => match control {
                None => break,
                Some(Control::End) => {
                    let _ = ctx.frames.send(Frame::new(kinds::END, json!({})));
                    break;
                }
                Some(Control::ForceLogout) => {
                    if matches!(ctx.session, SessionState::LoggedIn { .. }) {
                        ctx.session = SessionState::LoggedOut;
                    }
                    let _ = ctx.frames.send(Frame::new(kinds::LOGOUT, json!({})));
                }
            },
            line = lines_rx.recv() => match line {
                None => break,
                Some(line) => session::handle_line(&state, &mut ctx, &line).await,
            },
        }
    }

    if let SessionState::LoggedIn { user, .. } = &ctx.session {
        state.registry.logout_connection(*user, id).await;
    }
    state.deregister_connection(id).await;
    debug!(connection = id, "connection closed");
}

/// Drains the frame channel onto the socket. Once the connection is gone
/// the channel closes and queued writes are silently dropped with it.
async fn write_frames<W>(mut writer: W, mut frames: mpsc::UnboundedReceiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        if writer.write_all(frame.encode().as_bytes()).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Accumulates socket bytes into complete lines and enqueues them as raw
/// request frames. EOF or a transport violation ends the connection.
async fn read_lines<R>(mut reader: R, lines: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut assembler = LineAssembler::new();
    let mut buffer = [0u8; 4096];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(n) => match assembler.push(&buffer[..n]) {
                Ok(batch) => {
                    for line in batch {
                        if lines.send(line).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    debug!(error = %err, "transport violation, closing");
                    break;
                }
            },
        }
    }
}
