//! Unix domain socket server for IPC
//!
//! Provides request-response communication and push notifications for
//! state changes to subscribed clients.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::protocol::{Notification, Request, Response};
use crate::orchestrator::Application;
use crate::tools::{ToolError, ToolRegistry};

const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// What a client connection needs to answer requests
struct ServerContext {
    app: Arc<Application>,
    tools: Arc<ToolRegistry>,
    notifications: broadcast::Sender<Notification>,
}

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: UnixListener,
    ctx: Arc<ServerContext>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Bind the socket; must be called inside the tokio runtime
    pub fn new(
        socket_path: &Path,
        app: Arc<Application>,
        tools: Arc<ToolRegistry>,
        notifications: broadcast::Sender<Notification>,
    ) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Owner-only access
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener,
            ctx: Arc::new(ServerContext {
                app,
                tools,
                notifications,
            }),
            shutdown_tx,
        })
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let ctx = Arc::clone(&self.ctx);
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = handle_client(stream, ctx) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Disconnect clients and remove the socket file
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

/// A request frame, or the reason it could not be parsed
type Incoming = std::result::Result<Request, String>;

/// Serve one client until it disconnects
///
/// Frames are read on a separate task so notifications can be written
/// while the client is idle.
async fn handle_client(stream: UnixStream, ctx: Arc<ServerContext>) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (request_tx, mut request_rx) = mpsc::channel::<Incoming>(8);
    let reader_task = tokio::spawn(async move { read_requests(&mut reader, request_tx).await });

    let mut notifications: Option<broadcast::Receiver<Notification>> = None;
    loop {
        tokio::select! {
            incoming = request_rx.recv() => {
                let Some(incoming) = incoming else { break };
                let response = match incoming {
                    Ok(request) => {
                        debug!(?request, "received request");
                        let (response, subscribe) = process_request(request, &ctx).await;
                        if subscribe && notifications.is_none() {
                            debug!("client subscribed to notifications");
                            notifications = Some(ctx.notifications.subscribe());
                        }
                        response
                    }
                    Err(reason) => Response::error("bad_request", reason),
                };
                send_message(&mut writer, &response).await?;
            }
            notification = next_notification(&mut notifications) => match notification {
                Ok(notification) => send_message(&mut writer, &notification).await?,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "notification receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => notifications = None,
            },
        }
    }

    reader_task.await.context("request reader panicked")?
}

async fn next_notification(
    rx: &mut Option<broadcast::Receiver<Notification>>,
) -> std::result::Result<Notification, broadcast::error::RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Read length-prefixed frames until EOF
async fn read_requests<R>(reader: &mut R, tx: mpsc::Sender<Incoming>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    loop {
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!("client disconnected");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_MESSAGE_LEN {
            warn!(len, "message too large, disconnecting");
            return Ok(());
        }

        let mut msg_buf = vec![0u8; len];
        reader.read_exact(&mut msg_buf).await?;

        let incoming = serde_json::from_slice(&msg_buf).map_err(|e| e.to_string());
        if tx.send(incoming).await.is_err() {
            return Ok(());
        }
    }
}

/// Send a length-prefixed JSON message
async fn send_message<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let msg_bytes = serde_json::to_vec(msg)?;
    let msg_len = (msg_bytes.len() as u32).to_le_bytes();

    writer.write_all(&msg_len).await?;
    writer.write_all(&msg_bytes).await?;

    Ok(())
}

/// Process a request and return a response
/// Returns (Response, should_subscribe)
async fn process_request(request: Request, ctx: &ServerContext) -> (Response, bool) {
    match request {
        Request::Ping => (Response::Pong, false),

        Request::GetStatus => (Response::Status(ctx.app.status()), false),

        Request::ToggleChat => {
            ctx.app.toggle_chat_state();
            (Response::Accepted, false)
        }

        Request::StartListening => {
            ctx.app.start_listening();
            (Response::Accepted, false)
        }

        Request::StopListening => {
            ctx.app.stop_listening();
            (Response::Accepted, false)
        }

        Request::ListTools => (
            Response::Tools {
                tools: ctx.tools.list(),
            },
            false,
        ),

        Request::CallTool { name, arguments } => {
            info!(tool = %name, "tool call via IPC");
            let tools = Arc::clone(&ctx.tools);
            let result =
                tokio::task::spawn_blocking(move || tools.call(&name, &arguments)).await;
            let response = match result {
                Ok(Ok(text)) => Response::ToolResult {
                    text,
                    is_error: false,
                },
                Ok(Err(e @ ToolError::UnknownTool(_))) => {
                    Response::error("unknown_tool", e.to_string())
                }
                Ok(Err(e)) => Response::ToolResult {
                    text: e.to_string(),
                    is_error: true,
                },
                Err(e) => {
                    error!(?e, "tool call task failed");
                    Response::error("internal", "tool call failed")
                }
            };
            (response, false)
        }

        Request::Subscribe => (Response::Subscribed, true),
    }
}
