//! Sessions: the star network around a server hub.
//!
//! One process starts a session and becomes site 0, the authority for
//! admission and site allocation; everyone else connects as a client.
//! Each session runs as a single hub task that owns the engine: every
//! remote message and every host command is applied there, one at a
//! time, so no replica state is ever shared between threads.
//! Per-connection tasks only frame bytes in and drain frames out.

pub mod auth;
pub mod client;
pub mod server;

use std::net::SocketAddr;

use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::crdt::id::SiteId;
use crate::crdt::overlay::OverlayKey;
use crate::error::{Error, Result};
use crate::host::Host;
use crate::protocol::message::Message;
use crate::protocol::sexp::{FrameReader, Sexp};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for hosting a session.
///
/// Interactive prompting for names or passwords is host UX; by the
/// time a config exists, its values are resolved.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to listen on, e.g. `"0.0.0.0:6530"`. Port 0 picks a
    /// free port, reported by [`SessionHandle::local_addr`].
    pub bind_addr: String,
    /// Name announced to clients at login.
    pub session_name: String,
    /// When set, clients must pass challenge authentication.
    pub password: Option<String>,
    /// The server participant's display name.
    pub display_name: String,
}

/// Configuration for joining a session.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Server address, e.g. `"198.51.100.7:6530"`.
    pub addr: String,
    /// Display name sent in the introduction.
    pub display_name: String,
    /// Password for servers that challenge.
    pub password: Option<String>,
}

// =============================================================================
// Commands
// =============================================================================

/// Host-side requests delivered into the hub task.
pub(crate) enum Command {
    ShareBuffer {
        name: String,
        mode: Option<String>,
        content: String,
        reply: oneshot::Sender<Result<()>>,
    },
    StopShareBuffer {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Insert {
        buffer: String,
        pos: usize,
        text: String,
    },
    Delete {
        buffer: String,
        pos: usize,
        preimage: String,
    },
    Cursor {
        buffer: String,
        point: usize,
        mark: Option<usize>,
    },
    Focus {
        buffer: Option<String>,
    },
    OverlayCreate {
        buffer: String,
        start: usize,
        end: usize,
        species: Option<String>,
        front_advance: bool,
        rear_advance: bool,
        reply: oneshot::Sender<Result<OverlayKey>>,
    },
    OverlayMove {
        buffer: String,
        key: OverlayKey,
        start: usize,
        end: usize,
    },
    OverlayPut {
        buffer: String,
        key: OverlayKey,
        prop: String,
        value: Sexp,
    },
    OverlayRemove {
        buffer: String,
        key: OverlayKey,
    },
    Text {
        buffer: String,
        reply: oneshot::Sender<Option<String>>,
    },
    Site {
        reply: oneshot::Sender<Option<SiteId>>,
    },
    Stop,
}

// =============================================================================
// Session handle
// =============================================================================

/// A handle onto a running session's hub task.
///
/// Edit and cursor reports are fire-and-forget; queries and the
/// share/overlay-create calls await a reply. Handles are cheap to
/// clone.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    local_addr: Option<SocketAddr>,
    server: bool,
}

impl SessionHandle {
    fn send(&self, command: Command) -> Result<()> {
        return self
            .commands
            .send(command)
            .map_err(|_| Error::SessionClosed);
    }

    async fn ask<T>(&self, rx: oneshot::Receiver<T>) -> Result<T> {
        return rx.await.map_err(|_| Error::SessionClosed);
    }

    pub fn is_server(&self) -> bool {
        return self.server;
    }

    /// The bound listen address (servers only).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        return self.local_addr;
    }

    /// Start sharing a buffer with its current content. Server only.
    pub async fn share_buffer(
        &self,
        name: &str,
        mode: Option<String>,
        content: &str,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ShareBuffer {
            name: name.to_string(),
            mode,
            content: content.to_string(),
            reply,
        })?;
        return self.ask(rx).await?;
    }

    /// Stop sharing a buffer; peers receive a desync. Server only.
    pub async fn stop_share_buffer(&self, name: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StopShareBuffer {
            name: name.to_string(),
            reply,
        })?;
        return self.ask(rx).await?;
    }

    /// Report text typed into a shared buffer.
    pub fn local_insert(&self, buffer: &str, pos: usize, text: &str) -> Result<()> {
        return self.send(Command::Insert {
            buffer: buffer.to_string(),
            pos,
            text: text.to_string(),
        });
    }

    /// Report text deleted from a shared buffer. `preimage` is the
    /// removed text as it was before the change.
    pub fn local_delete(&self, buffer: &str, pos: usize, preimage: &str) -> Result<()> {
        return self.send(Command::Delete {
            buffer: buffer.to_string(),
            pos,
            preimage: preimage.to_string(),
        });
    }

    /// Report the local cursor after a command; unchanged positions
    /// are not re-sent.
    pub fn local_cursor(&self, buffer: &str, point: usize, mark: Option<usize>) -> Result<()> {
        return self.send(Command::Cursor {
            buffer: buffer.to_string(),
            point,
            mark,
        });
    }

    /// Report which shared buffer is being looked at.
    pub fn focus(&self, buffer: Option<String>) -> Result<()> {
        return self.send(Command::Focus { buffer });
    }

    /// Create and announce an overlay; returns its replication key.
    pub async fn create_overlay(
        &self,
        buffer: &str,
        start: usize,
        end: usize,
        species: Option<String>,
        front_advance: bool,
        rear_advance: bool,
    ) -> Result<OverlayKey> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::OverlayCreate {
            buffer: buffer.to_string(),
            start,
            end,
            species,
            front_advance,
            rear_advance,
            reply,
        })?;
        return self.ask(rx).await?;
    }

    pub fn move_overlay(&self, buffer: &str, key: OverlayKey, start: usize, end: usize) -> Result<()> {
        return self.send(Command::OverlayMove {
            buffer: buffer.to_string(),
            key,
            start,
            end,
        });
    }

    pub fn put_overlay(&self, buffer: &str, key: OverlayKey, prop: &str, value: Sexp) -> Result<()> {
        return self.send(Command::OverlayPut {
            buffer: buffer.to_string(),
            key,
            prop: prop.to_string(),
            value,
        });
    }

    pub fn remove_overlay(&self, buffer: &str, key: OverlayKey) -> Result<()> {
        return self.send(Command::OverlayRemove {
            buffer: buffer.to_string(),
            key,
        });
    }

    /// The replica's current text for a buffer.
    pub async fn text(&self, buffer: &str) -> Result<Option<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Text {
            buffer: buffer.to_string(),
            reply,
        })?;
        return self.ask(rx).await;
    }

    /// This participant's site, once known. Clients report `None`
    /// until login completes.
    pub async fn site(&self) -> Result<Option<SiteId>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Site { reply })?;
        return self.ask(rx).await;
    }

    /// Tear the session down: disconnect every peer, drop all tables.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

// =============================================================================
// Session manager
// =============================================================================

/// Process-wide registry of running sessions.
///
/// Server sessions are keyed by their session name, client sessions
/// by the address they dialed.
#[derive(Default)]
pub struct SessionManager {
    sessions: FxHashMap<String, SessionHandle>,
}

impl SessionManager {
    pub fn new() -> SessionManager {
        return SessionManager {
            sessions: FxHashMap::default(),
        };
    }

    /// Host a session: bind, listen, become site 0.
    pub async fn start_session(
        &mut self,
        config: ServerConfig,
        host: Box<dyn Host>,
    ) -> Result<SessionHandle> {
        let key = config.session_name.clone();
        if self.sessions.contains_key(&key) {
            return Err(Error::SessionExists(key));
        }
        let handle = server::start(config, host).await?;
        self.sessions.insert(key, handle.clone());
        return Ok(handle);
    }

    /// Join a session as a client.
    pub async fn connect(
        &mut self,
        config: ClientConfig,
        host: Box<dyn Host>,
    ) -> Result<SessionHandle> {
        let key = config.addr.clone();
        if self.sessions.contains_key(&key) {
            return Err(Error::SessionExists(key));
        }
        let handle = client::start(config, host).await?;
        self.sessions.insert(key, handle.clone());
        return Ok(handle);
    }

    pub fn get(&self, key: &str) -> Option<&SessionHandle> {
        return self.sessions.get(key);
    }

    /// Stop and deregister one session.
    pub fn stop(&mut self, key: &str) -> bool {
        match self.sessions.remove(key) {
            Some(handle) => {
                handle.stop();
                return true;
            }
            None => return false,
        }
    }

    /// Stop and deregister everything.
    pub fn stop_all(&mut self) {
        for handle in self.sessions.values() {
            handle.stop();
        }
        self.sessions.clear();
    }
}

// =============================================================================
// Connection plumbing
// =============================================================================

/// What a connection's reader task reports into the hub.
pub(crate) enum ConnEvent {
    /// One decoded message, in receive order.
    Frame(u64, Message),
    /// The byte stream is not a valid message stream.
    Invalid(u64, Error),
    /// The transport ended.
    Closed(u64),
}

/// Split a socket into a framing reader task and a draining writer
/// task; returns the outbound frame queue.
pub(crate) fn spawn_connection(
    stream: TcpStream,
    id: u64,
    events: mpsc::UnboundedSender<ConnEvent>,
) -> mpsc::UnboundedSender<String> {
    let (read_half, write_half) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(write_half, out_rx));
    tokio::spawn(read_loop(read_half, id, events));
    return out_tx;
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut frames: mpsc::UnboundedReceiver<String>) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = write_half.write_all(frame.as_bytes()).await {
            debug!("write failed: {}", e);
            return;
        }
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    id: u64,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    let mut reader = FrameReader::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => {
                let _ = events.send(ConnEvent::Closed(id));
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("read failed: {}", e);
                let _ = events.send(ConnEvent::Closed(id));
                return;
            }
        };
        reader.feed(&buf[..n]);
        loop {
            match reader.next_form() {
                Ok(Some(form)) => match Message::from_sexp(&form) {
                    Ok(message) => {
                        if events.send(ConnEvent::Frame(id, message)).is_err() {
                            return;
                        }
                    }
                    Err(error) => {
                        let _ = events.send(ConnEvent::Invalid(id, error));
                        return;
                    }
                },
                Ok(None) => break,
                Err(error) => {
                    let _ = events.send(ConnEvent::Invalid(id, error));
                    return;
                }
            }
        }
    }
}
