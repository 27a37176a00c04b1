//! The session server: admission, greeting, and the broadcast hub.
//!
//! The server applies every client operation to its own replica and
//! re-emits the frame to every other authenticated client. Its apply
//! order is the order everyone else sees, so all clients read one
//! consistent stream; commutativity of the operations makes that order
//! irrelevant to the converged state.

use std::net::SocketAddr;

use rustc_hash::FxHashMap;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::crdt::id::SiteId;
use crate::engine::Engine;
use crate::error::Result;
use crate::host::Host;
use crate::protocol::message::Message;
use crate::session::{auth, spawn_connection, Command, ConnEvent, ServerConfig, SessionHandle};

/// Bind the listener and spawn the hub task.
pub(crate) async fn start(config: ServerConfig, host: Box<dyn Host>) -> Result<SessionHandle> {
    let listener = TcpListener::bind(&config.bind_addr).await?;
    let local_addr = listener.local_addr()?;
    let (commands, command_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(listener, config, host, command_rx));
    return Ok(SessionHandle {
        commands,
        local_addr: Some(local_addr),
        server: true,
    });
}

async fn run(
    listener: TcpListener,
    config: ServerConfig,
    host: Box<dyn Host>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut server = Server {
        config,
        engine: Engine::new(0),
        host,
        peers: FxHashMap::default(),
        next_site: 1,
    };
    let mut next_conn: u64 = 0;
    info!(
        "session {:?} listening on {}",
        server.config.session_name,
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let id = next_conn;
                    next_conn += 1;
                    debug!("connection {} from {}", id, addr);
                    let tx = spawn_connection(stream, id, events_tx.clone());
                    server.peers.insert(id, Peer {
                        tx,
                        addr,
                        state: PeerState::Greeting,
                    });
                }
                Err(e) => warn!("accept failed: {}", e),
            },
            Some(event) = events.recv() => server.handle_event(event),
            command = commands.recv() => match command {
                None | Some(Command::Stop) => break,
                Some(command) => server.handle_command(command),
            },
        }
    }
    info!("session {:?} stopped", server.config.session_name);
}

struct Peer {
    tx: mpsc::UnboundedSender<String>,
    addr: SocketAddr,
    state: PeerState,
}

#[derive(Clone)]
enum PeerState {
    /// Waiting for the introduction.
    Greeting,
    /// Challenge sent; waiting for the response.
    Challenged { name: String, challenge: Vec<u8> },
    /// Authenticated and greeted.
    Connected { site: SiteId, name: String },
}

struct Server {
    config: ServerConfig,
    engine: Engine,
    host: Box<dyn Host>,
    peers: FxHashMap<u64, Peer>,
    /// One past the last assigned site; u32 so exhaustion is visible.
    next_site: u32,
}

impl Server {
    fn handle_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Frame(id, message) => self.handle_frame(id, message),
            ConnEvent::Invalid(id, error) => {
                warn!("connection {}: {}", id, error);
                self.drop_peer(id, true);
            }
            ConnEvent::Closed(id) => self.drop_peer(id, true),
        }
    }

    fn handle_frame(&mut self, id: u64, message: Message) {
        let state = match self.peers.get(&id) {
            Some(peer) => peer.state.clone(),
            None => return,
        };
        match state {
            PeerState::Greeting => match message {
                Message::Hello { name, response } => {
                    if self.config.password.is_none() {
                        self.accept(id, name);
                    } else if response.is_none() {
                        self.challenge(id, name);
                    } else {
                        // A response before any challenge.
                        self.drop_peer(id, false);
                    }
                }
                _ => {
                    warn!("connection {} spoke before hello", id);
                    self.drop_peer(id, false);
                }
            },
            PeerState::Challenged { name, challenge } => match message {
                Message::Hello {
                    response: Some(response),
                    ..
                } => {
                    let password = self.config.password.as_deref().unwrap_or_default();
                    if auth::verify_response(password, &challenge, &response) {
                        self.accept(id, name);
                    } else {
                        // No feedback beyond the transport closing.
                        info!("connection {} failed authentication", id);
                        self.drop_peer(id, false);
                    }
                }
                _ => self.drop_peer(id, false),
            },
            PeerState::Connected { site, .. } => self.handle_op(id, site, message),
        }
    }

    fn challenge(&mut self, id: u64, name: String) {
        let challenge = auth::generate_challenge();
        let frame = Message::Challenge {
            salt: challenge.clone(),
        }
        .encode();
        if let Some(peer) = self.peers.get_mut(&id) {
            let _ = peer.tx.send(frame);
            peer.state = PeerState::Challenged { name, challenge };
        }
    }

    /// Assign a site and run the greeting sequence.
    fn accept(&mut self, id: u64, name: String) {
        if self.next_site > u16::MAX as u32 {
            error!("used up client ids; refusing {:?}", name);
            self.drop_peer(id, false);
            return;
        }
        let site = self.next_site as SiteId;
        self.next_site += 1;

        let mut frames = vec![Message::Login {
            site,
            session: self.config.session_name.clone(),
        }
        .encode()];
        let buffers = self.engine.buffer_names();
        for buffer in &buffers {
            if let Ok(sync) = self.engine.make_sync(buffer) {
                frames.push(sync.encode());
            }
            if let Ok((cursors, _)) = self.engine.replay_messages(buffer) {
                frames.extend(cursors.iter().map(Message::encode));
            }
        }
        frames.push(
            Message::Contact {
                site: 0,
                name: Some(self.config.display_name.clone()),
                address: None,
            }
            .encode(),
        );
        for peer in self.peers.values() {
            if let PeerState::Connected { site, name } = &peer.state {
                frames.push(
                    Message::Contact {
                        site: *site,
                        name: Some(name.clone()),
                        address: Some((peer.addr.ip().to_string(), peer.addr.port())),
                    }
                    .encode(),
                );
            }
        }
        for buffer in &buffers {
            if let Ok((_, overlays)) = self.engine.replay_messages(buffer) {
                frames.extend(overlays.iter().map(Message::encode));
            }
        }

        let addr = match self.peers.get_mut(&id) {
            Some(peer) => {
                peer.state = PeerState::Connected {
                    site,
                    name: name.clone(),
                };
                for frame in frames {
                    let _ = peer.tx.send(frame);
                }
                peer.addr
            }
            None => return,
        };
        info!("{:?} logged in as site {}", name, site);
        self.host.contact(site, Some(&name));
        let contact = Message::Contact {
            site,
            name: Some(name),
            address: Some((addr.ip().to_string(), addr.port())),
        };
        self.broadcast(Some(id), &contact.encode());
    }

    /// An operation from an authenticated client: apply it here, then
    /// fan the frame out to everyone else.
    fn handle_op(&mut self, id: u64, site: SiteId, message: Message) {
        match &message {
            Message::Insert { .. }
            | Message::Delete { .. }
            | Message::Cursor { .. }
            | Message::Focus { .. }
            | Message::OverlayAdd { .. }
            | Message::OverlayMove { .. }
            | Message::OverlayPut { .. }
            | Message::OverlayRemove { .. } => {}
            Message::Get { .. } => {
                // Reserved; a future recovery path re-syncs here.
                return;
            }
            _ => {
                warn!("site {} sent a server-only message", site);
                self.drop_peer(id, true);
                return;
            }
        }
        if let Some(buffer) = buffer_of(&message) {
            if !self.engine.has_buffer(buffer) {
                warn!("site {} referenced unknown buffer {:?}", site, buffer);
                self.drop_peer(id, true);
                return;
            }
        }
        match self.engine.apply_remote(&message, self.host.as_mut()) {
            Ok(()) => self.broadcast(Some(id), &message.encode()),
            Err(e) => {
                warn!("site {}: {}", site, e);
                self.drop_peer(id, true);
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::ShareBuffer {
                name,
                mode,
                content,
                reply,
            } => {
                let _ = reply.send(self.share_buffer(&name, mode, &content));
            }
            Command::StopShareBuffer { name, reply } => {
                let result = if self.engine.remove_buffer(&name) {
                    self.broadcast(None, &Message::Desync { buffer: name }.encode());
                    Ok(())
                } else {
                    Err(crate::error::Error::UnknownBuffer(name))
                };
                let _ = reply.send(result);
            }
            Command::Insert { buffer, pos, text } => {
                match self.engine.local_insert(&buffer, pos, &text) {
                    Ok(messages) => self.broadcast_messages(&messages),
                    Err(e) => warn!("local insert: {}", e),
                }
            }
            Command::Delete {
                buffer,
                pos,
                preimage,
            } => match self.engine.local_delete(&buffer, pos, &preimage) {
                Ok(messages) => self.broadcast_messages(&messages),
                Err(e) => warn!("local delete: {}", e),
            },
            Command::Cursor {
                buffer,
                point,
                mark,
            } => match self.engine.local_cursor(&buffer, point, mark) {
                Ok(Some(message)) => self.broadcast(None, &message.encode()),
                Ok(None) => {}
                Err(e) => warn!("local cursor: {}", e),
            },
            Command::Focus { buffer } => {
                let message = self.engine.local_focus(buffer);
                self.broadcast(None, &message.encode());
            }
            Command::OverlayCreate {
                buffer,
                start,
                end,
                species,
                front_advance,
                rear_advance,
                reply,
            } => {
                let result = self.engine.create_overlay(
                    &buffer,
                    start,
                    end,
                    species,
                    front_advance,
                    rear_advance,
                );
                let _ = reply.send(match result {
                    Ok((key, message)) => {
                        self.broadcast(None, &message.encode());
                        Ok(key)
                    }
                    Err(e) => Err(e),
                });
            }
            Command::OverlayMove {
                buffer,
                key,
                start,
                end,
            } => match self.engine.move_overlay(&buffer, key, start, end) {
                Ok(Some(message)) => self.broadcast(None, &message.encode()),
                Ok(None) => {}
                Err(e) => warn!("overlay move: {}", e),
            },
            Command::OverlayPut {
                buffer,
                key,
                prop,
                value,
            } => match self.engine.put_overlay(&buffer, key, &prop, value) {
                Ok(Some(message)) => self.broadcast(None, &message.encode()),
                Ok(None) => {}
                Err(e) => warn!("overlay put: {}", e),
            },
            Command::OverlayRemove { buffer, key } => {
                match self.engine.remove_overlay(&buffer, key) {
                    Ok(Some(message)) => self.broadcast(None, &message.encode()),
                    Ok(None) => {}
                    Err(e) => warn!("overlay remove: {}", e),
                }
            }
            Command::Text { buffer, reply } => {
                let _ = reply.send(self.engine.text(&buffer));
            }
            Command::Site { reply } => {
                let _ = reply.send(Some(0));
            }
            Command::Stop => {}
        }
    }

    fn share_buffer(&mut self, name: &str, mode: Option<String>, content: &str) -> Result<()> {
        self.engine.create_buffer(name, mode)?;
        if !content.is_empty() {
            self.engine.local_insert(name, 0, content)?;
        }
        let sync = self.engine.make_sync(name)?;
        self.broadcast(None, &sync.encode());
        info!("sharing buffer {:?}", name);
        return Ok(());
    }

    /// Send a frame to every authenticated client except `except`.
    fn broadcast(&self, except: Option<u64>, frame: &str) {
        for (id, peer) in &self.peers {
            if Some(*id) == except {
                continue;
            }
            if matches!(peer.state, PeerState::Connected { .. }) {
                let _ = peer.tx.send(frame.to_string());
            }
        }
    }

    fn broadcast_messages(&self, messages: &[Message]) {
        for message in messages {
            self.broadcast(None, &message.encode());
        }
    }

    /// Forget a connection. For an authenticated peer, announce the
    /// departure: clear its contact and its cursor in every buffer.
    fn drop_peer(&mut self, id: u64, announce: bool) {
        let peer = match self.peers.remove(&id) {
            Some(peer) => peer,
            None => return,
        };
        if let PeerState::Connected { site, name } = peer.state {
            info!("site {} ({:?}) disconnected", site, name);
            if !announce {
                return;
            }
            let mut messages = vec![Message::Contact {
                site,
                name: None,
                address: None,
            }];
            for buffer in self.engine.buffer_names() {
                messages.push(Message::Cursor {
                    buffer,
                    site,
                    point_hint: 0,
                    point: None,
                    mark_hint: 0,
                    mark: None,
                });
            }
            for message in messages {
                if let Err(e) = self.engine.apply_remote(&message, self.host.as_mut()) {
                    warn!("disconnect cleanup: {}", e);
                }
                self.broadcast(None, &message.encode());
            }
        }
    }
}

/// The buffer a message operates on, for admission checks.
fn buffer_of(message: &Message) -> Option<&str> {
    match message {
        Message::Insert { buffer, .. }
        | Message::Delete { buffer, .. }
        | Message::Cursor { buffer, .. }
        | Message::OverlayAdd { buffer, .. }
        | Message::OverlayMove { buffer, .. }
        | Message::OverlayPut { buffer, .. }
        | Message::OverlayRemove { buffer, .. }
        | Message::Get { buffer } => return Some(buffer),
        Message::Focus { buffer, .. } => return buffer.as_deref(),
        _ => return None,
    }
}
