//! The client side of a session.
//!
//! A client introduces itself, answers a challenge if one comes back,
//! and then applies the server's stream in order. Local edits are
//! applied to the replica and sent to the server only; the server
//! fans them out.

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::crdt::id::SiteId;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::host::Host;
use crate::protocol::message::Message;
use crate::session::{auth, spawn_connection, ClientConfig, Command, ConnEvent, SessionHandle};

/// Dial the server and spawn the session task.
pub(crate) async fn start(config: ClientConfig, host: Box<dyn Host>) -> Result<SessionHandle> {
    let stream = TcpStream::connect(&config.addr).await?;
    let (commands, command_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(stream, config, host, command_rx));
    return Ok(SessionHandle {
        commands,
        local_addr: None,
        server: false,
    });
}

async fn run(
    stream: TcpStream,
    config: ClientConfig,
    mut host: Box<dyn Host>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let out = spawn_connection(stream, 0, events_tx);
    let _ = out.send(
        Message::Hello {
            name: config.display_name.clone(),
            response: None,
        }
        .encode(),
    );

    let mut engine = Engine::new(0);
    let mut site: Option<SiteId> = None;

    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                ConnEvent::Frame(_, message) => match message {
                    Message::Challenge { salt } => match &config.password {
                        Some(password) => {
                            let _ = out.send(Message::Hello {
                                name: config.display_name.clone(),
                                response: Some(auth::challenge_response(password, &salt)),
                            }.encode());
                        }
                        None => {
                            warn!("server at {} requires a password", config.addr);
                            break;
                        }
                    },
                    Message::Login { site: assigned, session } => {
                        info!("joined session {:?} as site {}", session, assigned);
                        site = Some(assigned);
                        engine.set_site(assigned);
                    }
                    message => {
                        if let Err(e) = engine.apply_remote(&message, host.as_mut()) {
                            warn!("stopping session: {}", e);
                            break;
                        }
                    }
                },
                ConnEvent::Invalid(_, error) => {
                    warn!("stopping session: {}", error);
                    break;
                }
                ConnEvent::Closed(_) => {
                    info!("server at {} closed the connection", config.addr);
                    break;
                }
            },
            command = commands.recv() => match command {
                None | Some(Command::Stop) => break,
                Some(command) => handle_command(&mut engine, &out, site, command),
            },
        }
    }
    info!("session with {} ended", config.addr);
}

fn handle_command(
    engine: &mut Engine,
    out: &mpsc::UnboundedSender<String>,
    site: Option<SiteId>,
    command: Command,
) {
    let send = |messages: Vec<Message>| {
        for message in messages {
            let _ = out.send(message.encode());
        }
    };
    match command {
        Command::ShareBuffer { reply, .. } => {
            let _ = reply.send(Err(Error::NotServer));
        }
        Command::StopShareBuffer { reply, .. } => {
            let _ = reply.send(Err(Error::NotServer));
        }
        Command::Insert { buffer, pos, text } => match engine.local_insert(&buffer, pos, &text) {
            Ok(messages) => send(messages),
            Err(e) => warn!("local insert: {}", e),
        },
        Command::Delete {
            buffer,
            pos,
            preimage,
        } => match engine.local_delete(&buffer, pos, &preimage) {
            Ok(messages) => send(messages),
            Err(e) => warn!("local delete: {}", e),
        },
        Command::Cursor {
            buffer,
            point,
            mark,
        } => match engine.local_cursor(&buffer, point, mark) {
            Ok(Some(message)) => send(vec![message]),
            Ok(None) => {}
            Err(e) => warn!("local cursor: {}", e),
        },
        Command::Focus { buffer } => {
            let message = engine.local_focus(buffer);
            send(vec![message]);
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
            let result =
                engine.create_overlay(&buffer, start, end, species, front_advance, rear_advance);
            let _ = reply.send(match result {
                Ok((key, message)) => {
                    send(vec![message]);
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
        } => match engine.move_overlay(&buffer, key, start, end) {
            Ok(Some(message)) => send(vec![message]),
            Ok(None) => {}
            Err(e) => warn!("overlay move: {}", e),
        },
        Command::OverlayPut {
            buffer,
            key,
            prop,
            value,
        } => match engine.put_overlay(&buffer, key, &prop, value) {
            Ok(Some(message)) => send(vec![message]),
            Ok(None) => {}
            Err(e) => warn!("overlay put: {}", e),
        },
        Command::OverlayRemove { buffer, key } => match engine.remove_overlay(&buffer, key) {
            Ok(Some(message)) => send(vec![message]),
            Ok(None) => {}
            Err(e) => warn!("overlay remove: {}", e),
        },
        Command::Text { buffer, reply } => {
            let _ = reply.send(engine.text(&buffer));
        }
        Command::Site { reply } => {
            let _ = reply.send(site);
        }
        Command::Stop => {}
    }
}
