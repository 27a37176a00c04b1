//! Wire messages.
//!
//! Every message is a printed list headed by a type symbol. Encoding
//! and decoding are exhaustive over the message set; anything else is
//! a protocol violation. Raw byte values (identifiers, the auth
//! challenge, the challenge response) travel as Base64 strings so the
//! frames stay printable.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::crdt::block::IdRun;
use crate::crdt::id::{Id, SiteId};
use crate::error::Error;
use crate::protocol::sexp::Sexp;

/// A message on the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Client introduction, optionally carrying a challenge response.
    Hello {
        name: String,
        response: Option<Vec<u8>>,
    },
    /// Server challenge for password authentication.
    Challenge { salt: Vec<u8> },
    /// Server acceptance: the client's site and the session name.
    Login { site: SiteId, session: String },
    /// Full-buffer snapshot: mode hint, content, annotation runs.
    Sync {
        buffer: String,
        mode: Option<String>,
        content: String,
        runs: Vec<IdRun>,
    },
    /// The buffer is no longer shared.
    Desync { buffer: String },
    Insert {
        buffer: String,
        id: Id,
        hint: usize,
        content: String,
    },
    Delete {
        buffer: String,
        hint: usize,
        pairs: Vec<(u32, Id)>,
    },
    /// A site's point and optional mark. A nil point clears the
    /// cursor; an empty identifier means end of document.
    Cursor {
        buffer: String,
        site: SiteId,
        point_hint: usize,
        point: Option<Id>,
        mark_hint: usize,
        mark: Option<Id>,
    },
    /// Presence: a nil name announces departure.
    Contact {
        site: SiteId,
        name: Option<String>,
        address: Option<(String, u16)>,
    },
    /// Which buffer a site is looking at; nil clears.
    Focus {
        site: SiteId,
        buffer: Option<String>,
    },
    OverlayAdd {
        buffer: String,
        site: SiteId,
        clock: u32,
        species: Option<String>,
        front_advance: bool,
        rear_advance: bool,
        start_hint: usize,
        start: Id,
        end_hint: usize,
        end: Id,
    },
    OverlayMove {
        buffer: String,
        site: SiteId,
        clock: u32,
        start_hint: usize,
        start: Id,
        end_hint: usize,
        end: Id,
    },
    OverlayPut {
        buffer: String,
        site: SiteId,
        clock: u32,
        prop: String,
        value: Sexp,
    },
    OverlayRemove {
        buffer: String,
        site: SiteId,
        clock: u32,
    },
    /// Reserved snapshot request; parsed and ignored.
    Get { buffer: String },
}

// =============================================================================
// Field encoders
// =============================================================================

fn id_to_sexp(id: &Id) -> Sexp {
    return Sexp::Str(BASE64.encode(id.as_bytes()));
}

fn opt_id_to_sexp(id: &Option<Id>) -> Sexp {
    match id {
        Some(id) => return id_to_sexp(id),
        None => return Sexp::nil(),
    }
}

fn opt_str_to_sexp(value: &Option<String>) -> Sexp {
    match value {
        Some(value) => return Sexp::Str(value.clone()),
        None => return Sexp::nil(),
    }
}

fn run_to_sexp(run: &IdRun) -> Sexp {
    let head = vec![Sexp::Int(run.len as i64), id_to_sexp(&run.id)];
    if run.eob {
        return Sexp::Dotted(head, Box::new(Sexp::Sym("t".to_string())));
    }
    return Sexp::List(head);
}

fn pair_to_sexp(pair: &(u32, Id)) -> Sexp {
    return Sexp::Dotted(
        vec![Sexp::Int(pair.0 as i64)],
        Box::new(id_to_sexp(&pair.1)),
    );
}

// =============================================================================
// Field decoders
// =============================================================================

fn bad(what: &str) -> Error {
    return Error::Protocol(what.to_string());
}

fn take_str(form: &Sexp, what: &str) -> Result<String, Error> {
    return form
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| bad(&format!("{} must be a string", what)));
}

fn take_opt_str(form: &Sexp, what: &str) -> Result<Option<String>, Error> {
    if form.is_nil() {
        return Ok(None);
    }
    // Accept either spelling; opaque tags are sometimes symbols.
    if let Some(sym) = form.as_sym() {
        return Ok(Some(sym.to_string()));
    }
    return Ok(Some(take_str(form, what)?));
}

fn take_site(form: &Sexp) -> Result<SiteId, Error> {
    let value = form.as_int().ok_or_else(|| bad("site must be an integer"))?;
    if !(0..=u16::MAX as i64).contains(&value) {
        return Err(bad("site out of range"));
    }
    return Ok(value as SiteId);
}

fn take_clock(form: &Sexp) -> Result<u32, Error> {
    let value = form.as_int().ok_or_else(|| bad("clock must be an integer"))?;
    if !(0..=u32::MAX as i64).contains(&value) {
        return Err(bad("clock out of range"));
    }
    return Ok(value as u32);
}

/// Hints are advisory; anything unusable degrades to 0.
fn take_hint(form: &Sexp) -> usize {
    return form.as_int().unwrap_or(0).max(0) as usize;
}

fn take_id(form: &Sexp, what: &str) -> Result<Id, Error> {
    let text = form
        .as_str()
        .ok_or_else(|| bad(&format!("{} must be a base64 string", what)))?;
    let bytes = BASE64
        .decode(text)
        .map_err(|_| bad(&format!("{} is not valid base64", what)))?;
    return Id::from_bytes(bytes).ok_or_else(|| bad(&format!("{} is not a valid id", what)));
}

fn take_opt_id(form: &Sexp, what: &str) -> Result<Option<Id>, Error> {
    if form.is_nil() {
        return Ok(None);
    }
    return Ok(Some(take_id(form, what)?));
}

fn take_bytes(form: &Sexp, what: &str) -> Result<Vec<u8>, Error> {
    let text = form
        .as_str()
        .ok_or_else(|| bad(&format!("{} must be a base64 string", what)))?;
    return BASE64
        .decode(text)
        .map_err(|_| bad(&format!("{} is not valid base64", what)));
}

fn take_run(form: &Sexp) -> Result<IdRun, Error> {
    let (head, eob) = match form {
        Sexp::List(items) => (items.as_slice(), false),
        Sexp::Dotted(items, tail) => (items.as_slice(), tail.truthy()),
        _ => return Err(bad("annotation run must be a list")),
    };
    if head.len() != 2 {
        return Err(bad("annotation run must have a length and an id"));
    }
    let len = head[0]
        .as_int()
        .filter(|len| (1..=i64::from(u32::MAX)).contains(len))
        .ok_or_else(|| bad("annotation run length out of range"))?;
    let id = take_id(&head[1], "annotation run id")?;
    if id.is_empty() {
        return Err(bad("annotation run id must not be empty"));
    }
    return Ok(IdRun {
        len: len as u32,
        id,
        eob,
    });
}

fn take_pair(form: &Sexp) -> Result<(u32, Id), Error> {
    match form {
        Sexp::Dotted(items, tail) if items.len() == 1 => {
            let len = items[0]
                .as_int()
                .filter(|len| (1..=i64::from(u32::MAX)).contains(len))
                .ok_or_else(|| bad("deletion length out of range"))?;
            let id = take_id(tail, "deletion id")?;
            if id.is_empty() {
                return Err(bad("deletion id must not be empty"));
            }
            return Ok((len as u32, id));
        }
        _ => return Err(bad("deletion entry must be a pair")),
    }
}

// =============================================================================
// Encode / decode
// =============================================================================

impl Message {
    /// The message as one printable form.
    pub fn to_sexp(&self) -> Sexp {
        match self {
            Message::Hello { name, response } => {
                let mut items = vec![Sexp::Sym("hello".to_string()), Sexp::Str(name.clone())];
                if let Some(response) = response {
                    items.push(Sexp::Str(BASE64.encode(response)));
                }
                return Sexp::List(items);
            }
            Message::Challenge { salt } => {
                return Sexp::List(vec![
                    Sexp::Sym("challenge".to_string()),
                    Sexp::Str(BASE64.encode(salt)),
                ]);
            }
            Message::Login { site, session } => {
                return Sexp::List(vec![
                    Sexp::Sym("login".to_string()),
                    Sexp::Int(*site as i64),
                    Sexp::Str(session.clone()),
                ]);
            }
            Message::Sync {
                buffer,
                mode,
                content,
                runs,
            } => {
                let mut items = vec![
                    Sexp::Sym("sync".to_string()),
                    Sexp::Str(buffer.clone()),
                    opt_str_to_sexp(mode),
                    Sexp::Str(content.clone()),
                ];
                items.extend(runs.iter().map(run_to_sexp));
                return Sexp::List(items);
            }
            Message::Desync { buffer } => {
                return Sexp::List(vec![
                    Sexp::Sym("desync".to_string()),
                    Sexp::Str(buffer.clone()),
                ]);
            }
            Message::Insert {
                buffer,
                id,
                hint,
                content,
            } => {
                return Sexp::List(vec![
                    Sexp::Sym("insert".to_string()),
                    Sexp::Str(buffer.clone()),
                    id_to_sexp(id),
                    Sexp::Int(*hint as i64),
                    Sexp::Str(content.clone()),
                ]);
            }
            Message::Delete {
                buffer,
                hint,
                pairs,
            } => {
                let mut items = vec![
                    Sexp::Sym("delete".to_string()),
                    Sexp::Str(buffer.clone()),
                    Sexp::Int(*hint as i64),
                ];
                items.extend(pairs.iter().map(pair_to_sexp));
                return Sexp::List(items);
            }
            Message::Cursor {
                buffer,
                site,
                point_hint,
                point,
                mark_hint,
                mark,
            } => {
                return Sexp::List(vec![
                    Sexp::Sym("cursor".to_string()),
                    Sexp::Str(buffer.clone()),
                    Sexp::Int(*site as i64),
                    Sexp::Int(*point_hint as i64),
                    opt_id_to_sexp(point),
                    Sexp::Int(*mark_hint as i64),
                    opt_id_to_sexp(mark),
                ]);
            }
            Message::Contact {
                site,
                name,
                address,
            } => {
                let mut items = vec![
                    Sexp::Sym("contact".to_string()),
                    Sexp::Int(*site as i64),
                    opt_str_to_sexp(name),
                ];
                if let Some((host, port)) = address {
                    items.push(Sexp::Str(host.clone()));
                    items.push(Sexp::Int(*port as i64));
                }
                return Sexp::List(items);
            }
            Message::Focus { site, buffer } => {
                return Sexp::List(vec![
                    Sexp::Sym("focus".to_string()),
                    Sexp::Int(*site as i64),
                    opt_str_to_sexp(buffer),
                ]);
            }
            Message::OverlayAdd {
                buffer,
                site,
                clock,
                species,
                front_advance,
                rear_advance,
                start_hint,
                start,
                end_hint,
                end,
            } => {
                return Sexp::List(vec![
                    Sexp::Sym("overlay-add".to_string()),
                    Sexp::Str(buffer.clone()),
                    Sexp::Int(*site as i64),
                    Sexp::Int(*clock as i64),
                    match species {
                        Some(species) => Sexp::Sym(species.clone()),
                        None => Sexp::nil(),
                    },
                    Sexp::from_bool(*front_advance),
                    Sexp::from_bool(*rear_advance),
                    Sexp::Int(*start_hint as i64),
                    id_to_sexp(start),
                    Sexp::Int(*end_hint as i64),
                    id_to_sexp(end),
                ]);
            }
            Message::OverlayMove {
                buffer,
                site,
                clock,
                start_hint,
                start,
                end_hint,
                end,
            } => {
                return Sexp::List(vec![
                    Sexp::Sym("overlay-move".to_string()),
                    Sexp::Str(buffer.clone()),
                    Sexp::Int(*site as i64),
                    Sexp::Int(*clock as i64),
                    Sexp::Int(*start_hint as i64),
                    id_to_sexp(start),
                    Sexp::Int(*end_hint as i64),
                    id_to_sexp(end),
                ]);
            }
            Message::OverlayPut {
                buffer,
                site,
                clock,
                prop,
                value,
            } => {
                return Sexp::List(vec![
                    Sexp::Sym("overlay-put".to_string()),
                    Sexp::Str(buffer.clone()),
                    Sexp::Int(*site as i64),
                    Sexp::Int(*clock as i64),
                    Sexp::Sym(prop.clone()),
                    value.clone(),
                ]);
            }
            Message::OverlayRemove {
                buffer,
                site,
                clock,
            } => {
                return Sexp::List(vec![
                    Sexp::Sym("overlay-remove".to_string()),
                    Sexp::Str(buffer.clone()),
                    Sexp::Int(*site as i64),
                    Sexp::Int(*clock as i64),
                ]);
            }
            Message::Get { buffer } => {
                return Sexp::List(vec![
                    Sexp::Sym("get".to_string()),
                    Sexp::Str(buffer.clone()),
                ]);
            }
        }
    }

    /// The printed frame, newline-terminated.
    pub fn encode(&self) -> String {
        return format!("{}\n", self.to_sexp());
    }

    /// Decode one received form.
    pub fn from_sexp(form: &Sexp) -> Result<Message, Error> {
        let items = form
            .as_list()
            .ok_or_else(|| bad("message must be a list"))?;
        let head = items
            .first()
            .and_then(Sexp::as_sym)
            .ok_or_else(|| bad("message must start with a type symbol"))?;
        let args = &items[1..];
        match head {
            "hello" => {
                if args.is_empty() || args.len() > 2 {
                    return Err(bad("hello takes a name and an optional response"));
                }
                let name = take_str(&args[0], "hello name")?;
                let response = match args.get(1) {
                    Some(form) => Some(take_bytes(form, "hello response")?),
                    None => None,
                };
                return Ok(Message::Hello { name, response });
            }
            "challenge" => {
                if args.len() != 1 {
                    return Err(bad("challenge takes one salt"));
                }
                return Ok(Message::Challenge {
                    salt: take_bytes(&args[0], "challenge salt")?,
                });
            }
            "login" => {
                if args.len() != 2 {
                    return Err(bad("login takes a site and a session name"));
                }
                return Ok(Message::Login {
                    site: take_site(&args[0])?,
                    session: take_str(&args[1], "session name")?,
                });
            }
            "sync" => {
                if args.len() < 3 {
                    return Err(bad("sync takes a buffer, mode, content, and runs"));
                }
                let runs = args[3..]
                    .iter()
                    .map(take_run)
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(Message::Sync {
                    buffer: take_str(&args[0], "buffer")?,
                    mode: take_opt_str(&args[1], "mode")?,
                    content: take_str(&args[2], "content")?,
                    runs,
                });
            }
            "desync" => {
                if args.len() != 1 {
                    return Err(bad("desync takes a buffer"));
                }
                return Ok(Message::Desync {
                    buffer: take_str(&args[0], "buffer")?,
                });
            }
            "insert" => {
                if args.len() != 4 {
                    return Err(bad("insert takes a buffer, id, hint, and content"));
                }
                let id = take_id(&args[1], "insert id")?;
                if id.is_empty() {
                    return Err(bad("insert id must not be empty"));
                }
                return Ok(Message::Insert {
                    buffer: take_str(&args[0], "buffer")?,
                    id,
                    hint: take_hint(&args[2]),
                    content: take_str(&args[3], "content")?,
                });
            }
            "delete" => {
                if args.len() < 2 {
                    return Err(bad("delete takes a buffer, hint, and pairs"));
                }
                let pairs = args[2..]
                    .iter()
                    .map(take_pair)
                    .collect::<Result<Vec<_>, _>>()?;
                return Ok(Message::Delete {
                    buffer: take_str(&args[0], "buffer")?,
                    hint: take_hint(&args[1]),
                    pairs,
                });
            }
            "cursor" => {
                if args.len() != 6 {
                    return Err(bad("cursor takes six fields"));
                }
                return Ok(Message::Cursor {
                    buffer: take_str(&args[0], "buffer")?,
                    site: take_site(&args[1])?,
                    point_hint: take_hint(&args[2]),
                    point: take_opt_id(&args[3], "point id")?,
                    mark_hint: take_hint(&args[4]),
                    mark: take_opt_id(&args[5], "mark id")?,
                });
            }
            "contact" => {
                if args.len() != 2 && args.len() != 4 {
                    return Err(bad("contact takes a site, name, and optional address"));
                }
                let address = if args.len() == 4 {
                    let host = take_str(&args[2], "contact host")?;
                    let port = args[3]
                        .as_int()
                        .filter(|port| (0..=u16::MAX as i64).contains(port))
                        .ok_or_else(|| bad("contact port out of range"))?;
                    Some((host, port as u16))
                } else {
                    None
                };
                return Ok(Message::Contact {
                    site: take_site(&args[0])?,
                    name: take_opt_str(&args[1], "contact name")?,
                    address,
                });
            }
            "focus" => {
                if args.len() != 2 {
                    return Err(bad("focus takes a site and a buffer"));
                }
                return Ok(Message::Focus {
                    site: take_site(&args[0])?,
                    buffer: take_opt_str(&args[1], "buffer")?,
                });
            }
            "overlay-add" => {
                if args.len() != 10 {
                    return Err(bad("overlay-add takes ten fields"));
                }
                return Ok(Message::OverlayAdd {
                    buffer: take_str(&args[0], "buffer")?,
                    site: take_site(&args[1])?,
                    clock: take_clock(&args[2])?,
                    species: take_opt_str(&args[3], "species")?,
                    front_advance: args[4].truthy(),
                    rear_advance: args[5].truthy(),
                    start_hint: take_hint(&args[6]),
                    start: take_id(&args[7], "overlay start")?,
                    end_hint: take_hint(&args[8]),
                    end: take_id(&args[9], "overlay end")?,
                });
            }
            "overlay-move" => {
                if args.len() != 7 {
                    return Err(bad("overlay-move takes seven fields"));
                }
                return Ok(Message::OverlayMove {
                    buffer: take_str(&args[0], "buffer")?,
                    site: take_site(&args[1])?,
                    clock: take_clock(&args[2])?,
                    start_hint: take_hint(&args[3]),
                    start: take_id(&args[4], "overlay start")?,
                    end_hint: take_hint(&args[5]),
                    end: take_id(&args[6], "overlay end")?,
                });
            }
            "overlay-put" => {
                if args.len() != 5 {
                    return Err(bad("overlay-put takes five fields"));
                }
                let prop = args[3]
                    .as_sym()
                    .or_else(|| args[3].as_str())
                    .ok_or_else(|| bad("overlay property name"))?;
                return Ok(Message::OverlayPut {
                    buffer: take_str(&args[0], "buffer")?,
                    site: take_site(&args[1])?,
                    clock: take_clock(&args[2])?,
                    prop: prop.to_string(),
                    value: args[4].clone(),
                });
            }
            "overlay-remove" => {
                if args.len() != 3 {
                    return Err(bad("overlay-remove takes three fields"));
                }
                return Ok(Message::OverlayRemove {
                    buffer: take_str(&args[0], "buffer")?,
                    site: take_site(&args[1])?,
                    clock: take_clock(&args[2])?,
                });
            }
            "get" => {
                if args.len() != 1 {
                    return Err(bad("get takes a buffer"));
                }
                return Ok(Message::Get {
                    buffer: take_str(&args[0], "buffer")?,
                });
            }
            other => return Err(bad(&format!("unknown message type: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sexp::FrameReader;

    fn id(digits: &[u16]) -> Id {
        let mut bytes = Vec::new();
        for d in digits {
            bytes.extend_from_slice(&d.to_be_bytes());
        }
        return Id::from_bytes(bytes).unwrap();
    }

    fn round_trip(message: Message) {
        let mut reader = FrameReader::new();
        reader.feed(message.encode().as_bytes());
        let form = reader.next_form().unwrap().unwrap();
        assert_eq!(Message::from_sexp(&form).unwrap(), message);
    }

    #[test]
    fn hello_round_trip() {
        round_trip(Message::Hello {
            name: "alice".to_string(),
            response: None,
        });
        round_trip(Message::Hello {
            name: "alice".to_string(),
            response: Some(vec![1, 2, 3, 255]),
        });
    }

    #[test]
    fn handshake_round_trips() {
        round_trip(Message::Challenge {
            salt: (0..32).collect(),
        });
        round_trip(Message::Login {
            site: 3,
            session: "scratch".to_string(),
        });
    }

    #[test]
    fn text_op_round_trips() {
        round_trip(Message::Insert {
            buffer: "notes".to_string(),
            id: id(&[500, 2, 0]),
            hint: 12,
            content: "hello \"world\"\n".to_string(),
        });
        round_trip(Message::Delete {
            buffer: "notes".to_string(),
            hint: 3,
            pairs: vec![(2, id(&[500, 2, 3])), (5, id(&[600, 1, 0]))],
        });
    }

    #[test]
    fn sync_round_trip() {
        round_trip(Message::Sync {
            buffer: "notes".to_string(),
            mode: Some("text-mode".to_string()),
            content: "HELLO".to_string(),
            runs: vec![
                IdRun { len: 2, id: id(&[10, 1, 0]), eob: false },
                IdRun { len: 3, id: id(&[10, 1, 2]), eob: true },
            ],
        });
        round_trip(Message::Sync {
            buffer: "empty".to_string(),
            mode: None,
            content: String::new(),
            runs: Vec::new(),
        });
    }

    #[test]
    fn cursor_round_trips() {
        round_trip(Message::Cursor {
            buffer: "notes".to_string(),
            site: 2,
            point_hint: 3,
            point: Some(id(&[10, 1, 3])),
            mark_hint: 0,
            mark: None,
        });
        // End-of-document point, cleared cursor.
        round_trip(Message::Cursor {
            buffer: "notes".to_string(),
            site: 2,
            point_hint: 5,
            point: Some(Id::empty()),
            mark_hint: 0,
            mark: None,
        });
        round_trip(Message::Cursor {
            buffer: "notes".to_string(),
            site: 2,
            point_hint: 0,
            point: None,
            mark_hint: 0,
            mark: None,
        });
    }

    #[test]
    fn presence_round_trips() {
        round_trip(Message::Contact {
            site: 4,
            name: Some("bob".to_string()),
            address: Some(("198.51.100.7".to_string(), 6530)),
        });
        round_trip(Message::Contact {
            site: 4,
            name: None,
            address: None,
        });
        round_trip(Message::Focus {
            site: 4,
            buffer: Some("notes".to_string()),
        });
    }

    #[test]
    fn overlay_round_trips() {
        round_trip(Message::OverlayAdd {
            buffer: "notes".to_string(),
            site: 1,
            clock: 0,
            species: Some("selection".to_string()),
            front_advance: false,
            rear_advance: true,
            start_hint: 0,
            start: id(&[10, 1, 0]),
            end_hint: 5,
            end: Id::empty(),
        });
        round_trip(Message::OverlayMove {
            buffer: "notes".to_string(),
            site: 1,
            clock: 0,
            start_hint: 1,
            start: id(&[10, 1, 1]),
            end_hint: 4,
            end: id(&[10, 1, 4]),
        });
        round_trip(Message::OverlayPut {
            buffer: "notes".to_string(),
            site: 1,
            clock: 0,
            prop: "face".to_string(),
            value: Sexp::Sym("highlight".to_string()),
        });
        round_trip(Message::OverlayRemove {
            buffer: "notes".to_string(),
            site: 1,
            clock: 0,
        });
    }

    #[test]
    fn reserved_get_round_trips() {
        round_trip(Message::Get {
            buffer: "notes".to_string(),
        });
    }

    #[test]
    fn malformed_messages_error() {
        let cases = [
            "(unknown 1)",
            "(hello)",
            "(login 70000 \"s\")",
            "(insert \"b\" \"!!!notbase64\" 0 \"x\")",
            "(insert \"b\" \"AAAA\" 0 \"x\")", // 2-byte id: bad shape
            "(cursor \"b\" 1 0)",
            "42",
        ];
        for text in cases {
            let mut reader = FrameReader::new();
            reader.feed(text.as_bytes());
            reader.feed(b" ");
            let form = reader.next_form().unwrap().unwrap();
            assert!(Message::from_sexp(&form).is_err(), "accepted: {}", text);
        }
    }
}
