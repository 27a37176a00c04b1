//! The replica engine: every shared buffer of one participant.
//!
//! The engine sits between three parties. The *host* reports local
//! edits and receives render callbacks; the *session* hands in remote
//! messages and carries away derived ones; the engine owns the
//! replicas in between. While a remote message is being applied, local
//! derivation is inhibited so a host that mirrors engine callbacks
//! back into the engine cannot echo operations onto the wire.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHashMap;

use crate::crdt::buffer::{BufferReplica, TextOp};
use crate::crdt::clock::LamportClock;
use crate::crdt::id::SiteId;
use crate::crdt::overlay::{CursorEntry, Overlay, OverlayKey};
use crate::error::{Error, Result};
use crate::host::Host;
use crate::protocol::message::Message;
use crate::protocol::sexp::Sexp;

/// One participant's replicated state across all shared buffers.
pub struct Engine {
    site: SiteId,
    clock: LamportClock,
    buffers: FxHashMap<String, BufferReplica>,
    modes: FxHashMap<String, Option<String>>,
    /// Last published cursor per buffer, for change-gated republish.
    last_cursor: FxHashMap<String, (usize, Option<usize>)>,
    /// Which buffer each site is looking at.
    focus: FxHashMap<SiteId, String>,
    applying_remote: bool,
    rng: StdRng,
}

impl Engine {
    /// Create an engine for the given site.
    pub fn new(site: SiteId) -> Engine {
        return Engine::with_rng(site, StdRng::from_entropy());
    }

    /// Create an engine with a caller-supplied generator, for
    /// deterministic tests.
    pub fn with_rng(site: SiteId, rng: StdRng) -> Engine {
        return Engine {
            site,
            clock: LamportClock::new(),
            buffers: FxHashMap::default(),
            modes: FxHashMap::default(),
            last_cursor: FxHashMap::default(),
            focus: FxHashMap::default(),
            applying_remote: false,
            rng,
        };
    }

    pub fn site(&self) -> SiteId {
        return self.site;
    }

    /// Adopt the site assigned at login.
    pub fn set_site(&mut self, site: SiteId) {
        self.site = site;
    }

    /// True while a remote message is being applied; local hooks are
    /// inhibited for the duration.
    pub fn is_applying_remote(&self) -> bool {
        return self.applying_remote;
    }

    // =========================================================================
    // Buffers
    // =========================================================================

    /// Create an empty buffer replica.
    pub fn create_buffer(&mut self, name: &str, mode: Option<String>) -> Result<()> {
        if self.buffers.contains_key(name) {
            return Err(Error::BufferExists(name.to_string()));
        }
        self.buffers.insert(name.to_string(), BufferReplica::new());
        self.modes.insert(name.to_string(), mode);
        return Ok(());
    }

    /// Drop a buffer replica and everything keyed under it.
    pub fn remove_buffer(&mut self, name: &str) -> bool {
        self.modes.remove(name);
        self.last_cursor.remove(name);
        self.focus.retain(|_, buffer| buffer.as_str() != name);
        return self.buffers.remove(name).is_some();
    }

    pub fn has_buffer(&self, name: &str) -> bool {
        return self.buffers.contains_key(name);
    }

    pub fn buffer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buffers.keys().cloned().collect();
        names.sort();
        return names;
    }

    pub fn text(&self, name: &str) -> Option<String> {
        return self.buffers.get(name).map(BufferReplica::text);
    }

    pub fn replica(&self, name: &str) -> Option<&BufferReplica> {
        return self.buffers.get(name);
    }

    fn replica_mut(&mut self, name: &str) -> Result<&mut BufferReplica> {
        return self
            .buffers
            .get_mut(name)
            .ok_or_else(|| Error::UnknownBuffer(name.to_string()));
    }

    // =========================================================================
    // Local edits
    // =========================================================================

    /// The host typed `text` at `pos`. Returns the operations to send.
    pub fn local_insert(&mut self, buffer: &str, pos: usize, text: &str) -> Result<Vec<Message>> {
        if self.applying_remote {
            return Ok(Vec::new());
        }
        let site = self.site;
        let rng = &mut self.rng;
        let replica = self
            .buffers
            .get_mut(buffer)
            .ok_or_else(|| Error::UnknownBuffer(buffer.to_string()))?;
        let ops = replica.local_insert(pos, text, site, rng);
        return Ok(ops
            .into_iter()
            .map(|op| text_op_to_message(buffer, op))
            .collect());
    }

    /// The host deleted `preimage` at `pos`. Returns the operations to
    /// send.
    pub fn local_delete(
        &mut self,
        buffer: &str,
        pos: usize,
        preimage: &str,
    ) -> Result<Vec<Message>> {
        if self.applying_remote {
            return Ok(Vec::new());
        }
        let count = preimage.chars().count();
        let replica = self.replica_mut(buffer)?;
        debug_assert_eq!(replica.store().slice(pos, pos + count), preimage);
        let op = replica.local_delete(pos, count);
        return Ok(op
            .into_iter()
            .map(|op| text_op_to_message(buffer, op))
            .collect());
    }

    /// The host's cursor settled at `point`/`mark`. Returns a message
    /// only when the cursor moved since the last publish.
    pub fn local_cursor(
        &mut self,
        buffer: &str,
        point: usize,
        mark: Option<usize>,
    ) -> Result<Option<Message>> {
        if self.applying_remote {
            return Ok(None);
        }
        if !self.has_buffer(buffer) {
            return Err(Error::UnknownBuffer(buffer.to_string()));
        }
        if self.last_cursor.get(buffer) == Some(&(point, mark)) {
            return Ok(None);
        }
        self.last_cursor.insert(buffer.to_string(), (point, mark));

        let site = self.site;
        let replica = self.replica_mut(buffer)?;
        let point_id = replica.anchor_at(point);
        let mark_id = mark.map(|mark| replica.anchor_at(mark));
        replica.set_cursor(
            site,
            Some(CursorEntry {
                point: point_id.clone(),
                point_hint: point,
                mark: mark_id.clone(),
                mark_hint: mark.unwrap_or(0),
            }),
        );
        return Ok(Some(Message::Cursor {
            buffer: buffer.to_string(),
            site,
            point_hint: point,
            point: Some(point_id),
            mark_hint: mark.unwrap_or(0),
            mark: mark_id,
        }));
    }

    /// The host switched buffers; `None` means it looked away.
    pub fn local_focus(&mut self, buffer: Option<String>) -> Message {
        match &buffer {
            Some(name) => {
                self.focus.insert(self.site, name.clone());
            }
            None => {
                self.focus.remove(&self.site);
            }
        }
        return Message::Focus {
            site: self.site,
            buffer,
        };
    }

    // =========================================================================
    // Local overlays
    // =========================================================================

    /// Create an overlay over `[start, end)` and return its key and
    /// the announcement to send.
    pub fn create_overlay(
        &mut self,
        buffer: &str,
        start: usize,
        end: usize,
        species: Option<String>,
        front_advance: bool,
        rear_advance: bool,
    ) -> Result<(OverlayKey, Message)> {
        let site = self.site;
        let key = (site, self.clock.tick());
        let replica = self.replica_mut(buffer)?;
        let start_id = if front_advance {
            replica.anchor_at(start)
        } else {
            replica.anchor_before(start)
        };
        let end_id = if rear_advance {
            replica.anchor_at(end)
        } else {
            replica.anchor_before(end)
        };
        let overlay = Overlay {
            species: species.clone(),
            front_advance,
            rear_advance,
            start: start_id.clone(),
            start_hint: start,
            end: end_id.clone(),
            end_hint: end,
            properties: FxHashMap::default(),
        };
        replica.overlay_add(key, overlay);
        let message = Message::OverlayAdd {
            buffer: buffer.to_string(),
            site,
            clock: key.1,
            species,
            front_advance,
            rear_advance,
            start_hint: start,
            start: start_id,
            end_hint: end,
            end: end_id,
        };
        return Ok((key, message));
    }

    /// Move a known overlay to `[start, end)`.
    pub fn move_overlay(
        &mut self,
        buffer: &str,
        key: OverlayKey,
        start: usize,
        end: usize,
    ) -> Result<Option<Message>> {
        let replica = self.replica_mut(buffer)?;
        let (front_advance, rear_advance) = match replica.overlays().get(key) {
            Some(overlay) => (overlay.front_advance, overlay.rear_advance),
            None => return Ok(None),
        };
        let start_id = if front_advance {
            replica.anchor_at(start)
        } else {
            replica.anchor_before(start)
        };
        let end_id = if rear_advance {
            replica.anchor_at(end)
        } else {
            replica.anchor_before(end)
        };
        replica.overlay_move(key, start_id.clone(), start, end_id.clone(), end);
        return Ok(Some(Message::OverlayMove {
            buffer: buffer.to_string(),
            site: key.0,
            clock: key.1,
            start_hint: start,
            start: start_id,
            end_hint: end,
            end: end_id,
        }));
    }

    /// Replicate one overlay property.
    pub fn put_overlay(
        &mut self,
        buffer: &str,
        key: OverlayKey,
        prop: &str,
        value: Sexp,
    ) -> Result<Option<Message>> {
        let replica = self.replica_mut(buffer)?;
        if !replica.overlay_put(key, prop, value.clone()) {
            return Ok(None);
        }
        return Ok(Some(Message::OverlayPut {
            buffer: buffer.to_string(),
            site: key.0,
            clock: key.1,
            prop: prop.to_string(),
            value,
        }));
    }

    /// Delete an overlay.
    pub fn remove_overlay(&mut self, buffer: &str, key: OverlayKey) -> Result<Option<Message>> {
        let replica = self.replica_mut(buffer)?;
        if !replica.overlay_remove(key) {
            return Ok(None);
        }
        return Ok(Some(Message::OverlayRemove {
            buffer: buffer.to_string(),
            site: key.0,
            clock: key.1,
        }));
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// The full-buffer snapshot a newcomer needs.
    pub fn make_sync(&self, buffer: &str) -> Result<Message> {
        let replica = self
            .buffers
            .get(buffer)
            .ok_or_else(|| Error::UnknownBuffer(buffer.to_string()))?;
        let mode = self.modes.get(buffer).cloned().unwrap_or(None);
        return Ok(Message::Sync {
            buffer: buffer.to_string(),
            mode,
            content: replica.text(),
            runs: replica.store().dump_runs(0, replica.len()),
        });
    }

    /// Cursor and overlay messages that replay a buffer's metadata for
    /// a newcomer.
    pub fn replay_messages(&self, buffer: &str) -> Result<(Vec<Message>, Vec<Message>)> {
        let replica = self
            .buffers
            .get(buffer)
            .ok_or_else(|| Error::UnknownBuffer(buffer.to_string()))?;
        let mut cursors = Vec::new();
        for (site, entry) in replica.cursors().iter() {
            cursors.push(Message::Cursor {
                buffer: buffer.to_string(),
                site,
                point_hint: entry.point_hint,
                point: Some(entry.point.clone()),
                mark_hint: entry.mark_hint,
                mark: entry.mark.clone(),
            });
        }
        let mut overlays = Vec::new();
        for ((site, clock), overlay) in replica.overlays().iter() {
            overlays.push(Message::OverlayAdd {
                buffer: buffer.to_string(),
                site,
                clock,
                species: overlay.species.clone(),
                front_advance: overlay.front_advance,
                rear_advance: overlay.rear_advance,
                start_hint: overlay.start_hint,
                start: overlay.start.clone(),
                end_hint: overlay.end_hint,
                end: overlay.end.clone(),
            });
            for (prop, value) in &overlay.properties {
                overlays.push(Message::OverlayPut {
                    buffer: buffer.to_string(),
                    site,
                    clock,
                    prop: prop.clone(),
                    value: value.clone(),
                });
            }
        }
        return Ok((cursors, overlays));
    }

    // =========================================================================
    // Remote application
    // =========================================================================

    /// Apply one message from a peer, mirroring its effect into the
    /// host. Operations on buffers this replica does not hold are
    /// dropped; whether that is a violation is the session's call.
    pub fn apply_remote(&mut self, message: &Message, host: &mut dyn Host) -> Result<()> {
        self.applying_remote = true;
        let result = self.dispatch(message, host);
        self.applying_remote = false;
        return result;
    }

    fn dispatch(&mut self, message: &Message, host: &mut dyn Host) -> Result<()> {
        match message {
            Message::Insert {
                buffer,
                id,
                hint,
                content,
            } => {
                let replica = match self.buffers.get_mut(buffer) {
                    Some(replica) => replica,
                    None => return Ok(()),
                };
                if content.is_empty() {
                    return Ok(());
                }
                let pos = replica.apply_insert(id, *hint, content);
                host.insert(buffer, pos, content);
                return Ok(());
            }
            Message::Delete {
                buffer,
                hint,
                pairs,
            } => {
                let replica = match self.buffers.get_mut(buffer) {
                    Some(replica) => replica,
                    None => return Ok(()),
                };
                for (pos, text) in replica.apply_delete(*hint, pairs) {
                    host.delete(buffer, pos, &text);
                }
                return Ok(());
            }
            Message::Cursor {
                buffer,
                site,
                point_hint,
                point,
                mark_hint,
                mark,
            } => {
                let replica = match self.buffers.get_mut(buffer) {
                    Some(replica) => replica,
                    None => return Ok(()),
                };
                match point {
                    Some(point) => {
                        let entry = CursorEntry {
                            point: point.clone(),
                            point_hint: *point_hint,
                            mark: mark.clone(),
                            mark_hint: *mark_hint,
                        };
                        if let Some((point, mark)) = replica.set_cursor(*site, Some(entry)) {
                            host.cursor(buffer, *site, Some(point), mark);
                        }
                    }
                    None => {
                        replica.clear_cursor(*site);
                        host.cursor(buffer, *site, None, None);
                    }
                }
                return Ok(());
            }
            Message::Sync {
                buffer,
                mode,
                content,
                runs,
            } => {
                let replica = BufferReplica::from_snapshot(content, runs)
                    .ok_or_else(|| Error::Protocol("sync runs do not cover content".to_string()))?;
                self.buffers.insert(buffer.clone(), replica);
                self.modes.insert(buffer.clone(), mode.clone());
                host.create_buffer(buffer, mode.as_deref(), content);
                return Ok(());
            }
            Message::Desync { buffer } => {
                if self.remove_buffer(buffer) {
                    host.remove_buffer(buffer);
                }
                return Ok(());
            }
            Message::Contact { site, name, .. } => {
                host.contact(*site, name.as_deref());
                return Ok(());
            }
            Message::Focus { site, buffer } => {
                match buffer {
                    Some(name) => {
                        self.focus.insert(*site, name.clone());
                    }
                    None => {
                        self.focus.remove(site);
                    }
                }
                host.focus(*site, buffer.as_deref());
                return Ok(());
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
                let replica = match self.buffers.get_mut(buffer) {
                    Some(replica) => replica,
                    None => return Ok(()),
                };
                let overlay = Overlay {
                    species: species.clone(),
                    front_advance: *front_advance,
                    rear_advance: *rear_advance,
                    start: start.clone(),
                    start_hint: *start_hint,
                    end: end.clone(),
                    end_hint: *end_hint,
                    properties: FxHashMap::default(),
                };
                let range = replica.overlay_add((*site, *clock), overlay);
                host.overlay(buffer, (*site, *clock), Some(range));
                return Ok(());
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
                let replica = match self.buffers.get_mut(buffer) {
                    Some(replica) => replica,
                    None => return Ok(()),
                };
                let moved = replica.overlay_move(
                    (*site, *clock),
                    start.clone(),
                    *start_hint,
                    end.clone(),
                    *end_hint,
                );
                if let Some(range) = moved {
                    host.overlay(buffer, (*site, *clock), Some(range));
                }
                return Ok(());
            }
            Message::OverlayPut {
                buffer,
                site,
                clock,
                prop,
                value,
            } => {
                let replica = match self.buffers.get_mut(buffer) {
                    Some(replica) => replica,
                    None => return Ok(()),
                };
                if replica.overlay_put((*site, *clock), prop, value.clone()) {
                    host.overlay_property(buffer, (*site, *clock), prop, value);
                }
                return Ok(());
            }
            Message::OverlayRemove {
                buffer,
                site,
                clock,
            } => {
                let replica = match self.buffers.get_mut(buffer) {
                    Some(replica) => replica,
                    None => return Ok(()),
                };
                if replica.overlay_remove((*site, *clock)) {
                    host.overlay(buffer, (*site, *clock), None);
                }
                return Ok(());
            }
            Message::Get { .. } => {
                // Reserved for a future snapshot-recovery path.
                return Ok(());
            }
            Message::Hello { .. } | Message::Challenge { .. } | Message::Login { .. } => {
                return Err(Error::Protocol(
                    "handshake message outside the handshake".to_string(),
                ));
            }
        }
    }
}

fn text_op_to_message(buffer: &str, op: TextOp) -> Message {
    match op {
        TextOp::Insert { id, hint, content } => {
            return Message::Insert {
                buffer: buffer.to_string(),
                id,
                hint,
                content,
            };
        }
        TextOp::Delete { hint, pairs } => {
            return Message::Delete {
                buffer: buffer.to_string(),
                hint,
                pairs,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NullHost;

    fn engine(site: SiteId) -> Engine {
        return Engine::with_rng(site, StdRng::seed_from_u64(site as u64 + 11));
    }

    fn exchange(messages: &[Message], to: &mut Engine) {
        let mut host = NullHost;
        for message in messages {
            to.apply_remote(message, &mut host).unwrap();
        }
    }

    #[test]
    fn create_and_edit_buffer() {
        let mut alice = engine(1);
        alice.create_buffer("notes", None).unwrap();
        let ops = alice.local_insert("notes", 0, "hello").unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(alice.text("notes"), Some("hello".to_string()));
    }

    #[test]
    fn duplicate_buffer_is_an_error() {
        let mut alice = engine(1);
        alice.create_buffer("notes", None).unwrap();
        assert!(matches!(
            alice.create_buffer("notes", None),
            Err(Error::BufferExists(_))
        ));
    }

    #[test]
    fn edits_replay_on_peers() {
        let mut alice = engine(1);
        let mut bob = engine(2);
        alice.create_buffer("notes", None).unwrap();
        bob.create_buffer("notes", None).unwrap();

        exchange(&alice.local_insert("notes", 0, "hello world").unwrap(), &mut bob);
        exchange(&alice.local_delete("notes", 0, "hello ").unwrap(), &mut bob);
        assert_eq!(bob.text("notes"), Some("world".to_string()));
        assert_eq!(bob.text("notes"), alice.text("notes"));
    }

    #[test]
    fn unknown_buffers_are_dropped() {
        let mut alice = engine(1);
        let mut bob = engine(2);
        alice.create_buffer("notes", None).unwrap();
        let ops = alice.local_insert("notes", 0, "hello").unwrap();
        // Bob never saw a sync for "notes"; the operation is ignored.
        exchange(&ops, &mut bob);
        assert_eq!(bob.text("notes"), None);
    }

    #[test]
    fn sync_snapshot_bootstraps_a_peer() {
        let mut alice = engine(1);
        alice.create_buffer("notes", Some("text-mode".to_string())).unwrap();
        alice.local_insert("notes", 0, "HELLO").unwrap();
        alice.local_insert("notes", 2, "-").unwrap();

        let mut bob = engine(2);
        exchange(&[alice.make_sync("notes").unwrap()], &mut bob);
        assert_eq!(bob.text("notes"), alice.text("notes"));

        // And the annotation survives: further edits converge.
        let ops = bob.local_insert("notes", 6, "!").unwrap();
        exchange(&ops, &mut alice);
        assert_eq!(alice.text("notes"), bob.text("notes"));
    }

    #[test]
    fn cursor_publish_is_change_gated() {
        let mut alice = engine(1);
        alice.create_buffer("notes", None).unwrap();
        alice.local_insert("notes", 0, "hello").unwrap();
        assert!(alice.local_cursor("notes", 3, None).unwrap().is_some());
        assert!(alice.local_cursor("notes", 3, None).unwrap().is_none());
        assert!(alice.local_cursor("notes", 4, None).unwrap().is_some());
        assert!(alice.local_cursor("notes", 4, Some(1)).unwrap().is_some());
    }

    #[test]
    fn local_hooks_inhibited_during_apply() {
        struct EchoHost {
            echoed: Vec<Message>,
        }
        impl Host for EchoHost {
            fn insert(&mut self, _buffer: &str, _pos: usize, _text: &str) {}
        }

        let mut alice = engine(1);
        let mut bob = engine(2);
        alice.create_buffer("notes", None).unwrap();
        bob.create_buffer("notes", None).unwrap();
        let ops = alice.local_insert("notes", 0, "hi").unwrap();

        // A host that re-reports the mutation mid-apply derives nothing.
        let mut host = EchoHost { echoed: Vec::new() };
        for op in &ops {
            bob.applying_remote = true;
            host.echoed = bob.local_insert("notes", 0, "hi").unwrap();
            bob.applying_remote = false;
            bob.apply_remote(op, &mut host).unwrap();
        }
        assert!(host.echoed.is_empty());
        assert_eq!(bob.text("notes"), Some("hi".to_string()));
    }

    #[test]
    fn overlay_lifecycle() {
        let mut alice = engine(1);
        let mut bob = engine(2);
        alice.create_buffer("notes", None).unwrap();
        alice.local_insert("notes", 0, "HELLO").unwrap();
        let mut bob_msgs = vec![alice.make_sync("notes").unwrap()];

        let (key, add) = alice
            .create_overlay("notes", 1, 4, Some("selection".to_string()), true, false)
            .unwrap();
        let put = alice
            .put_overlay("notes", key, "face", Sexp::Sym("highlight".to_string()))
            .unwrap()
            .unwrap();
        bob_msgs.push(add);
        bob_msgs.push(put);
        exchange(&bob_msgs, &mut bob);
        let overlay = bob.replica("notes").unwrap().overlays().get(key).unwrap();
        assert_eq!(
            bob.replica("notes").unwrap().resolve_overlay(overlay),
            (1, 4)
        );

        let remove = alice.remove_overlay("notes", key).unwrap().unwrap();
        exchange(&[remove], &mut bob);
        assert!(bob.replica("notes").unwrap().overlays().is_empty());
    }

    #[test]
    fn replay_covers_cursors_and_overlays() {
        let mut alice = engine(1);
        alice.create_buffer("notes", None).unwrap();
        alice.local_insert("notes", 0, "HELLO").unwrap();
        alice.local_cursor("notes", 2, None).unwrap();
        let (key, _) = alice
            .create_overlay("notes", 0, 5, None, false, false)
            .unwrap();
        alice
            .put_overlay("notes", key, "face", Sexp::Sym("region".to_string()))
            .unwrap();

        let (cursors, overlays) = alice.replay_messages("notes").unwrap();
        assert_eq!(cursors.len(), 1);
        assert_eq!(overlays.len(), 2); // add + one put
    }

    #[test]
    fn handshake_messages_are_rejected() {
        let mut alice = engine(1);
        let mut host = NullHost;
        let message = Message::Login {
            site: 2,
            session: "s".to_string(),
        };
        assert!(alice.apply_remote(&message, &mut host).is_err());
    }
}
