//! Per-buffer replica: deriving operations from local edits and
//! applying operations from peers.
//!
//! The deriver and the applier are two halves of the same contract:
//! whatever sequence of operations the deriver emits, applying them at
//! any other replica in any interleaving with concurrent operations
//! reproduces the same document. Local inserts prefer extending the
//! block they touch (one identifier per burst of typing); everything
//! else allocates a fresh block between its neighbors.

use rand::Rng;

use crate::crdt::block::{char_slice, BlockStore, IdRun};
use crate::crdt::id::{Id, SiteId, BLOCK_CAPACITY, OFFSET_MAX};
use crate::crdt::overlay::{CursorEntry, CursorTable, Overlay, OverlayKey, OverlayTable};
use crate::protocol::sexp::Sexp;

/// A text operation derived from a local edit, ready for the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum TextOp {
    Insert {
        id: Id,
        hint: usize,
        content: String,
    },
    Delete {
        hint: usize,
        pairs: Vec<(u32, Id)>,
    },
}

/// One buffer's full replicated state: text, cursors, overlays.
#[derive(Clone, Debug, Default)]
pub struct BufferReplica {
    store: BlockStore,
    cursors: CursorTable,
    overlays: OverlayTable,
}

impl BufferReplica {
    pub fn new() -> BufferReplica {
        return BufferReplica {
            store: BlockStore::new(),
            cursors: CursorTable::new(),
            overlays: OverlayTable::new(),
        };
    }

    /// Rebuild the text from a sync snapshot. Cursor and overlay
    /// tables start empty; the snapshot sender replays them separately.
    pub fn from_snapshot(content: &str, runs: &[IdRun]) -> Option<BufferReplica> {
        let store = BlockStore::from_runs(content, runs)?;
        return Some(BufferReplica {
            store,
            cursors: CursorTable::new(),
            overlays: OverlayTable::new(),
        });
    }

    pub fn store(&self) -> &BlockStore {
        return &self.store;
    }

    pub fn cursors(&self) -> &CursorTable {
        return &self.cursors;
    }

    pub fn overlays(&self) -> &OverlayTable {
        return &self.overlays;
    }

    pub fn text(&self) -> String {
        return self.store.text();
    }

    pub fn len(&self) -> usize {
        return self.store.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.store.is_empty();
    }

    // =========================================================================
    // Local edits
    // =========================================================================

    /// Derive operations for `text` typed at `beg`, updating the store.
    pub fn local_insert<R: Rng>(
        &mut self,
        beg: usize,
        text: &str,
        site: SiteId,
        rng: &mut R,
    ) -> Vec<TextOp> {
        let count = text.chars().count();
        if count == 0 {
            return Vec::new();
        }
        debug_assert!(beg <= self.store.len());
        let end = beg + count;

        let left = if beg > 0 {
            self.store.id_at(beg - 1)
        } else {
            Id::empty()
        };
        // The character that will sit just after the insertion.
        let right = self.store.id_at(beg);

        // A block continuing across the insertion point must be split
        // first, or the new identifiers would break the ordering.
        if !left.is_empty() && !right.is_empty() && right.base_eq(&left) {
            self.store.split_at(beg);
        }

        let mut ops = Vec::new();
        let mut at = beg;
        let mut low = left.clone();
        let mut low_offset = if left.is_empty() { 0 } else { left.offset() };

        // Typing right after our own block's flagged end extends the
        // block instead of minting a new identifier, as long as the
        // offset digit has headroom.
        if !left.is_empty() && left.site() == site && self.store.is_block_end(beg - 1) {
            let headroom = (OFFSET_MAX - low_offset) as usize;
            let merge_end = end.min(beg + headroom);
            if merge_end > beg {
                let chunk = char_slice(text, 0, merge_end - beg);
                self.store.extend_run(beg, chunk);
                ops.push(TextOp::Insert {
                    id: low.with_offset(low_offset + 1),
                    hint: beg,
                    content: chunk.to_string(),
                });
                low_offset += (merge_end - beg) as u16;
                at = merge_end;
            }
        }

        // Whatever remains becomes fresh blocks between the (possibly
        // just-extended) left neighbor and the right neighbor.
        let right_offset = if right.is_empty() { 0 } else { right.offset() };
        while at < end {
            let block_end = end.min(at + BLOCK_CAPACITY);
            let chunk = char_slice(text, at - beg, block_end - beg);
            let id = Id::generate_between(&low, low_offset, &right, right_offset, site, rng);
            self.store.insert_run(at, id.clone(), chunk, true);
            ops.push(TextOp::Insert {
                id: id.clone(),
                hint: at,
                content: chunk.to_string(),
            });
            low = id;
            low_offset = OFFSET_MAX;
            at = block_end;
        }
        return ops;
    }

    /// Derive the operation for deleting `count` characters at `beg`,
    /// updating the store.
    pub fn local_delete(&mut self, beg: usize, count: usize) -> Option<TextOp> {
        if count == 0 {
            return None;
        }
        let end = beg + count;
        debug_assert!(end <= self.store.len());
        self.store.split_at(beg);
        self.store.split_at(end);
        let pairs = self
            .store
            .dump_runs(beg, end)
            .into_iter()
            .map(|run| (run.len, run.id))
            .collect();
        self.store.remove_range(beg, end);
        return Some(TextOp::Delete { hint: beg, pairs });
    }

    // =========================================================================
    // Remote operations
    // =========================================================================

    /// Apply an insert from a peer. Returns the position where the
    /// content landed.
    pub fn apply_insert(&mut self, id: &Id, hint: usize, content: &str) -> usize {
        let pos = self.store.find_id(id, hint, false);
        let count = content.chars().count();
        if count == 0 || id.offset() as usize + count - 1 > u16::MAX as usize {
            return pos;
        }
        // An interior landing splits the run it falls into, which also
        // bars later local appends from merging across the seam.
        self.store.split_at(pos);
        if pos > 0 {
            let left = self.store.id_at(pos - 1);
            if left.base_eq(id) && left.offset() < OFFSET_MAX && left.offset() + 1 == id.offset() {
                self.store.extend_run(pos, content);
                return pos;
            }
        }
        self.store.insert_run(pos, id.clone(), content, true);
        return pos;
    }

    /// Apply a delete from a peer. Returns the removed `(position,
    /// text)` chunks in removal order.
    ///
    /// A pair character whose identifier is no longer present was
    /// already removed by a concurrent delete the hub serialized
    /// first; it is skipped so overlapping deletes converge.
    pub fn apply_delete(&mut self, hint: usize, pairs: &[(u32, Id)]) -> Vec<(usize, String)> {
        let mut removed = Vec::new();
        for (len, id) in pairs {
            let mut remaining = *len as usize;
            let mut id = id.clone();
            while remaining > 0 {
                let pos = self.store.find_id(&id, hint, true);
                if pos < self.store.len() && self.store.id_at(pos) == id {
                    let run_end = self.store.run_end(pos);
                    let take = remaining.min(run_end - pos);
                    self.store.split_at(pos);
                    self.store.split_at(pos + take);
                    let text = self.store.remove_range(pos, pos + take);
                    removed.push((pos, text));
                    remaining -= take;
                    if remaining > 0 {
                        id = id.with_offset(id.offset().wrapping_add(take as u16));
                    }
                } else {
                    remaining -= 1;
                    if remaining > 0 {
                        id = id.with_offset(id.offset().wrapping_add(1));
                    }
                }
            }
        }
        return removed;
    }

    // =========================================================================
    // Cursors
    // =========================================================================

    /// Record a site's cursor and resolve it to positions for the
    /// host. `None` clears the cursor.
    pub fn set_cursor(
        &mut self,
        site: SiteId,
        entry: Option<CursorEntry>,
    ) -> Option<(usize, Option<usize>)> {
        let resolved = entry.as_ref().map(|entry| {
            let point = self.resolve_at(&entry.point, entry.point_hint);
            let mark = entry
                .mark
                .as_ref()
                .map(|mark| self.resolve_at(mark, entry.mark_hint));
            return (point, mark);
        });
        self.cursors.set(site, entry);
        return resolved;
    }

    pub fn clear_cursor(&mut self, site: SiteId) -> bool {
        return self.cursors.remove(site);
    }

    /// Position of the character carrying `id`; document end for the
    /// empty identifier.
    pub fn resolve_at(&self, id: &Id, hint: usize) -> usize {
        if id.is_empty() {
            return self.store.len();
        }
        return self.store.find_id(id, hint, true);
    }

    /// Identifier of the character at `pos`; empty at or past the end.
    pub fn anchor_at(&self, pos: usize) -> Id {
        return self.store.id_at(pos);
    }

    /// Identifier of the character before `pos`; empty at the start.
    pub fn anchor_before(&self, pos: usize) -> Id {
        if pos == 0 {
            return Id::empty();
        }
        return self.store.id_at(pos - 1);
    }

    // =========================================================================
    // Overlays
    // =========================================================================

    /// Insert or overwrite an overlay; returns its resolved range.
    pub fn overlay_add(&mut self, key: OverlayKey, overlay: Overlay) -> (usize, usize) {
        let range = self.resolve_overlay(&overlay);
        self.overlays.add(key, overlay);
        return range;
    }

    /// Move a known overlay's endpoints; returns the resolved range,
    /// or `None` when the key is unknown.
    pub fn overlay_move(
        &mut self,
        key: OverlayKey,
        start: Id,
        start_hint: usize,
        end: Id,
        end_hint: usize,
    ) -> Option<(usize, usize)> {
        if !self
            .overlays
            .move_endpoints(key, start, start_hint, end, end_hint)
        {
            return None;
        }
        let overlay = self.overlays.get(key)?;
        return Some(self.resolve_overlay(overlay));
    }

    pub fn overlay_put(&mut self, key: OverlayKey, prop: &str, value: Sexp) -> bool {
        return self.overlays.put(key, prop, value);
    }

    pub fn overlay_remove(&mut self, key: OverlayKey) -> bool {
        return self.overlays.remove(key);
    }

    /// Resolve an overlay's endpoint identifiers to a position range.
    pub fn resolve_overlay(&self, overlay: &Overlay) -> (usize, usize) {
        let start = self.resolve_endpoint(&overlay.start, overlay.start_hint, overlay.front_advance);
        let end = self.resolve_endpoint(&overlay.end, overlay.end_hint, overlay.rear_advance);
        return (start, end.max(start));
    }

    /// An endpoint either anchors to the character at its position
    /// (`at_char`, the advancing flavor) or just after the character
    /// before it.
    fn resolve_endpoint(&self, id: &Id, hint: usize, at_char: bool) -> usize {
        if at_char {
            if id.is_empty() {
                return self.store.len();
            }
            return self.store.find_id(id, hint, true);
        }
        if id.is_empty() {
            return 0;
        }
        return self.store.find_id(id, hint, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        return StdRng::seed_from_u64(0x7eac4);
    }

    /// Apply one replica's ops to another.
    fn relay(ops: &[TextOp], to: &mut BufferReplica) {
        for op in ops {
            match op {
                TextOp::Insert { id, hint, content } => {
                    to.apply_insert(id, *hint, content);
                }
                TextOp::Delete { hint, pairs } => {
                    to.apply_delete(*hint, pairs);
                }
            }
        }
    }

    #[test]
    fn typing_extends_one_block() {
        let mut rng = rng();
        let mut replica = BufferReplica::new();
        let first = replica.local_insert(0, "HE", 1, &mut rng);
        let second = replica.local_insert(2, "LLO", 1, &mut rng);
        assert_eq!(replica.text(), "HELLO");
        assert_eq!(replica.store().run_count(), 1);
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        // The continuation reuses the block's base at the next offset.
        match (&first[0], &second[0]) {
            (TextOp::Insert { id: a, .. }, TextOp::Insert { id: b, .. }) => {
                assert!(a.base_eq(b));
                assert_eq!(b.offset(), 2);
            }
            _ => panic!("expected inserts"),
        }
        assert!(replica.store().validate().is_ok());
    }

    #[test]
    fn interior_insert_splits() {
        let mut rng = rng();
        let mut replica = BufferReplica::new();
        replica.local_insert(0, "HELLO", 1, &mut rng);
        replica.local_insert(2, "X", 1, &mut rng);
        assert_eq!(replica.text(), "HEXLLO");
        assert!(replica.store().run_count() >= 3);
        assert!(replica.store().validate().is_ok());
    }

    #[test]
    fn derived_ops_replay_identically() {
        let mut rng = rng();
        let mut source = BufferReplica::new();
        let mut sink = BufferReplica::new();
        relay(&source.local_insert(0, "HELLO WORLD", 1, &mut rng), &mut sink);
        relay(&[source.local_delete(5, 1).unwrap()], &mut sink);
        relay(&source.local_insert(5, ", ", 1, &mut rng), &mut sink);
        assert_eq!(source.text(), "HELLO, WORLD");
        assert_eq!(sink.text(), source.text());
        assert_eq!(
            sink.store().dump_runs(0, sink.len()),
            source.store().dump_runs(0, source.len())
        );
    }

    #[test]
    fn remote_insert_merges_adjacent_offsets() {
        let mut rng = rng();
        let mut source = BufferReplica::new();
        let mut sink = BufferReplica::new();
        relay(&source.local_insert(0, "HE", 1, &mut rng), &mut sink);
        relay(&source.local_insert(2, "LLO", 1, &mut rng), &mut sink);
        assert_eq!(sink.text(), "HELLO");
        assert_eq!(sink.store().run_count(), 1);
    }

    #[test]
    fn append_after_remote_split_does_not_merge() {
        let mut rng1 = rng();
        let mut rng2 = StdRng::seed_from_u64(0xb0b);
        let mut alice = BufferReplica::new();
        let mut bob = BufferReplica::new();

        // Shared prefix "AB", one block owned by site 1.
        let seed = alice.local_insert(0, "AB", 1, &mut rng1);
        relay(&seed, &mut bob);

        // Bob inserts between A and B; Alice applies it, splitting her
        // block.
        let wedge = bob.local_insert(1, "x", 2, &mut rng2);
        relay(&wedge, &mut alice);
        assert_eq!(alice.text(), "AxB");

        // Alice now types right after A (the split point). The left
        // fragment lost its end-of-block flag, so this must mint a
        // fresh identifier rather than reuse offset 1 of her block.
        let fresh = alice.local_insert(1, "y", 1, &mut rng1);
        match &fresh[0] {
            TextOp::Insert { id, .. } => assert_eq!(id.offset(), 0),
            _ => panic!("expected insert"),
        }
        relay(&fresh, &mut bob);
        assert_eq!(alice.text(), "AyxB");
        assert_eq!(bob.text(), alice.text());
        assert!(alice.store().validate().is_ok());
        assert!(bob.store().validate().is_ok());
    }

    #[test]
    fn overlapping_concurrent_deletes_converge() {
        let mut rng1 = rng();
        let mut alice = BufferReplica::new();
        let mut bob = BufferReplica::new();
        relay(&alice.local_insert(0, "ABCDEF", 1, &mut rng1), &mut bob);

        // Both delete overlapping ranges before seeing each other.
        let from_alice = alice.local_delete(1, 3).unwrap(); // BCD
        let from_bob = bob.local_delete(2, 3).unwrap(); // CDE

        relay(&[from_bob], &mut alice);
        relay(&[from_alice], &mut bob);

        assert_eq!(alice.text(), "AF");
        assert_eq!(bob.text(), "AF");
        assert!(alice.store().validate().is_ok());
        assert!(bob.store().validate().is_ok());
    }

    #[test]
    fn delete_mid_block_keeps_tail_ids() {
        let mut rng = rng();
        let mut replica = BufferReplica::new();
        replica.local_insert(0, "HELLO", 1, &mut rng);
        let before = replica.store().id_at(4);
        replica.local_delete(1, 2);
        assert_eq!(replica.text(), "HLO");
        // The surviving tail keeps its original identifiers.
        assert_eq!(replica.store().id_at(2), before);
        assert!(replica.store().validate().is_ok());
    }

    #[test]
    fn cursor_follows_reference_character() {
        let mut rng = rng();
        let mut replica = BufferReplica::new();
        replica.local_insert(0, "HELLO", 1, &mut rng);
        let anchor = replica.anchor_at(3);
        replica.local_delete(0, 1);
        assert_eq!(replica.resolve_at(&anchor, 3), 2);
    }

    #[test]
    fn huge_insert_spans_blocks() {
        let mut rng = rng();
        let mut source = BufferReplica::new();
        let mut sink = BufferReplica::new();
        let text: String = std::iter::repeat('a').take(BLOCK_CAPACITY + 10).collect();
        let ops = source.local_insert(0, &text, 1, &mut rng);
        assert_eq!(ops.len(), 2);
        relay(&ops, &mut sink);
        assert_eq!(source.len(), BLOCK_CAPACITY + 10);
        assert_eq!(sink.text(), source.text());
        assert!(source.store().validate().is_ok());
    }
}
