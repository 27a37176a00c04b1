//! Replicated cursors and overlays.
//!
//! Both kinds of metadata ride alongside the text: cursors are keyed
//! by site, overlays by `(site, clock)`. Endpoints are stored as
//! identifiers plus position hints and resolved against the block
//! store on demand, so they follow their reference characters through
//! concurrent edits.

use rustc_hash::FxHashMap;

use crate::crdt::id::{Id, SiteId};
use crate::protocol::sexp::Sexp;

/// Globally unique overlay key: originating site and that site's
/// Lamport clock value at creation.
pub type OverlayKey = (SiteId, u32);

/// A remote participant's cursor: point, optional mark, and the
/// sender-side position hints.
#[derive(Clone, Debug)]
pub struct CursorEntry {
    pub point: Id,
    pub point_hint: usize,
    pub mark: Option<Id>,
    pub mark_hint: usize,
}

/// A replicated annotation over a range of characters.
#[derive(Clone, Debug)]
pub struct Overlay {
    /// Opaque tag grouping overlays of the same kind.
    pub species: Option<String>,
    /// Whether the start anchors to the character at the start
    /// position (true) or after the character before it (false).
    pub front_advance: bool,
    /// Same choice for the end position.
    pub rear_advance: bool,
    pub start: Id,
    pub start_hint: usize,
    pub end: Id,
    pub end_hint: usize,
    /// Replicated properties; every value is printable by construction.
    pub properties: FxHashMap<String, Sexp>,
}

// =============================================================================
// Cursor table
// =============================================================================

/// Cursors of every site seen on a buffer.
#[derive(Clone, Debug, Default)]
pub struct CursorTable {
    entries: FxHashMap<SiteId, CursorEntry>,
}

impl CursorTable {
    pub fn new() -> CursorTable {
        return CursorTable {
            entries: FxHashMap::default(),
        };
    }

    /// Record a site's cursor; `None` clears it.
    pub fn set(&mut self, site: SiteId, entry: Option<CursorEntry>) {
        match entry {
            Some(entry) => {
                self.entries.insert(site, entry);
            }
            None => {
                self.entries.remove(&site);
            }
        }
    }

    pub fn get(&self, site: SiteId) -> Option<&CursorEntry> {
        return self.entries.get(&site);
    }

    pub fn remove(&mut self, site: SiteId) -> bool {
        return self.entries.remove(&site).is_some();
    }

    pub fn iter(&self) -> impl Iterator<Item = (SiteId, &CursorEntry)> {
        return self.entries.iter().map(|(site, entry)| (*site, entry));
    }
}

// =============================================================================
// Overlay table
// =============================================================================

/// Overlays keyed by `(site, clock)`.
#[derive(Clone, Debug, Default)]
pub struct OverlayTable {
    entries: FxHashMap<OverlayKey, Overlay>,
}

impl OverlayTable {
    pub fn new() -> OverlayTable {
        return OverlayTable {
            entries: FxHashMap::default(),
        };
    }

    /// Add an overlay. A duplicate key overwrites benignly: the key is
    /// immutable history, so the newest description wins.
    pub fn add(&mut self, key: OverlayKey, overlay: Overlay) {
        self.entries.insert(key, overlay);
    }

    /// Move an overlay's endpoints. Unknown keys are dropped silently.
    pub fn move_endpoints(
        &mut self,
        key: OverlayKey,
        start: Id,
        start_hint: usize,
        end: Id,
        end_hint: usize,
    ) -> bool {
        match self.entries.get_mut(&key) {
            Some(overlay) => {
                overlay.start = start;
                overlay.start_hint = start_hint;
                overlay.end = end;
                overlay.end_hint = end_hint;
                return true;
            }
            None => return false,
        }
    }

    /// Set one replicated property. Unknown keys are dropped silently.
    pub fn put(&mut self, key: OverlayKey, prop: &str, value: Sexp) -> bool {
        match self.entries.get_mut(&key) {
            Some(overlay) => {
                overlay.properties.insert(prop.to_string(), value);
                return true;
            }
            None => return false,
        }
    }

    /// Delete an overlay. Unknown keys are dropped silently.
    pub fn remove(&mut self, key: OverlayKey) -> bool {
        return self.entries.remove(&key).is_some();
    }

    pub fn get(&self, key: OverlayKey) -> Option<&Overlay> {
        return self.entries.get(&key);
    }

    pub fn len(&self) -> usize {
        return self.entries.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.entries.is_empty();
    }

    pub fn iter(&self) -> impl Iterator<Item = (OverlayKey, &Overlay)> {
        return self.entries.iter().map(|(key, overlay)| (*key, overlay));
    }
}
