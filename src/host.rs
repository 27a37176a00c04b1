//! The host boundary.
//!
//! The engine owns the replica; the host owns whatever the user sees.
//! When a remote operation lands, the engine mutates its replica and
//! calls these methods so the host can mirror the change. Local-edit
//! hooks are inhibited for the duration of every callback: a host that
//! echoes the mutation back into the engine derives nothing.
//!
//! All methods default to no-ops so a host only implements what it
//! renders.

use crate::crdt::id::SiteId;
use crate::crdt::overlay::OverlayKey;
use crate::protocol::sexp::Sexp;

/// Callbacks from the engine into the embedding editor.
pub trait Host: Send {
    /// A buffer arrived via snapshot; `mode` is an advisory hint the
    /// host may ignore.
    fn create_buffer(&mut self, buffer: &str, mode: Option<&str>, content: &str) {
        let _ = (buffer, mode, content);
    }

    /// The buffer is no longer shared.
    fn remove_buffer(&mut self, buffer: &str) {
        let _ = buffer;
    }

    /// Remote text arrived at `pos`.
    fn insert(&mut self, buffer: &str, pos: usize, text: &str) {
        let _ = (buffer, pos, text);
    }

    /// Remote deletion removed `text` at `pos`.
    fn delete(&mut self, buffer: &str, pos: usize, text: &str) {
        let _ = (buffer, pos, text);
    }

    /// A site's cursor moved; `None` point means it left the buffer.
    fn cursor(&mut self, buffer: &str, site: SiteId, point: Option<usize>, mark: Option<usize>) {
        let _ = (buffer, site, point, mark);
    }

    /// An overlay appeared or moved; `None` means it was removed.
    fn overlay(&mut self, buffer: &str, key: OverlayKey, range: Option<(usize, usize)>) {
        let _ = (buffer, key, range);
    }

    /// A replicated overlay property changed.
    fn overlay_property(&mut self, buffer: &str, key: OverlayKey, prop: &str, value: &Sexp) {
        let _ = (buffer, key, prop, value);
    }

    /// A participant joined (`Some(name)`) or left (`None`).
    fn contact(&mut self, site: SiteId, name: Option<&str>) {
        let _ = (site, name);
    }

    /// Which buffer a site is looking at.
    fn focus(&mut self, site: SiteId, buffer: Option<&str>) {
        let _ = (site, buffer);
    }
}

/// A host that renders nothing. Useful for tests and headless peers.
pub struct NullHost;

impl Host for NullHost {}
