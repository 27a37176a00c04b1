//! The replica core: identifiers, block storage, edit derivation, and
//! replicated cursor/overlay metadata.
//!
//! Characters are ordered by dense identifiers, so concurrent
//! operations commute: replicas that have seen the same set of
//! operations hold the same document, whatever the delivery order.

pub mod block;
pub mod buffer;
pub mod clock;
pub mod id;
pub mod overlay;
