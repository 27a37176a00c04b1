//! Tandem - real-time collaborative text editing over replicated
//! documents.
//!
//! Every participant holds a full local replica of each shared buffer.
//! Characters carry dense identifiers, so concurrent edits commute and
//! replicas converge without coordination. Sessions form a star: one
//! process serves as site 0 and relays everyone's operations; cursors
//! and annotation overlays replicate alongside the text.
//!
//! # Quick Start
//!
//! ```
//! use tandem::engine::Engine;
//! use tandem::host::NullHost;
//!
//! // Two replicas of the same buffer.
//! let mut alice = Engine::new(1);
//! let mut bob = Engine::new(2);
//! alice.create_buffer("notes", None).unwrap();
//! bob.create_buffer("notes", None).unwrap();
//!
//! // Alice types; the derived operations replay at Bob.
//! let ops = alice.local_insert("notes", 0, "Hello, World!").unwrap();
//! let mut host = NullHost;
//! for op in &ops {
//!     bob.apply_remote(op, &mut host).unwrap();
//! }
//! assert_eq!(bob.text("notes"), alice.text("notes"));
//! ```
//!
//! Networked sessions live in [`session`]: a [`SessionManager`] starts
//! a server or connects a client, and the returned handle carries host
//! edits into the session's hub task.

pub mod crdt;
pub mod engine;
pub mod error;
pub mod host;
pub mod protocol;
pub mod session;

pub use engine::Engine;
pub use error::{Error, Result};
pub use host::{Host, NullHost};
pub use session::{ClientConfig, ServerConfig, SessionHandle, SessionManager};
