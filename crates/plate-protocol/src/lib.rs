//! # plate-protocol
//!
//! Wire protocol spoken between the plategate gateway and the remote
//! messaging server.
//!
//! Every principal holds one long-lived session. A session opens a stream,
//! authenticates, and then exchanges [`Stanza`]s addressed to
//! `<principal>@<domain>` identities. Stanzas may carry a body, a chat-state
//! signal (typing indicators), or both.
//!
//! ## Frame Types
//!
//! - `Open` / `Opened` - Stream negotiation
//! - `Auth` / `AuthOk` / `AuthFailed` - Credential exchange
//! - `Stanza` - Messages and chat-state notifications
//! - `Register` / `Unregister` - Administrative account management
//! - `Ack` / `Error` - Replies to administrative requests
//! - `Ping` / `Pong` / `Close` - Keepalive and teardown
//!
//! ## Example
//!
//! ```rust
//! use plate_protocol::{codec, Frame, Jid, Stanza};
//!
//! let to = Jid::new("34ABC123", "fleet.local");
//! let frame = Frame::stanza(Stanza::chat(to, "on my way"));
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod stanza;

pub use codec::{decode, encode, ProtocolError};
pub use frames::{Frame, FrameType, PROTOCOL_VERSION};
pub use stanza::{generate_stanza_id, ChatStateSignal, Jid, Stanza, StanzaKind};
