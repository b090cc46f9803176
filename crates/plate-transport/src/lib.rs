//! # plate-transport
//!
//! Session transport for the plategate gateway.
//!
//! - [`Connector`] opens authenticated sessions
//! - [`Session`] is one live session for one identity
//! - [`InboundHandler`] receives stanzas pushed by the server
//!
//! [`TcpConnector`] is the production implementation: one TCP stream per
//! session, length-prefixed frames, and fixed-delay reconnection.
//!
//! ```rust,ignore
//! use plate_transport::{Connector, Credentials, SessionKind, TcpConfig, TcpConnector};
//!
//! let connector = TcpConnector::new(TcpConfig::default());
//! let session = connector
//!     .connect(&Credentials::new("34ABC123", "secret"), SessionKind::Principal)
//!     .await?;
//! ```

pub mod tcp;
pub mod traits;

pub use tcp::{ReconnectPolicy, TcpConfig, TcpConnector};
pub use traits::{Connector, Credentials, InboundHandler, Session, SessionKind, TransportError};
