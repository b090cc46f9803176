//! # plate-core
//!
//! Connection and state-transition core of the plategate gateway.
//!
//! - **ConnectionPool** - zero or one live session per principal
//! - **ChatStateMachine** - debounced typing/presence transitions per pair
//! - **MessageDispatcher** - send, persist and fan out; mirrored for inbound
//! - **VehicleRegistry** - vehicles, remote accounts and their credentials
//! - **TopicRouter** - local publish/subscribe for connected clients
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌────────────────┐     ┌────────────────┐
//! │   request    │────▶│ VehicleRegistry│────▶│ ConnectionPool │──▶ remote
//! └──────────────┘     └────────────────┘     └────────────────┘
//!        │                                            │ inbound
//!        ▼                                            ▼
//! ┌──────────────┐     ┌────────────────┐     ┌────────────────┐
//! │ChatStateMach.│────▶│     stores     │◀────│MessageDispatch.│
//! └──────────────┘     └────────────────┘     └────────────────┘
//!        │                                            │
//!        └───────────────▶ TopicRouter ◀──────────────┘
//! ```

pub mod credentials;
pub mod dispatch;
pub mod fanout;
pub mod gateway;
pub mod model;
pub mod pool;
pub mod provisioner;
pub mod registry;
pub mod store;
pub mod typing;

#[cfg(test)]
mod testkit;

pub use credentials::{generate_password, CredentialCipher, CryptoError, SecretCipher};
pub use dispatch::{DispatchError, MessageDispatcher};
pub use fanout::{Fanout, FanoutConfig, FanoutError, FanoutStats, Publication, TopicRouter};
pub use gateway::{Gateway, GatewayConfig};
pub use model::{
    ChatState, ChatStateRecord, ChatStateRequest, MessageRecord, MessageRequest, MessageResponse,
    VehicleRecord,
};
pub use pool::{AdminSession, ConnectionError, ConnectionPool};
pub use provisioner::{AccountProvisioner, AdminProvisioner, ProvisionError};
pub use registry::{RegistryError, VehicleRegistry};
pub use store::{MemoryStore, StoreError, Stores};
pub use typing::{ChatStateMachine, DEFAULT_DEBOUNCE};
