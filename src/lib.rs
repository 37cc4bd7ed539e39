#![forbid(unsafe_code)]

//! Star-topology message middleware.
//!
//! Named post offices running in separate processes exchange JSON-encoded
//! messages on behalf of application actors that own mailboxes. All
//! inter-process traffic flows through one broker, the central post office,
//! which authenticates peers, routes direct messages, fans out publishes,
//! and re-encrypts selectively-encrypted fields per hop.

pub mod codec;
pub mod config;
pub mod cpo;
pub mod crypto;
pub mod mailbox;
pub mod message;
pub mod monitor;
pub mod po;
pub mod subscriptions;
pub mod telemetry;
pub mod wire;

mod error;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use config::{ClientEntry, CpoConfig, OverflowPolicy, PoConfig};
pub use cpo::CentralPostOffice;
pub use mailbox::Mailbox;
pub use message::Message;
pub use po::{PoError, PostOffice};
