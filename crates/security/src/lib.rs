pub mod api;
pub mod certs;
pub mod crypto;
pub mod events;
pub mod gateway;
pub mod tokens;

pub use crypto::MessageCrypto;
pub use events::{SecurityEvent, SecurityEventLog};
pub use gateway::SecurityGateway;
pub use tokens::{TokenOutcome, TokenStore};
