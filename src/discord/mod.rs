//! Discord integration: wire types, REST client, and the gateway session.

pub mod gateway;
pub mod rest;
pub mod types;

pub use gateway::GatewayEvent;
pub use rest::Rest;
