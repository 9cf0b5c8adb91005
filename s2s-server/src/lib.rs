//! XMPP server-to-server federation.
//!
//! Streams are negotiated by a fixed pipeline of protocol stages
//! ([`proc`]): stream open, errors, features, STARTTLS, compression refusal,
//! server dialback and SASL EXTERNAL. Authenticated connections are grouped
//! per (local, remote) domain pair ([`cid_connections`]); anything that gets
//! past the stages is vetted by the packet checker before it is routed.

pub mod cid;
pub mod cid_connections;
pub mod config;
pub mod connection;
pub mod dns;
pub mod error;
pub mod handler;
pub mod manager;
pub mod packet;
pub mod proc;
pub mod server;
pub mod tls;
pub mod transport;
pub mod xml;
