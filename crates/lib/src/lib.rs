//! Tern core library: channel adapters that turn external messaging services into a stream of
//! normalized inbound messages plus a send path, and the config they are built from.

pub mod channels;
pub mod config;
