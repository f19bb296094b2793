//! Multi-user chat server: sessions, named channels, broadcast and private messages.

pub mod command;
pub mod config;
pub mod connection;
pub mod server;
pub mod state;
