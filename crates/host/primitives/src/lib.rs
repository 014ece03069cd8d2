//! Leaf types shared across the weft host: the error taxonomy, host
//! configuration, the muxer's wire frames and the secure-channel handshake
//! messages. Nothing in here performs I/O.

pub mod config;
pub mod error;
pub mod frame;
pub mod handshake;
