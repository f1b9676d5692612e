//! # sidedrop-core
//!
//! Shared building blocks for the sidedrop peer-to-peer file hand-off
//! protocol.
//!
//! This crate provides the foundational types and utilities used by
//! [`sidedrop-engine`] and the CLI binary.
//!
//! ## Responsibilities
//!
//! - **Protocol primitives** — frame format (magic / version / type /
//!   length), channel-bind and file-transfer payloads, and JSON payload
//!   encoding/decoding.
//!
//! - **Signaling** — the `SessionDescription` offer/answer model and its
//!   armored text codec for manual out-of-band exchange.
//!
//! - **Offer registry** — short shareable codes mapping to pending
//!   offers, with single-use claims and TTL-bounded lifetime.
//!
//! - **Peer-channel capability** — the `ByteChannel` / `ChannelFactory`
//!   trait boundary that concrete transports implement.
//!
//! - **Filesystem helpers** — filename sanitisation, temp-file write with
//!   atomic rename, and collision rename strategy (e.g. `file (1).ext`).

pub mod channel;
pub mod fs;
pub mod protocol;
pub mod registry;
pub mod signaling;
pub mod tls;
