//! # sidedrop-engine
//!
//! Runtime logic for sidedrop, embedded into the CLI front-end.
//!
//! This crate provides:
//! - **Session state machines**: explicit sender and receiver variants
//!   over a monotonic `Idle → Negotiating → Connected → Closed/Failed`
//!   lifecycle, with the channel-bind handshake and timeout-bounded
//!   connect waits
//! - **Transfer protocol**: chunked, strictly ordered file streaming
//!   with an explicit end-of-transfer marker and frame-at-a-time
//!   reassembly
//! - **Engine**: command/event loop composing signaling, the offer
//!   registry, sessions and transfer into the two user-facing roles
//! - **Transport implementations**: QUIC (per-offer pinned self-signed
//!   certs), plaintext TCP, and an in-process pipe for tests

pub mod engine;
pub mod framed;
pub mod mem;
pub mod quic;
pub mod session;
pub mod tcp;
pub mod transfer;
