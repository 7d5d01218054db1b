#![forbid(unsafe_code)]

//! Client SDK for driving an AI-agent subprocess.
//!
//! Layers, bottom-up: [`wire`] framing and message classification,
//! [`transport`] process ownership and fan-out, [`rpc`] request correlation,
//! [`events`] typed notifications, [`approval`] negotiation, [`turn`]
//! orchestration and the [`retry`] wrapper.

pub mod approval;
pub mod audit;
pub mod config;
pub mod dialect;
pub mod errors;
pub mod events;
pub mod retry;
pub mod rpc;
pub mod transcript;
pub mod transport;
pub mod turn;
pub mod wire;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
