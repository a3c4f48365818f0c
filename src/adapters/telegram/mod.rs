//! Telegram adapters: gateway, tl mapping, session storage.

pub mod client;
pub mod mapper;
pub mod session;

pub use client::GrammersTgGateway;
