//! tg-spider: resumable Telegram channel media crawler with chunk-parallel
//! downloads, built with Hexagonal Architecture.

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod shared;
pub mod usecases;
