//! Core domain layer. No external I/O dependencies.
//!
//! Entities and business rules live here. Dependencies flow inward.

pub mod entities;
pub mod errors;
pub mod filter;
pub mod path;

pub use entities::{
    Channel, Dialog, DownloadTask, DocumentMeta, FileLocation, Media, MediaKind, MediaKindSet,
    MessageMeta, PhotoMeta, ProgressEvent, Topic,
};
pub use errors::DomainError;
pub use filter::{FilterPolicy, SizeRange};
