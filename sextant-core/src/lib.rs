//! Core types for the sextant network content index
//!
//! This crate defines the data model shared by every sextant component:
//!
//! - [`PeerId`]: self-describing peer identities embedding an ed25519 key
//! - [`link`]: content ids and multihash helpers (CIDv1, sha2-256)
//! - [`Value`]: the (provider, context, metadata) tuple the index stores
//! - [`schema`]: the advertisement chain wire format (CBOR)
//! - [`Datastore`]: the ancillary key-value store (staged blocks, provider
//!   records, head pointers) with memory and redb implementations
//! - [`FileStore`]: archive storage for CAR files

pub mod datastore;
pub mod error;
pub mod filestore;
pub mod link;
pub mod peer;
pub mod schema;
pub mod value;

pub use datastore::{Datastore, MemoryDatastore, RedbDatastore};
pub use error::{Error, Result};
pub use filestore::{DirFileStore, FileInfo, FileStore, MemFileStore};
pub use link::{Cid, Multihash};
pub use peer::PeerId;
pub use value::Value;
