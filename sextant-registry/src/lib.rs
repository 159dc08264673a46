//! Provider registry, policy, and freeze lifecycle for sextant
//!
//! The registry is the authority for which peers may publish and be
//! ingested, what is known about each provider, and whether the indexer is
//! frozen (read-only due to disk pressure).

pub mod freeze;
pub mod policy;
pub mod registry;

pub use freeze::{DiskSampler, DiskUsage, FreezeWatcher, StatfsSampler};
pub use policy::{Policy, PolicyConfig};
pub use registry::{parse_peer_id, ProviderInfo, ProviderUpdate, Registry};
