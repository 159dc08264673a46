//! Ingest and publish policy
//!
//! Two mirrored boolean-with-exceptions sets decide, per peer, whether its
//! content may be ingested and whether it may publish advertisements on
//! behalf of other providers. Exception membership flips immediately on
//! config reload.

use sextant_core::{Error, PeerId, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

/// Policy section of the config file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Default ingest decision for peers not in `except`.
    #[serde(default)]
    pub allow: bool,
    /// Peers whose ingest decision is the opposite of `allow`.
    #[serde(default)]
    pub except: Vec<String>,
    /// Default publish decision for peers not in `publish_except`.
    #[serde(default)]
    pub publish: bool,
    /// Peers whose publish decision is the opposite of `publish`.
    #[serde(default)]
    pub publish_except: Vec<String>,
}

/// Compiled policy state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Policy {
    allow: bool,
    except: HashSet<PeerId>,
    publish: bool,
    publish_except: HashSet<PeerId>,
}

impl Policy {
    /// Compile a policy from config, validating every exception id.
    pub fn new(cfg: &PolicyConfig) -> Result<Self> {
        Ok(Self {
            allow: cfg.allow,
            except: parse_ids(&cfg.except)?,
            publish: cfg.publish,
            publish_except: parse_ids(&cfg.publish_except)?,
        })
    }

    /// Whether a peer's advertisements may be ingested.
    pub fn allowed(&self, peer: &PeerId) -> bool {
        self.allow ^ self.except.contains(peer)
    }

    /// Whether `publisher` may publish advertisements for `provider`.
    ///
    /// Requires the provider to be ingest-allowed; a peer may always publish
    /// for itself when it is itself allowed.
    pub fn publish_allowed(&self, publisher: &PeerId, provider: &PeerId) -> bool {
        if !self.allowed(provider) {
            return false;
        }
        if publisher == provider {
            return true;
        }
        self.publish ^ self.publish_except.contains(publisher)
    }

    /// Flip a peer to allowed. Returns true if the policy changed.
    pub fn allow(&mut self, peer: PeerId) -> bool {
        if self.allow {
            self.except.remove(&peer)
        } else {
            self.except.insert(peer)
        }
    }

    /// Flip a peer to blocked. Returns true if the policy changed.
    pub fn block(&mut self, peer: PeerId) -> bool {
        if self.allow {
            self.except.insert(peer)
        } else {
            self.except.remove(&peer)
        }
    }

    /// Atomically replace this policy's state (config reload).
    pub fn copy(&mut self, other: &Policy) {
        *self = other.clone();
    }

    /// Serialize back to config form with stably sorted exception lists.
    pub fn to_config(&self) -> PolicyConfig {
        PolicyConfig {
            allow: self.allow,
            except: sorted_ids(&self.except),
            publish: self.publish,
            publish_except: sorted_ids(&self.publish_except),
        }
    }

    /// True iff no peer can ever be allowed (default-block, no exceptions).
    pub fn none_allowed(&self) -> bool {
        !self.allow && self.except.is_empty()
    }

    /// The set of explicitly allowed peers under a default-block policy.
    /// Under default-allow this is empty (everyone not excepted is allowed).
    pub fn allowed_peers(&self) -> Vec<PeerId> {
        if self.allow {
            Vec::new()
        } else {
            let mut peers: Vec<PeerId> = self.except.iter().copied().collect();
            peers.sort();
            peers
        }
    }
}

fn parse_ids(ids: &[String]) -> Result<HashSet<PeerId>> {
    let mut set = HashSet::with_capacity(ids.len());
    for id in ids {
        let peer = PeerId::from_str(id)
            .map_err(|e| Error::other(format!("bad policy peer id {}: {}", id, e)))?;
        set.insert(peer);
    }
    Ok(set)
}

fn sorted_ids(set: &HashSet<PeerId>) -> Vec<String> {
    let mut ids: Vec<String> = set.iter().map(|p| p.to_string()).collect();
    ids.sort();
    ids
}
