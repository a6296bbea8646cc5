// Copyright 2026. The meshctl Community
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! `NodeIdentity` — the immutable identity of a running node process (§3).
//!
//! Unlike the teacher's `tari_comms::peer_manager::NodeIdentity`, which
//! derives a `NodeId` from a public key, identity here carries no
//! cryptographic material (spec.md §1 Non-goals: "no cryptographic
//! identity"). Identity is a random UUID plus the set of addresses the node
//! listens on.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The identity of one node in the cluster. Immutable for the lifetime of
/// the process that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub unique_id: Uuid,
    pub listen_addresses: Vec<SocketAddr>,
}

impl NodeIdentity {
    pub fn new(unique_id: Uuid, listen_addresses: Vec<SocketAddr>) -> Self {
        Self {
            unique_id,
            listen_addresses,
        }
    }

    /// Generates a fresh random identity, analogous to
    /// `tari_comms::peer_manager::NodeIdentity::random` but without a keypair.
    pub fn random(listen_addresses: Vec<SocketAddr>) -> Self {
        Self::new(Uuid::new_v4(), listen_addresses)
    }

    pub fn primary_address(&self) -> Option<SocketAddr> {
        self.listen_addresses.first().copied()
    }
}

impl std::fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.unique_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_identities_are_distinct() {
        let a = NodeIdentity::random(vec!["127.0.0.1:9000".parse().unwrap()]);
        let b = NodeIdentity::random(vec!["127.0.0.1:9001".parse().unwrap()]);
        assert_ne!(a.unique_id, b.unique_id);
    }

    #[test]
    fn primary_address_is_first() {
        let addrs: Vec<SocketAddr> = vec!["127.0.0.1:9000".parse().unwrap(), "127.0.0.1:9001".parse().unwrap()];
        let id = NodeIdentity::new(Uuid::new_v4(), addrs.clone());
        assert_eq!(id.primary_address(), Some(addrs[0]));
    }
}
