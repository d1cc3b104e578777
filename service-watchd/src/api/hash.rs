use std::collections::BTreeSet;
use std::net::IpAddr;
use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::{InterfaceId, Metadata, ServiceRecord};

/// Fields that make up a service's identity and reachability. The `outdated`
/// flag is left out since published records never carry it.
#[derive(Serialize)]
struct HashView<'a> {
    full_name: &'a str,
    hostname: Option<&'a str>,
    addresses: Option<&'a BTreeSet<IpAddr>>,
    port: &'a str,
    metadata: &'a Metadata,
    interface: InterfaceId,
}

/// Computes a SHA-256 hash of the visible service list.
/// Services are sorted by full name for deterministic output.
pub fn compute_hash(services: &[ServiceRecord]) -> String {
    let mut indices: Vec<usize> = (0..services.len()).collect();
    indices.sort_by(|&a, &b| services[a].full_name.cmp(&services[b].full_name));

    let views: Vec<HashView<'_>> = indices
        .iter()
        .map(|&i| {
            let s = &services[i];
            HashView {
                full_name: &s.full_name,
                hostname: s.hostname(),
                addresses: s.host.as_ref().map(|h| &h.addresses),
                port: &s.port,
                metadata: &s.metadata,
                interface: s.interface,
            }
        })
        .collect();

    // String keys throughout, so serialization cannot fail
    let json = serde_json::to_vec(&views).unwrap_or_default();

    let hash = Sha256::digest(&json);
    hex::encode(hash)
}
