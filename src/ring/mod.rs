//! Consistent-hash ring over backend endpoints.
//!
//! Each endpoint contributes 40 virtual nodes. Point `i` of endpoint `E` is
//! `consistent(jody(E.addr) + i)` where `jody` is a 64-bit Jody-style string
//! hash and `consistent(h) = h mod 10^9`. Both the replica factor and the
//! modulus are part of the observable placement contract: changing either
//! moves keys for every client of a running fleet.
//!
//! A ring is immutable once built and is only ever observed through
//! [`HashRing::lookup_server`]; membership changes are handled by building a
//! fresh ring.

use crate::registry::ServerEndpoint;

/// Virtual nodes per endpoint.
const RING_REPLICATION: usize = 40;

/// The hash space is folded into `[0, 10^9)`.
const HASH_RADIX: u64 = 1_000_000_000;

/// 64-bit Jody block hash over byte strings.
///
/// Word-at-a-time mixing with the reference shift/constant pair; the tail is
/// zero-padded into a final little-endian word.
pub mod jody {
    const SHIFT: u32 = 14;
    const CONSTANT: u64 = 0x1f3d5b79;

    fn mix(mut hash: u64, word: u64) -> u64 {
        hash = hash.wrapping_add(word).wrapping_add(CONSTANT);
        hash = hash.rotate_left(SHIFT);
        hash ^= word;
        hash = hash.rotate_left(SHIFT);
        hash ^= CONSTANT;
        hash.wrapping_add(word)
    }

    /// Hash a byte string from the zero state.
    pub fn hash(data: &[u8]) -> u64 {
        let mut h = 0u64;
        let mut chunks = data.chunks_exact(8);

        for chunk in &mut chunks {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            h = mix(h, u64::from_le_bytes(word));
        }

        let tail = chunks.remainder();
        if !tail.is_empty() {
            let mut word = [0u8; 8];
            word[..tail.len()].copy_from_slice(tail);
            h = mix(h, u64::from_le_bytes(word));
        }

        h
    }

    /// Fold one extra word into an existing hash state.
    pub fn add(hash: u64, word: u64) -> u64 {
        mix(hash, word)
    }
}

fn consistent_hash(h: u64) -> u64 {
    h % HASH_RADIX
}

#[derive(Debug, Clone)]
struct RingNode {
    hash: u64,
    endpoint: ServerEndpoint,
}

/// Immutable sorted set of `(hash, endpoint)` virtual nodes.
#[derive(Debug, Clone)]
pub struct HashRing {
    nodes: Vec<RingNode>,
}

impl HashRing {
    /// Build a ring over `endpoints`. Hash collisions between points are
    /// resolved by insertion order, which the stable sort preserves.
    pub fn new(endpoints: &[ServerEndpoint]) -> Self {
        let mut nodes = Vec::with_capacity(RING_REPLICATION * endpoints.len());

        for endpoint in endpoints {
            let base = jody::hash(endpoint.addr.as_bytes());
            for i in 0..RING_REPLICATION {
                nodes.push(RingNode {
                    hash: consistent_hash(jody::add(base, i as u64)),
                    endpoint: endpoint.clone(),
                });
            }
        }

        nodes.sort_by_key(|node| node.hash);
        Self { nodes }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of virtual nodes on the ring.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Map `key` to its endpoint: the first ring point strictly above the
    /// key's hash, wrapping to the start of the ring.
    pub fn lookup_server(&self, key: &[u8]) -> Option<&ServerEndpoint> {
        if self.nodes.is_empty() {
            return None;
        }

        let h = consistent_hash(jody::hash(key));
        let mut i = self.nodes.partition_point(|node| node.hash <= h);
        if i == self.nodes.len() {
            i = 0;
        }

        Some(&self.nodes[i].endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn endpoints(addrs: &[&str]) -> Vec<ServerEndpoint> {
        addrs
            .iter()
            .map(|addr| ServerEndpoint::new("backend", *addr))
            .collect()
    }

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("redgate.test.hash.{i}")).collect()
    }

    #[test]
    fn jody_hash_is_deterministic() {
        assert_eq!(jody::hash(b"localhost:6379"), jody::hash(b"localhost:6379"));
        assert_ne!(jody::hash(b"localhost:6379"), jody::hash(b"localhost:6380"));
        assert_ne!(jody::add(jody::hash(b"a"), 0), jody::add(jody::hash(b"a"), 1));
    }

    #[test]
    fn jody_hash_tail_is_length_sensitive() {
        // A short key and its zero-extension differ through the length of
        // the words fed to the mixer.
        assert_ne!(jody::hash(b"abc"), jody::hash(b"abc\0\0\0\0\0abc"));
        assert_ne!(jody::hash(b""), jody::hash(b"\0"));

        assert_eq!(jody::hash(b""), 0);
    }

    #[test]
    fn ring_has_forty_points_per_endpoint() {
        let ring = HashRing::new(&endpoints(&["localhost:6379", "localhost:6380"]));
        assert_eq!(ring.len(), 80);
    }

    #[test]
    fn empty_ring_resolves_nothing() {
        let ring = HashRing::new(&[]);
        assert!(ring.is_empty());
        assert!(ring.lookup_server(b"any").is_none());
    }

    #[test]
    fn lookup_always_lands_on_a_member() {
        let members = endpoints(&["a:6379", "b:6379", "c:6379", "d:6379"]);
        let ring = HashRing::new(&members);

        for key in keys(1000) {
            let hit = ring.lookup_server(key.as_bytes()).unwrap();
            assert!(members.contains(hit), "{key} resolved off-ring");
        }
    }

    #[test]
    fn identically_built_rings_agree() {
        let members = endpoints(&["a:6379", "b:6379", "c:6379"]);
        let one = HashRing::new(&members);
        let two = HashRing::new(&members);

        for key in keys(200) {
            assert_eq!(
                one.lookup_server(key.as_bytes()),
                two.lookup_server(key.as_bytes())
            );
        }
    }

    #[test]
    fn adding_an_endpoint_relocates_about_its_share() {
        let four = endpoints(&["a:6379", "b:6379", "c:6379", "d:6379"]);
        let mut five = four.clone();
        five.push(ServerEndpoint::new("backend", "e:6379"));

        let before = HashRing::new(&four);
        let after = HashRing::new(&five);

        let keys = keys(2000);
        let mut moved = 0;

        for key in &keys {
            let old = before.lookup_server(key.as_bytes()).unwrap();
            let new = after.lookup_server(key.as_bytes()).unwrap();
            if old != new {
                moved += 1;
                // A grown ring only hands keys to the newcomer.
                assert_eq!(new.addr, "e:6379", "{key} moved between survivors");
            }
        }

        // Expected share is 1/(n+1) of the key space, verified within 50%.
        let expected = keys.len() / 5;
        assert!(
            moved >= expected / 2 && moved <= expected * 3 / 2,
            "moved {moved} of {} keys, expected about {expected}",
            keys.len()
        );
        assert!(moved > 0);
    }

    #[test]
    fn removing_an_endpoint_only_moves_its_keys() {
        let full = endpoints(&["a:6379", "b:6379", "c:6379", "d:6379"]);
        let removed = "b:6379";
        let remaining: Vec<_> = full.iter().filter(|e| e.addr != removed).cloned().collect();

        let before = HashRing::new(&full);
        let after = HashRing::new(&remaining);

        let mut mapping = HashMap::new();
        let keys = keys(160);
        for key in &keys {
            mapping.insert(
                key.clone(),
                before.lookup_server(key.as_bytes()).unwrap().addr.clone(),
            );
        }

        let mut orphaned = 0;
        for key in &keys {
            let new = after.lookup_server(key.as_bytes()).unwrap();
            let old = &mapping[key];

            if old == removed {
                orphaned += 1;
                assert_ne!(new.addr, removed);
            } else {
                // Keys on surviving endpoints never move.
                assert_eq!(&new.addr, old, "{key} relocated off a surviving endpoint");
            }
        }

        assert!(orphaned > 0, "no key hashed to the removed endpoint");
    }
}
