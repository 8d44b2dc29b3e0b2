//! Connection factories.
//!
//! [`OutgoingConnectionFactory`] deduplicates and caches client-initiated
//! connections; [`IncomingConnectionFactory`] accepts connections on one
//! listening endpoint. Each factory guards its bookkeeping with one mutex
//! and never performs socket I/O while holding it.

mod incoming;
mod outgoing;

pub use incoming::{IncomingConnectionFactory, ListenerState};
pub use outgoing::{ConnectionCallback, OutgoingConnectionFactory};

use crate::connection::{Adapter, Connection};
use crate::endpoint::{ConcurrencyMode, Connector, Endpoint, EndpointSelection};
use crate::route::RouteKey;
use rand::seq::SliceRandom;
use std::collections::HashSet;
use std::sync::Arc;

/// One route to try, in order, together with the endpoint that asked for
/// it. `endpoint` keeps its own compression flag; the key does not.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub key: RouteKey,
    pub endpoint: Endpoint,
}

/// Flattens resolved connectors into the ordered candidate list.
///
/// Endpoint order is preserved. With [`EndpointSelection::Random`] the
/// connectors of each endpoint are shuffled among themselves only. A route
/// reached through several endpoints is kept at its first position.
pub(crate) fn build_candidates(
    resolved: Vec<(Endpoint, Vec<Connector>)>,
    mode: ConcurrencyMode,
    selection: EndpointSelection,
) -> Vec<Candidate> {
    let mut rng = rand::rng();
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    for (endpoint, mut connectors) in resolved {
        if selection == EndpointSelection::Random {
            connectors.shuffle(&mut rng);
        }
        for connector in connectors {
            let key = RouteKey::new(connector, &endpoint, mode);
            if seen.insert(key.clone()) {
                candidates.push(Candidate {
                    key,
                    endpoint: endpoint.clone(),
                });
            }
        }
    }
    candidates
}

/// Drops finished connections and the entries they leave empty.
pub(crate) fn reap<K>(map: &mut std::collections::HashMap<K, Vec<Arc<Connection>>>)
where
    K: std::hash::Hash + Eq,
{
    map.retain(|_, connections| {
        connections.retain(|connection| !connection.is_finished());
        !connections.is_empty()
    });
}

// Compares adapter identity, ignoring vtable pointers.
pub(crate) fn same_adapter(a: &Arc<dyn Adapter>, b: &Arc<dyn Adapter>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::SocketAddr;

    fn endpoint_with(port: u16, count: u16) -> (Endpoint, Vec<Connector>) {
        let endpoint = Endpoint::tcp("127.0.0.1", port);
        let connectors = (0..count)
            .map(|i| {
                let addr: SocketAddr = format!("127.0.0.{}:{port}", i + 1).parse().unwrap();
                Connector::new(addr, &endpoint)
            })
            .collect();
        (endpoint, connectors)
    }

    #[test]
    fn ordered_selection_keeps_resolver_order() {
        let resolved = vec![endpoint_with(1000, 3), endpoint_with(2000, 2)];
        let expected: Vec<Connector> = resolved.iter().flat_map(|(_, c)| c.clone()).collect();
        let candidates = build_candidates(resolved, ConcurrencyMode::Pooled, EndpointSelection::Ordered);
        let got: Vec<Connector> = candidates.iter().map(|c| c.key.connector().clone()).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn shuffle_never_interleaves_endpoints() {
        for _ in 0..200 {
            let resolved = vec![endpoint_with(1000, 4), endpoint_with(2000, 4), endpoint_with(3000, 1)];
            let candidates = build_candidates(resolved, ConcurrencyMode::Pooled, EndpointSelection::Random);
            let ports: Vec<u16> = candidates.iter().map(|c| c.endpoint.port()).collect();
            assert_eq!(ports, vec![1000, 1000, 1000, 1000, 2000, 2000, 2000, 2000, 3000]);
        }
    }

    #[test]
    fn shuffle_picks_each_connector_first_evenly() {
        const TRIALS: usize = 6000;
        let mut first: HashMap<SocketAddr, usize> = HashMap::new();
        for _ in 0..TRIALS {
            let candidates = build_candidates(
                vec![endpoint_with(1000, 3)],
                ConcurrencyMode::Pooled,
                EndpointSelection::Random,
            );
            *first.entry(candidates[0].key.connector().addr()).or_default() += 1;
        }
        assert_eq!(first.len(), 3);
        for (addr, count) in first {
            // Expected 2000 each; the bounds are many standard deviations wide.
            assert!((1600..=2400).contains(&count), "{addr} picked first {count} times");
        }
    }

    #[test]
    fn candidate_keys_ignore_compression() {
        let (endpoint, connectors) = endpoint_with(1000, 1);
        let plain = build_candidates(
            vec![(endpoint.clone(), connectors.clone())],
            ConcurrencyMode::Pooled,
            EndpointSelection::Ordered,
        );
        let compressed = build_candidates(
            vec![(endpoint.with_compress(true), connectors)],
            ConcurrencyMode::Pooled,
            EndpointSelection::Ordered,
        );
        assert_eq!(plain[0].key, compressed[0].key);
        assert!(compressed[0].endpoint.compress());
    }

    #[test]
    fn repeated_routes_keep_their_first_position() {
        let (endpoint, connectors) = endpoint_with(1000, 2);
        let (other, other_connectors) = endpoint_with(2000, 1);
        let resolved = vec![
            (endpoint.clone(), connectors.clone()),
            (other, other_connectors),
            (endpoint.with_compress(true), connectors.clone()),
        ];
        let candidates = build_candidates(resolved, ConcurrencyMode::Pooled, EndpointSelection::Ordered);

        let ports: Vec<u16> = candidates.iter().map(|c| c.endpoint.port()).collect();
        assert_eq!(ports, vec![1000, 1000, 2000]);
        assert!(candidates.iter().all(|c| !c.endpoint.compress()));
    }
}
