//! Route identity and the in-flight attempt registry.

use crate::endpoint::{ConcurrencyMode, Connector, Endpoint};
use std::collections::HashMap;

/// Cache and pending-set identity of a route.
///
/// A thread-per-connection session and a pooled session to the same
/// connector are not interchangeable, so the mode is part of the key.
/// The endpoint is the connection endpoint, stored with compression
/// cleared; see [`RouteKey::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    connector: Connector,
    endpoint: Endpoint,
    mode: ConcurrencyMode,
}

impl RouteKey {
    /// Builds the key for a connection to `connector` made on behalf of
    /// `endpoint`.
    ///
    /// Connections never take the compression flag from their endpoint, so
    /// endpoints that differ only by that flag map to the same route.
    pub fn new(connector: Connector, endpoint: &Endpoint, mode: ConcurrencyMode) -> Self {
        Self {
            connector,
            endpoint: endpoint.with_compress(false),
            mode,
        }
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn mode(&self) -> ConcurrencyMode {
        self.mode
    }
}

/// Registry of in-flight attempts and the waiters registered on them.
///
/// Presence of a key means an attempt to that route is in progress; the
/// attempt's owner is the only party allowed to remove it.
#[derive(Debug)]
pub(crate) struct PendingSet<W> {
    routes: HashMap<RouteKey, Vec<(u64, W)>>,
}

impl<W: Clone> PendingSet<W> {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn contains(&self, key: &RouteKey) -> bool {
        self.routes.contains_key(key)
    }

    /// Marks every key as in progress. A key that already is keeps its
    /// waiters.
    pub fn claim<'a>(&mut self, keys: impl IntoIterator<Item = &'a RouteKey>) {
        for key in keys {
            self.routes.entry(key.clone()).or_default();
        }
    }

    /// Registers `waiter` on `key` if an attempt is in progress. Returns
    /// whether the key was pending.
    pub fn join(&mut self, key: &RouteKey, id: u64, waiter: &W) -> bool {
        match self.routes.get_mut(key) {
            Some(waiters) => {
                if !waiters.iter().any(|(waiter_id, _)| *waiter_id == id) {
                    waiters.push((id, waiter.clone()));
                }
                true
            }
            None => false,
        }
    }

    /// Removes `id` from the waiters of `key`, if registered.
    pub fn leave(&mut self, key: &RouteKey, id: u64) {
        if let Some(waiters) = self.routes.get_mut(key) {
            waiters.retain(|(waiter_id, _)| *waiter_id != id);
        }
    }

    /// Ends the attempt on every key and returns the waiters to notify,
    /// each one once even if it joined several keys.
    pub fn release<'a>(&mut self, keys: impl IntoIterator<Item = &'a RouteKey>) -> Vec<W> {
        let mut notify: Vec<(u64, W)> = Vec::new();
        for key in keys {
            if let Some(waiters) = self.routes.remove(key) {
                for (id, waiter) in waiters {
                    if !notify.iter().any(|(seen, _)| *seen == id) {
                        notify.push((id, waiter));
                    }
                }
            }
        }
        notify.into_iter().map(|(_, waiter)| waiter).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::SocketAddr;

    fn key(port: u16, mode: ConcurrencyMode) -> RouteKey {
        let endpoint = Endpoint::tcp("127.0.0.1", port);
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        RouteKey::new(Connector::new(addr, &endpoint), &endpoint, mode)
    }

    #[test]
    fn mode_is_part_of_identity() {
        let pooled = key(4061, ConcurrencyMode::Pooled);
        let tpc = key(4061, ConcurrencyMode::ThreadPerConnection);
        assert_ne!(pooled, tpc);

        let set: HashSet<_> = [pooled.clone(), tpc, pooled].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn endpoint_is_part_of_identity_except_compression() {
        let endpoint = Endpoint::tcp("127.0.0.1", 4061);
        let addr: SocketAddr = "127.0.0.1:4061".parse().unwrap();
        let connector = Connector::new(addr, &endpoint);
        let mode = ConcurrencyMode::Pooled;

        let plain = RouteKey::new(connector.clone(), &endpoint, mode);
        let compressed = RouteKey::new(connector.clone(), &endpoint.with_compress(true), mode);
        assert_eq!(plain, compressed);

        let timed = endpoint.with_timeout(Some(std::time::Duration::from_secs(1)));
        assert_ne!(plain, RouteKey::new(connector, &timed, mode));
    }

    #[test]
    fn claim_join_release() {
        let mut pending: PendingSet<&'static str> = PendingSet::new();
        let a = key(1, ConcurrencyMode::Pooled);
        let b = key(2, ConcurrencyMode::Pooled);

        assert!(!pending.join(&a, 1, &"first"));
        pending.claim([&a, &b]);
        assert!(pending.contains(&a) && pending.contains(&b));

        assert!(pending.join(&a, 1, &"first"));
        assert!(pending.join(&b, 1, &"first"));
        assert!(pending.join(&b, 2, &"second"));
        assert!(pending.join(&b, 3, &"third"));
        pending.leave(&b, 3);

        let mut notified = pending.release([&a, &b]);
        notified.sort();
        assert_eq!(notified, vec!["first", "second"]);
        assert!(pending.is_empty());
    }

    #[test]
    fn claiming_a_pending_key_keeps_its_waiters() {
        let mut pending: PendingSet<&'static str> = PendingSet::new();
        let a = key(1, ConcurrencyMode::Pooled);

        pending.claim([&a]);
        assert!(pending.join(&a, 1, &"first"));
        pending.claim([&a, &a]);
        assert_eq!(pending.release([&a]), vec!["first"]);
        assert!(pending.is_empty());
    }
}
