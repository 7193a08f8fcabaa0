use crate::{CcpRoutingAccount, Route};
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::HashMap;
use uuid::Uuid;

/// A prefix-keyed map with longest-prefix resolution.
///
/// Keys are address prefixes without a trailing separator; the empty string
/// is the catch-all. Resolution walks the destination's segment chains from
/// most to least specific, so `g.bar` matches `g.bar.alice` but never
/// `g.bart`, and the catch-all is only consulted when nothing else matches.
#[derive(Clone)]
pub(crate) struct PrefixMap<T> {
    map: HashMap<String, T>,
}

impl<T> PrefixMap<T> {
    pub fn new() -> Self {
        PrefixMap {
            map: HashMap::new(),
        }
    }

    pub fn insert(&mut self, prefix: String, item: T) -> Option<T> {
        self.map.insert(prefix, item)
    }

    pub fn remove(&mut self, prefix: &str) -> Option<T> {
        self.map.remove(prefix)
    }

    pub fn get(&self, prefix: &str) -> Option<&T> {
        self.map.get(prefix)
    }

    pub fn get_mut(&mut self, prefix: &str) -> Option<&mut T> {
        self.map.get_mut(prefix)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &T)> {
        self.map.iter()
    }

    pub fn retain(&mut self, f: impl FnMut(&String, &mut T) -> bool) {
        self.map.retain(f)
    }

    /// The longest stored prefix that covers the address on whole-segment
    /// boundaries, if any.
    pub fn longest_prefix(&self, address: &str) -> Option<&str> {
        let mut end = address.len();
        loop {
            if let Some((key, _)) = self.map.get_key_value(&address[..end]) {
                return Some(key);
            }
            match address[..end].rfind('.') {
                Some(separator) => end = separator,
                None => break,
            }
        }
        self.map.get_key_value("").map(|(key, _)| key.as_str())
    }

    /// Resolves the address to the entry stored under its longest matching
    /// prefix.
    pub fn resolve(&self, address: &str) -> Option<&T> {
        self.longest_prefix(address).and_then(|key| self.map.get(key))
    }
}

/// One peer's view of reachability, or our own.
///
/// The table maps each address prefix to the set of routes registered for
/// it, keyed by next-hop account: multiple peers can advertise the same
/// prefix, but one peer holds at most one route per prefix.
///
/// The table is identified by an id (a UUID in array form) that is
/// regenerated whenever the table is rebuilt from scratch (e.g. when the
/// node restarts), and versioned by a monotonically increasing epoch.
/// Together these let peers detect whether an incremental update can be
/// applied or a full resync is needed.
#[derive(Clone)]
pub struct RoutingTable<A> {
    id: [u8; 16],
    epoch: u32,
    prefix_map: PrefixMap<Vec<(A, Route)>>,
}

impl<A> RoutingTable<A>
where
    A: CcpRoutingAccount,
{
    pub fn new(id: [u8; 16]) -> Self {
        RoutingTable {
            id,
            epoch: 0,
            prefix_map: PrefixMap::new(),
        }
    }

    pub fn id(&self) -> [u8; 16] {
        self.id
    }

    #[cfg(test)]
    pub fn set_id(&mut self, id: [u8; 16]) {
        self.id = id;
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn increment_epoch(&mut self) -> u32 {
        let epoch = self.epoch;
        self.epoch += 1;
        epoch
    }

    /// Adds the route under (prefix, account). Returns true unless an
    /// identical route from the same account was already stored.
    pub fn add_route(&mut self, account: A, route: Route) -> bool {
        let routes = match self.prefix_map.get_mut(&route.prefix) {
            Some(routes) => routes,
            None => {
                self.prefix_map.insert(route.prefix.clone(), Vec::new());
                self.prefix_map
                    .get_mut(&route.prefix)
                    .expect("prefix was just inserted")
            }
        };
        match routes.iter_mut().find(|(a, _)| a.id() == account.id()) {
            Some(entry) if entry.1 == route => false,
            Some(entry) => {
                *entry = (account, route);
                true
            }
            None => {
                routes.push((account, route));
                true
            }
        }
    }

    /// Removes the route registered under (prefix, next hop). The prefix key
    /// disappears with its last route.
    pub fn remove_route(&mut self, prefix: &str, next_hop: Uuid) -> bool {
        if let Some(routes) = self.prefix_map.get_mut(prefix) {
            let before = routes.len();
            routes.retain(|(account, _)| account.id() != next_hop);
            let removed = routes.len() < before;
            if routes.is_empty() {
                self.prefix_map.remove(prefix);
            }
            removed
        } else {
            false
        }
    }

    /// Replaces all routes for the prefix with the single given one.
    pub fn set_route(&mut self, prefix: String, account: A, route: Route) {
        self.prefix_map.insert(prefix, vec![(account, route)]);
    }

    /// Removes every route for the prefix. Returns true if any existed.
    pub fn delete_route(&mut self, prefix: &str) -> bool {
        self.prefix_map.remove(prefix).is_some()
    }

    /// Drops every route learned from the given account, returning the
    /// affected prefixes. Used when a peer resets its routing table.
    pub fn remove_all_routes_from(&mut self, next_hop: Uuid) -> Vec<String> {
        let mut affected = Vec::new();
        self.prefix_map.retain(|prefix, routes| {
            let before = routes.len();
            routes.retain(|(account, _)| account.id() != next_hop);
            if routes.len() < before {
                affected.push(prefix.clone());
            }
            !routes.is_empty()
        });
        affected
    }

    /// All routes registered under exactly this prefix.
    pub fn get_routes_for(&self, prefix: &str) -> &[(A, Route)] {
        self.prefix_map
            .get(prefix)
            .map(|routes| routes.as_slice())
            .unwrap_or(&[])
    }

    /// Every route under the single longest prefix matching the destination
    /// (not a union across shorter prefixes). Empty when nothing matches.
    pub fn find_next_hops(&self, destination: &str) -> &[(A, Route)] {
        self.prefix_map
            .resolve(destination)
            .map(|routes| routes.as_slice())
            .unwrap_or(&[])
    }

    /// Read-only longest-match lookup, mostly for diagnostics.
    pub fn find_longest_prefix(&self, address: &str) -> Option<&str> {
        self.prefix_map.longest_prefix(address)
    }

    /// The best route for the destination: longest prefix first, then
    /// child > peer > parent, then shortest path, with the account id as a
    /// stable tiebreak.
    pub fn best_route(&self, destination: &str) -> Option<&(A, Route)> {
        best_of(self.find_next_hops(destination))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<(A, Route)>)> {
        self.prefix_map.iter()
    }
}

/// Ranks a route set: child > peer > parent, then shortest path, then
/// smallest account id so the result is deterministic.
pub(crate) fn best_of<A: CcpRoutingAccount>(routes: &[(A, Route)]) -> Option<&(A, Route)> {
    routes.iter().min_by(|(a, route_a), (b, route_b)| {
        b.routing_relation()
            .cmp(&a.routing_relation())
            .then_with(|| route_a.path.len().cmp(&route_b.path.len()))
            .then_with(|| a.id().cmp(&b.id()))
    })
}

impl<A> Default for RoutingTable<A>
where
    A: CcpRoutingAccount,
{
    fn default() -> RoutingTable<A> {
        let mut id = [0; 16];
        SystemRandom::new()
            .fill(&mut id)
            .expect("Unable to get randomness");
        RoutingTable::new(id)
    }
}
