//! Best-path selection (RFC 4271 section 9.1.2).
//!
//! Candidates are compared by a strict ordering; a later rule applies
//! only when every earlier rule ties:
//!
//! 1. Highest LOCAL_PREF
//! 2. Shortest AS_PATH (an AS_SET counts as one hop)
//! 3. Lowest ORIGIN (IGP < EGP < Incomplete)
//! 4. Lowest MED, only between routes from the same neighbor AS
//! 5. eBGP-learned over iBGP-learned
//! 6. Lowest IGP cost to NEXT_HOP (via the pluggable lookup)
//! 7. Oldest route
//! 8. Lowest BGP Identifier of the advertising peer
//! 9. Lowest peer address

use std::cmp::Ordering;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use crate::hooks::IgpCostLookup;
use crate::rib::Route;

pub struct BestPathSelector {
    local_as: u32,
    router_id: Ipv4Addr,
    igp_cost: Option<Arc<dyn IgpCostLookup>>,
}

impl BestPathSelector {
    pub fn new(local_as: u32, router_id: Ipv4Addr) -> Self {
        Self {
            local_as,
            router_id,
            igp_cost: None,
        }
    }

    pub fn set_igp_cost_lookup(&mut self, lookup: Arc<dyn IgpCostLookup>) {
        self.igp_cost = Some(lookup);
    }

    pub fn select_best<'a>(&self, candidates: &'a [Arc<Route>]) -> Option<&'a Arc<Route>> {
        candidates.iter().min_by(|a, b| self.compare(a, b))
    }

    /// `Less` means `a` is the better route
    pub fn compare(&self, a: &Route, b: &Route) -> Ordering {
        b.local_pref()
            .cmp(&a.local_pref())
            .then_with(|| {
                a.attributes
                    .as_path
                    .length()
                    .cmp(&b.attributes.as_path.length())
            })
            .then_with(|| a.attributes.origin.cmp(&b.attributes.origin))
            .then_with(|| self.compare_med(a, b))
            .then_with(|| self.compare_ebgp(a, b))
            .then_with(|| self.compare_igp_cost(a, b))
            .then_with(|| a.timestamp.cmp(&b.timestamp))
            .then_with(|| u32::from(self.peer_router_id(a)).cmp(&u32::from(self.peer_router_id(b))))
            .then_with(|| self.peer_address(a).cmp(&self.peer_address(b)))
    }

    /// MED comparison only applies between routes from the same
    /// neighbor AS
    fn compare_med(&self, a: &Route, b: &Route) -> Ordering {
        if a.neighbor_as() != b.neighbor_as() {
            return Ordering::Equal;
        }
        a.multi_exit_disc().cmp(&b.multi_exit_disc())
    }

    fn is_ebgp(&self, route: &Route) -> bool {
        route
            .neighbor_as()
            .map(|asn| asn != self.local_as)
            .unwrap_or(false)
    }

    fn compare_ebgp(&self, a: &Route, b: &Route) -> Ordering {
        // eBGP (true) wins, so compare inverted
        self.is_ebgp(b).cmp(&self.is_ebgp(a))
    }

    fn compare_igp_cost(&self, a: &Route, b: &Route) -> Ordering {
        let lookup = match &self.igp_cost {
            Some(lookup) => lookup,
            None => return Ordering::Equal,
        };
        let (next_hop_a, next_hop_b) = match (a.attributes.next_hop, b.attributes.next_hop) {
            (Some(a), Some(b)) => (a, b),
            _ => return Ordering::Equal,
        };
        match (lookup.cost_to(next_hop_a), lookup.cost_to(next_hop_b)) {
            (Some(cost_a), Some(cost_b)) => cost_a.cmp(&cost_b),
            // Prefer the reachable next-hop
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }

    fn peer_router_id(&self, route: &Route) -> Ipv4Addr {
        route
            .learned_from()
            .map(|info| info.router_id)
            .unwrap_or(self.router_id)
    }

    fn peer_address(&self, route: &Route) -> IpAddr {
        route
            .learned_from()
            .map(|info| info.address)
            .unwrap_or_else(|| IpAddr::from([0, 0, 0, 0]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerKey;
    use crate::message::{AsPath, Origin, Prefix};
    use crate::rib::{PathAttributes, PeerInfo, RouteSource};
    use chrono::{Duration, Utc};

    struct RouteBuilder {
        route: Route,
    }

    impl RouteBuilder {
        fn from_peer(address: &str, router_id: &str, remote_as: u32) -> Self {
            let address: IpAddr = address.parse().unwrap();
            Self {
                route: Route {
                    prefix: Prefix::new("10.0.0.0".parse().unwrap(), 8),
                    attributes: Arc::new(PathAttributes {
                        origin: Origin::Igp,
                        as_path: AsPath::from_sequence(vec![remote_as]),
                        next_hop: Some("172.16.0.1".parse().unwrap()),
                        local_pref: None,
                        multi_exit_disc: None,
                        others: vec![],
                    }),
                    source: RouteSource::Peer(PeerInfo {
                        key: PeerKey::Address(address),
                        router_id: router_id.parse().unwrap(),
                        address,
                        remote_as,
                    }),
                    timestamp: Utc::now(),
                },
            }
        }

        fn attrs(mut self, f: impl FnOnce(&mut PathAttributes)) -> Self {
            let mut attributes = (*self.route.attributes).clone();
            f(&mut attributes);
            self.route.attributes = Arc::new(attributes);
            self
        }

        fn age(mut self, seconds: i64) -> Self {
            self.route.timestamp = self.route.timestamp - Duration::seconds(seconds);
            self
        }

        fn build(self) -> Arc<Route> {
            Arc::new(self.route)
        }
    }

    fn selector() -> BestPathSelector {
        BestPathSelector::new(65001, "4.4.4.4".parse().unwrap())
    }

    #[test]
    fn test_highest_local_pref_wins() {
        let preferred = RouteBuilder::from_peer("172.16.0.1", "1.1.1.1", 65001)
            .attrs(|a| a.local_pref = Some(200))
            .build();
        let other = RouteBuilder::from_peer("172.16.0.2", "2.2.2.2", 65001)
            .attrs(|a| {
                a.local_pref = Some(100);
                // Even with a shorter path
                a.as_path = AsPath::default();
            })
            .build();
        let candidates = vec![other, preferred.clone()];
        assert_eq!(selector().select_best(&candidates), Some(&preferred));
    }

    #[test]
    fn test_shortest_as_path_wins() {
        let short = RouteBuilder::from_peer("172.16.0.1", "1.1.1.1", 65000)
            .attrs(|a| a.as_path = AsPath::from_sequence(vec![65000]))
            .build();
        let long = RouteBuilder::from_peer("172.16.0.2", "2.2.2.2", 65010)
            .attrs(|a| a.as_path = AsPath::from_sequence(vec![65010, 65020]))
            .build();
        let candidates = vec![long, short.clone()];
        assert_eq!(selector().select_best(&candidates), Some(&short));
    }

    #[test]
    fn test_lowest_origin_wins() {
        let igp = RouteBuilder::from_peer("172.16.0.1", "1.1.1.1", 65000)
            .attrs(|a| a.origin = Origin::Igp)
            .build();
        let incomplete = RouteBuilder::from_peer("172.16.0.2", "2.2.2.2", 65010)
            .attrs(|a| a.origin = Origin::Incomplete)
            .build();
        let candidates = vec![incomplete, igp.clone()];
        assert_eq!(selector().select_best(&candidates), Some(&igp));
    }

    #[test]
    fn test_med_only_compared_within_same_neighbor_as() {
        // Same neighbor AS: lower MED wins
        let low = RouteBuilder::from_peer("172.16.0.1", "1.1.1.1", 65000)
            .attrs(|a| a.multi_exit_disc = Some(10))
            .build();
        let high = RouteBuilder::from_peer("172.16.0.2", "2.2.2.2", 65000)
            .attrs(|a| a.multi_exit_disc = Some(50))
            .build();
        let candidates = vec![high.clone(), low.clone()];
        assert_eq!(selector().select_best(&candidates), Some(&low));

        // Different neighbor AS: MED skipped, falls through to age
        let older_high_med = RouteBuilder::from_peer("172.16.0.2", "2.2.2.2", 65010)
            .attrs(|a| {
                a.as_path = AsPath::from_sequence(vec![65010]);
                a.multi_exit_disc = Some(50);
            })
            .age(60)
            .build();
        let candidates = vec![low.clone(), older_high_med.clone()];
        assert_eq!(selector().select_best(&candidates), Some(&older_high_med));
    }

    #[test]
    fn test_ebgp_preferred_over_ibgp() {
        let ebgp = RouteBuilder::from_peer("172.16.0.1", "1.1.1.1", 65000).build();
        let ibgp = RouteBuilder::from_peer("172.16.0.2", "2.2.2.2", 65001).build();
        let candidates = vec![ibgp, ebgp.clone()];
        assert_eq!(selector().select_best(&candidates), Some(&ebgp));
    }

    struct StaticCosts;

    impl IgpCostLookup for StaticCosts {
        fn cost_to(&self, next_hop: Ipv4Addr) -> Option<u32> {
            match next_hop.octets()[3] {
                1 => Some(10),
                2 => Some(20),
                _ => None,
            }
        }
    }

    #[test]
    fn test_igp_cost_breaks_ties() {
        let mut selector = selector();
        selector.set_igp_cost_lookup(Arc::new(StaticCosts));

        let near = RouteBuilder::from_peer("172.16.0.1", "1.1.1.1", 65000)
            .attrs(|a| a.next_hop = Some("192.0.2.1".parse().unwrap()))
            .build();
        let far = RouteBuilder::from_peer("172.16.0.2", "2.2.2.2", 65010)
            .attrs(|a| {
                a.as_path = AsPath::from_sequence(vec![65010]);
                a.next_hop = Some("192.0.2.2".parse().unwrap());
            })
            .build();
        let candidates = vec![far, near.clone()];
        assert_eq!(selector.select_best(&candidates), Some(&near));

        // Unreachable next-hop loses to a reachable one
        let unreachable = RouteBuilder::from_peer("172.16.0.3", "3.3.3.3", 65020)
            .attrs(|a| {
                a.as_path = AsPath::from_sequence(vec![65020]);
                a.next_hop = Some("192.0.2.99".parse().unwrap());
            })
            .build();
        let candidates = vec![unreachable, near.clone()];
        assert_eq!(selector.select_best(&candidates), Some(&near));
    }

    #[test]
    fn test_oldest_route_wins() {
        let old = RouteBuilder::from_peer("172.16.0.1", "1.1.1.1", 65000)
            .age(300)
            .build();
        let new = RouteBuilder::from_peer("172.16.0.2", "2.2.2.2", 65010)
            .attrs(|a| a.as_path = AsPath::from_sequence(vec![65010]))
            .build();
        let candidates = vec![new, old.clone()];
        assert_eq!(selector().select_best(&candidates), Some(&old));
    }

    #[test]
    fn test_router_id_then_peer_ip_tiebreak() {
        let now = Utc::now();
        let mut low_id = RouteBuilder::from_peer("172.16.0.2", "1.1.1.1", 65000).build();
        let mut high_id = RouteBuilder::from_peer("172.16.0.1", "9.9.9.9", 65000).build();
        // Pin identical timestamps so only the identifier differs
        Arc::get_mut(&mut low_id).unwrap().timestamp = now;
        Arc::get_mut(&mut high_id).unwrap().timestamp = now;

        let candidates = vec![high_id, low_id.clone()];
        assert_eq!(selector().select_best(&candidates), Some(&low_id));

        // Same router-id: lowest peer address
        let mut a = RouteBuilder::from_peer("172.16.0.1", "1.1.1.1", 65000).build();
        let mut b = RouteBuilder::from_peer("172.16.0.9", "1.1.1.1", 65000).build();
        Arc::get_mut(&mut a).unwrap().timestamp = now;
        Arc::get_mut(&mut b).unwrap().timestamp = now;
        let candidates = vec![b, a.clone()];
        assert_eq!(selector().select_best(&candidates), Some(&a));
    }

    #[test]
    fn test_local_route_beats_peer_route_on_as_path() {
        let local = Arc::new(Route {
            prefix: Prefix::new("10.99.99.0".parse().unwrap(), 24),
            attributes: Arc::new(PathAttributes {
                origin: Origin::Igp,
                as_path: AsPath::default(),
                next_hop: Some("4.4.4.4".parse().unwrap()),
                local_pref: Some(100),
                multi_exit_disc: None,
                others: vec![],
            }),
            source: RouteSource::Local,
            timestamp: Utc::now(),
        });
        let learned = RouteBuilder::from_peer("172.16.0.1", "1.1.1.1", 65000).build();
        let candidates = vec![learned, local.clone()];
        assert_eq!(selector().select_best(&candidates), Some(&local));
    }
}
