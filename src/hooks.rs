//! Seams for the external collaborators this speaker integrates with.
//! Every hook is optional; an absent hook is a no-op (routes pass
//! policy unchanged, nothing reaches the kernel, iBGP routes are not
//! reflected).

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::config::PeerKey;
use crate::message::Prefix;
use crate::rib::Route;

/// Pushes winning routes into the kernel FIB
pub trait KernelRouteInstaller: Send + Sync {
    fn install(&self, prefix: Prefix, next_hop: Ipv4Addr, protocol: &str);
    fn remove(&self, prefix: Prefix);
}

/// IGP cost to a NEXT_HOP, for decision-process step 6.
/// `None` means the next-hop is not reachable via the IGP.
pub trait IgpCostLookup: Send + Sync {
    fn cost_to(&self, next_hop: Ipv4Addr) -> Option<u32>;
}

/// Per-peer import filter; `None` rejects the route silently
pub trait ImportPolicy: Send + Sync {
    fn apply(&self, peer: &PeerKey, route: Arc<Route>) -> Option<Arc<Route>>;
}

/// Per-peer export filter; `None` suppresses the advertisement
pub trait ExportPolicy: Send + Sync {
    fn apply(&self, peer: &PeerKey, route: Arc<Route>) -> Option<Arc<Route>>;
}

/// Authorizes iBGP-to-iBGP re-advertisement
pub trait RouteReflector: Send + Sync {
    fn should_reflect(
        &self,
        route: &Route,
        from_peer: &PeerKey,
        to_peer: &PeerKey,
        is_ebgp_source: bool,
    ) -> bool;
}

#[derive(Clone, Default)]
pub struct Hooks {
    pub kernel_routes: Option<Arc<dyn KernelRouteInstaller>>,
    pub igp_cost: Option<Arc<dyn IgpCostLookup>>,
    pub import_policy: Option<Arc<dyn ImportPolicy>>,
    pub export_policy: Option<Arc<dyn ExportPolicy>>,
    pub route_reflector: Option<Arc<dyn RouteReflector>>,
}

impl Hooks {
    pub fn import(&self, peer: &PeerKey, route: Arc<Route>) -> Option<Arc<Route>> {
        match &self.import_policy {
            Some(policy) => policy.apply(peer, route),
            None => Some(route),
        }
    }

    pub fn export(&self, peer: &PeerKey, route: Arc<Route>) -> Option<Arc<Route>> {
        match &self.export_policy {
            Some(policy) => policy.apply(peer, route),
            None => Some(route),
        }
    }

    pub fn install_route(&self, prefix: Prefix, next_hop: Option<Ipv4Addr>) {
        if let (Some(installer), Some(next_hop)) = (&self.kernel_routes, next_hop) {
            installer.install(prefix, next_hop, "bgp");
        }
    }

    pub fn remove_route(&self, prefix: Prefix) {
        if let Some(installer) = &self.kernel_routes {
            installer.remove(prefix);
        }
    }

    pub fn should_reflect(
        &self,
        route: &Route,
        from_peer: &PeerKey,
        to_peer: &PeerKey,
        is_ebgp_source: bool,
    ) -> bool {
        match &self.route_reflector {
            Some(reflector) => reflector.should_reflect(route, from_peer, to_peer, is_ebgp_source),
            None => false,
        }
    }
}
