mod selection;

pub use selection::BestPathSelector;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hasher;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::PeerKey;
use crate::message::{AsPath, Origin, PathAttribute, Prefix};
use crate::utils::format_time_as_elapsed;

/// Decoded view over the path attributes of one route. The recognized
/// attributes are broken out; everything else rides along opaquely in
/// `others` and is re-emitted verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct PathAttributes {
    pub origin: Origin,
    pub as_path: AsPath,
    pub next_hop: Option<Ipv4Addr>,
    pub local_pref: Option<u32>,
    pub multi_exit_disc: Option<u32>,
    pub others: Vec<PathAttribute>,
}

impl Default for PathAttributes {
    fn default() -> Self {
        Self {
            origin: Origin::Incomplete,
            as_path: AsPath::default(),
            next_hop: None,
            local_pref: None,
            multi_exit_disc: None,
            others: vec![],
        }
    }
}

impl PathAttributes {
    pub fn from_attributes(attributes: Vec<PathAttribute>) -> Self {
        let mut decoded = Self::default();
        for attribute in attributes {
            match attribute {
                PathAttribute::Origin(origin) => decoded.origin = origin,
                PathAttribute::AsPath(as_path) => decoded.as_path = as_path,
                PathAttribute::NextHop(next_hop) => decoded.next_hop = Some(next_hop),
                PathAttribute::MultiExitDisc(med) => decoded.multi_exit_disc = Some(med),
                PathAttribute::LocalPref(pref) => decoded.local_pref = Some(pref),
                other => decoded.others.push(other),
            }
        }
        decoded
    }

    /// Attribute list for the wire, well-known mandatory ones first and
    /// in order: ORIGIN, AS_PATH, NEXT_HOP
    pub fn to_wire(&self) -> Vec<PathAttribute> {
        let mut attributes: Vec<PathAttribute> = Vec::with_capacity(5 + self.others.len());
        attributes.push(PathAttribute::Origin(self.origin));
        attributes.push(PathAttribute::AsPath(self.as_path.clone()));
        if let Some(next_hop) = self.next_hop {
            attributes.push(PathAttribute::NextHop(next_hop));
        }
        if let Some(med) = self.multi_exit_disc {
            attributes.push(PathAttribute::MultiExitDisc(med));
        }
        if let Some(pref) = self.local_pref {
            attributes.push(PathAttribute::LocalPref(pref));
        }
        attributes.extend(self.others.iter().cloned());
        attributes
    }

    /// Hash of the encoded attributes, used to batch NLRI sharing one
    /// attribute set into a single UPDATE
    pub fn cache_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        let mut bytes: Vec<u8> = Vec::with_capacity(32);
        for attribute in self.to_wire() {
            let _ = attribute.encode(&mut bytes, true);
        }
        hasher.write(&bytes);
        hasher.finish()
    }
}

/// Who advertised a route to us
#[derive(Debug, Clone, PartialEq)]
pub enum RouteSource {
    /// Originated by this speaker (exempt from split horizon)
    Local,
    Peer(PeerInfo),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub key: PeerKey,
    pub router_id: Ipv4Addr,
    pub address: IpAddr,
    pub remote_as: u32,
}

/// One learned or originated route. Immutable once inserted; the
/// export pipeline copies attributes instead of mutating them.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub prefix: Prefix,
    pub attributes: Arc<PathAttributes>,
    pub source: RouteSource,
    pub timestamp: DateTime<Utc>,
}

impl Route {
    pub fn is_local(&self) -> bool {
        matches!(self.source, RouteSource::Local)
    }

    pub fn local_pref(&self) -> u32 {
        self.attributes.local_pref.unwrap_or(100)
    }

    pub fn multi_exit_disc(&self) -> u32 {
        self.attributes.multi_exit_disc.unwrap_or(0)
    }

    /// First AS in the AS_PATH, i.e. the AS this route was learned from
    pub fn neighbor_as(&self) -> Option<u32> {
        self.attributes.as_path.first_asn()
    }

    pub fn learned_from(&self) -> Option<&PeerInfo> {
        match &self.source {
            RouteSource::Peer(info) => Some(info),
            RouteSource::Local => None,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let source = match &self.source {
            RouteSource::Local => "local".to_string(),
            RouteSource::Peer(info) => info.key.to_string(),
        };
        write!(
            f,
            "<Route {} from={} age={}>",
            self.prefix,
            source,
            format_time_as_elapsed(self.timestamp),
        )
    }
}

/// Routes currently advertised by one peer (not withdrawn)
#[derive(Debug, Default)]
pub struct AdjRibIn {
    routes: HashMap<Prefix, Arc<Route>>,
}

impl AdjRibIn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; an UPDATE for a known prefix is an implicit
    /// withdraw of the previous route
    pub fn insert(&mut self, route: Arc<Route>) {
        self.routes.insert(route.prefix, route);
    }

    pub fn withdraw(&mut self, prefix: Prefix) -> Option<Arc<Route>> {
        self.routes.remove(&prefix)
    }

    pub fn get(&self, prefix: Prefix) -> Option<&Arc<Route>> {
        self.routes.get(&prefix)
    }

    pub fn prefixes(&self) -> Vec<Prefix> {
        self.routes.keys().copied().collect()
    }

    pub fn routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.values()
    }

    /// Session reset: drop everything, returning the flushed prefixes
    /// so the decision process can re-examine them
    pub fn flush(&mut self) -> Vec<Prefix> {
        self.routes.drain().map(|(prefix, _)| prefix).collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Routes most recently advertised *to* one peer; every entry
/// corresponds to a successfully sent UPDATE
#[derive(Debug, Default)]
pub struct AdjRibOut {
    routes: HashMap<Prefix, Arc<Route>>,
}

impl AdjRibOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, route: Arc<Route>) {
        self.routes.insert(route.prefix, route);
    }

    pub fn withdraw(&mut self, prefix: Prefix) -> Option<Arc<Route>> {
        self.routes.remove(&prefix)
    }

    pub fn get(&self, prefix: Prefix) -> Option<&Arc<Route>> {
        self.routes.get(&prefix)
    }

    pub fn contains(&self, prefix: Prefix) -> bool {
        self.routes.contains_key(&prefix)
    }

    pub fn routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.values()
    }

    pub fn flush(&mut self) {
        self.routes.clear();
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}

/// The winning route per prefix, output of the decision process.
/// At most one entry per prefix.
#[derive(Debug, Default)]
pub struct LocRib {
    routes: HashMap<Prefix, Arc<Route>>,
}

impl LocRib {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&mut self, route: Arc<Route>) -> Option<Arc<Route>> {
        self.routes.insert(route.prefix, route)
    }

    pub fn remove(&mut self, prefix: Prefix) -> Option<Arc<Route>> {
        self.routes.remove(&prefix)
    }

    pub fn lookup(&self, prefix: Prefix) -> Option<&Arc<Route>> {
        self.routes.get(&prefix)
    }

    pub fn routes(&self) -> impl Iterator<Item = &Arc<Route>> {
        self.routes.values()
    }

    pub fn prefixes(&self) -> Vec<Prefix> {
        self.routes.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Segment;

    fn attrs(next_hop: &str, asns: Vec<u32>) -> PathAttributes {
        PathAttributes {
            origin: Origin::Igp,
            as_path: AsPath::from_sequence(asns),
            next_hop: Some(next_hop.parse().unwrap()),
            local_pref: None,
            multi_exit_disc: None,
            others: vec![],
        }
    }

    #[test]
    fn test_from_attributes_breaks_out_recognized() {
        let attributes = vec![
            PathAttribute::Origin(Origin::Egp),
            PathAttribute::AsPath(AsPath::from_sequence(vec![65000])),
            PathAttribute::NextHop("172.16.0.1".parse().unwrap()),
            PathAttribute::LocalPref(200),
            PathAttribute::Unknown {
                flags: 0xc0,
                code: 32,
                value: vec![1, 2, 3],
            },
        ];
        let decoded = PathAttributes::from_attributes(attributes);
        assert_eq!(decoded.origin, Origin::Egp);
        assert_eq!(decoded.local_pref, Some(200));
        assert_eq!(decoded.others.len(), 1);

        let wire = decoded.to_wire();
        assert_eq!(wire[0].type_code(), 1);
        assert_eq!(wire[1].type_code(), 2);
        assert_eq!(wire[2].type_code(), 3);
    }

    #[test]
    fn test_cache_key_distinguishes_attribute_sets() {
        let a = attrs("172.16.0.1", vec![65000]);
        let b = attrs("172.16.0.1", vec![65000, 65010]);
        let a2 = attrs("172.16.0.1", vec![65000]);
        assert_eq!(a.cache_key(), a2.cache_key());
        assert_ne!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn test_adj_rib_in_implicit_withdraw() {
        let mut rib = AdjRibIn::new();
        let prefix = Prefix::new("10.0.0.0".parse().unwrap(), 8);
        let older = Arc::new(Route {
            prefix,
            attributes: Arc::new(attrs("172.16.0.1", vec![65000])),
            source: RouteSource::Local,
            timestamp: Utc::now(),
        });
        let newer = Arc::new(Route {
            attributes: Arc::new(attrs("172.16.0.1", vec![65000, 65010])),
            ..(*older).clone()
        });
        rib.insert(older);
        rib.insert(newer.clone());
        assert_eq!(rib.len(), 1);
        assert_eq!(rib.get(prefix), Some(&newer));

        let flushed = rib.flush();
        assert_eq!(flushed, vec![prefix]);
    }

    #[test]
    fn test_as_set_counts_once_in_path_length() {
        let as_path = AsPath {
            segments: vec![
                Segment::AsSequence(vec![65000, 65001]),
                Segment::AsSet(vec![64900, 64901, 64902]),
            ],
        };
        assert_eq!(as_path.length(), 3);
    }
}
