//! Aliasing between the v2 and v3 type URLs of the same resource type.
//!
//! A server speaking the older API version answers a v3 subscription with v2
//! type URLs (and the other way around). The mux uses [`TypeUrlMap`] to find
//! the subscription such a response belongs to.

use std::collections::HashMap;

const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

/// Current message name paired with the name it had in the previous API
/// version.
const VERSIONED_MESSAGES: &[(&str, &str)] = &[
    ("envoy.config.listener.v3.Listener", "envoy.api.v2.Listener"),
    (
        "envoy.config.route.v3.RouteConfiguration",
        "envoy.api.v2.RouteConfiguration",
    ),
    (
        "envoy.config.route.v3.ScopedRouteConfiguration",
        "envoy.api.v2.ScopedRouteConfiguration",
    ),
    ("envoy.config.route.v3.VirtualHost", "envoy.api.v2.route.VirtualHost"),
    ("envoy.config.cluster.v3.Cluster", "envoy.api.v2.Cluster"),
    (
        "envoy.config.endpoint.v3.ClusterLoadAssignment",
        "envoy.api.v2.ClusterLoadAssignment",
    ),
    (
        "envoy.extensions.transport_sockets.tls.v3.Secret",
        "envoy.api.v2.auth.Secret",
    ),
    ("envoy.service.runtime.v3.Runtime", "envoy.service.discovery.v2.Runtime"),
];

/// The type URL `type_url` had in the previous API version, if any.
pub fn earlier_type_url(type_url: &str) -> Option<String> {
    let message = type_url.strip_prefix(TYPE_URL_PREFIX)?;
    VERSIONED_MESSAGES
        .iter()
        .find(|(current, _)| *current == message)
        .map(|(_, earlier)| format!("{TYPE_URL_PREFIX}{earlier}"))
}

/// The current type URL of a previous-version `type_url`, if any.
pub fn later_type_url(type_url: &str) -> Option<String> {
    let message = type_url.strip_prefix(TYPE_URL_PREFIX)?;
    VERSIONED_MESSAGES
        .iter()
        .find(|(_, earlier)| *earlier == message)
        .map(|(current, _)| format!("{TYPE_URL_PREFIX}{current}"))
}

/// Symmetric map between type URLs and their counterpart in the other API
/// version, filled in lazily.
#[derive(Debug, Default)]
pub(crate) struct TypeUrlMap {
    map: HashMap<String, String>,
}

impl TypeUrlMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Record `type_url` and its counterpart, in both directions. No-op if
    /// already known or if the type has no counterpart.
    pub(crate) fn register_alias(&mut self, type_url: &str) {
        if self.map.contains_key(type_url) {
            return;
        }
        let Some(counterpart) = earlier_type_url(type_url).or_else(|| later_type_url(type_url))
        else {
            return;
        };
        self.map.insert(counterpart.clone(), type_url.to_owned());
        self.map.insert(type_url.to_owned(), counterpart);
    }

    pub(crate) fn resolve(&self, type_url: &str) -> Option<&str> {
        self.map.get(type_url).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTER_V3: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
    const CLUSTER_V2: &str = "type.googleapis.com/envoy.api.v2.Cluster";

    #[test]
    fn counterparts() {
        assert_eq!(earlier_type_url(CLUSTER_V3).as_deref(), Some(CLUSTER_V2));
        assert_eq!(later_type_url(CLUSTER_V2).as_deref(), Some(CLUSTER_V3));
        assert_eq!(earlier_type_url(CLUSTER_V2), None);
        assert_eq!(earlier_type_url("envoy.config.cluster.v3.Cluster"), None);
        assert_eq!(earlier_type_url("type.googleapis.com/foo.Bar"), None);
    }

    #[test]
    fn registering_either_version_maps_both_ways() {
        let mut map = TypeUrlMap::new();
        map.register_alias(CLUSTER_V3);
        assert_eq!(map.resolve(CLUSTER_V3), Some(CLUSTER_V2));
        assert_eq!(map.resolve(CLUSTER_V2), Some(CLUSTER_V3));

        let mut map = TypeUrlMap::new();
        map.register_alias(CLUSTER_V2);
        assert_eq!(map.resolve(CLUSTER_V3), Some(CLUSTER_V2));
        assert_eq!(map.resolve(CLUSTER_V2), Some(CLUSTER_V3));
    }

    #[test]
    fn unknown_types_are_not_registered() {
        let mut map = TypeUrlMap::new();
        map.register_alias("type.googleapis.com/foo.Bar");
        assert_eq!(map.resolve("type.googleapis.com/foo.Bar"), None);
    }
}
