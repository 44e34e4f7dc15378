//! Configuration for the delta xDS multiplexer.

use crate::message::Node;

/// Configuration for [`DeltaGrpcMux`](crate::DeltaGrpcMux).
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Node identification sent to the xDS server on the first request of
    /// each stream, and the source of xdstp:// context parameters.
    pub node: Node,

    /// Match responses whose type URL has no subscription against the
    /// counterpart type URL of the other API version (v2 vs v3).
    ///
    /// Default: false.
    pub enable_type_url_downgrade_and_upgrade: bool,
}

impl MuxConfig {
    /// Create a new configuration with the given node identification.
    ///
    /// # Example
    ///
    /// ```
    /// use xds_delta_client::{MuxConfig, Node};
    ///
    /// let node = Node::new("envoy", "1.30")
    ///     .with_id("my-node")
    ///     .with_cluster("my-cluster");
    ///
    /// let config = MuxConfig::new(node);
    /// assert!(!config.enable_type_url_downgrade_and_upgrade);
    /// ```
    pub fn new(node: Node) -> Self {
        Self {
            node,
            enable_type_url_downgrade_and_upgrade: false,
        }
    }

    /// Enable or disable v2/v3 type URL aliasing.
    ///
    /// # Example
    ///
    /// ```
    /// use xds_delta_client::{MuxConfig, Node};
    ///
    /// let config = MuxConfig::new(Node::new("envoy", "1.30"))
    ///     .with_type_url_downgrade_and_upgrade(true);
    /// assert!(config.enable_type_url_downgrade_and_upgrade);
    /// ```
    pub fn with_type_url_downgrade_and_upgrade(mut self, enabled: bool) -> Self {
        self.enable_type_url_downgrade_and_upgrade = enabled;
        self
    }
}
