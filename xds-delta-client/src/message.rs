//! Crate-owned delta xDS message types.
//!
//! These types are codegen-agnostic and serve as the interface between
//! the multiplexer and the codec layer. The codec converts these
//! to/from the wire format (e.g., prost/envoy-types).

use std::collections::BTreeMap;

use bytes::Bytes;

/// gRPC status code attached to NACKs.
pub const INTERNAL: i32 = 13;

/// A delta discovery request to send to the xDS server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaDiscoveryRequest {
    /// The node making the request. Only set on the first request of a stream.
    pub node: Option<Node>,
    /// Type URL of the resources being requested.
    pub type_url: String,
    /// Resource names to add to the subscription.
    pub resource_names_subscribe: Vec<String>,
    /// Resource names to remove from the subscription.
    pub resource_names_unsubscribe: Vec<String>,
    /// Versions of resources the client already holds. Only set on the
    /// first request of a stream.
    pub initial_resource_versions: BTreeMap<String, String>,
    /// The nonce of the response being ACKed or NACKed, if any.
    pub response_nonce: String,
    /// Error details if this is a NACK (negative acknowledgment).
    pub error_detail: Option<ErrorDetail>,
}

/// A delta discovery response from the xDS server.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaDiscoveryResponse {
    /// The server's version of the whole response, used for debugging only.
    pub system_version_info: String,
    /// Added or updated resources.
    pub resources: Vec<DeltaResource>,
    /// Type URL of the resources.
    pub type_url: String,
    /// Names of resources the server removed.
    pub removed_resources: Vec<String>,
    /// Nonce for this response, to be echoed back in the ACK or NACK.
    pub nonce: String,
}

/// A single resource carried by a [`DeltaDiscoveryResponse`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaResource {
    /// The resource name.
    pub name: String,
    /// The resource version. Opaque, compared for equality only.
    pub version: String,
    /// The payload. `None` when the server only refreshes the version.
    pub resource: Option<ResourceAny>,
}

/// A resource wrapped as google.protobuf.Any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceAny {
    /// Type URL of the resource.
    pub type_url: String,
    /// Serialized resource bytes.
    pub value: Bytes,
}

/// Node identification for the client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    /// An opaque node identifier.
    pub id: Option<String>,
    /// The cluster the node belongs to.
    pub cluster: Option<String>,
    /// Locality specifying where the node is running.
    pub locality: Option<Locality>,
    /// Free-form string identifying the client type (e.g., "envoy", "grpc").
    pub user_agent_name: String,
    /// Version of the client.
    pub user_agent_version: String,
}

impl Node {
    /// Create a new Node with the required user agent fields.
    ///
    /// Other fields (id, cluster, locality) can be set using builder methods.
    pub fn new(user_agent_name: impl Into<String>, user_agent_version: impl Into<String>) -> Self {
        Self {
            id: None,
            cluster: None,
            locality: None,
            user_agent_name: user_agent_name.into(),
            user_agent_version: user_agent_version.into(),
        }
    }

    /// Set the node ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the cluster.
    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    /// Set the locality.
    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = Some(locality);
        self
    }

    /// Context parameters describing this node, as attached to xdstp://
    /// glob collection names.
    ///
    /// Keys are prefixed with `xds.node.`; fields that are unset or empty are
    /// left out.
    pub fn context_params(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        let mut insert = |key: &str, value: &str| {
            if !value.is_empty() {
                params.insert(format!("xds.node.{key}"), value.to_owned());
            }
        };

        insert("id", self.id.as_deref().unwrap_or_default());
        insert("cluster", self.cluster.as_deref().unwrap_or_default());
        insert("user_agent_name", &self.user_agent_name);
        insert("user_agent_version", &self.user_agent_version);
        if let Some(locality) = &self.locality {
            insert("locality.region", &locality.region);
            insert("locality.zone", &locality.zone);
            insert("locality.sub_zone", &locality.sub_zone);
        }
        params
    }
}

/// Locality information identifying where a node is running.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Locality {
    /// Region the node is in.
    pub region: String,
    /// Zone within the region.
    pub zone: String,
    /// Sub-zone within the zone.
    pub sub_zone: String,
}

/// Error details for NACK responses.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorDetail {
    /// gRPC status code.
    pub code: i32,
    /// Error message.
    pub message: String,
}

impl ErrorDetail {
    /// An `INTERNAL` error detail carrying `message`.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: INTERNAL,
            message: message.into(),
        }
    }
}

/// The acknowledgment owed to the server for one processed response.
///
/// Produced once per [`DeltaDiscoveryResponse`] and consumed once when the
/// next request for its type is sent.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateAck {
    /// Type URL of the subscription that processed the response.
    pub type_url: String,
    /// Nonce of the response being acknowledged.
    pub nonce: String,
    /// System version of the response being acknowledged.
    pub system_version_info: String,
    /// Set when the response (or part of it) was rejected.
    pub error_detail: Option<ErrorDetail>,
}

impl UpdateAck {
    /// An ACK for the response with the given nonce.
    pub fn new(
        type_url: impl Into<String>,
        nonce: impl Into<String>,
        system_version_info: impl Into<String>,
    ) -> Self {
        Self {
            type_url: type_url.into(),
            nonce: nonce.into(),
            system_version_info: system_version_info.into(),
            error_detail: None,
        }
    }

    /// Returns true if this acknowledgment rejects the response.
    pub fn is_nack(&self) -> bool {
        self.error_detail.is_some()
    }

    /// Turn this acknowledgment into a NACK, appending `message` to any
    /// error already recorded.
    pub fn reject(&mut self, message: impl AsRef<str>) {
        match &mut self.error_detail {
            Some(detail) => {
                detail.message.push_str("; ");
                detail.message.push_str(message.as_ref());
            }
            None => self.error_detail = Some(ErrorDetail::internal(message.as_ref())),
        }
    }
}
