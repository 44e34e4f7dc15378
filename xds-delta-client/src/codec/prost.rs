//! Prost-based codec using envoy-types.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;

use bytes::Bytes;
use prost::Message;

use crate::codec::DeltaXdsCodec;
use crate::error::{Error, Result};
use crate::message::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DeltaResource, Node, ResourceAny,
};
use crate::resource::OpaqueResourceDecoder;

use envoy_types::pb::envoy::config::core::v3 as core;
use envoy_types::pb::envoy::service::discovery::v3 as discovery;

/// A codec that uses prost/envoy-types for serialization.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProstCodec;

fn encode_node(node: &Node) -> core::Node {
    core::Node {
        id: node.id.clone().unwrap_or_default(),
        cluster: node.cluster.clone().unwrap_or_default(),
        user_agent_name: node.user_agent_name.clone(),
        user_agent_version_type: Some(core::node::UserAgentVersionType::UserAgentVersion(
            node.user_agent_version.clone(),
        )),
        locality: node.locality.as_ref().map(|l| core::Locality {
            region: l.region.clone(),
            zone: l.zone.clone(),
            sub_zone: l.sub_zone.clone(),
        }),
        ..Default::default()
    }
}

impl DeltaXdsCodec for ProstCodec {
    fn encode_request(&self, request: &DeltaDiscoveryRequest) -> Result<Bytes> {
        use envoy_types::pb::google::rpc::Status;

        let proto_request = discovery::DeltaDiscoveryRequest {
            node: request.node.as_ref().map(encode_node),
            type_url: request.type_url.clone(),
            resource_names_subscribe: request.resource_names_subscribe.clone(),
            resource_names_unsubscribe: request.resource_names_unsubscribe.clone(),
            initial_resource_versions: request
                .initial_resource_versions
                .iter()
                .map(|(name, version)| (name.clone(), version.clone()))
                .collect(),
            response_nonce: request.response_nonce.clone(),
            error_detail: request.error_detail.as_ref().map(|e| Status {
                code: e.code,
                message: e.message.clone(),
                details: vec![],
            }),
            ..Default::default()
        };

        Ok(proto_request.encode_to_vec().into())
    }

    fn decode_response(&self, bytes: Bytes) -> Result<DeltaDiscoveryResponse> {
        let proto_response = discovery::DeltaDiscoveryResponse::decode(bytes)?;

        Ok(DeltaDiscoveryResponse {
            system_version_info: proto_response.system_version_info,
            resources: proto_response
                .resources
                .into_iter()
                .map(|resource| DeltaResource {
                    name: resource.name,
                    version: resource.version,
                    resource: resource.resource.map(|any| ResourceAny {
                        type_url: any.type_url,
                        value: any.value.into(),
                    }),
                })
                .collect(),
            type_url: proto_response.type_url,
            removed_resources: proto_response.removed_resources,
            nonce: proto_response.nonce,
        })
    }
}

/// An [`OpaqueResourceDecoder`] for resources that are prost messages.
///
/// The decoded value is an `M`; watches get it back with
/// [`DecodedResource::downcast_ref`](crate::DecodedResource::downcast_ref).
pub struct ProstResourceDecoder<M> {
    _message: PhantomData<fn() -> M>,
}

impl<M> ProstResourceDecoder<M> {
    /// Create a decoder for `M`.
    pub fn new() -> Self {
        Self {
            _message: PhantomData,
        }
    }
}

impl<M> Default for ProstResourceDecoder<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for ProstResourceDecoder<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProstResourceDecoder")
            .field("message", &std::any::type_name::<M>())
            .finish()
    }
}

impl<M> OpaqueResourceDecoder for ProstResourceDecoder<M>
where
    M: Message + Default + 'static,
{
    fn decode_resource(&self, bytes: Bytes) -> Result<Box<dyn Any>> {
        let message = M::decode(bytes).map_err(Error::Decode)?;
        Ok(Box::new(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ErrorDetail, Locality};
    use envoy_types::pb::envoy::config::cluster::v3::Cluster;
    use envoy_types::pb::google::protobuf::Any as ProtoAny;

    const CLUSTER: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";

    #[test]
    fn test_encode_request_minimal() {
        let codec = ProstCodec;
        let request = DeltaDiscoveryRequest {
            type_url: CLUSTER.to_string(),
            resource_names_subscribe: vec!["cluster-1".to_string()],
            resource_names_unsubscribe: vec!["cluster-0".to_string()],
            ..Default::default()
        };

        let bytes = codec.encode_request(&request).unwrap();
        assert!(!bytes.is_empty());

        let decoded = discovery::DeltaDiscoveryRequest::decode(bytes).unwrap();
        assert_eq!(decoded.type_url, CLUSTER);
        assert_eq!(decoded.resource_names_subscribe, vec!["cluster-1"]);
        assert_eq!(decoded.resource_names_unsubscribe, vec!["cluster-0"]);
        assert!(decoded.node.is_none());
        assert!(decoded.error_detail.is_none());
    }

    #[test]
    fn test_encode_first_request_of_stream() {
        let codec = ProstCodec;
        let node = Node::new("envoy", "1.30")
            .with_id("node-1")
            .with_cluster("cluster-1")
            .with_locality(Locality {
                region: "us-west".to_string(),
                zone: "us-west-1a".to_string(),
                sub_zone: "rack-1".to_string(),
            });
        let request = DeltaDiscoveryRequest {
            node: Some(node),
            type_url: CLUSTER.to_string(),
            resource_names_subscribe: vec!["a".to_string(), "b".to_string()],
            initial_resource_versions: [("a".to_string(), "v1".to_string())].into(),
            ..Default::default()
        };

        let bytes = codec.encode_request(&request).unwrap();
        let decoded = discovery::DeltaDiscoveryRequest::decode(bytes).unwrap();

        let node = decoded.node.unwrap();
        assert_eq!(node.id, "node-1");
        assert_eq!(node.cluster, "cluster-1");
        assert_eq!(node.user_agent_name, "envoy");
        match node.user_agent_version_type {
            Some(core::node::UserAgentVersionType::UserAgentVersion(version)) => {
                assert_eq!(version, "1.30");
            }
            _ => panic!("Expected UserAgentVersion to be set"),
        }
        assert_eq!(node.locality.unwrap().sub_zone, "rack-1");
        assert_eq!(decoded.initial_resource_versions.len(), 1);
        assert_eq!(
            decoded.initial_resource_versions.get("a").map(String::as_str),
            Some("v1")
        );
    }

    #[test]
    fn test_encode_nack() {
        let codec = ProstCodec;
        let request = DeltaDiscoveryRequest {
            type_url: CLUSTER.to_string(),
            response_nonce: "nonce-abc".to_string(),
            error_detail: Some(ErrorDetail::internal("bad cluster")),
            ..Default::default()
        };

        let bytes = codec.encode_request(&request).unwrap();
        let decoded = discovery::DeltaDiscoveryRequest::decode(bytes).unwrap();
        assert_eq!(decoded.response_nonce, "nonce-abc");
        let error = decoded.error_detail.unwrap();
        assert_eq!(error.code, 13);
        assert_eq!(error.message, "bad cluster");
    }

    #[test]
    fn test_decode_response() {
        let proto_response = discovery::DeltaDiscoveryResponse {
            system_version_info: "7".to_string(),
            type_url: CLUSTER.to_string(),
            nonce: "nonce-1".to_string(),
            resources: vec![
                discovery::Resource {
                    name: "cluster-1".to_string(),
                    version: "v1".to_string(),
                    resource: Some(ProtoAny {
                        type_url: CLUSTER.to_string(),
                        value: b"fake-cluster-bytes".to_vec(),
                    }),
                    ..Default::default()
                },
                discovery::Resource {
                    name: "cluster-2".to_string(),
                    version: "v2".to_string(),
                    ..Default::default()
                },
            ],
            removed_resources: vec!["cluster-0".to_string()],
            ..Default::default()
        };
        let bytes: Bytes = proto_response.encode_to_vec().into();

        let response = ProstCodec.decode_response(bytes).unwrap();

        assert_eq!(response.system_version_info, "7");
        assert_eq!(response.type_url, CLUSTER);
        assert_eq!(response.nonce, "nonce-1");
        assert_eq!(response.removed_resources, vec!["cluster-0"]);
        assert_eq!(response.resources.len(), 2);
        assert_eq!(response.resources[0].name, "cluster-1");
        assert_eq!(
            response.resources[0].resource.as_ref().unwrap().value.as_ref(),
            b"fake-cluster-bytes"
        );
        assert_eq!(response.resources[1].version, "v2");
        assert!(response.resources[1].resource.is_none());
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result = ProstCodec.decode_response(Bytes::from_static(&[0xff, 0xff, 0xff]));
        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[test]
    fn test_resource_decoder() {
        let cluster = Cluster {
            name: "cluster-1".to_string(),
            ..Default::default()
        };
        let decoder = ProstResourceDecoder::<Cluster>::new();
        let decoded = decoder
            .decode_resource(cluster.encode_to_vec().into())
            .unwrap();
        assert_eq!(decoded.downcast_ref::<Cluster>().unwrap().name, "cluster-1");

        assert!(decoder
            .decode_resource(Bytes::from_static(&[0xff, 0xff]))
            .is_err());
    }
}
