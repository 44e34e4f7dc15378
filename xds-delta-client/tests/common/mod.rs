#![allow(dead_code)]

use std::collections::BTreeSet;
use std::rc::Rc;

use xds_delta_client::testutil::{FakeStream, RecordingCallbacks, StringDecoder};
use xds_delta_client::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DeltaGrpcMux, DeltaResource, MuxConfig, Node,
    StreamCallbacks, WatchHandle,
};

pub const CLUSTER: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const CLUSTER_V2: &str = "type.googleapis.com/envoy.api.v2.Cluster";
pub const LISTENER: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ROUTE: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const ENDPOINT: &str = "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";

pub fn node() -> Node {
    Node::new("envoy", "1.30").with_id("node-1")
}

pub fn mux() -> (DeltaGrpcMux, FakeStream) {
    mux_with_config(MuxConfig::new(node()))
}

pub fn mux_with_config(config: MuxConfig) -> (DeltaGrpcMux, FakeStream) {
    let stream = FakeStream::new();
    let mux = DeltaGrpcMux::new(config, stream.clone());
    (mux, stream)
}

/// Bring the stream up and tell the mux about it.
pub fn connect(mux: &DeltaGrpcMux, stream: &FakeStream) {
    stream.set_available(true);
    mux.on_stream_established();
}

pub fn watch(
    mux: &DeltaGrpcMux,
    type_url: &str,
    resources: &[&str],
) -> (WatchHandle, Rc<RecordingCallbacks>) {
    let callbacks = RecordingCallbacks::new();
    let handle = mux
        .add_watch(
            type_url,
            resources.iter().copied(),
            callbacks.clone(),
            Rc::new(StringDecoder),
            false,
        )
        .unwrap();
    (handle, callbacks)
}

pub fn response(
    type_url: &str,
    version: &str,
    nonce: &str,
    resources: Vec<DeltaResource>,
    removed: &[&str],
) -> DeltaDiscoveryResponse {
    DeltaDiscoveryResponse {
        system_version_info: version.to_string(),
        resources,
        type_url: type_url.to_string(),
        removed_resources: strings(removed),
        nonce: nonce.to_string(),
    }
}

pub fn strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

/// What the server believes the client is subscribed to, per the requests
/// it received.
pub fn server_view(requests: &[DeltaDiscoveryRequest], type_url: &str) -> BTreeSet<String> {
    let mut view = BTreeSet::new();
    for request in requests.iter().filter(|r| r.type_url == type_url) {
        if request.node.is_some() {
            view.clear();
        }
        view.extend(request.resource_names_subscribe.iter().cloned());
        for name in &request.resource_names_unsubscribe {
            view.remove(name);
        }
    }
    view
}
