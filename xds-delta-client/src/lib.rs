//! A delta xDS subscription multiplexer.
//!
//! This crate multiplexes delta xDS subscriptions for many resource types
//! over a single shared discovery stream. It handles:
//! - Subscription interest per type, merged across the watches of that type
//! - Version tracking and full resynchronization on a fresh stream
//! - ACK/NACK bookkeeping, with ACKs sent before any other request
//! - Pausing types so interest changes are batched into one request
//! - v2/v3 type URL aliasing and xdstp:// glob collections
//!
//! It does NOT own a transport, runtime or retry policy. The caller drives
//! a [`DiscoveryStream`] and feeds its events back through
//! [`StreamCallbacks`].
//!
//! # Example
//!
//! ```ignore
//! use std::rc::Rc;
//! use xds_delta_client::{DeltaGrpcMux, MuxConfig, Node, StreamCallbacks};
//!
//! let node = Node::new("envoy", "1.30").with_id("my-node");
//! let mux = DeltaGrpcMux::new(MuxConfig::new(node), stream);
//!
//! let clusters = mux.add_watch(
//!     "type.googleapis.com/envoy.config.cluster.v3.Cluster",
//!     ["cluster-a"],
//!     Rc::new(cluster_callbacks),
//!     Rc::new(ProstResourceDecoder::<Cluster>::new()),
//!     false,
//! )?;
//! mux.start();
//!
//! // Driven by the stream:
//! mux.on_stream_established();
//! mux.on_discovery_response(codec.decode_response(bytes)?);
//! ```
//!
//! # Feature Flags
//!
//! - `codegen-prost`: Enables the `prost` codec for envoy-types messages. Enabled by default.
//! - `test-util`: Exposes the [`testutil`] fakes.

pub mod client;
pub mod codec;
pub mod error;
pub mod message;
pub mod resource;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;

pub use client::ack_queue::PausableAckQueue;
pub use client::config::MuxConfig;
pub use client::mux::{DeltaGrpcMux, ScopedResume, WatchHandle};
pub use client::subscription_state::{
    ConfigUpdate, DeltaSubscriptionState, HandledResponse, PendingVersions,
};
pub use client::watch_map::{
    AddedRemoved, ConfigUpdateFailureReason, PlannedUpdate, SubscriptionCallbacks, WatchId,
    WatchMap,
};
pub use codec::DeltaXdsCodec;
pub use error::{Error, Result};
pub use message::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DeltaResource, ErrorDetail, Locality, Node,
    ResourceAny, UpdateAck,
};
pub use resource::{DecodedResource, OpaqueResourceDecoder};
pub use transport::{DiscoveryStream, StreamCallbacks};

// Prost codec
#[cfg(feature = "codegen-prost")]
pub use codec::prost::{ProstCodec, ProstResourceDecoder};
