//! Codec for encoding/decoding delta xDS messages.
//!
//! The codec layer converts between crate-owned message types
//! ([`DeltaDiscoveryRequest`], [`DeltaDiscoveryResponse`]) and serialized
//! bytes. The multiplexer itself never touches bytes; whatever owns the
//! stream uses a codec on the way in and out.

use crate::error::Result;
use crate::message::{DeltaDiscoveryRequest, DeltaDiscoveryResponse};
use bytes::Bytes;

#[cfg(feature = "codegen-prost")]
pub mod prost;

/// Trait for encoding/decoding delta xDS discovery messages.
pub trait DeltaXdsCodec {
    /// Encode a [`DeltaDiscoveryRequest`] to bytes.
    fn encode_request(&self, request: &DeltaDiscoveryRequest) -> Result<Bytes>;

    /// Decode bytes into a [`DeltaDiscoveryResponse`].
    fn decode_response(&self, bytes: Bytes) -> Result<DeltaDiscoveryResponse>;
}
