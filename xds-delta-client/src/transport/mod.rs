//! Provides abstraction for the discovery stream.
//!
//! The multiplexer does not own a transport. It drives a [`DiscoveryStream`]
//! that knows how to establish the shared bidirectional stream, rate limit
//! it and put requests on the wire. Whatever runs the stream reports back
//! through [`StreamCallbacks`], which the multiplexer implements.
//!
//! This abstraction allows for different transport implementations:
//! - gRPC transports (tonic, grpc-rust)
//! - Mock transports for testing
//! - Other custom transports

use crate::message::{DeltaDiscoveryRequest, DeltaDiscoveryResponse};

/// The shared delta discovery stream, as seen by the multiplexer.
///
/// Implementations must not call back into [`StreamCallbacks`] from inside
/// these methods; callbacks are delivered later, from the event loop.
pub trait DiscoveryStream {
    /// Start establishing a new stream. The outcome is reported through
    /// [`StreamCallbacks::on_stream_established`] or
    /// [`StreamCallbacks::on_establishment_failure`]. Retries and backoff are
    /// the stream's business.
    fn establish_new_stream(&mut self);

    /// Returns true if a stream is established and can take requests.
    fn stream_available(&self) -> bool;

    /// Returns true if the rate limiter allows sending one more request.
    fn check_rate_limit_allows_drain(&mut self) -> bool;

    /// Put `request` on the wire.
    fn send_message(&mut self, request: DeltaDiscoveryRequest);

    /// Report the number of ACKs waiting to be sent.
    fn maybe_update_queue_size_stat(&mut self, _size: usize) {}
}

/// Events delivered by the stream to the multiplexer.
pub trait StreamCallbacks {
    /// A new stream is up.
    fn on_stream_established(&self);

    /// A stream could not be established.
    fn on_establishment_failure(&self);

    /// The stream can take more requests.
    fn on_writeable(&self);

    /// A response arrived.
    fn on_discovery_response(&self, message: DeltaDiscoveryResponse);
}
