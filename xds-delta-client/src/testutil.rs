//! Test doubles for driving a [`DeltaGrpcMux`](crate::DeltaGrpcMux)
//! without a server.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;

use crate::client::watch_map::{ConfigUpdateFailureReason, SubscriptionCallbacks};
use crate::error::{Error, Result};
use crate::message::{DeltaDiscoveryRequest, DeltaResource, ResourceAny};
use crate::resource::{DecodedResource, OpaqueResourceDecoder};
use crate::transport::DiscoveryStream;

#[derive(Debug, Default)]
struct FakeStreamState {
    available: bool,
    rate_limited: bool,
    establish_calls: usize,
    sent: Vec<DeltaDiscoveryRequest>,
    queue_size_stat: Option<usize>,
}

/// A [`DiscoveryStream`] that records what is sent through it.
///
/// Clones share state, so a test keeps one clone and hands the other to the
/// mux. The stream starts out unavailable.
#[derive(Debug, Clone, Default)]
pub struct FakeStream {
    state: Rc<RefCell<FakeStreamState>>,
}

impl FakeStream {
    /// A stream that is not yet available.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the stream (un)available for sending.
    pub fn set_available(&self, available: bool) {
        self.state.borrow_mut().available = available;
    }

    /// Make the rate limiter refuse (or allow) sends.
    pub fn set_rate_limited(&self, rate_limited: bool) {
        self.state.borrow_mut().rate_limited = rate_limited;
    }

    /// Requests sent so far.
    pub fn sent(&self) -> Vec<DeltaDiscoveryRequest> {
        self.state.borrow().sent.clone()
    }

    /// Requests sent so far, clearing the record.
    pub fn take_sent(&self) -> Vec<DeltaDiscoveryRequest> {
        std::mem::take(&mut self.state.borrow_mut().sent)
    }

    /// How many times establishment was requested.
    pub fn establish_calls(&self) -> usize {
        self.state.borrow().establish_calls
    }

    /// The last reported ACK queue size.
    pub fn queue_size_stat(&self) -> Option<usize> {
        self.state.borrow().queue_size_stat
    }
}

impl DiscoveryStream for FakeStream {
    fn establish_new_stream(&mut self) {
        self.state.borrow_mut().establish_calls += 1;
    }

    fn stream_available(&self) -> bool {
        self.state.borrow().available
    }

    fn check_rate_limit_allows_drain(&mut self) -> bool {
        !self.state.borrow().rate_limited
    }

    fn send_message(&mut self, request: DeltaDiscoveryRequest) {
        self.state.borrow_mut().sent.push(request);
    }

    fn maybe_update_queue_size_stat(&mut self, size: usize) {
        self.state.borrow_mut().queue_size_stat = Some(size);
    }
}

/// One callback received by [`RecordingCallbacks`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    /// `on_config_update`.
    Update {
        /// `(name, version)` of each added resource.
        added: Vec<(String, String)>,
        /// Removed resource names.
        removed: Vec<String>,
        /// The response's system version.
        system_version_info: String,
    },
    /// `on_config_update_failed`.
    Failed {
        /// The failure reason.
        reason: ConfigUpdateFailureReason,
        /// The error's message, if one was given.
        error: Option<String>,
    },
}

/// [`SubscriptionCallbacks`] that record every call.
#[derive(Debug, Default)]
pub struct RecordingCallbacks {
    events: RefCell<Vec<CallbackEvent>>,
    values: RefCell<Vec<String>>,
    reject_with: RefCell<Option<String>>,
}

impl RecordingCallbacks {
    /// Callbacks that accept every update.
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Reject subsequent updates with `message`.
    pub fn reject_updates(&self, message: impl Into<String>) {
        *self.reject_with.borrow_mut() = Some(message.into());
    }

    /// Events received so far.
    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events.borrow().clone()
    }

    /// Events received so far, clearing the record.
    pub fn take_events(&self) -> Vec<CallbackEvent> {
        std::mem::take(&mut self.events.borrow_mut())
    }

    /// Every added resource decoded as a `String`, in delivery order.
    pub fn string_values(&self) -> Vec<String> {
        self.values.borrow().clone()
    }
}

impl SubscriptionCallbacks for RecordingCallbacks {
    fn on_config_update(
        &self,
        added: &[DecodedResource],
        removed: &[String],
        system_version_info: &str,
    ) -> Result<()> {
        self.events.borrow_mut().push(CallbackEvent::Update {
            added: added
                .iter()
                .map(|r| (r.name().to_owned(), r.version().to_owned()))
                .collect(),
            removed: removed.to_vec(),
            system_version_info: system_version_info.to_owned(),
        });
        self.values.borrow_mut().extend(
            added
                .iter()
                .filter_map(|r| r.downcast_ref::<String>().cloned()),
        );
        match self.reject_with.borrow().as_ref() {
            Some(message) => Err(Error::Validation(message.clone())),
            None => Ok(()),
        }
    }

    fn on_config_update_failed(&self, reason: ConfigUpdateFailureReason, error: Option<&Error>) {
        self.events.borrow_mut().push(CallbackEvent::Failed {
            reason,
            error: error.map(ToString::to_string),
        });
    }
}

/// Decodes payloads as UTF-8 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringDecoder;

impl OpaqueResourceDecoder for StringDecoder {
    fn decode_resource(&self, bytes: Bytes) -> Result<Box<dyn Any>> {
        let value = String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::Validation(format!("resource is not UTF-8: {e}")))?;
        Ok(Box::new(value))
    }
}

/// A response resource whose payload is `value` as UTF-8.
pub fn resource(name: &str, version: &str, value: &str) -> DeltaResource {
    DeltaResource {
        name: name.to_owned(),
        version: version.to_owned(),
        resource: Some(ResourceAny {
            type_url: String::new(),
            value: Bytes::copy_from_slice(value.as_bytes()),
        }),
    }
}
