//! The delta xDS multiplexer.
//!
//! [`DeltaGrpcMux`] runs every resource type over one shared stream:
//! - one [`DeltaSubscriptionState`] and one [`WatchMap`] per type URL,
//! - a [`PausableAckQueue`] of acknowledgments owed to the server,
//! - the activation order of the types, which is their send priority.
//!
//! Everything runs on one thread. Watch callbacks are invoked with no
//! internal state borrowed, so they may call back into the mux, e.g. to add
//! watches for dependent resource types.

use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use crate::client::ack_queue::PausableAckQueue;
use crate::client::config::MuxConfig;
use crate::client::subscription_state::{ConfigUpdate, DeltaSubscriptionState};
use crate::client::type_url::TypeUrlMap;
use crate::client::watch_map::{
    ConfigUpdateFailureReason, PlannedUpdate, SubscriptionCallbacks, WatchId, WatchMap,
};
use crate::error::{Error, Result};
use crate::message::{DeltaDiscoveryResponse, UpdateAck};
use crate::resource::OpaqueResourceDecoder;
use crate::resource::xdstp::{self, XdstpName};
use crate::transport::{DiscoveryStream, StreamCallbacks};

/// Everything the mux keeps for one type URL.
struct Subscription {
    sub_state: DeltaSubscriptionState,
    watch_map: WatchMap,
    /// Decoder of the watch that created the subscription.
    decoder: Rc<dyn OpaqueResourceDecoder>,
}

struct MuxState {
    config: MuxConfig,
    subscriptions: HashMap<String, Subscription>,
    /// Type URLs in the order they were first subscribed. Only grows.
    subscription_ordering: Vec<String>,
    pausable_ack_queue: PausableAckQueue,
    type_url_map: TypeUrlMap,
}

impl MuxState {
    /// The subscription for `type_url`, created on first use.
    fn subscription_entry(
        &mut self,
        type_url: &str,
        use_namespace_matching: bool,
        decoder: &Rc<dyn OpaqueResourceDecoder>,
    ) -> &mut Subscription {
        match self.subscriptions.entry(type_url.to_owned()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if self.config.enable_type_url_downgrade_and_upgrade {
                    self.type_url_map.register_alias(type_url);
                }
                debug!(type_url, "adding subscription");
                self.subscription_ordering.push(type_url.to_owned());
                entry.insert(Subscription {
                    sub_state: DeltaSubscriptionState::new(type_url, self.config.node.clone()),
                    watch_map: WatchMap::new(use_namespace_matching),
                    decoder: Rc::clone(decoder),
                })
            }
        }
    }

    /// The type URL of the subscription a response of `type_url` belongs
    /// to, trying the aliased type URL once if enabled.
    fn resolve_subscription(&mut self, type_url: &str) -> Option<String> {
        if self.subscriptions.contains_key(type_url) {
            return Some(type_url.to_owned());
        }
        if !self.config.enable_type_url_downgrade_and_upgrade {
            return None;
        }
        self.type_url_map.register_alias(type_url);
        self.type_url_map
            .resolve(type_url)
            .filter(|alias| self.subscriptions.contains_key(*alias))
            .map(str::to_owned)
    }

    // ACKs before plain updates; among updates, the earliest subscribed
    // type first.
    fn who_wants_to_send_discovery_request(&self) -> Option<String> {
        if let Some(ack) = self.pausable_ack_queue.front() {
            return Some(ack.type_url.clone());
        }
        self.subscription_ordering
            .iter()
            .find(|type_url| {
                !self.pausable_ack_queue.paused(type_url)
                    && self
                        .subscriptions
                        .get(*type_url)
                        .is_some_and(|sub| sub.sub_state.subscription_update_pending())
            })
            .cloned()
    }
}

struct Shared {
    state: RefCell<MuxState>,
    stream: RefCell<Box<dyn DiscoveryStream>>,
}

/// Callbacks to run once internal state is released.
enum Delivery {
    Update {
        planned: Vec<PlannedUpdate>,
        system_version_info: String,
    },
    Failure {
        watches: Vec<(WatchId, Rc<dyn SubscriptionCallbacks>)>,
        reason: ConfigUpdateFailureReason,
        error: Option<Error>,
    },
}

impl Delivery {
    fn plan(watch_map: &WatchMap, update: ConfigUpdate) -> Self {
        match update {
            ConfigUpdate::Delta {
                added,
                removed,
                system_version_info,
            } => Delivery::Update {
                planned: watch_map.plan_config_update(&added, &removed),
                system_version_info,
            },
            ConfigUpdate::Failed { reason, error } => Delivery::Failure {
                watches: watch_map.plan_config_update_failed(),
                reason,
                error,
            },
        }
    }
}

/// Delta xDS subscription multiplexer over a single discovery stream.
///
/// This is a handle; clones refer to the same mux. It is not `Send`: all
/// calls, including [`StreamCallbacks`], must come from one thread.
///
/// # Example
///
/// ```ignore
/// use std::rc::Rc;
/// use xds_delta_client::{DeltaGrpcMux, MuxConfig, Node, StreamCallbacks};
///
/// let mux = DeltaGrpcMux::new(MuxConfig::new(Node::new("envoy", "1.30")), stream);
/// let watch = mux.add_watch(
///     "type.googleapis.com/envoy.config.cluster.v3.Cluster",
///     ["cluster-a", "cluster-b"],
///     Rc::new(cluster_callbacks),
///     Rc::new(cluster_decoder),
///     false,
/// )?;
/// mux.start();
///
/// // From the stream's event loop:
/// mux.on_stream_established();
/// mux.on_discovery_response(response);
///
/// // Dropping the handle unsubscribes.
/// drop(watch);
/// ```
#[derive(Clone)]
pub struct DeltaGrpcMux {
    shared: Rc<Shared>,
}

impl DeltaGrpcMux {
    /// Create a mux driving `stream`. Nothing is sent until the stream is
    /// established.
    pub fn new(config: MuxConfig, stream: impl DiscoveryStream + 'static) -> Self {
        let state = MuxState {
            config,
            subscriptions: HashMap::new(),
            subscription_ordering: Vec::new(),
            pausable_ack_queue: PausableAckQueue::new(),
            type_url_map: TypeUrlMap::new(),
        };
        Self {
            shared: Rc::new(Shared {
                state: RefCell::new(state),
                stream: RefCell::new(Box::new(stream)),
            }),
        }
    }

    /// Ask the stream to establish itself.
    pub fn start(&self) {
        self.shared.stream.borrow_mut().establish_new_stream();
    }

    /// Watch `resources` of `type_url`, creating the subscription for the
    /// type on first use.
    ///
    /// An empty `resources` makes a wildcard watch. With
    /// `use_namespace_matching`, the names are namespaces: the watch
    /// receives resources whose name lies under one of them, but does not
    /// itself subscribe to anything.
    ///
    /// A single `xdstp://` glob collection (`.../*`) is accepted and
    /// expanded with the node's context parameters.
    ///
    /// # Panics
    ///
    /// Panics on xdstp:// names other than glob collections, and on
    /// several names of which one is xdstp://.
    pub fn add_watch<I, S>(
        &self,
        type_url: &str,
        resources: I,
        callbacks: Rc<dyn SubscriptionCallbacks>,
        decoder: Rc<dyn OpaqueResourceDecoder>,
        use_namespace_matching: bool,
    ) -> Result<WatchHandle>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let resources = resources.into_iter().map(Into::into).collect();
        let watch = {
            let mut state = self.shared.state.borrow_mut();
            let sub = state.subscription_entry(type_url, use_namespace_matching, &decoder);
            sub.watch_map.add_watch(callbacks)
        };
        let handle = WatchHandle {
            type_url: type_url.to_owned(),
            watch,
            mux: Rc::downgrade(&self.shared),
        };

        // Sends a request if any of the names are new to the subscription.
        self.update_watch_inner(type_url, watch, resources, use_namespace_matching)?;
        Ok(handle)
    }

    /// Replace the names watched by `handle`. Names new to the subscription
    /// are subscribed; names no other watch wants are unsubscribed.
    pub fn update_watch<I, S>(&self, handle: &WatchHandle, resources: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let resources = resources.into_iter().map(Into::into).collect();
        self.update_watch_inner(&handle.type_url, handle.watch, resources, false)
    }

    /// Remove the watch behind `handle`. Same as dropping it.
    pub fn remove_watch(&self, handle: WatchHandle) {
        drop(handle);
    }

    /// Subscribe to `resources` of `type_url` without going through a
    /// watch.
    ///
    /// # Panics
    ///
    /// Panics if `type_url` has no subscription.
    pub fn request_on_demand_update<I, S>(&self, type_url: &str, resources: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let for_update: BTreeSet<String> = resources.into_iter().map(Into::into).collect();
        let pending = {
            let mut state = self.shared.state.borrow_mut();
            let Some(sub) = state.subscriptions.get_mut(type_url) else {
                panic!("Watch of {type_url} has no subscription to update.");
            };
            sub.sub_state
                .update_subscription_interest(&for_update, &BTreeSet::new());
            sub.sub_state.subscription_update_pending()
        };
        if pending {
            self.try_send_discovery_requests();
        }
    }

    /// Hold back requests and ACKs of `type_url` until the returned guard
    /// is dropped.
    pub fn pause(&self, type_url: &str) -> ScopedResume {
        self.pause_types([type_url])
    }

    /// Hold back requests and ACKs of every type in `type_urls` until the
    /// returned guard is dropped.
    ///
    /// Pauses nest. Interest changes made while paused are merged into a
    /// single request once the last pause of the type is released.
    pub fn pause_types<I, S>(&self, type_urls: I) -> ScopedResume
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let type_urls: Vec<String> = type_urls.into_iter().map(Into::into).collect();
        let mut state = self.shared.state.borrow_mut();
        for type_url in &type_urls {
            state.pausable_ack_queue.pause(type_url);
        }
        ScopedResume {
            mux: Rc::downgrade(&self.shared),
            type_urls,
        }
    }

    /// Returns true if `type_url` is paused.
    pub fn is_paused(&self, type_url: &str) -> bool {
        self.shared.state.borrow().pausable_ack_queue.paused(type_url)
    }

    /// Subscribed type URLs, in activation order.
    pub fn subscribed_type_urls(&self) -> Vec<String> {
        self.shared.state.borrow().subscription_ordering.clone()
    }

    /// The resource names the subscription for `type_url` tracks.
    pub fn subscription_interest(&self, type_url: &str) -> Option<BTreeSet<String>> {
        let state = self.shared.state.borrow();
        state
            .subscriptions
            .get(type_url)
            .map(|sub| sub.sub_state.resource_names())
    }

    /// The version held for resource `name` of `type_url`.
    pub fn resource_version(&self, type_url: &str, name: &str) -> Option<String> {
        let state = self.shared.state.borrow();
        state
            .subscriptions
            .get(type_url)
            .and_then(|sub| sub.sub_state.resource_version(name))
            .map(str::to_owned)
    }

    /// Number of ACKs waiting to be sent, paused types included.
    pub fn pending_ack_count(&self) -> usize {
        self.shared.state.borrow().pausable_ack_queue.len()
    }

    /// The type URL that gets to send next, if any type has something to
    /// send. Does not check whether sending is currently possible.
    pub fn who_wants_to_send_discovery_request(&self) -> Option<String> {
        self.shared
            .state
            .borrow()
            .who_wants_to_send_discovery_request()
    }

    /// Send as many requests as the stream allows, highest priority first.
    ///
    /// Stops at the first type that cannot be sent rather than skipping to
    /// a lower priority one.
    pub fn try_send_discovery_requests(&self) {
        loop {
            let request = {
                let mut guard = self.shared.state.borrow_mut();
                let state = &mut *guard;
                let Some(type_url) = state.who_wants_to_send_discovery_request() else {
                    break;
                };
                let Some(sub) = state.subscriptions.get_mut(&type_url) else {
                    panic!(
                        "Tried to send discovery request for non-existent subscription {type_url}."
                    );
                };

                if !self.can_send_discovery_request(&state.pausable_ack_queue, &type_url) {
                    break;
                }

                match state.pausable_ack_queue.pop_front() {
                    // ACKs take precedence over plain requests, so a queued
                    // ACK is always of the chosen type.
                    Some(ack) => {
                        debug_assert_eq!(ack.type_url, type_url);
                        sub.sub_state.get_next_request_with_ack(ack)
                    }
                    None => sub.sub_state.get_next_request_ackless(),
                }
            };

            debug!(
                type_url = %request.type_url,
                subscribe = ?request.resource_names_subscribe,
                unsubscribe = ?request.resource_names_unsubscribe,
                nonce = %request.response_nonce,
                nack = request.error_detail.is_some(),
                "sending DeltaDiscoveryRequest"
            );
            self.shared.stream.borrow_mut().send_message(request);
        }

        let queue_size = self.shared.state.borrow().pausable_ack_queue.len();
        self.shared
            .stream
            .borrow_mut()
            .maybe_update_queue_size_stat(queue_size);
    }

    // Whether external conditions allow sending a request. Does not check
    // whether there is anything to send.
    fn can_send_discovery_request(&self, ack_queue: &PausableAckQueue, type_url: &str) -> bool {
        assert!(
            !ack_queue.paused(type_url),
            "can_send_discovery_request() called on paused type_url {type_url}. Pausedness is \
             supposed to be filtered out by who_wants_to_send_discovery_request()."
        );

        let mut stream = self.shared.stream.borrow_mut();
        if !stream.stream_available() {
            trace!(type_url, "no stream available to send a discovery request");
            false
        } else if !stream.check_rate_limit_allows_drain() {
            trace!(type_url, "discovery request hit rate limit; will try later");
            false
        } else {
            true
        }
    }

    fn update_watch_inner(
        &self,
        type_url: &str,
        watch: WatchId,
        resources: BTreeSet<String>,
        creating_namespace_watch: bool,
    ) -> Result<()> {
        let (resources, is_xdstp) = self.expand_xdstp_collection(resources)?;
        // Namespace watches observe resources others subscribed to; their
        // prefixes never go on the wire.
        let suppress_interest = creating_namespace_watch && !is_xdstp;
        self.apply_watch_interest(type_url, watch, &resources, suppress_interest);
        Ok(())
    }

    fn apply_watch_interest(
        &self,
        type_url: &str,
        watch: WatchId,
        resources: &BTreeSet<String>,
        suppress_interest: bool,
    ) {
        let pending = {
            let mut state = self.shared.state.borrow_mut();
            let Some(sub) = state.subscriptions.get_mut(type_url) else {
                panic!("Watch of {type_url} has no subscription to update.");
            };
            let added_removed = sub.watch_map.update_watch_interest(watch, resources);
            if !suppress_interest {
                sub.sub_state
                    .update_subscription_interest(&added_removed.added, &added_removed.removed);
            }
            sub.sub_state.subscription_update_pending()
        };

        // Tell the server about our change in interest, if any.
        if pending {
            self.try_send_discovery_requests();
        }
    }

    fn remove_watch_inner(&self, type_url: &str, watch: WatchId) {
        self.apply_watch_interest(type_url, watch, &BTreeSet::new(), false);
        let removed = {
            let mut state = self.shared.state.borrow_mut();
            let Some(sub) = state.subscriptions.get_mut(type_url) else {
                panic!("remove_watch() called for non-existent subscription {type_url}.");
            };
            sub.watch_map.remove_watch(watch)
        };
        // The watch may hold the last reference to callbacks that own watch
        // handles of their own; drop it with the state released.
        drop(removed);
    }

    /// Rewrite a glob collection watch into the name actually subscribed
    /// to. Returns whether the names were xdstp.
    fn expand_xdstp_collection(
        &self,
        resources: BTreeSet<String>,
    ) -> Result<(BTreeSet<String>, bool)> {
        let Some(first) = resources.first().cloned() else {
            return Ok((resources, false));
        };
        if !xdstp::has_xdstp_scheme(&first) {
            return Ok((resources, false));
        }
        // Callers must be asking for a single resource, the collection.
        assert_eq!(
            resources.len(),
            1,
            "xdstp:// watches must name exactly one collection, got {resources:?}"
        );

        let resource = XdstpName::decode(&first)?;
        if !resource.is_glob_collection() {
            unimplemented!("xdstp:// resources other than glob collections: {first}");
        }
        let node_params = self.shared.state.borrow().config.node.context_params();
        let expanded = resource.with_node_context(&node_params).encode();
        Ok((BTreeSet::from([expanded]), true))
    }

    fn kick_off_ack(&self, ack: UpdateAck) {
        self.shared.state.borrow_mut().pausable_ack_queue.push(ack);
        self.try_send_discovery_requests();
    }

    fn watch_alive(&self, type_url: &str, watch: WatchId) -> bool {
        self.shared
            .state
            .borrow()
            .subscriptions
            .get(type_url)
            .is_some_and(|sub| sub.watch_map.contains(watch))
    }

    /// Run planned callbacks. Returns the messages of callbacks that
    /// rejected an update.
    fn deliver(&self, type_url: &str, delivery: Delivery) -> Vec<String> {
        let mut rejections = Vec::new();
        match delivery {
            Delivery::Update {
                planned,
                system_version_info,
            } => {
                for update in planned {
                    // Removed by an earlier callback.
                    if !self.watch_alive(type_url, update.watch) {
                        continue;
                    }
                    if let Err(error) = update.callbacks.on_config_update(
                        &update.added,
                        &update.removed,
                        &system_version_info,
                    ) {
                        rejections.push(Error::Callback(error.to_string()).to_string());
                    }
                }
            }
            Delivery::Failure {
                watches,
                reason,
                error,
            } => {
                for (watch, callbacks) in watches {
                    if self.watch_alive(type_url, watch) {
                        callbacks.on_config_update_failed(reason, error.as_ref());
                    }
                }
            }
        }
        rejections
    }
}

impl StreamCallbacks for DeltaGrpcMux {
    fn on_stream_established(&self) {
        debug!("discovery stream established");
        {
            let mut state = self.shared.state.borrow_mut();
            for subscription in state.subscriptions.values_mut() {
                subscription.sub_state.mark_stream_fresh();
            }
        }
        self.try_send_discovery_requests();
    }

    fn on_establishment_failure(&self) {
        // Notifying one subscription may create others (e.g. a failed
        // cluster fetch lets listeners start up). Notify everything that
        // exists, then go again until a pass finds nothing new.
        let mut already_called: HashSet<String> = HashSet::new();
        loop {
            let all_subscribed = self.shared.state.borrow().subscription_ordering.clone();
            for type_url in &all_subscribed {
                if !already_called.insert(type_url.clone()) {
                    continue;
                }
                let delivery = {
                    let state = self.shared.state.borrow();
                    let Some(sub) = state.subscriptions.get(type_url) else {
                        panic!("subscription {type_url} is ordered but does not exist");
                    };
                    Delivery::plan(&sub.watch_map, sub.sub_state.handle_establishment_failure())
                };
                self.deliver(type_url, delivery);
            }

            let subscribed_now = self.shared.state.borrow().subscription_ordering.len();
            if subscribed_now == all_subscribed.len() {
                break;
            }
        }
    }

    fn on_writeable(&self) {
        self.try_send_discovery_requests();
    }

    fn on_discovery_response(&self, message: DeltaDiscoveryResponse) {
        debug!(
            type_url = %message.type_url,
            version = %message.system_version_info,
            "received DeltaDiscoveryResponse"
        );

        let (type_url, mut ack, versions, delivery) = {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            let Some(type_url) = state.resolve_subscription(&message.type_url) else {
                warn!(
                    type_url = %message.type_url,
                    version = %message.system_version_info,
                    "dropping received DeltaDiscoveryResponse for non-existent subscription"
                );
                return;
            };
            let Some(sub) = state.subscriptions.get_mut(&type_url) else {
                panic!("resolved subscription {type_url} does not exist");
            };
            let handled = sub.sub_state.handle_response(&message, sub.decoder.as_ref());
            let delivery = Delivery::plan(&sub.watch_map, handled.update);
            (type_url, handled.ack, handled.versions, delivery)
        };

        let rejections = self.deliver(&type_url, delivery);
        if rejections.is_empty() {
            if let Some(sub) = self.shared.state.borrow_mut().subscriptions.get_mut(&type_url) {
                sub.sub_state.commit_versions(versions);
            }
        } else {
            debug!(%type_url, "update rejected by watches, keeping previous versions");
            for rejection in rejections {
                ack.reject(rejection);
            }
        }
        self.kick_off_ack(ack);
    }
}

impl fmt::Debug for DeltaGrpcMux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("DeltaGrpcMux");
        match self.shared.state.try_borrow() {
            Ok(state) => debug
                .field("subscriptions", &state.subscription_ordering)
                .field("pausable_ack_queue", &state.pausable_ack_queue),
            Err(_) => debug.field("state", &"<borrowed>"),
        };
        debug.finish_non_exhaustive()
    }
}

/// A registered watch. Dropping it (or calling [`cancel`](Self::cancel))
/// removes the watch; its callbacks are not invoked again afterwards.
#[must_use = "dropping a WatchHandle removes the watch"]
pub struct WatchHandle {
    type_url: String,
    watch: WatchId,
    mux: Weak<Shared>,
}

impl WatchHandle {
    /// The watched type URL.
    pub fn type_url(&self) -> &str {
        &self.type_url
    }

    /// The watch's id within its type.
    pub fn id(&self) -> WatchId {
        self.watch
    }

    /// Replace the watched names. See [`DeltaGrpcMux::update_watch`].
    pub fn update<I, S>(&self, resources: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match self.mux.upgrade() {
            Some(shared) => DeltaGrpcMux { shared }.update_watch(self, resources),
            None => Ok(()),
        }
    }

    /// Remove the watch.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(shared) = self.mux.upgrade() {
            DeltaGrpcMux { shared }.remove_watch_inner(&self.type_url, self.watch);
        }
    }
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchHandle")
            .field("type_url", &self.type_url)
            .field("watch", &self.watch)
            .finish()
    }
}

/// Guard returned by [`DeltaGrpcMux::pause`]. Dropping it resumes the
/// paused types and flushes whatever became sendable.
#[must_use = "dropping a ScopedResume resumes immediately"]
pub struct ScopedResume {
    mux: Weak<Shared>,
    type_urls: Vec<String>,
}

impl Drop for ScopedResume {
    fn drop(&mut self) {
        let Some(shared) = self.mux.upgrade() else {
            return;
        };
        let mux = DeltaGrpcMux { shared };
        for type_url in &self.type_urls {
            let unpaused = {
                let mut state = mux.shared.state.borrow_mut();
                state.pausable_ack_queue.resume(type_url);
                !state.pausable_ack_queue.paused(type_url)
            };
            if unpaused {
                mux.try_send_discovery_requests();
            }
        }
    }
}

impl fmt::Debug for ScopedResume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedResume")
            .field("type_urls", &self.type_urls)
            .finish()
    }
}
