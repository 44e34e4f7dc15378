//! Per-type delta subscription bookkeeping.
//!
//! Tracks which resource names the client is interested in, the version it
//! holds of each, and the interest changes not yet told to the server.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::debug;

use crate::client::watch_map::ConfigUpdateFailureReason;
use crate::error::Error;
use crate::message::{DeltaDiscoveryRequest, DeltaDiscoveryResponse, Node, UpdateAck};
use crate::resource::{DecodedResource, OpaqueResourceDecoder};

/// What the client knows about one resource it is interested in.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ResourceVersion {
    /// Subscribed, but no version received yet.
    WaitingForServer,
    /// Last version the server sent.
    Known(String),
}

/// An update to fan out to the watches of a subscription.
#[derive(Debug)]
pub enum ConfigUpdate {
    /// Resources to deliver.
    Delta {
        /// Successfully decoded added or updated resources.
        added: Vec<DecodedResource>,
        /// Names the server removed.
        removed: Vec<String>,
        /// The server's version of the response.
        system_version_info: String,
    },
    /// The subscription could not be updated.
    Failed {
        /// Why.
        reason: ConfigUpdateFailureReason,
        /// The error behind the failure, if any.
        error: Option<Error>,
    },
}

/// Result of [`DeltaSubscriptionState::handle_response`].
#[derive(Debug)]
pub struct HandledResponse {
    /// The ACK or NACK owed to the server.
    pub ack: UpdateAck,
    /// The update to deliver to watches.
    pub update: ConfigUpdate,
    /// Versions to record once the watches have accepted `update`.
    pub versions: PendingVersions,
}

/// Version changes carried by a response, held back until every watch
/// accepts the update. See [`DeltaSubscriptionState::commit_versions`].
#[derive(Debug, Default)]
pub struct PendingVersions {
    known: Vec<(String, String)>,
    removed: Vec<String>,
}

impl PendingVersions {
    /// Whether committing would change nothing.
    pub fn is_empty(&self) -> bool {
        self.known.is_empty() && self.removed.is_empty()
    }
}

/// Delta xDS state of one resource type.
#[derive(Debug)]
pub struct DeltaSubscriptionState {
    type_url: String,
    node: Node,
    // Every name we are interested in, plus names the server sent unasked.
    resource_versions: BTreeMap<String, ResourceVersion>,
    names_added: BTreeSet<String>,
    names_removed: BTreeSet<String>,
    // Pending additions the server already knows: removed, then re-added
    // before a request went out.
    names_resubscribed: BTreeSet<String>,
    any_request_sent_yet_in_current_stream: bool,
}

impl DeltaSubscriptionState {
    /// Create the state for `type_url`. `node` is attached to the first
    /// request of every stream.
    pub fn new(type_url: impl Into<String>, node: Node) -> Self {
        Self {
            type_url: type_url.into(),
            node,
            resource_versions: BTreeMap::new(),
            names_added: BTreeSet::new(),
            names_removed: BTreeSet::new(),
            names_resubscribed: BTreeSet::new(),
            any_request_sent_yet_in_current_stream: false,
        }
    }

    /// The type URL this state tracks.
    pub fn type_url(&self) -> &str {
        &self.type_url
    }

    /// Record interest changes to send with the next request.
    ///
    /// Adding a name already tracked, or removing a name not tracked, is a
    /// no-op. A name added and removed again before any request went out
    /// leaves no trace.
    pub fn update_subscription_interest(
        &mut self,
        added: &BTreeSet<String>,
        removed: &BTreeSet<String>,
    ) {
        for name in added {
            if self.resource_versions.contains_key(name) {
                continue;
            }
            self.resource_versions
                .insert(name.clone(), ResourceVersion::WaitingForServer);
            // Re-adding a name whose removal is still pending subscribes it
            // again, so the server sends it anew.
            if self.names_removed.remove(name) {
                self.names_resubscribed.insert(name.clone());
            }
            self.names_added.insert(name.clone());
        }
        for name in removed {
            if self.resource_versions.remove(name).is_none() {
                continue;
            }
            // A pending addition the server never heard of leaves no trace.
            let pending_addition = self.names_added.remove(name);
            let resubscribed = self.names_resubscribed.remove(name);
            if !pending_addition || resubscribed {
                self.names_removed.insert(name.clone());
            }
        }
    }

    /// Returns true if there is something to tell the server: pending
    /// interest changes, or the initial request of a fresh stream.
    pub fn subscription_update_pending(&self) -> bool {
        !self.names_added.is_empty()
            || !self.names_removed.is_empty()
            || !self.any_request_sent_yet_in_current_stream
    }

    /// Returns true if `name` is tracked by this subscription.
    pub fn is_interested_in(&self, name: &str) -> bool {
        self.resource_versions.contains_key(name)
    }

    /// The version held for `name`, if one was received.
    pub fn resource_version(&self, name: &str) -> Option<&str> {
        match self.resource_versions.get(name) {
            Some(ResourceVersion::Known(version)) => Some(version),
            _ => None,
        }
    }

    /// Every tracked name.
    pub fn resource_names(&self) -> BTreeSet<String> {
        self.resource_versions.keys().cloned().collect()
    }

    /// Apply a response and compute the acknowledgment owed for it.
    ///
    /// Responses naming a resource twice are rejected whole. Otherwise each
    /// resource is decoded on its own: those that decode are delivered,
    /// those that fail turn the ACK into a NACK listing them.
    ///
    /// No version is recorded here. The caller passes
    /// [`HandledResponse::versions`] to [`commit_versions`](Self::commit_versions)
    /// once the update has been accepted.
    pub fn handle_response(
        &mut self,
        message: &DeltaDiscoveryResponse,
        decoder: &dyn OpaqueResourceDecoder,
    ) -> HandledResponse {
        let mut ack = UpdateAck::new(
            self.type_url.clone(),
            message.nonce.clone(),
            message.system_version_info.clone(),
        );

        if let Err(error) = check_unique_names(message) {
            debug!(type_url = %self.type_url, %error, "rejecting delta response");
            ack.reject(error.to_string());
            return HandledResponse {
                ack,
                update: ConfigUpdate::Failed {
                    reason: ConfigUpdateFailureReason::UpdateRejected,
                    error: Some(error),
                },
                versions: PendingVersions::default(),
            };
        }

        let mut versions = PendingVersions::default();
        let mut added = Vec::with_capacity(message.resources.len());
        let mut failures = Vec::new();
        for resource in &message.resources {
            let Some(payload) = &resource.resource else {
                // Version refresh only.
                versions
                    .known
                    .push((resource.name.clone(), resource.version.clone()));
                continue;
            };
            match decoder.decode_resource(payload.value.clone()) {
                Ok(decoded) => {
                    versions
                        .known
                        .push((resource.name.clone(), resource.version.clone()));
                    added.push(DecodedResource::new(
                        resource.name.clone(),
                        resource.version.clone(),
                        decoded,
                    ));
                }
                Err(error) => failures.push(format!("{}: {error}", resource.name)),
            }
        }

        versions.removed = message.removed_resources.clone();

        if !failures.is_empty() {
            ack.reject(failures.join("; "));
        }

        HandledResponse {
            ack,
            update: ConfigUpdate::Delta {
                added,
                removed: message.removed_resources.clone(),
                system_version_info: message.system_version_info.clone(),
            },
            versions,
        }
    }

    /// Record the versions of an accepted response. Names unsubscribed
    /// while the update was being delivered are skipped.
    pub fn commit_versions(&mut self, versions: PendingVersions) {
        for (name, version) in versions.known {
            if !self.names_removed.contains(&name) {
                self.set_resource_version(&name, &version);
            }
        }
        for name in &versions.removed {
            if let Some(version) = self.resource_versions.get_mut(name) {
                *version = ResourceVersion::WaitingForServer;
            }
        }
    }

    /// The update to deliver when the stream could not be established.
    /// Interest is left untouched.
    pub fn handle_establishment_failure(&self) -> ConfigUpdate {
        debug!(type_url = %self.type_url, "notifying watches of establishment failure");
        ConfigUpdate::Failed {
            reason: ConfigUpdateFailureReason::ConnectionFailure,
            error: Some(Error::ConnectionFailure),
        }
    }

    /// Forget what was sent on the previous stream; the next request will
    /// restate the whole subscription.
    pub fn mark_stream_fresh(&mut self) {
        self.any_request_sent_yet_in_current_stream = false;
    }

    /// Build the next request, carrying pending interest changes only.
    pub fn get_next_request_ackless(&mut self) -> DeltaDiscoveryRequest {
        let mut request = DeltaDiscoveryRequest {
            type_url: self.type_url.clone(),
            ..Default::default()
        };

        if !self.any_request_sent_yet_in_current_stream {
            self.any_request_sent_yet_in_current_stream = true;
            request.node = Some(self.node.clone());
            // A new stream may mean a new server: state all interest, and
            // the versions we already hold.
            for (name, version) in &self.resource_versions {
                if let ResourceVersion::Known(version) = version {
                    request
                        .initial_resource_versions
                        .insert(name.clone(), version.clone());
                }
                self.names_added.insert(name.clone());
            }
            self.names_removed.clear();
        }
        self.names_resubscribed.clear();

        request.resource_names_subscribe =
            std::mem::take(&mut self.names_added).into_iter().collect();
        request.resource_names_unsubscribe =
            std::mem::take(&mut self.names_removed).into_iter().collect();
        request
    }

    /// Build the next request and attach `ack` to it.
    pub fn get_next_request_with_ack(&mut self, ack: UpdateAck) -> DeltaDiscoveryRequest {
        let mut request = self.get_next_request_ackless();
        request.response_nonce = ack.nonce;
        request.error_detail = ack.error_detail;
        request
    }

    fn set_resource_version(&mut self, name: &str, version: &str) {
        self.resource_versions
            .insert(name.to_owned(), ResourceVersion::Known(version.to_owned()));
    }
}

fn check_unique_names(message: &DeltaDiscoveryResponse) -> Result<(), Error> {
    let mut seen =
        HashSet::with_capacity(message.resources.len() + message.removed_resources.len());
    for resource in &message.resources {
        if !seen.insert(resource.name.as_str()) {
            return Err(Error::DuplicateResource {
                name: resource.name.clone(),
                location: "among added/updated resources",
            });
        }
    }
    for name in &message.removed_resources {
        if !seen.insert(name.as_str()) {
            return Err(Error::DuplicateResource {
                name: name.clone(),
                location: "in the union of added+removed resources",
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DeltaResource, ResourceAny};
    use std::any::Any;

    use bytes::Bytes;

    const TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";

    struct Utf8Decoder;

    impl OpaqueResourceDecoder for Utf8Decoder {
        fn decode_resource(&self, bytes: Bytes) -> crate::Result<Box<dyn Any>> {
            String::from_utf8(bytes.to_vec())
                .map(|s| Box::new(s) as Box<dyn Any>)
                .map_err(|e| Error::Validation(e.to_string()))
        }
    }

    fn names(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn state_with_initial_request_sent(initial: &[&str]) -> DeltaSubscriptionState {
        let mut state = DeltaSubscriptionState::new(TYPE_URL, Node::new("envoy", "1"));
        state.update_subscription_interest(&names(initial), &BTreeSet::new());
        state.get_next_request_ackless();
        assert!(!state.subscription_update_pending());
        state
    }

    /// Handle `message` and record its versions, as the mux does when every
    /// watch accepts the update.
    fn accept(
        state: &mut DeltaSubscriptionState,
        message: &DeltaDiscoveryResponse,
    ) -> HandledResponse {
        let HandledResponse {
            ack,
            update,
            versions,
        } = state.handle_response(message, &Utf8Decoder);
        state.commit_versions(versions);
        HandledResponse {
            ack,
            update,
            versions: PendingVersions::default(),
        }
    }

    fn resource(name: &str, version: &str, payload: &'static [u8]) -> DeltaResource {
        DeltaResource {
            name: name.to_string(),
            version: version.to_string(),
            resource: Some(ResourceAny {
                type_url: TYPE_URL.to_string(),
                value: Bytes::from_static(payload),
            }),
        }
    }

    fn response(resources: Vec<DeltaResource>, removed: &[&str]) -> DeltaDiscoveryResponse {
        DeltaDiscoveryResponse {
            system_version_info: "system-1".to_string(),
            resources,
            type_url: TYPE_URL.to_string(),
            removed_resources: removed.iter().map(|name| name.to_string()).collect(),
            nonce: "nonce-1".to_string(),
        }
    }

    #[test]
    fn new_state_wants_to_send_initial_request() {
        let mut state = DeltaSubscriptionState::new(TYPE_URL, Node::new("envoy", "1"));
        assert!(state.subscription_update_pending());

        let request = state.get_next_request_ackless();
        assert_eq!(request.type_url, TYPE_URL);
        assert_eq!(request.node.as_ref().unwrap().user_agent_name, "envoy");
        assert!(request.resource_names_subscribe.is_empty());
        assert!(!state.subscription_update_pending());
    }

    #[test]
    fn interest_updates_are_idempotent() {
        let mut state = state_with_initial_request_sent(&["x", "y"]);

        state.update_subscription_interest(&names(&["x"]), &names(&["z"]));
        assert!(!state.subscription_update_pending());

        state.update_subscription_interest(&names(&["w"]), &BTreeSet::new());
        state.update_subscription_interest(&names(&["w"]), &BTreeSet::new());
        let request = state.get_next_request_ackless();
        assert_eq!(request.resource_names_subscribe, vec!["w".to_string()]);
        assert!(request.resource_names_unsubscribe.is_empty());
        assert!(request.node.is_none());
    }

    #[test]
    fn add_then_remove_before_sending_cancels_out() {
        let mut state = state_with_initial_request_sent(&["x"]);

        state.update_subscription_interest(&names(&["y"]), &BTreeSet::new());
        state.update_subscription_interest(&BTreeSet::new(), &names(&["y"]));
        assert!(!state.subscription_update_pending());

        state.update_subscription_interest(&BTreeSet::new(), &names(&["x"]));
        state.update_subscription_interest(&names(&["x"]), &BTreeSet::new());
        let request = state.get_next_request_ackless();
        assert_eq!(request.resource_names_subscribe, vec!["x".to_string()]);
        assert!(request.resource_names_unsubscribe.is_empty());
    }

    #[test]
    fn remove_readd_remove_still_unsubscribes() {
        let mut state = state_with_initial_request_sent(&["x"]);

        state.update_subscription_interest(&BTreeSet::new(), &names(&["x"]));
        state.update_subscription_interest(&names(&["x"]), &BTreeSet::new());
        state.update_subscription_interest(&BTreeSet::new(), &names(&["x"]));

        let request = state.get_next_request_ackless();
        assert!(request.resource_names_subscribe.is_empty());
        assert_eq!(request.resource_names_unsubscribe, vec!["x".to_string()]);
        assert!(!state.is_interested_in("x"));
    }

    #[test]
    fn removal_is_sent_as_unsubscribe() {
        let mut state = state_with_initial_request_sent(&["x", "y"]);

        state.update_subscription_interest(&BTreeSet::new(), &names(&["x"]));
        assert!(state.subscription_update_pending());
        let request = state.get_next_request_ackless();
        assert!(request.resource_names_subscribe.is_empty());
        assert_eq!(request.resource_names_unsubscribe, vec!["x".to_string()]);
        assert!(!state.is_interested_in("x"));
    }

    #[test]
    fn good_response_records_versions_and_acks() {
        let mut state = state_with_initial_request_sent(&["x", "y"]);

        let handled = accept(&mut state, &response(vec![resource("x", "v1", b"payload-x")], &[]));

        assert_eq!(handled.ack.type_url, TYPE_URL);
        assert_eq!(handled.ack.nonce, "nonce-1");
        assert_eq!(handled.ack.system_version_info, "system-1");
        assert!(!handled.ack.is_nack());
        assert_eq!(state.resource_version("x"), Some("v1"));
        assert_eq!(state.resource_version("y"), None);

        match handled.update {
            ConfigUpdate::Delta {
                added,
                removed,
                system_version_info,
            } => {
                assert_eq!(added.len(), 1);
                assert_eq!(added[0].downcast_ref::<String>().unwrap(), "payload-x");
                assert!(removed.is_empty());
                assert_eq!(system_version_info, "system-1");
            }
            other => panic!("unexpected update {other:?}"),
        }
    }

    #[test]
    fn versions_are_compared_by_equality_only() {
        let mut state = state_with_initial_request_sent(&["x"]);
        accept(&mut state, &response(vec![resource("x", "v9", b"a")], &[]));
        accept(&mut state, &response(vec![resource("x", "v10", b"b")], &[]));
        accept(&mut state, &response(vec![resource("x", "aaa", b"c")], &[]));
        assert_eq!(state.resource_version("x"), Some("aaa"));
    }

    #[test]
    fn versions_wait_for_commit() {
        let mut state = state_with_initial_request_sent(&["x"]);
        accept(&mut state, &response(vec![resource("x", "v1", b"a")], &[]));

        let handled = state.handle_response(
            &response(vec![resource("x", "v2", b"b")], &[]),
            &Utf8Decoder,
        );
        assert!(!handled.versions.is_empty());
        assert_eq!(state.resource_version("x"), Some("v1"));

        // Never committed: a fresh stream offers the last accepted version.
        drop(handled);
        state.mark_stream_fresh();
        let request = state.get_next_request_ackless();
        assert_eq!(request.initial_resource_versions["x"], "v1");
    }

    #[test]
    fn commit_skips_names_unsubscribed_meanwhile() {
        let mut state = state_with_initial_request_sent(&["x", "y"]);
        let handled = state.handle_response(
            &response(vec![resource("x", "v1", b"a"), resource("y", "v1", b"b")], &[]),
            &Utf8Decoder,
        );
        state.update_subscription_interest(&BTreeSet::new(), &names(&["x"]));
        state.commit_versions(handled.versions);

        assert!(!state.is_interested_in("x"));
        assert_eq!(state.resource_version("y"), Some("v1"));
    }

    #[test]
    fn undecodable_resources_are_nacked_individually() {
        let mut state = state_with_initial_request_sent(&["x", "y"]);

        let handled = accept(
            &mut state,
            &response(
                vec![resource("x", "v1", b"\xff\xfe"), resource("y", "v1", b"ok")],
                &[],
            ),
        );

        let detail = handled.ack.error_detail.unwrap();
        assert_eq!(detail.code, crate::message::INTERNAL);
        assert!(detail.message.starts_with("x: "));
        assert_eq!(state.resource_version("x"), None);
        assert_eq!(state.resource_version("y"), Some("v1"));
        match handled.update {
            ConfigUpdate::Delta { added, .. } => {
                assert_eq!(added.len(), 1);
                assert_eq!(added[0].name(), "y");
            }
            other => panic!("unexpected update {other:?}"),
        }
    }

    #[test]
    fn duplicate_names_reject_the_whole_response() {
        let mut state = state_with_initial_request_sent(&["x"]);

        let handled = state.handle_response(
            &response(vec![resource("x", "v1", b"a"), resource("x", "v2", b"b")], &[]),
            &Utf8Decoder,
        );
        assert_eq!(
            handled.ack.error_detail.unwrap().message,
            "duplicate name x found among added/updated resources"
        );
        assert!(matches!(
            handled.update,
            ConfigUpdate::Failed {
                reason: ConfigUpdateFailureReason::UpdateRejected,
                ..
            }
        ));
        assert_eq!(state.resource_version("x"), None);

        let handled = state.handle_response(
            &response(vec![resource("x", "v1", b"a")], &["x"]),
            &Utf8Decoder,
        );
        assert_eq!(
            handled.ack.error_detail.unwrap().message,
            "duplicate name x found in the union of added+removed resources"
        );
    }

    #[test]
    fn removed_resources_go_back_to_waiting() {
        let mut state = state_with_initial_request_sent(&["x"]);
        accept(&mut state, &response(vec![resource("x", "v1", b"a")], &[]));
        assert_eq!(state.resource_version("x"), Some("v1"));

        let handled = accept(&mut state, &response(vec![], &["x", "unknown"]));
        assert!(!handled.ack.is_nack());
        assert!(state.is_interested_in("x"));
        assert_eq!(state.resource_version("x"), None);
        assert!(!state.is_interested_in("unknown"));
    }

    #[test]
    fn fresh_stream_restates_everything() {
        let mut state = state_with_initial_request_sent(&["x", "y"]);
        accept(&mut state, &response(vec![resource("x", "v1", b"a")], &[]));
        state.update_subscription_interest(&BTreeSet::new(), &names(&["y"]));

        state.mark_stream_fresh();
        assert!(state.subscription_update_pending());

        let request = state.get_next_request_ackless();
        assert!(request.node.is_some());
        assert_eq!(request.resource_names_subscribe, vec!["x".to_string()]);
        assert!(request.resource_names_unsubscribe.is_empty());
        assert_eq!(request.initial_resource_versions.len(), 1);
        assert_eq!(request.initial_resource_versions["x"], "v1");
    }

    #[test]
    fn waiting_resources_are_subscribed_without_version() {
        let mut state = state_with_initial_request_sent(&["x"]);
        state.mark_stream_fresh();

        let request = state.get_next_request_ackless();
        assert_eq!(request.resource_names_subscribe, vec!["x".to_string()]);
        assert!(request.initial_resource_versions.is_empty());
    }

    #[test]
    fn ack_is_attached_to_request() {
        let mut state = state_with_initial_request_sent(&["x"]);
        let mut ack = UpdateAck::new(TYPE_URL, "nonce-7", "system-7");
        ack.reject("bad");

        let request = state.get_next_request_with_ack(ack);
        assert_eq!(request.response_nonce, "nonce-7");
        assert_eq!(request.error_detail.unwrap().message, "bad");
        assert!(request.resource_names_subscribe.is_empty());
    }

    #[test]
    fn establishment_failure_keeps_interest() {
        let state = state_with_initial_request_sent(&["x"]);
        let update = state.handle_establishment_failure();
        assert!(matches!(
            update,
            ConfigUpdate::Failed {
                reason: ConfigUpdateFailureReason::ConnectionFailure,
                error: Some(Error::ConnectionFailure),
            }
        ));
        assert!(state.is_interested_in("x"));
    }
}
