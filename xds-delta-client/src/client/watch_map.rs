//! Tracks the watches of one resource type and the union of their interest.
//!
//! Many watches can share a single wire-level subscription per resource
//! name. The [`WatchMap`] knows which watches want which names, so that:
//! - only names that become newly wanted by *any* watch are subscribed,
//! - only names that *no* watch wants any more are unsubscribed,
//! - each update from the server reaches exactly the watches interested in it.
//!
//! Updates are not delivered by the map itself. It plans deliveries while the
//! caller holds it, and the caller runs them once it has released its own
//! state, so that watch callbacks may freely add, change or remove watches.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::resource::xdstp::{self, XdstpName};
use crate::resource::DecodedResource;

/// Why a [`SubscriptionCallbacks::on_config_update_failed`] was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigUpdateFailureReason {
    /// The discovery stream could not be established.
    ConnectionFailure,
    /// The server did not answer within the initial fetch timeout.
    FetchTimedout,
    /// The server's update was rejected.
    UpdateRejected,
}

/// Receiver of updates for one watch.
///
/// Callbacks are invoked on the multiplexer's thread with none of its state
/// borrowed; they may call back into the multiplexer.
pub trait SubscriptionCallbacks {
    /// Resources were added, updated or removed.
    ///
    /// Returning `Err` rejects the update: the response is NACKed with the
    /// error's message. Other watches still receive the update.
    fn on_config_update(
        &self,
        added: &[DecodedResource],
        removed: &[String],
        system_version_info: &str,
    ) -> Result<()>;

    /// The subscription could not be updated.
    fn on_config_update_failed(&self, reason: ConfigUpdateFailureReason, error: Option<&Error>);
}

/// Identifies a watch within its [`WatchMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchId(u64);

/// A registered watch.
pub struct Watch {
    callbacks: Rc<dyn SubscriptionCallbacks>,
    resource_names: BTreeSet<String>,
}

impl Watch {
    /// The names this watch is interested in. Empty means wildcard.
    pub fn resource_names(&self) -> &BTreeSet<String> {
        &self.resource_names
    }
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch")
            .field("resource_names", &self.resource_names)
            .finish_non_exhaustive()
    }
}

/// Change to a subscription's interest caused by one watch update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddedRemoved {
    /// Names no watch wanted before.
    pub added: BTreeSet<String>,
    /// Names no watch wants any more.
    pub removed: BTreeSet<String>,
}

/// A planned [`SubscriptionCallbacks::on_config_update`] call.
pub struct PlannedUpdate {
    /// The watch to deliver to.
    pub watch: WatchId,
    /// Its callbacks.
    pub callbacks: Rc<dyn SubscriptionCallbacks>,
    /// Added or updated resources the watch is interested in.
    pub added: Vec<DecodedResource>,
    /// Removed resource names the watch is interested in.
    pub removed: Vec<String>,
}

impl fmt::Debug for PlannedUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlannedUpdate")
            .field("watch", &self.watch)
            .field("added", &self.added)
            .field("removed", &self.removed)
            .finish_non_exhaustive()
    }
}

/// The watches of one resource type.
pub struct WatchMap {
    use_namespace_matching: bool,
    next_watch_id: u64,
    // Ordered by id, i.e. by registration.
    watches: BTreeMap<WatchId, Watch>,
    // Watches with an empty interest set; they receive every resource.
    wildcard_watches: BTreeSet<WatchId>,
    // Resource name (or namespace) -> watches interested in it.
    watch_interest: HashMap<String, BTreeSet<WatchId>>,
}

impl WatchMap {
    /// Create an empty map.
    ///
    /// With `use_namespace_matching`, watch interest names namespaces and
    /// updates are routed by the namespace of the resource name.
    pub fn new(use_namespace_matching: bool) -> Self {
        Self {
            use_namespace_matching,
            next_watch_id: 1,
            watches: BTreeMap::new(),
            wildcard_watches: BTreeSet::new(),
            watch_interest: HashMap::new(),
        }
    }

    /// Register a watch. It starts out as a wildcard watch with no named
    /// interest; follow up with [`update_watch_interest`](Self::update_watch_interest).
    pub fn add_watch(&mut self, callbacks: Rc<dyn SubscriptionCallbacks>) -> WatchId {
        let id = WatchId(self.next_watch_id);
        self.next_watch_id += 1;
        self.watches.insert(
            id,
            Watch {
                callbacks,
                resource_names: BTreeSet::new(),
            },
        );
        self.wildcard_watches.insert(id);
        id
    }

    /// Replace the interest of `watch` with `names`.
    ///
    /// Returns the names that became wanted by the map as a whole, and the
    /// names that no watch wants any more.
    ///
    /// # Panics
    ///
    /// Panics if `watch` is not registered.
    pub fn update_watch_interest(
        &mut self,
        watch: WatchId,
        names: &BTreeSet<String>,
    ) -> AddedRemoved {
        let Some(entry) = self.watches.get_mut(&watch) else {
            panic!("update_watch_interest() called on unknown watch {watch:?}");
        };

        if names.is_empty() {
            self.wildcard_watches.insert(watch);
        } else {
            self.wildcard_watches.remove(&watch);
        }

        let newly_added: Vec<String> = names
            .difference(&entry.resource_names)
            .cloned()
            .collect();
        let newly_removed: Vec<String> = entry
            .resource_names
            .difference(names)
            .cloned()
            .collect();
        entry.resource_names = names.clone();

        AddedRemoved {
            added: self.find_additions(newly_added, watch),
            removed: self.find_removals(newly_removed, watch),
        }
    }

    /// Remove `watch` and its interest. Withdraw the interest first with
    /// [`update_watch_interest`](Self::update_watch_interest) to learn which
    /// names nobody wants any more.
    ///
    /// The watch is handed back so that the caller decides when its
    /// callbacks are dropped.
    pub fn remove_watch(&mut self, watch: WatchId) -> Option<Watch> {
        self.wildcard_watches.remove(&watch);
        let mut entry = self.watches.remove(&watch)?;
        let names = std::mem::take(&mut entry.resource_names);
        self.find_removals(names, watch);
        Some(entry)
    }

    /// Returns true if `watch` is registered.
    pub fn contains(&self, watch: WatchId) -> bool {
        self.watches.contains_key(&watch)
    }

    /// Number of registered watches.
    pub fn len(&self) -> usize {
        self.watches.len()
    }

    /// Returns true if no watch is registered.
    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// The union of every watch's named interest.
    pub fn interest(&self) -> BTreeSet<String> {
        self.watch_interest.keys().cloned().collect()
    }

    /// Plan the delivery of a delta update to the watches interested in it.
    ///
    /// Watches receive only the resources they are interested in. When the
    /// update carries nothing at all, every watch receives it empty.
    pub fn plan_config_update(
        &self,
        added: &[DecodedResource],
        removed: &[String],
    ) -> Vec<PlannedUpdate> {
        let mut per_watch: BTreeMap<WatchId, (Vec<DecodedResource>, Vec<String>)> =
            BTreeMap::new();

        for resource in added {
            for watch in self.watches_interested_in(resource.name()) {
                per_watch.entry(watch).or_default().0.push(resource.clone());
            }
        }
        for name in removed {
            for watch in self.watches_interested_in(name) {
                per_watch.entry(watch).or_default().1.push(name.clone());
            }
        }

        if added.is_empty() && removed.is_empty() {
            per_watch = self
                .watches
                .keys()
                .map(|id| (*id, Default::default()))
                .collect();
        }

        per_watch
            .into_iter()
            .filter_map(|(id, (added, removed))| {
                self.watches.get(&id).map(|watch| PlannedUpdate {
                    watch: id,
                    callbacks: Rc::clone(&watch.callbacks),
                    added,
                    removed,
                })
            })
            .collect()
    }

    /// Plan a failure notification to every watch.
    pub fn plan_config_update_failed(&self) -> Vec<(WatchId, Rc<dyn SubscriptionCallbacks>)> {
        self.watches
            .iter()
            .map(|(id, watch)| (*id, Rc::clone(&watch.callbacks)))
            .collect()
    }

    fn watches_interested_in(&self, resource_name: &str) -> BTreeSet<WatchId> {
        let mut interested = if self.use_namespace_matching {
            BTreeSet::new()
        } else {
            self.wildcard_watches.clone()
        };

        let parsed = if xdstp::has_xdstp_scheme(resource_name) {
            XdstpName::decode(resource_name).ok()
        } else {
            None
        };

        let key = match &parsed {
            Some(name) => name.encode(),
            None if self.use_namespace_matching => namespace_from_name(resource_name).to_owned(),
            None => resource_name.to_owned(),
        };

        let exact = self.watch_interest.get(&key);
        let matched = match (exact, &parsed) {
            (None, Some(name)) => self.watch_interest.get(&name.glob_collection().encode()),
            (exact, _) => exact,
        };
        if let Some(watches) = matched {
            interested.extend(watches.iter().copied());
        }
        interested
    }

    fn find_additions(&mut self, newly_added: Vec<String>, watch: WatchId) -> BTreeSet<String> {
        let mut added = BTreeSet::new();
        for name in newly_added {
            let watches = self.watch_interest.entry(name.clone()).or_default();
            if watches.is_empty() {
                added.insert(name);
            }
            watches.insert(watch);
        }
        added
    }

    fn find_removals(
        &mut self,
        newly_removed: impl IntoIterator<Item = String>,
        watch: WatchId,
    ) -> BTreeSet<String> {
        let mut removed = BTreeSet::new();
        for name in newly_removed {
            let Some(watches) = self.watch_interest.get_mut(&name) else {
                continue;
            };
            watches.remove(&watch);
            if watches.is_empty() {
                self.watch_interest.remove(&name);
                removed.insert(name);
            }
        }
        removed
    }
}

impl fmt::Debug for WatchMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchMap")
            .field("use_namespace_matching", &self.use_namespace_matching)
            .field("watches", &self.watches)
            .field("wildcard_watches", &self.wildcard_watches)
            .field("watch_interest", &self.watch_interest)
            .finish()
    }
}

/// The namespace of a resource: its name up to the last `/`.
fn namespace_from_name(resource_name: &str) -> &str {
    match resource_name.rfind('/') {
        Some(pos) => &resource_name[..pos],
        None => "",
    }
}
