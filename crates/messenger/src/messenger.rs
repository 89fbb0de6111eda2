//! Messenger tree: namespaces, allow-lists, dispatch.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, trace};

use crate::name::{namespace_of, validate_namespace};
use crate::{Error, Result};

/// A registered action handler.
pub type ActionHandler = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// A registered event listener.
pub type EventListener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle returned by [`Messenger::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    event: String,
    id: u64,
}

impl SubscriptionId {
    /// The event this subscription listens to.
    pub fn event(&self) -> &str {
        &self.event
    }
}

/// Construction arguments for a child messenger.
#[derive(Debug, Clone, Default)]
pub struct Restriction {
    pub namespace: String,
    pub allowed_actions: Vec<String>,
    pub allowed_events: Vec<String>,
}

impl Restriction {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_actions.extend(actions.into_iter().map(Into::into));
        self
    }

    pub fn with_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_events.extend(events.into_iter().map(Into::into));
        self
    }
}

/// A namespaced, synchronous action/event bus.
///
/// Cloning a `Messenger` yields another handle to the same node.
#[derive(Clone)]
pub struct Messenger {
    node: Arc<Node>,
}

struct Node {
    namespace: String,
    parent: Option<Link>,
    actions: RwLock<HashMap<String, ActionHandler>>,
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    /// Subscriptions made through this node, wherever the event lives.
    owned_subscriptions: Mutex<HashSet<SubscriptionId>>,
    /// Per-thread count of handler invocations currently running on this node.
    in_flight: Mutex<HashMap<ThreadId, usize>>,
    next_subscription: AtomicU64,
    /// Namespaces claimed anywhere in this tree.
    claimed: Arc<Mutex<HashSet<String>>>,
}

/// The edge from a child to its parent, fixed at construction.
struct Link {
    parent: Arc<Node>,
    actions: HashSet<String>,
    events: HashSet<String>,
}

#[derive(Clone)]
struct Subscriber {
    id: u64,
    listener: EventListener,
}

impl Messenger {
    /// Create a root messenger owning `namespace`.
    pub fn root(namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        validate_namespace(&namespace)?;
        let claimed = Arc::new(Mutex::new(HashSet::from([namespace.clone()])));
        Ok(Self {
            node: Arc::new(Node::new(namespace, None, claimed)),
        })
    }

    /// The namespace owned by this messenger.
    pub fn namespace(&self) -> &str {
        &self.node.namespace
    }

    /// Register `handler` for `name`, which must live in this namespace.
    pub fn register_action_handler<F>(&self, name: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        self.ensure_own(&name)?;

        if self.node.is_in_flight_on_current_thread() {
            return Err(Error::Reentrant(name));
        }

        let mut actions = self.node.actions.write();
        if actions.contains_key(&name) {
            return Err(Error::Conflict(name));
        }
        debug!(namespace = %self.node.namespace, action = %name, "registered action handler");
        actions.insert(name, Arc::new(handler));
        Ok(())
    }

    /// Invoke the action `name` with `args`.
    ///
    /// The handler's result, including its error, is returned as is.
    pub fn call(&self, name: &str, args: Value) -> Result<Value> {
        let (owner, handler) = self.resolve_action(name)?;
        trace!(caller = %self.node.namespace, action = %name, "dispatching action");
        let _guard = InFlight::enter(&owner);
        handler(args)
    }

    /// Notify the current subscribers of `event`, in subscription order.
    ///
    /// Returns the number of listeners notified. Subscriptions added or
    /// removed by a listener take effect on the next publish.
    pub fn publish(&self, event: &str, payload: Value) -> Result<usize> {
        self.ensure_own(event)?;

        let snapshot: Vec<EventListener> = self
            .node
            .subscribers
            .read()
            .get(event)
            .map(|subs| subs.iter().map(|s| s.listener.clone()).collect())
            .unwrap_or_default();

        trace!(event = %event, listeners = snapshot.len(), "publishing event");
        for listener in &snapshot {
            listener(&payload);
        }
        Ok(snapshot.len())
    }

    /// Subscribe to `event`, which must be in this namespace or allow-listed
    /// down to this messenger.
    pub fn subscribe<F>(&self, event: &str, listener: F) -> Result<SubscriptionId>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let owner = self.resolve_event_owner(event)?;
        let id = owner.next_subscription.fetch_add(1, Ordering::Relaxed);
        owner
            .subscribers
            .write()
            .entry(event.to_string())
            .or_default()
            .push(Subscriber {
                id,
                listener: Arc::new(listener),
            });

        let handle = SubscriptionId {
            event: event.to_string(),
            id,
        };
        self.node.owned_subscriptions.lock().insert(handle.clone());
        debug!(namespace = %self.node.namespace, event = %event, "subscribed");
        Ok(handle)
    }

    /// Remove a subscription previously made through this messenger.
    pub fn unsubscribe(&self, handle: &SubscriptionId) -> Result<()> {
        if !self.node.owned_subscriptions.lock().remove(handle) {
            return Err(Error::NotFound(format!("subscription to {}", handle.event)));
        }
        let owner = self.resolve_event_owner(&handle.event)?;
        if let Some(subs) = owner.subscribers.write().get_mut(&handle.event) {
            subs.retain(|s| s.id != handle.id);
        }
        Ok(())
    }

    /// Create a child messenger scoped by `restriction`.
    ///
    /// Every allow-listed name must already be visible to this messenger;
    /// a child can never see more than its parent.
    pub fn restrict(&self, restriction: Restriction) -> Result<Messenger> {
        let Restriction {
            namespace,
            allowed_actions,
            allowed_events,
        } = restriction;
        validate_namespace(&namespace)?;

        for name in &allowed_actions {
            self.ensure_visible_action(name)?;
        }
        for name in &allowed_events {
            self.ensure_visible_event(name)?;
        }

        if !self.node.claimed.lock().insert(namespace.clone()) {
            return Err(Error::Conflict(namespace));
        }

        debug!(
            parent = %self.node.namespace,
            child = %namespace,
            actions = allowed_actions.len(),
            events = allowed_events.len(),
            "restricted messenger created"
        );

        let link = Link {
            parent: self.node.clone(),
            actions: allowed_actions.into_iter().collect(),
            events: allowed_events.into_iter().collect(),
        };
        Ok(Messenger {
            node: Arc::new(Node::new(namespace, Some(link), self.node.claimed.clone())),
        })
    }

    fn ensure_own(&self, name: &str) -> Result<()> {
        if namespace_of(name)? != self.node.namespace {
            return Err(self.forbidden(name));
        }
        Ok(())
    }

    fn forbidden(&self, name: &str) -> Error {
        Error::Forbidden {
            name: name.to_string(),
            namespace: self.node.namespace.clone(),
        }
    }

    fn resolve_action(&self, name: &str) -> Result<(Arc<Node>, ActionHandler)> {
        let namespace = namespace_of(name)?;

        let mut node = &self.node;
        loop {
            if node.namespace == namespace {
                return node
                    .actions
                    .read()
                    .get(name)
                    .cloned()
                    .map(|handler| (node.clone(), handler))
                    .ok_or_else(|| Error::NotFound(name.to_string()));
            }
            let Some(link) = &node.parent else {
                return Err(Error::NotFound(name.to_string()));
            };
            if !link.actions.contains(name) {
                return Err(self.forbidden(name));
            }
            node = &link.parent;
        }
    }

    fn resolve_event_owner(&self, event: &str) -> Result<Arc<Node>> {
        let namespace = namespace_of(event)?;

        let mut node = &self.node;
        loop {
            if node.namespace == namespace {
                return Ok(node.clone());
            }
            let Some(link) = &node.parent else {
                return Err(Error::NotFound(event.to_string()));
            };
            if !link.events.contains(event) {
                return Err(self.forbidden(event));
            }
            node = &link.parent;
        }
    }

    fn ensure_visible_action(&self, name: &str) -> Result<()> {
        match self.resolve_action(name) {
            // Allow-listing a handler that is registered later is fine.
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn ensure_visible_event(&self, name: &str) -> Result<()> {
        self.resolve_event_owner(name).map(|_| ())
    }
}

impl fmt::Debug for Messenger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Messenger")
            .field("namespace", &self.node.namespace)
            .field(
                "parent",
                &self.node.parent.as_ref().map(|l| l.parent.namespace.as_str()),
            )
            .field("actions", &self.node.actions.read().len())
            .finish()
    }
}

impl Node {
    fn new(namespace: String, parent: Option<Link>, claimed: Arc<Mutex<HashSet<String>>>) -> Self {
        Self {
            namespace,
            parent,
            actions: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            owned_subscriptions: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            claimed,
        }
    }

    fn is_in_flight_on_current_thread(&self) -> bool {
        self.in_flight
            .lock()
            .get(&thread::current().id())
            .is_some_and(|depth| *depth > 0)
    }
}

/// Marks a handler invocation on `node` for the current thread.
struct InFlight {
    node: Arc<Node>,
    thread: ThreadId,
}

impl InFlight {
    fn enter(node: &Arc<Node>) -> Self {
        let thread = thread::current().id();
        *node.in_flight.lock().entry(thread).or_insert(0) += 1;
        Self {
            node: node.clone(),
            thread,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut in_flight = self.node.in_flight.lock();
        if let Some(depth) = in_flight.get_mut(&self.thread) {
            *depth -= 1;
            if *depth == 0 {
                in_flight.remove(&self.thread);
            }
        }
    }
}
