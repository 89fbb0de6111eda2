//! Capability-scoped action/event bus.
//!
//! A [`Messenger`] owns exactly one namespace. Actions and events are named
//! `Namespace:name`, and a messenger may only register handlers for, and
//! publish events in, its own namespace.
//!
//! Child messengers are created with [`Messenger::restrict`]. The child sees
//! its ancestors only through the allow-lists given at construction, so the
//! maximum privilege of any subsystem is visible from that single call.
//!
//! # Example
//!
//! ```
//! use messenger::{Messenger, Restriction};
//! use serde_json::json;
//!
//! let root = Messenger::root("Wallet")?;
//! root.register_action_handler("Wallet:listAccounts", |_| Ok(json!(["0xabc"])))?;
//!
//! let child = root.restrict(
//!     Restriction::new("PermissionController").with_actions(["Wallet:listAccounts"]),
//! )?;
//! assert_eq!(child.call("Wallet:listAccounts", json!([]))?, json!(["0xabc"]));
//! # Ok::<(), messenger::Error>(())
//! ```

mod error;
mod messenger;
mod name;

pub use error::{Error, Result};
pub use messenger::{ActionHandler, EventListener, Messenger, Restriction, SubscriptionId};
pub use name::namespace_of;
