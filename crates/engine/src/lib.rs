//! Warden enforcement engine.
//!
//! This crate owns the [`PermissionController`]: the single component that
//! holds subjects' grants, decides every restricted-method invocation, and
//! keeps the permission history.
//!
//! # Overview
//!
//! - **Deny by default**: [`PermissionController::execute_restricted_method`]
//!   fails with `Unauthorized` unless the subject holds a grant for the
//!   target. Granted calls run through the grant's caveats, in stored order.
//! - **Merge on re-approval**: [`PermissionController::request_permission`]
//!   folds new caveats into an existing grant using the configured
//!   [`permissions::MergePolicy`].
//! - **History outlives grants**: every approval and successful call is
//!   folded into the history ledger, which revocation never touches.
//! - **Approval flow**: [`PermissionController::request_with_approval`] parks
//!   a request until [`PermissionController::approve_request`] or
//!   [`PermissionController::reject_request`]; a disconnecting subject
//!   abandons its pending requests.
//!
//! The controller talks to the rest of the wallet only through its
//! [`messenger::Messenger`], which must own the [`NAMESPACE`] namespace.
//!
//! # Example
//!
//! ```no_run
//! use engine::{EngineOptions, PermissionController, NAMESPACE};
//! use messenger::{Messenger, Restriction};
//! use permissions::{build_specifications, hook_names, Caveat, HookTable, MergePolicy};
//! use serde_json::json;
//! use storage::Store;
//!
//! # async fn example() -> engine::Result<()> {
//! let wallet = Messenger::root("Wallet")?;
//! wallet.register_action_handler("Wallet:listAccounts", |_| Ok(json!(["0xabc", "0xdef"])))?;
//! let messenger = wallet.restrict(Restriction::new(NAMESPACE).with_actions(["Wallet:listAccounts"]))?;
//!
//! let hooks = HookTable::new()
//!     .bind_action(hook_names::GET_ALL_ACCOUNTS, &messenger, "Wallet:listAccounts")
//!     .with(hook_names::HANDLE_KEYRING_REQUEST, Ok)
//!     .with(hook_names::SHOW_NOTIFICATION, |_| Ok(json!(null)));
//! let specs = build_specifications(&hooks)?;
//!
//! let controller = PermissionController::new(
//!     messenger,
//!     specs,
//!     MergePolicy::default(),
//!     Store::open("warden.db")?,
//!     EngineOptions::default(),
//! )?;
//!
//! let dapp = "https://dapp.example".into();
//! controller.request_permission(&dapp, "eth_accounts", vec![Caveat::restrict_returned_accounts(["0xabc"])])?;
//! let accounts = controller.execute_restricted_method(&dapp, "eth_accounts", json!([])).await?;
//! assert_eq!(accounts, json!(["0xabc"]));
//! # Ok(())
//! # }
//! ```

mod approval;
mod controller;
mod error;
mod wiring;

pub use approval::{PendingRequest, RequestId};
pub use controller::{
    DEFAULT_ACTIVITY_LOG_LIMIT, EngineOptions, NAMESPACE, PermissionController, actions, events,
};
pub use error::{Error, Result};
pub use storage::{ActivityEntry, HistoryBySubject, HistoryEntry};
