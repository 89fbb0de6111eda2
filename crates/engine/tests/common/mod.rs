#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use engine::{EngineOptions, NAMESPACE, PermissionController};
use messenger::{Messenger, Restriction};
use permissions::{ExclusionMap, HookTable, MergePolicy, build_specifications, hook_names};
use serde_json::{Value, json};
use storage::Store;

pub const LIST_ACCOUNTS: &str = "Wallet:listAccounts";
pub const CONNECTED: &str = "Wallet:subjectConnected";
pub const DISCONNECTED: &str = "Wallet:subjectDisconnected";

pub struct Harness {
    pub wallet: Messenger,
    pub controller: Arc<PermissionController>,
}

/// A wallet holding `0xabc` and `0xdef`.
pub fn harness() -> Harness {
    harness_with(&ExclusionMap::new(), |_| Ok(json!(["0xabc", "0xdef"])))
}

/// A wallet whose account list is produced by `accounts`.
pub fn harness_with<F>(exclusions: &ExclusionMap, accounts: F) -> Harness
where
    F: Fn(Value) -> messenger::Result<Value> + Send + Sync + 'static,
{
    build(exclusions, accounts, MergePolicy::default(), Store::in_memory().unwrap(), false)
}

/// Like [`harness`], but grants are revoked when a subject disconnects.
pub fn revoking_harness() -> Harness {
    build(
        &ExclusionMap::new(),
        |_| Ok(json!(["0xabc", "0xdef"])),
        MergePolicy::default(),
        Store::in_memory().unwrap(),
        true,
    )
}

/// Like [`harness`], on `store` and with `merge_policy`.
pub fn harness_on(store: Store, merge_policy: MergePolicy) -> Harness {
    build(
        &ExclusionMap::new(),
        |_| Ok(json!(["0xabc", "0xdef"])),
        merge_policy,
        store,
        false,
    )
}

fn build<F>(
    exclusions: &ExclusionMap,
    accounts: F,
    merge_policy: MergePolicy,
    store: Store,
    revoke_on_disconnect: bool,
) -> Harness
where
    F: Fn(Value) -> messenger::Result<Value> + Send + Sync + 'static,
{
    let wallet = Messenger::root("Wallet").unwrap();
    wallet.register_action_handler(LIST_ACCOUNTS, accounts).unwrap();

    let messenger = wallet
        .restrict(
            Restriction::new(NAMESPACE)
                .with_actions([LIST_ACCOUNTS])
                .with_events([CONNECTED, DISCONNECTED]),
        )
        .unwrap();
    let hooks = HookTable::new()
        .bind_action(hook_names::GET_ALL_ACCOUNTS, &messenger, LIST_ACCOUNTS)
        .with(hook_names::HANDLE_KEYRING_REQUEST, Ok)
        .with(hook_names::SHOW_NOTIFICATION, |_| Ok(Value::Null));
    let specs = build_specifications(&hooks)
        .unwrap()
        .apply_exclusions(exclusions);

    let options = EngineOptions {
        revoke_on_disconnect,
        ..EngineOptions::default().with_connection_events(CONNECTED, DISCONNECTED)
    };
    let controller =
        PermissionController::new(messenger, specs, merge_policy, store, options).unwrap();

    Harness { wallet, controller }
}

/// A wallet that hands out a fresh account on every call.
pub fn counting_harness() -> Harness {
    let counter = AtomicUsize::new(0);
    harness_with(&ExclusionMap::new(), move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        Ok(json!([format!("0x{n:04x}")]))
    })
}

pub fn permission_error(err: engine::Error) -> permissions::Error {
    match err {
        engine::Error::Permission(e) => e,
        other => panic!("expected a permission error, got {other:?}"),
    }
}
