mod common;

use std::sync::Arc;

use common::{Harness, harness, harness_on, harness_with, permission_error};
use engine::events;
use messenger::{Messenger, Restriction};
use parking_lot::Mutex;
use permissions::{
    Caveat, CaveatType, ExclusionMap, MergePolicy, MergeStrategy, SubjectId, targets,
};
use serde_json::{Value, json};
use storage::Store;

fn dapp() -> SubjectId {
    "https://dapp.example".into()
}

#[tokio::test]
async fn granted_accounts_are_restricted_and_recorded() {
    let Harness { controller, .. } = harness();

    controller
        .request_permission(
            &dapp(),
            targets::ETH_ACCOUNTS,
            vec![Caveat::restrict_returned_accounts(["0xabc"])],
        )
        .unwrap();

    let accounts = controller
        .execute_restricted_method(&dapp(), targets::ETH_ACCOUNTS, json!([]))
        .await
        .unwrap();
    assert_eq!(accounts, json!(["0xabc"]));

    let history = controller.query_history(&dapp()).unwrap();
    assert!(history[targets::ETH_ACCOUNTS].accounts.contains_key("0xabc"));
    assert!(!history[targets::ETH_ACCOUNTS].accounts.contains_key("0xdef"));
}

#[tokio::test]
async fn excluded_target_is_not_found_with_reason() {
    let mut exclusions = ExclusionMap::new();
    exclusions.insert(targets::ETH_ACCOUNTS.into(), "disabled".into());
    let Harness { controller, .. } = harness_with(&exclusions, |_| Ok(json!(["0xabc"])));

    let err = controller
        .request_permission(&dapp(), targets::ETH_ACCOUNTS, vec![])
        .unwrap_err();
    match permission_error(err) {
        permissions::Error::NotFound { target, reason } => {
            assert_eq!(target, targets::ETH_ACCOUNTS);
            assert_eq!(reason.as_deref(), Some("disabled"));
        }
        other => panic!("expected NotFound, got {other:?}"),
    }

    // Other targets are unaffected.
    controller
        .request_permission(&dapp(), targets::SNAP_NOTIFY, vec![])
        .unwrap();
}

#[tokio::test]
async fn execution_requires_a_grant() {
    let Harness { controller, .. } = harness();

    assert!(!controller.has_permission(&dapp(), targets::ETH_ACCOUNTS));
    let err = controller
        .execute_restricted_method(&dapp(), targets::ETH_ACCOUNTS, json!([]))
        .await
        .unwrap_err();
    assert!(matches!(
        permission_error(err),
        permissions::Error::Unauthorized { .. }
    ));
    // A denied call leaves no history behind.
    assert!(controller.query_history(&dapp()).unwrap().is_empty());

    controller
        .request_permission(&dapp(), targets::ETH_ACCOUNTS, vec![])
        .unwrap();
    let accounts = controller
        .execute_restricted_method(&dapp(), targets::ETH_ACCOUNTS, json!([]))
        .await
        .unwrap();
    assert_eq!(accounts, json!(["0xabc", "0xdef"]));
}

#[tokio::test]
async fn revoke_leaves_history() {
    let Harness { controller, .. } = harness();
    controller
        .request_permission(
            &dapp(),
            targets::ETH_ACCOUNTS,
            vec![Caveat::restrict_returned_accounts(["0xdef"])],
        )
        .unwrap();
    controller
        .execute_restricted_method(&dapp(), targets::ETH_ACCOUNTS, json!([]))
        .await
        .unwrap();
    let before = controller.query_history(&dapp()).unwrap();

    controller
        .revoke_permission(&dapp(), targets::ETH_ACCOUNTS)
        .unwrap();

    assert!(!controller.has_permission(&dapp(), targets::ETH_ACCOUNTS));
    assert_eq!(controller.query_history(&dapp()).unwrap(), before);

    let err = controller
        .execute_restricted_method(&dapp(), targets::ETH_ACCOUNTS, json!([]))
        .await
        .unwrap_err();
    assert!(matches!(
        permission_error(err),
        permissions::Error::Unauthorized { .. }
    ));
}

#[test]
fn granting_the_same_caveat_twice_is_idempotent() {
    let Harness { controller, .. } = harness();
    let caveats = vec![
        Caveat::restrict_returned_accounts(["0xabc"]),
        Caveat::LimitResponseLength(1),
    ];

    let once = controller
        .request_permission(&dapp(), targets::ETH_ACCOUNTS, caveats.clone())
        .unwrap();
    let twice = controller
        .request_permission(&dapp(), targets::ETH_ACCOUNTS, caveats)
        .unwrap();
    assert_eq!(once.caveats, twice.caveats);
}

#[test]
fn disallowed_caveats_are_rejected() {
    let Harness { controller, .. } = harness();
    let err = controller
        .request_permission(
            &dapp(),
            targets::SNAP_NOTIFY,
            vec![Caveat::restrict_returned_accounts(["0xabc"])],
        )
        .unwrap_err();
    assert!(matches!(
        permission_error(err),
        permissions::Error::InvalidCaveat(_)
    ));
}

#[tokio::test]
async fn caveats_apply_in_stored_order() {
    let Harness { controller, .. } = harness();
    controller
        .request_permission(
            &dapp(),
            targets::ETH_ACCOUNTS,
            vec![
                Caveat::restrict_returned_accounts(["0xdef", "0xabc"]),
                Caveat::LimitResponseLength(1),
            ],
        )
        .unwrap();

    let accounts = controller
        .execute_restricted_method(&dapp(), targets::ETH_ACCOUNTS, json!([]))
        .await
        .unwrap();
    // Filtered to the wallet's order, then truncated.
    assert_eq!(accounts, json!(["0xabc"]));
}

#[tokio::test]
async fn method_errors_propagate_unchanged() {
    let Harness { controller, .. } = harness();
    controller
        .request_permission(&dapp(), targets::SNAP_NOTIFY, vec![])
        .unwrap();

    let err = controller
        .execute_restricted_method(
            &dapp(),
            targets::SNAP_NOTIFY,
            json!({ "type": "email", "message": "hi" }),
        )
        .await
        .unwrap_err();
    assert!(matches!(permission_error(err), permissions::Error::Method(_)));
    assert!(controller.has_permission(&dapp(), targets::SNAP_NOTIFY));
}

#[tokio::test]
async fn forced_params_replace_the_request() {
    let Harness { controller, .. } = harness();
    controller
        .request_permission(
            &dapp(),
            targets::SNAP_NOTIFY,
            vec![Caveat::ForceParams(json!({ "type": "inApp", "message": "Forced" }))],
        )
        .unwrap();

    controller
        .execute_restricted_method(
            &dapp(),
            targets::SNAP_NOTIFY,
            json!({ "type": "email", "message": "ignored" }),
        )
        .await
        .unwrap();
}

#[test]
fn empty_restriction_is_forbidden_everything() {
    let parent = Messenger::root("Wallet").unwrap();
    for name in ["Wallet:listAccounts", "Wallet:sign", "Wallet:unregistered"] {
        parent
            .register_action_handler(name, |_| Ok(json!(null)))
            .unwrap();
    }
    let child = parent.restrict(Restriction::new("Sandbox")).unwrap();

    for name in ["Wallet:listAccounts", "Wallet:sign", "Wallet:unregistered", "Wallet:never"] {
        assert!(matches!(
            child.call(name, json!(null)),
            Err(messenger::Error::Forbidden { .. })
        ));
    }
}

#[test]
fn emptying_intersection_is_refused_and_the_store_still_loads() {
    let dir = std::env::temp_dir().join(format!("warden-scenarios-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("warden.db");
    let policy = || {
        MergePolicy::default()
            .with_strategy(CaveatType::RestrictReturnedAccounts, MergeStrategy::Intersection)
            .unwrap()
    };

    {
        let Harness { controller, .. } = harness_on(Store::open(&path).unwrap(), policy());
        controller
            .request_permission(
                &dapp(),
                targets::ETH_ACCOUNTS,
                vec![Caveat::restrict_returned_accounts(["0xabc"])],
            )
            .unwrap();

        let err = controller
            .request_permission(
                &dapp(),
                targets::ETH_ACCOUNTS,
                vec![Caveat::restrict_returned_accounts(["0xdef"])],
            )
            .unwrap_err();
        assert!(matches!(permission_error(err), permissions::Error::InvalidCaveat(_)));
        assert_eq!(controller.get_permitted_accounts(&dapp()), ["0xabc"]);
    }

    let Harness { controller, .. } = harness_on(Store::open(&path).unwrap(), policy());
    assert_eq!(controller.get_permitted_accounts(&dapp()), ["0xabc"]);

    std::fs::remove_dir_all(&dir).unwrap();
}

fn record_events(harness: &Harness, event: &str) -> Arc<Mutex<Vec<Value>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observer = harness
        .controller
        .messenger()
        .restrict(Restriction::new("Observer").with_events([event]))
        .unwrap();
    let sink = seen.clone();
    observer
        .subscribe(event, move |payload| sink.lock().push(payload.clone()))
        .unwrap();
    seen
}

#[tokio::test]
async fn removing_permitted_accounts() {
    let harness = harness();
    let changes = record_events(&harness, events::ACCOUNTS_CHANGED);
    let controller = &harness.controller;
    let solo: SubjectId = "https://solo.example".into();

    let err = controller
        .remove_permitted_account(&dapp(), "0xabc")
        .await
        .unwrap_err();
    assert!(matches!(permission_error(err), permissions::Error::Unauthorized { .. }));

    controller
        .request_permission(
            &dapp(),
            targets::ETH_ACCOUNTS,
            vec![Caveat::restrict_returned_accounts(["0xabc", "0xdef"])],
        )
        .unwrap();
    controller
        .request_permission(
            &solo,
            targets::ETH_ACCOUNTS,
            vec![Caveat::restrict_returned_accounts(["0xdef"])],
        )
        .unwrap();

    let err = controller
        .remove_permitted_account(&dapp(), "0x999")
        .await
        .unwrap_err();
    assert!(matches!(permission_error(err), permissions::Error::InvalidCaveat(_)));

    let err = controller
        .remove_permitted_account(&solo, "0xabc")
        .await
        .unwrap_err();
    assert!(matches!(permission_error(err), permissions::Error::NotFound { .. }));

    let narrowed = controller
        .remove_permitted_account(&dapp(), "0xdef")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(narrowed.permitted_accounts(), ["0xabc"]);
    assert_eq!(controller.get_permitted_accounts(&dapp()), ["0xabc"]);

    // Removing the last account revokes the grant.
    let remaining = controller
        .remove_permitted_account(&solo, "0xdef")
        .await
        .unwrap();
    assert!(remaining.is_none());
    assert!(!controller.has_permission(&solo, targets::ETH_ACCOUNTS));
    assert!(
        controller
            .query_history(&solo)
            .unwrap()
            .contains_key(targets::ETH_ACCOUNTS)
    );

    let changes = changes.lock();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0]["accounts"], json!(["0xabc"]));
    assert_eq!(changes[1]["subject"], json!("https://solo.example"));
    assert_eq!(changes[1]["accounts"], json!([]));
}

#[tokio::test]
async fn removing_an_account_everywhere() {
    let Harness { controller, .. } = harness();
    let both: SubjectId = "https://both.example".into();
    let only: SubjectId = "https://only.example".into();
    let other: SubjectId = "https://other.example".into();
    let unrestricted: SubjectId = "https://all.example".into();

    for (subject, accounts) in [
        (&both, vec!["0xabc", "0xdef"]),
        (&only, vec!["0xdef"]),
        (&other, vec!["0xabc"]),
    ] {
        controller
            .request_permission(
                subject,
                targets::ETH_ACCOUNTS,
                vec![Caveat::restrict_returned_accounts(accounts)],
            )
            .unwrap();
    }
    controller
        .request_permission(&unrestricted, targets::ETH_ACCOUNTS, vec![])
        .unwrap();

    let err = controller
        .remove_all_account_permissions("0x999")
        .await
        .unwrap_err();
    assert!(matches!(permission_error(err), permissions::Error::InvalidCaveat(_)));

    let mut changed = controller.remove_all_account_permissions("0xdef").await.unwrap();
    changed.sort();
    assert_eq!(changed, vec![both.clone(), only.clone()]);

    assert_eq!(controller.get_permitted_accounts(&both), ["0xabc"]);
    assert!(!controller.has_permission(&only, targets::ETH_ACCOUNTS));
    assert_eq!(controller.get_permitted_accounts(&other), ["0xabc"]);
    assert!(controller.has_permission(&unrestricted, targets::ETH_ACCOUNTS));
}
