mod common;

use std::collections::BTreeSet;

use common::{Harness, counting_harness, harness};
use permissions::{Caveat, SubjectId, targets};
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_calls_on_one_key_never_lose_accounts() {
    let Harness { controller, .. } = counting_harness();
    let subject: SubjectId = "https://dapp.example".into();
    controller
        .request_permission(&subject, targets::ETH_ACCOUNTS, vec![])
        .unwrap();

    let calls = (0..32).map(|_| {
        let controller = controller.clone();
        let subject = subject.clone();
        tokio::spawn(async move {
            controller
                .execute_restricted_method(&subject, targets::ETH_ACCOUNTS, json!([]))
                .await
        })
    });

    let mut returned = BTreeSet::new();
    for call in calls.collect::<Vec<_>>() {
        let accounts = call.await.unwrap().unwrap();
        returned.insert(accounts[0].as_str().unwrap().to_string());
    }
    assert_eq!(returned.len(), 32);

    let history = controller.query_history(&subject).unwrap();
    let recorded: BTreeSet<String> = history[targets::ETH_ACCOUNTS]
        .accounts
        .keys()
        .cloned()
        .collect();
    assert_eq!(recorded, returned);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reapprovals_merge_every_account() {
    let Harness { controller, .. } = harness();
    let subject: SubjectId = "https://dapp.example".into();

    let grants = (0..16).map(|i| {
        let controller = controller.clone();
        let subject = subject.clone();
        tokio::task::spawn_blocking(move || {
            controller.request_permission(
                &subject,
                targets::ETH_ACCOUNTS,
                vec![Caveat::restrict_returned_accounts([format!("0x{i:02x}")])],
            )
        })
    });
    for grant in grants.collect::<Vec<_>>() {
        grant.await.unwrap().unwrap();
    }

    let permitted: BTreeSet<_> = controller
        .get_permitted_accounts(&subject)
        .into_iter()
        .collect();
    let expected: BTreeSet<_> = (0..16).map(|i| format!("0x{i:02x}")).collect();
    assert_eq!(permitted, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_see_torn_caveat_lists() {
    let Harness { controller, .. } = harness();
    let subject: SubjectId = "https://dapp.example".into();
    controller
        .request_permission(
            &subject,
            targets::ETH_ACCOUNTS,
            vec![Caveat::restrict_returned_accounts(["0x00"])],
        )
        .unwrap();

    let writer = {
        let controller = controller.clone();
        let subject = subject.clone();
        tokio::task::spawn_blocking(move || {
            for i in 1..50 {
                controller
                    .request_permission(
                        &subject,
                        targets::ETH_ACCOUNTS,
                        vec![
                            Caveat::restrict_returned_accounts([format!("0x{i:02x}")]),
                            Caveat::LimitResponseLength(10),
                        ],
                    )
                    .unwrap();
            }
        })
    };

    let reader = {
        let controller = controller.clone();
        let subject = subject.clone();
        tokio::task::spawn_blocking(move || {
            let mut last = 0;
            for _ in 0..200 {
                let permitted = controller.get_permitted_accounts(&subject);
                // Accounts only accumulate under the union strategy.
                assert!(permitted.len() >= last);
                assert_eq!(permitted[0], "0x00");
                last = permitted.len();
            }
        })
    };

    writer.await.unwrap();
    reader.await.unwrap();
    assert_eq!(controller.get_permitted_accounts(&subject).len(), 50);
}
