//! The embedding host: a root wallet messenger, its hooks, and the
//! permission controller wired beneath it.

use std::sync::Arc;

use engine::{NAMESPACE, PermissionController};
use messenger::{Messenger, Restriction};
use permissions::{HookTable, Subject, build_specifications, hook_names};
use serde_json::{Value, json};
use storage::Store;
use tracing::info;

use crate::config::Config;
use crate::error::Result;

pub const WALLET: &str = "Wallet";
pub const LIST_ACCOUNTS: &str = "Wallet:listAccounts";
pub const HANDLE_KEYRING_REQUEST: &str = "Wallet:handleKeyringRequest";
pub const SHOW_NOTIFICATION: &str = "Wallet:showNotification";
pub const SUBJECT_CONNECTED: &str = "Wallet:subjectConnected";
pub const SUBJECT_DISCONNECTED: &str = "Wallet:subjectDisconnected";

pub struct Host {
    wallet: Messenger,
    pub controller: Arc<PermissionController>,
}

impl Host {
    pub fn new(config: &Config, store: Store) -> Result<Self> {
        let wallet = Messenger::root(WALLET)?;
        register_wallet_actions(&wallet, config.wallet.accounts.clone())?;

        let messenger = wallet.restrict(
            Restriction::new(NAMESPACE)
                .with_actions([LIST_ACCOUNTS, HANDLE_KEYRING_REQUEST, SHOW_NOTIFICATION])
                .with_events([SUBJECT_CONNECTED, SUBJECT_DISCONNECTED]),
        )?;

        let hooks = HookTable::new()
            .bind_action(hook_names::GET_ALL_ACCOUNTS, &messenger, LIST_ACCOUNTS)
            .bind_action(hook_names::HANDLE_KEYRING_REQUEST, &messenger, HANDLE_KEYRING_REQUEST)
            .bind_action(hook_names::SHOW_NOTIFICATION, &messenger, SHOW_NOTIFICATION);
        let specifications =
            build_specifications(&hooks)?.apply_exclusions(&config.permissions.exclusions);

        let controller = PermissionController::new(
            messenger,
            specifications,
            config.merge_policy()?,
            store,
            config.engine_options(SUBJECT_CONNECTED, SUBJECT_DISCONNECTED),
        )?;

        Ok(Self { wallet, controller })
    }

    /// Announce that `subject` connected.
    pub fn connect(&self, subject: &Subject) -> Result<()> {
        self.wallet
            .publish(SUBJECT_CONNECTED, serde_json::to_value(subject)?)?;
        Ok(())
    }

    /// Announce that `subject` went away.
    pub fn disconnect(&self, subject: &Subject) -> Result<()> {
        self.wallet
            .publish(SUBJECT_DISCONNECTED, serde_json::to_value(subject)?)?;
        Ok(())
    }
}

fn register_wallet_actions(wallet: &Messenger, accounts: Vec<String>) -> Result<()> {
    let listed = accounts.clone();
    wallet.register_action_handler(LIST_ACCOUNTS, move |_| Ok(json!(listed)))?;

    wallet.register_action_handler(HANDLE_KEYRING_REQUEST, move |params| {
        let method = params["request"]["method"].as_str().unwrap_or_default();
        match method {
            "keyring_listAccounts" => Ok(Value::Array(
                accounts
                    .iter()
                    .map(|address| json!({ "address": address }))
                    .collect(),
            )),
            other => Err(messenger::Error::handler(format!(
                "keyring method '{other}' is not supported by this host"
            ))),
        }
    })?;

    wallet.register_action_handler(SHOW_NOTIFICATION, |params| {
        let origin = params["origin"].as_str().unwrap_or_default();
        let message = params["notification"]["message"].as_str().unwrap_or_default();
        info!(origin, message, "notification");
        println!("[{origin}] {message}");
        Ok(Value::Null)
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use permissions::{Caveat, SubjectKind, targets};

    fn host(toml: &str) -> Host {
        let config = Config::parse(toml).unwrap();
        Host::new(&config, Store::in_memory().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn wallet_accounts_flow_through_the_controller() {
        let host = host("[wallet]\naccounts = [\"0xabc\", \"0xdef\"]");
        let dapp = Subject::new("https://dapp.example", SubjectKind::Page);

        host.controller
            .request_permission(
                &dapp.id,
                targets::ETH_ACCOUNTS,
                vec![Caveat::restrict_returned_accounts(["0xdef"])],
            )
            .unwrap();
        let accounts = host
            .controller
            .execute_restricted_method(&dapp.id, targets::ETH_ACCOUNTS, json!([]))
            .await
            .unwrap();
        assert_eq!(accounts, json!(["0xdef"]));
    }

    #[tokio::test]
    async fn keyring_requests_reach_the_host() {
        let host = host("");
        let snap = Subject::new("npm:@example/keyring", SubjectKind::Module);
        host.controller
            .request_permission(&snap.id, targets::SNAP_MANAGE_ACCOUNTS, vec![])
            .unwrap();

        let listed = host
            .controller
            .execute_restricted_method(
                &snap.id,
                targets::SNAP_MANAGE_ACCOUNTS,
                json!({ "method": "keyring_listAccounts" }),
            )
            .await
            .unwrap();
        assert_eq!(listed, json!([]));

        let err = host
            .controller
            .execute_restricted_method(
                &snap.id,
                targets::SNAP_MANAGE_ACCOUNTS,
                json!({ "method": "keyring_deleteAccount" }),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn configured_exclusions_apply() {
        let host = host("[permissions.exclusions]\nsnap_notify = \"off\"");
        assert!(!host.controller.specifications().contains(targets::SNAP_NOTIFY));
        assert!(host.controller.specifications().contains(targets::ETH_ACCOUNTS));
    }

    #[test]
    fn disconnect_revokes_when_configured() {
        let host = host("[permissions]\nrevoke_on_disconnect = true");
        let dapp = Subject::new("https://dapp.example", SubjectKind::Page);
        host.connect(&dapp).unwrap();
        host.controller
            .request_permission(&dapp.id, targets::ETH_ACCOUNTS, vec![])
            .unwrap();
        host.disconnect(&dapp).unwrap();
        assert!(!host.controller.has_permission(&dapp.id, targets::ETH_ACCOUNTS));
    }
}
