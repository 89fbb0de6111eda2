//! Messenger surface of the controller: its actions and the connection
//! events it listens to.

use std::sync::Arc;

use permissions::{Subject, SubjectId};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::controller::actions;
use crate::{PermissionController, Result};

#[derive(Deserialize)]
struct SubjectParams {
    subject: SubjectId,
}

#[derive(Deserialize)]
struct TargetParams {
    subject: SubjectId,
    target: String,
}

impl PermissionController {
    pub(crate) fn register_actions(self: &Arc<Self>) -> Result<()> {
        self.register(actions::HAS_PERMISSION, |controller, params| {
            let TargetParams { subject, target } = serde_json::from_value(params)?;
            Ok(json!(controller.has_permission(&subject, &target)))
        })?;
        self.register(actions::GET_PERMISSIONS, |controller, params| {
            let SubjectParams { subject } = serde_json::from_value(params)?;
            Ok(serde_json::to_value(controller.get_permissions(&subject))?)
        })?;
        self.register(actions::GET_HISTORY, |controller, params| {
            let SubjectParams { subject } = serde_json::from_value(params)?;
            Ok(serde_json::to_value(controller.query_history(&subject)?)?)
        })?;
        self.register(actions::REVOKE_PERMISSION, |controller, params| {
            let TargetParams { subject, target } = serde_json::from_value(params)?;
            controller.revoke_permission(&subject, &target)?;
            Ok(Value::Null)
        })?;
        Ok(())
    }

    /// Register `handler` holding only a weak reference to the controller,
    /// so the messenger never keeps it alive.
    fn register<F>(self: &Arc<Self>, name: &str, handler: F) -> Result<()>
    where
        F: Fn(&PermissionController, Value) -> Result<Value> + Send + Sync + 'static,
    {
        let controller = Arc::downgrade(self);
        self.messenger.register_action_handler(name, move |params| {
            let controller = controller
                .upgrade()
                .ok_or_else(|| messenger::Error::handler("permission controller was dropped"))?;
            handler(&controller, params).map_err(|e| messenger::Error::handler(e.to_string()))
        })?;
        Ok(())
    }

    pub(crate) fn subscribe_connection_events(self: &Arc<Self>) -> Result<()> {
        let mut handles = Vec::new();

        if let Some(event) = &self.options.connected_event {
            handles.push(self.messenger.subscribe(event, |payload| {
                debug!(subject = %payload, "subject connected");
            })?);
        }

        if let Some(event) = &self.options.disconnected_event {
            let controller = Arc::downgrade(self);
            handles.push(self.messenger.subscribe(event, move |payload| {
                let Some(controller) = controller.upgrade() else {
                    return;
                };
                match Subject::deserialize(payload) {
                    Ok(subject) => controller.subject_disconnected(&subject.id),
                    Err(e) => warn!(error = %e, "ignoring malformed disconnect event"),
                }
            })?);
        }

        self.subscriptions.lock().extend(handles);
        Ok(())
    }

    /// Abandon `subject`'s pending requests and, if configured, revoke its
    /// grants.
    pub fn subject_disconnected(&self, subject: &SubjectId) {
        let abandoned = self.abandon_requests(subject);
        if abandoned > 0 {
            warn!(subject = %subject, abandoned, "abandoned pending permission requests");
        }
        if self.options.revoke_on_disconnect {
            if let Err(e) = self.revoke_all(subject) {
                warn!(subject = %subject, error = %e, "failed to revoke on disconnect");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use messenger::{Messenger, Restriction};
    use permissions::{
        HookTable, MergePolicy, SubjectKind, build_specifications, hook_names, targets,
    };
    use storage::Store;

    use super::*;
    use crate::EngineOptions;
    use crate::controller::NAMESPACE;

    const CONNECTED: &str = "Wallet:subjectConnected";
    const DISCONNECTED: &str = "Wallet:subjectDisconnected";

    fn wired(revoke_on_disconnect: bool) -> (Messenger, Arc<PermissionController>) {
        let wallet = Messenger::root("Wallet").unwrap();
        let messenger = wallet
            .restrict(Restriction::new(NAMESPACE).with_events([CONNECTED, DISCONNECTED]))
            .unwrap();
        let hooks = HookTable::new()
            .with(hook_names::GET_ALL_ACCOUNTS, |_| Ok(json!(["0xabc"])))
            .with(hook_names::HANDLE_KEYRING_REQUEST, Ok)
            .with(hook_names::SHOW_NOTIFICATION, |_| Ok(Value::Null));
        let options = EngineOptions {
            revoke_on_disconnect,
            ..EngineOptions::default().with_connection_events(CONNECTED, DISCONNECTED)
        };
        let controller = PermissionController::new(
            messenger,
            build_specifications(&hooks).unwrap(),
            MergePolicy::default(),
            Store::in_memory().unwrap(),
            options,
        )
        .unwrap();
        (wallet, controller)
    }

    #[test]
    fn actions_are_callable_by_children() {
        let (wallet, controller) = wired(false);
        let subject: SubjectId = "https://dapp.example".into();
        controller
            .request_permission(&subject, targets::ETH_ACCOUNTS, vec![])
            .unwrap();

        let ui = controller
            .messenger
            .restrict(Restriction::new("PermissionsUi").with_actions([
                actions::HAS_PERMISSION,
                actions::GET_PERMISSIONS,
                actions::REVOKE_PERMISSION,
            ]))
            .unwrap();

        let params = json!({ "subject": "https://dapp.example", "target": "eth_accounts" });
        assert_eq!(ui.call(actions::HAS_PERMISSION, params.clone()).unwrap(), json!(true));

        let listed = ui
            .call(actions::GET_PERMISSIONS, json!({ "subject": "https://dapp.example" }))
            .unwrap();
        assert_eq!(listed[0]["targetName"], json!("eth_accounts"));

        ui.call(actions::REVOKE_PERMISSION, params.clone()).unwrap();
        assert_eq!(ui.call(actions::HAS_PERMISSION, params).unwrap(), json!(false));

        // Not allow-listed to the UI.
        assert!(matches!(
            ui.call(actions::GET_HISTORY, json!({ "subject": "x" })),
            Err(messenger::Error::Forbidden { .. })
        ));
        drop(wallet);
    }

    #[test]
    fn handler_errors_surface_as_messenger_errors() {
        let (_wallet, controller) = wired(false);
        let err = controller
            .messenger
            .call(
                actions::REVOKE_PERMISSION,
                json!({ "subject": "a", "target": "eth_accounts" }),
            )
            .unwrap_err();
        assert!(matches!(err, messenger::Error::Handler(_)));

        let err = controller
            .messenger
            .call(actions::HAS_PERMISSION, json!({ "subject": "a" }))
            .unwrap_err();
        assert!(matches!(err, messenger::Error::Handler(_)));
    }

    #[test]
    fn disconnect_revokes_when_configured() {
        let (wallet, controller) = wired(true);
        let subject = Subject::new("https://dapp.example", SubjectKind::Page);
        controller
            .request_permission(&subject.id, targets::ETH_ACCOUNTS, vec![])
            .unwrap();

        wallet
            .publish(CONNECTED, serde_json::to_value(&subject).unwrap())
            .unwrap();
        assert!(controller.has_permission(&subject.id, targets::ETH_ACCOUNTS));

        wallet
            .publish(DISCONNECTED, serde_json::to_value(&subject).unwrap())
            .unwrap();
        assert!(!controller.has_permission(&subject.id, targets::ETH_ACCOUNTS));
        // History outlives the grant.
        assert!(
            controller
                .query_history(&subject.id)
                .unwrap()
                .contains_key(targets::ETH_ACCOUNTS)
        );
    }

    #[test]
    fn disconnect_keeps_grants_by_default() {
        let (wallet, controller) = wired(false);
        let subject = Subject::new("https://dapp.example", SubjectKind::Page);
        controller
            .request_permission(&subject.id, targets::ETH_ACCOUNTS, vec![])
            .unwrap();
        wallet
            .publish(DISCONNECTED, serde_json::to_value(&subject).unwrap())
            .unwrap();
        assert!(controller.has_permission(&subject.id, targets::ETH_ACCOUNTS));
    }

    #[test]
    fn dropping_the_controller_unsubscribes() {
        let (wallet, controller) = wired(false);
        drop(controller);
        let notified = wallet
            .publish(DISCONNECTED, json!({ "id": "a", "kind": "page" }))
            .unwrap();
        assert_eq!(notified, 0);
    }
}
