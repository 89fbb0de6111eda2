//! The permission controller: grants, enforcement and history.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use messenger::{Messenger, SubscriptionId};
use parking_lot::{Mutex, RwLock};
use permissions::{
    Caveat, CaveatType, GrantId, MergePolicy, MethodRequest, Permission, Specifications,
    SubjectId, targets,
};
use serde_json::{Value, json};
use storage::{ActivityEntry, GrantRecord, HistoryBySubject, HistoryEntry, Store};
use tracing::{debug, info, warn};

use crate::approval::Parked;
use crate::{Error, RequestId, Result};

/// Namespace the controller's messenger must own.
pub const NAMESPACE: &str = "PermissionController";

/// Default bound of the activity log.
pub const DEFAULT_ACTIVITY_LOG_LIMIT: usize = 100;

/// Actions the controller registers on its namespace.
pub mod actions {
    pub const HAS_PERMISSION: &str = "PermissionController:hasPermission";
    pub const GET_PERMISSIONS: &str = "PermissionController:getPermissions";
    pub const GET_HISTORY: &str = "PermissionController:getHistory";
    pub const REVOKE_PERMISSION: &str = "PermissionController:revokePermission";
}

/// Events the controller publishes on its namespace.
pub mod events {
    pub const PERMISSION_GRANTED: &str = "PermissionController:permissionGranted";
    pub const PERMISSION_REVOKED: &str = "PermissionController:permissionRevoked";
    pub const APPROVAL_REQUESTED: &str = "PermissionController:approvalRequested";
    pub const ACCOUNTS_CHANGED: &str = "PermissionController:accountsChanged";
}

/// Controller settings.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Event announcing a new subject. Must be visible to the controller's
    /// messenger.
    pub connected_event: Option<String>,
    /// Event announcing a subject went away. Its payload is a
    /// [`permissions::Subject`].
    pub disconnected_event: Option<String>,
    /// Revoke every grant of a subject when it disconnects.
    pub revoke_on_disconnect: bool,
    pub activity_log_limit: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            connected_event: None,
            disconnected_event: None,
            revoke_on_disconnect: false,
            activity_log_limit: DEFAULT_ACTIVITY_LOG_LIMIT,
        }
    }
}

impl EngineOptions {
    pub fn with_connection_events(
        mut self,
        connected: impl Into<String>,
        disconnected: impl Into<String>,
    ) -> Self {
        self.connected_event = Some(connected.into());
        self.disconnected_event = Some(disconnected.into());
        self
    }
}

type Grants = HashMap<SubjectId, BTreeMap<String, Permission>>;

/// Outcome of taking one account out of an `eth_accounts` grant.
enum Withdrawal {
    Unchanged,
    Narrowed(Permission),
    Revoked,
}

/// The single owner of grants and history for one wallet.
///
/// All writes are serialized by the store lock. Reads of active grants go
/// through an in-memory snapshot that is only replaced after the store
/// write succeeded, so a reader never sees a half-updated caveat list.
pub struct PermissionController {
    pub(crate) messenger: Messenger,
    pub(crate) specifications: Specifications,
    merge_policy: MergePolicy,
    pub(crate) options: EngineOptions,
    store: Mutex<Store>,
    grants: RwLock<Grants>,
    pub(crate) pending: Mutex<HashMap<RequestId, Parked>>,
    pub(crate) subscriptions: Mutex<Vec<SubscriptionId>>,
}

impl PermissionController {
    /// Build a controller on `messenger`, which must own [`NAMESPACE`].
    ///
    /// Active grants are loaded from `store`. Grants for targets that are
    /// not registered (or excluded) stay in the store but are inactive.
    pub fn new(
        messenger: Messenger,
        specifications: Specifications,
        merge_policy: MergePolicy,
        store: Store,
        options: EngineOptions,
    ) -> Result<Arc<Self>> {
        let grants = load_grants(&store, &specifications)?;
        let subjects = grants.len();

        let controller = Arc::new(Self {
            messenger,
            specifications,
            merge_policy,
            options,
            store: Mutex::new(store),
            grants: RwLock::new(grants),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(Vec::new()),
        });
        controller.register_actions()?;
        controller.subscribe_connection_events()?;

        info!(
            targets = controller.specifications.len(),
            subjects, "permission controller ready"
        );
        Ok(controller)
    }

    /// The controller's messenger. Restrict it to hand a UI the
    /// controller's actions and events.
    pub fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    pub fn specifications(&self) -> &Specifications {
        &self.specifications
    }

    /// Grant `target` to `subject`, merging into any existing grant.
    ///
    /// Proposed caveats of the same type are folded together first, then
    /// merged type by type into the existing caveats by the merge policy.
    pub fn request_permission(
        &self,
        subject: &SubjectId,
        target: &str,
        caveats: Vec<Caveat>,
    ) -> Result<Permission> {
        let permission = self.grant(subject, target, caveats)?;
        self.publish(events::PERMISSION_GRANTED, serde_json::to_value(&permission)?);
        Ok(permission)
    }

    /// Validate, merge and persist a grant without announcing it.
    ///
    /// The grant and its history entry are written in one transaction, and
    /// the snapshot is only updated once that commits.
    pub(crate) fn grant(
        &self,
        subject: &SubjectId,
        target: &str,
        caveats: Vec<Caveat>,
    ) -> Result<Permission> {
        let spec = self.specifications.get(target)?;
        spec.validate_caveats(&caveats)?;
        let proposed = self.merge_policy.merge_all(&[], &caveats)?;

        let permission = {
            let mut store = self.store.lock();
            let permission = match self.get_permission(subject, target) {
                Some(mut existing) => {
                    existing.caveats = self.merge_policy.merge_all(&existing.caveats, &proposed)?;
                    existing.date_approved = Utc::now();
                    existing
                }
                None => Permission::new(subject.clone(), target, proposed),
            };

            store.grant_and_record(
                &record_from_permission(&permission)?,
                permission.permitted_accounts(),
            )?;
            self.grants
                .write()
                .entry(subject.clone())
                .or_default()
                .insert(target.to_string(), permission.clone());
            permission
        };

        info!(
            subject = %subject,
            target,
            grant = %permission.id,
            caveats = permission.caveats.len(),
            "permission granted"
        );
        Ok(permission)
    }

    pub fn has_permission(&self, subject: &SubjectId, target: &str) -> bool {
        self.grants
            .read()
            .get(subject)
            .is_some_and(|held| held.contains_key(target))
    }

    pub fn get_permission(&self, subject: &SubjectId, target: &str) -> Option<Permission> {
        self.grants
            .read()
            .get(subject)
            .and_then(|held| held.get(target))
            .cloned()
    }

    /// Every active grant of `subject`, ordered by target.
    pub fn get_permissions(&self, subject: &SubjectId) -> Vec<Permission> {
        self.grants
            .read()
            .get(subject)
            .map(|held| held.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Invoke `target` on behalf of `subject` through its caveats.
    ///
    /// Every attempt on a registered target lands in the activity log,
    /// including denials.
    pub async fn execute_restricted_method(
        &self,
        subject: &SubjectId,
        target: &str,
        params: Value,
    ) -> Result<Value> {
        let activity = ActivityEntry::begin(subject.as_str(), target);
        let result = self.invoke(subject, target, params).await;
        if self.specifications.contains(target) {
            self.log_activity(activity.finish(result.is_ok()));
        }
        result
    }

    async fn invoke(&self, subject: &SubjectId, target: &str, params: Value) -> Result<Value> {
        let spec = self.specifications.get(target)?;
        let Some(grant) = self.get_permission(subject, target) else {
            warn!(subject = %subject, target, "denied: no active grant");
            return Err(permissions::Error::unauthorized(subject.as_str(), target).into());
        };

        let method = spec.decorated_method(&grant.caveats)?;
        debug!(subject = %subject, target, caveats = grant.caveats.len(), "executing restricted method");
        let result = method(MethodRequest {
            subject: subject.clone(),
            target: target.to_string(),
            params,
        })
        .await?;

        let accounts = spec.observed_accounts(&result);
        self.store
            .lock()
            .record_history(subject.as_str(), target, &accounts, Utc::now())?;
        Ok(result)
    }

    fn log_activity(&self, entry: ActivityEntry) {
        let appended = self
            .store
            .lock()
            .append_activity(&entry, self.options.activity_log_limit);
        if let Err(e) = appended {
            warn!(error = %e, method = %entry.method, "failed to append activity log");
        }
    }

    /// Remove the grant of `target` from `subject`. History is kept.
    pub fn revoke_permission(&self, subject: &SubjectId, target: &str) -> Result<()> {
        {
            let store = self.store.lock();
            if !self.has_permission(subject, target) {
                return Err(permissions::Error::NotFound {
                    target: target.to_string(),
                    reason: Some(format!("'{subject}' holds no grant for it")),
                }
                .into());
            }
            store.delete_grant(subject.as_str(), target)?;
            self.forget(subject, |held| {
                held.remove(target);
            });
        }

        info!(subject = %subject, target, "permission revoked");
        self.publish_revoked(subject, [target]);
        Ok(())
    }

    /// Revoke every grant of `subject`, returning the revoked targets.
    pub fn revoke_all(&self, subject: &SubjectId) -> Result<Vec<String>> {
        let revoked = {
            let mut store = self.store.lock();
            let revoked = store.delete_grants_for(subject.as_str())?;
            self.forget(subject, BTreeMap::clear);
            revoked
        };

        if !revoked.is_empty() {
            info!(subject = %subject, count = revoked.len(), "revoked all permissions");
            self.publish_revoked(subject, revoked.iter().map(String::as_str));
        }
        Ok(revoked)
    }

    /// Revoke every grant of every subject, returning how many were active.
    pub fn clear_permissions(&self) -> Result<usize> {
        let revoked = {
            let store = self.store.lock();
            store.clear_grants()?;
            std::mem::take(&mut *self.grants.write())
        };

        let count = revoked.values().map(BTreeMap::len).sum();
        info!(count, "cleared all permissions");
        for (subject, held) in &revoked {
            self.publish_revoked(subject, held.keys().map(String::as_str));
        }
        Ok(count)
    }

    /// Drop `subject`'s entry from the snapshot once `edit` empties it.
    fn forget(&self, subject: &SubjectId, edit: impl FnOnce(&mut BTreeMap<String, Permission>)) {
        let mut grants = self.grants.write();
        if let Some(held) = grants.get_mut(subject) {
            edit(held);
            if held.is_empty() {
                grants.remove(subject);
            }
        }
    }

    /// Accounts `subject` may see through `eth_accounts`.
    pub fn get_permitted_accounts(&self, subject: &SubjectId) -> Vec<String> {
        self.get_permission(subject, targets::ETH_ACCOUNTS)
            .map(|grant| grant.permitted_accounts().to_vec())
            .unwrap_or_default()
    }

    /// Extend `subject`'s `eth_accounts` grant with one more account.
    ///
    /// The account must be held by the wallet, and the extension goes
    /// through the regular merge path.
    pub async fn add_permitted_account(
        &self,
        subject: &SubjectId,
        account: &str,
    ) -> Result<Permission> {
        let target = targets::ETH_ACCOUNTS;
        let Some(grant) = self.get_permission(subject, target) else {
            return Err(permissions::Error::unauthorized(subject.as_str(), target).into());
        };

        let restricted = grant.caveat(&CaveatType::RestrictReturnedAccounts).is_some();
        if !restricted || grant.permitted_accounts().iter().any(|a| a == account) {
            return Err(permissions::Error::Conflict(format!(
                "'{account}' is already permitted for '{subject}'"
            ))
            .into());
        }

        self.ensure_wallet_holds(subject, account).await?;
        self.request_permission(
            subject,
            target,
            vec![Caveat::restrict_returned_accounts([account])],
        )
    }

    /// Take `account` out of `subject`'s `eth_accounts` grant.
    ///
    /// Returns the narrowed grant, or `None` when `account` was the last
    /// permitted account and the grant was revoked.
    pub async fn remove_permitted_account(
        &self,
        subject: &SubjectId,
        account: &str,
    ) -> Result<Option<Permission>> {
        let target = targets::ETH_ACCOUNTS;
        if !self.has_permission(subject, target) {
            return Err(permissions::Error::unauthorized(subject.as_str(), target).into());
        }
        self.ensure_wallet_holds(subject, account).await?;

        let withdrawal = {
            let store = self.store.lock();
            self.withdraw_account(&store, subject, account)?
        };
        match withdrawal {
            Withdrawal::Unchanged => Err(permissions::Error::NotFound {
                target: target.to_string(),
                reason: Some(format!("'{account}' is not permitted for '{subject}'")),
            }
            .into()),
            Withdrawal::Narrowed(grant) => {
                self.announce_withdrawal(subject, account, Some(&grant));
                Ok(Some(grant))
            }
            Withdrawal::Revoked => {
                self.announce_withdrawal(subject, account, None);
                Ok(None)
            }
        }
    }

    /// Take `account` out of every subject's `eth_accounts` grant, for
    /// instance after the wallet stopped holding it. Returns the subjects
    /// whose grant changed.
    pub async fn remove_all_account_permissions(&self, account: &str) -> Result<Vec<SubjectId>> {
        self.ensure_wallet_holds(&SubjectId::new(NAMESPACE), account)
            .await?;

        let withdrawals = {
            let store = self.store.lock();
            let holders: Vec<SubjectId> = self
                .grants
                .read()
                .iter()
                .filter(|(_, held)| {
                    held.get(targets::ETH_ACCOUNTS)
                        .is_some_and(|grant| grant.permitted_accounts().iter().any(|a| a == account))
                })
                .map(|(subject, _)| subject.clone())
                .collect();

            let mut withdrawals = Vec::with_capacity(holders.len());
            for subject in holders {
                let withdrawal = self.withdraw_account(&store, &subject, account)?;
                withdrawals.push((subject, withdrawal));
            }
            withdrawals
        };

        let mut changed = Vec::new();
        for (subject, withdrawal) in withdrawals {
            match withdrawal {
                Withdrawal::Unchanged => continue,
                Withdrawal::Narrowed(grant) => {
                    self.announce_withdrawal(&subject, account, Some(&grant))
                }
                Withdrawal::Revoked => self.announce_withdrawal(&subject, account, None),
            }
            changed.push(subject);
        }
        Ok(changed)
    }

    /// Drop `account` from `subject`'s `restrictReturnedAccounts` caveat.
    /// Runs under the store lock.
    fn withdraw_account(
        &self,
        store: &Store,
        subject: &SubjectId,
        account: &str,
    ) -> Result<Withdrawal> {
        let target = targets::ETH_ACCOUNTS;
        let Some(mut grant) = self.get_permission(subject, target) else {
            return Ok(Withdrawal::Unchanged);
        };

        let emptied = {
            let Some(Caveat::RestrictReturnedAccounts(accounts)) = grant
                .caveats
                .iter_mut()
                .find(|c| c.caveat_type() == CaveatType::RestrictReturnedAccounts)
            else {
                return Ok(Withdrawal::Unchanged);
            };
            let before = accounts.len();
            accounts.retain(|a| a != account);
            if accounts.len() == before {
                return Ok(Withdrawal::Unchanged);
            }
            accounts.is_empty()
        };

        if emptied {
            store.delete_grant(subject.as_str(), target)?;
            self.forget(subject, |held| {
                held.remove(target);
            });
            return Ok(Withdrawal::Revoked);
        }

        store.put_grant(&record_from_permission(&grant)?)?;
        self.grants
            .write()
            .entry(subject.clone())
            .or_default()
            .insert(target.to_string(), grant.clone());
        Ok(Withdrawal::Narrowed(grant))
    }

    fn announce_withdrawal(&self, subject: &SubjectId, account: &str, remaining: Option<&Permission>) {
        let accounts = remaining.map(Permission::permitted_accounts).unwrap_or_default();
        match remaining {
            Some(_) => info!(subject = %subject, account, "permitted account removed"),
            None => {
                info!(subject = %subject, account, "last permitted account removed; permission revoked");
                self.publish_revoked(subject, [targets::ETH_ACCOUNTS]);
            }
        }
        self.publish(
            events::ACCOUNTS_CHANGED,
            json!({ "subject": subject, "accounts": accounts }),
        );
    }

    /// Fail with `InvalidCaveat` unless the wallet holds `account`.
    ///
    /// Asks the undecorated `eth_accounts` implementation, so no subject's
    /// caveats hide an account from the check.
    async fn ensure_wallet_holds(&self, caller: &SubjectId, account: &str) -> Result<()> {
        let target = targets::ETH_ACCOUNTS;
        let spec = self.specifications.get(target)?;
        let all_accounts = spec.decorated_method(&[])?;
        let held = all_accounts(MethodRequest {
            subject: caller.clone(),
            target: target.to_string(),
            params: Value::Null,
        })
        .await?;
        if !spec.observed_accounts(&held).iter().any(|a| a == account) {
            return Err(permissions::Error::InvalidCaveat(format!(
                "wallet does not hold account '{account}'"
            ))
            .into());
        }
        Ok(())
    }

    /// Record that `subject` was shown `accounts` and announce the change.
    pub fn notify_accounts_changed(&self, subject: &SubjectId, accounts: &[String]) -> Result<()> {
        let target = targets::ETH_ACCOUNTS;
        if !self.has_permission(subject, target) {
            return Err(permissions::Error::unauthorized(subject.as_str(), target).into());
        }

        if !accounts.is_empty() {
            self.store
                .lock()
                .record_history(subject.as_str(), target, accounts, Utc::now())?;
        }
        self.publish(
            events::ACCOUNTS_CHANGED,
            json!({ "subject": subject, "accounts": accounts }),
        );
        Ok(())
    }

    /// The resource an endowment grants, for a subject holding it.
    pub fn get_endowments(&self, subject: &SubjectId, target: &str) -> Result<Value> {
        let spec = self.specifications.get(target)?;
        let Some(value) = spec.endowment_value() else {
            return Err(permissions::Error::NotFound {
                target: target.to_string(),
                reason: Some("not an endowment".into()),
            }
            .into());
        };
        if !self.has_permission(subject, target) {
            warn!(subject = %subject, target, "denied: no active grant");
            return Err(permissions::Error::unauthorized(subject.as_str(), target).into());
        }
        Ok(value.clone())
    }

    /// History of `subject`, keyed by target. Includes revoked targets.
    pub fn query_history(&self, subject: &SubjectId) -> Result<BTreeMap<String, HistoryEntry>> {
        Ok(self.store.lock().query_history(subject.as_str())?)
    }

    pub fn all_history(&self) -> Result<HistoryBySubject> {
        Ok(self.store.lock().all_history()?)
    }

    /// The newest `limit` activity entries, oldest first.
    pub fn activity_log(&self, limit: usize) -> Result<Vec<ActivityEntry>> {
        Ok(self.store.lock().activity(limit)?)
    }

    pub(crate) fn publish(&self, event: &str, payload: Value) {
        if let Err(e) = self.messenger.publish(event, payload) {
            warn!(event, error = %e, "failed to publish event");
        }
    }

    fn publish_revoked<'a>(&self, subject: &SubjectId, targets: impl IntoIterator<Item = &'a str>) {
        let targets: Vec<&str> = targets.into_iter().collect();
        self.publish(
            events::PERMISSION_REVOKED,
            json!({ "subject": subject, "targets": targets }),
        );
    }
}

impl Drop for PermissionController {
    fn drop(&mut self) {
        for handle in self.subscriptions.get_mut().drain(..) {
            if let Err(e) = self.messenger.unsubscribe(&handle) {
                debug!(event = handle.event(), error = %e, "unsubscribe on drop failed");
            }
        }
    }
}

fn load_grants(store: &Store, specifications: &Specifications) -> Result<Grants> {
    let mut grants = Grants::new();
    for record in store.all_grants()? {
        if !specifications.contains(&record.target) {
            warn!(
                subject = %record.subject,
                target = %record.target,
                "stored grant targets an unavailable permission; leaving it inactive"
            );
            continue;
        }
        let permission = permission_from_record(record)?;
        grants
            .entry(permission.invoker.clone())
            .or_default()
            .insert(permission.target_name.clone(), permission);
    }
    Ok(grants)
}

fn record_from_permission(permission: &Permission) -> Result<GrantRecord> {
    Ok(GrantRecord {
        id: permission.id.0,
        subject: permission.invoker.as_str().to_string(),
        target: permission.target_name.clone(),
        caveats: serde_json::to_value(&permission.caveats)?,
        granted_at: permission.date_approved,
    })
}

fn permission_from_record(record: GrantRecord) -> Result<Permission> {
    Ok(Permission {
        id: GrantId(record.id),
        target_name: record.target,
        caveats: serde_json::from_value(record.caveats)?,
        invoker: SubjectId::new(record.subject),
        date_approved: record.granted_at,
    })
}
