//! The closed catalog of specification builders.

use std::sync::Arc;

use futures_util::FutureExt;
use serde_json::{Value, json};
use tracing::debug;

use crate::{
    CaveatType, Error, Hook, HookTable, MethodRequest, PermissionSpecification, RestrictedMethod,
    Result, SelectHooks, Specifications,
};

/// Bumped whenever a builder is added, removed, or changes its hooks.
pub const CATALOG_VERSION: u32 = 1;

/// Target names of the catalog.
pub mod targets {
    pub const ETH_ACCOUNTS: &str = "eth_accounts";
    pub const SNAP_MANAGE_ACCOUNTS: &str = "snap_manageAccounts";
    pub const SNAP_NOTIFY: &str = "snap_notify";
    pub const NETWORK_ACCESS: &str = "endowment:network-access";
    pub const RPC: &str = "endowment:rpc";
}

/// Hook names the catalog's builders require.
pub mod hook_names {
    pub const GET_ALL_ACCOUNTS: &str = "getAllAccounts";
    pub const HANDLE_KEYRING_REQUEST: &str = "handleKeyringRequest";
    pub const SHOW_NOTIFICATION: &str = "showNotification";
}

const NOTIFICATION_MAX_LENGTH: usize = 50;

/// Builds one specification from its typed hooks.
pub trait SpecificationBuilder {
    const TARGET: &'static str;
    type Hooks: SelectHooks;

    fn build(hooks: Self::Hooks) -> PermissionSpecification;
}

/// Bind every catalog builder against `table`.
///
/// Fails with [`Error::MissingHook`] when a builder's hook is absent; this
/// is a boot-time check, never a call-time one.
pub fn build_specifications(table: &HookTable) -> Result<Specifications> {
    let mut specs = Specifications::new();
    register::<EthAccounts>(&mut specs, table)?;
    register::<SnapManageAccounts>(&mut specs, table)?;
    register::<SnapNotify>(&mut specs, table)?;
    register::<NetworkAccessEndowment>(&mut specs, table)?;
    register::<RpcEndowment>(&mut specs, table)?;
    debug!(version = CATALOG_VERSION, targets = specs.len(), "built permission specifications");
    Ok(specs)
}

fn register<B: SpecificationBuilder>(specs: &mut Specifications, table: &HookTable) -> Result<()> {
    let hooks = B::Hooks::select(B::TARGET, table)?;
    let spec = B::build(hooks);
    debug_assert_eq!(spec.target_name(), B::TARGET);
    specs.insert(spec)
}

/// Wrap a synchronous hook call as a restricted method.
fn hook_method<F>(f: F) -> RestrictedMethod
where
    F: Fn(MethodRequest) -> Result<Value> + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |request: MethodRequest| {
        let f = f.clone();
        async move { f(request) }.boxed()
    })
}

fn string_array(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// `eth_accounts`: the accounts a subject may see.
pub struct EthAccounts;

pub struct EthAccountsHooks {
    get_all_accounts: Hook,
}

impl SelectHooks for EthAccountsHooks {
    fn select(target: &str, table: &HookTable) -> Result<Self> {
        Ok(Self {
            get_all_accounts: table.require(target, hook_names::GET_ALL_ACCOUNTS)?,
        })
    }
}

impl SpecificationBuilder for EthAccounts {
    const TARGET: &'static str = targets::ETH_ACCOUNTS;
    type Hooks = EthAccountsHooks;

    fn build(hooks: Self::Hooks) -> PermissionSpecification {
        let get_all_accounts = hooks.get_all_accounts;
        let method = hook_method(move |_request| {
            let accounts = get_all_accounts(Value::Null)?;
            if !accounts.is_array() {
                return Err(Error::Method(format!(
                    "{} hook returned {accounts}, expected an array",
                    hook_names::GET_ALL_ACCOUNTS
                )));
            }
            Ok(accounts)
        });

        PermissionSpecification::restricted_method(
            Self::TARGET,
            [CaveatType::RestrictReturnedAccounts, CaveatType::LimitResponseLength],
            method,
        )
        .with_observed_accounts(string_array)
    }
}

/// `snap_manageAccounts`: forwards keyring requests from a module.
pub struct SnapManageAccounts;

pub struct SnapManageAccountsHooks {
    handle_keyring_request: Hook,
}

impl SelectHooks for SnapManageAccountsHooks {
    fn select(target: &str, table: &HookTable) -> Result<Self> {
        Ok(Self {
            handle_keyring_request: table.require(target, hook_names::HANDLE_KEYRING_REQUEST)?,
        })
    }
}

impl SpecificationBuilder for SnapManageAccounts {
    const TARGET: &'static str = targets::SNAP_MANAGE_ACCOUNTS;
    type Hooks = SnapManageAccountsHooks;

    fn build(hooks: Self::Hooks) -> PermissionSpecification {
        let handle = hooks.handle_keyring_request;
        let method = hook_method(move |request| {
            handle(json!({
                "origin": request.subject.as_str(),
                "request": request.params,
            }))
        });

        PermissionSpecification::restricted_method(
            Self::TARGET,
            [CaveatType::FilterResponse],
            method,
        )
    }
}

/// `snap_notify`: shows a short notification on behalf of a module.
pub struct SnapNotify;

pub struct SnapNotifyHooks {
    show_notification: Hook,
}

impl SelectHooks for SnapNotifyHooks {
    fn select(target: &str, table: &HookTable) -> Result<Self> {
        Ok(Self {
            show_notification: table.require(target, hook_names::SHOW_NOTIFICATION)?,
        })
    }
}

impl SpecificationBuilder for SnapNotify {
    const TARGET: &'static str = targets::SNAP_NOTIFY;
    type Hooks = SnapNotifyHooks;

    fn build(hooks: Self::Hooks) -> PermissionSpecification {
        let show = hooks.show_notification;
        let method = hook_method(move |request| {
            validate_notification(&request.params)?;
            show(json!({
                "origin": request.subject.as_str(),
                "notification": request.params,
            }))
        });

        PermissionSpecification::restricted_method(Self::TARGET, [CaveatType::ForceParams], method)
    }
}

fn validate_notification(params: &Value) -> Result<()> {
    let kind = params.get("type").and_then(Value::as_str);
    if !matches!(kind, Some("inApp" | "native")) {
        return Err(Error::Method(
            "notification type must be \"inApp\" or \"native\"".into(),
        ));
    }
    match params.get("message").and_then(Value::as_str) {
        Some(message) if !message.is_empty() && message.chars().count() <= NOTIFICATION_MAX_LENGTH => {
            Ok(())
        }
        _ => Err(Error::Method(format!(
            "notification message must be 1 to {NOTIFICATION_MAX_LENGTH} characters"
        ))),
    }
}

/// `endowment:network-access`: network globals for a module.
pub struct NetworkAccessEndowment;

impl SpecificationBuilder for NetworkAccessEndowment {
    const TARGET: &'static str = targets::NETWORK_ACCESS;
    type Hooks = ();

    fn build(_hooks: ()) -> PermissionSpecification {
        PermissionSpecification::endowment(
            Self::TARGET,
            [],
            json!(["fetch", "Request", "Headers", "Response"]),
        )
    }
}

/// `endowment:rpc`: lets a module receive RPC requests.
pub struct RpcEndowment;

impl SpecificationBuilder for RpcEndowment {
    const TARGET: &'static str = targets::RPC;
    type Hooks = ();

    fn build(_hooks: ()) -> PermissionSpecification {
        PermissionSpecification::endowment(
            Self::TARGET,
            [CaveatType::Other("rpcOrigin".into())],
            Value::Null,
        )
    }
}
