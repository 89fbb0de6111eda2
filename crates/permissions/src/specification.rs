//! Permission specifications and the registry built from them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{Caveat, CaveatType, Error, Result, SubjectId};

/// Future returned by a restricted method.
pub type MethodFuture = BoxFuture<'static, Result<Value>>;

/// A bound, possibly caveat-decorated, restricted method implementation.
pub type RestrictedMethod = Arc<dyn Fn(MethodRequest) -> MethodFuture + Send + Sync>;

/// Extracts the accounts a successful call exposed, for the history ledger.
pub type ObservedAccounts = fn(&Value) -> Vec<String>;

/// Target name to exclusion reason.
pub type ExclusionMap = BTreeMap<String, String>;

/// Input to a restricted method.
#[derive(Debug, Clone)]
pub struct MethodRequest {
    pub subject: SubjectId,
    pub target: String,
    pub params: Value,
}

/// What a permission grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionKind {
    /// A callable operation.
    RestrictedMethod,
    /// Passive access to a resource.
    Endowment,
}

#[derive(Clone)]
enum Implementation {
    Method(RestrictedMethod),
    Endowment(Value),
}

/// A restrictable target: its kind, accepted caveats and implementation.
#[derive(Clone)]
pub struct PermissionSpecification {
    target_name: String,
    allowed_caveats: BTreeSet<CaveatType>,
    implementation: Implementation,
    observed_accounts: Option<ObservedAccounts>,
}

impl PermissionSpecification {
    pub fn restricted_method(
        target_name: impl Into<String>,
        allowed_caveats: impl IntoIterator<Item = CaveatType>,
        method: RestrictedMethod,
    ) -> Self {
        Self {
            target_name: target_name.into(),
            allowed_caveats: allowed_caveats.into_iter().collect(),
            implementation: Implementation::Method(method),
            observed_accounts: None,
        }
    }

    pub fn endowment(
        target_name: impl Into<String>,
        allowed_caveats: impl IntoIterator<Item = CaveatType>,
        endowment: Value,
    ) -> Self {
        Self {
            target_name: target_name.into(),
            allowed_caveats: allowed_caveats.into_iter().collect(),
            implementation: Implementation::Endowment(endowment),
            observed_accounts: None,
        }
    }

    /// Report the accounts a successful call returned to the history ledger.
    pub fn with_observed_accounts(mut self, extract: ObservedAccounts) -> Self {
        self.observed_accounts = Some(extract);
        self
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn kind(&self) -> PermissionKind {
        match self.implementation {
            Implementation::Method(_) => PermissionKind::RestrictedMethod,
            Implementation::Endowment(_) => PermissionKind::Endowment,
        }
    }

    pub fn allowed_caveats(&self) -> &BTreeSet<CaveatType> {
        &self.allowed_caveats
    }

    /// Reject any caveat whose type this target does not accept.
    pub fn validate_caveats(&self, caveats: &[Caveat]) -> Result<()> {
        for caveat in caveats {
            let ty = caveat.caveat_type();
            if !self.allowed_caveats.contains(&ty) {
                return Err(Error::InvalidCaveat(format!(
                    "caveat type '{ty}' is not allowed for '{}'",
                    self.target_name
                )));
            }
        }
        Ok(())
    }

    /// The implementation wrapped by `caveats`, in stored order: the first
    /// caveat sits closest to the implementation.
    pub fn decorated_method(&self, caveats: &[Caveat]) -> Result<RestrictedMethod> {
        let Implementation::Method(method) = &self.implementation else {
            return Err(Error::NotFound {
                target: self.target_name.clone(),
                reason: Some("endowments are not callable".into()),
            });
        };
        Ok(caveats
            .iter()
            .fold(method.clone(), |inner, caveat| caveat.decorate(inner)))
    }

    pub fn endowment_value(&self) -> Option<&Value> {
        match &self.implementation {
            Implementation::Endowment(value) => Some(value),
            Implementation::Method(_) => None,
        }
    }

    pub fn observed_accounts(&self, result: &Value) -> Vec<String> {
        self.observed_accounts
            .map(|extract| extract(result))
            .unwrap_or_default()
    }
}

impl fmt::Debug for PermissionSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionSpecification")
            .field("target_name", &self.target_name)
            .field("kind", &self.kind())
            .field("allowed_caveats", &self.allowed_caveats)
            .finish()
    }
}

/// The registry of specifications, immutable once built.
#[derive(Debug, Clone, Default)]
pub struct Specifications {
    specs: BTreeMap<String, PermissionSpecification>,
    excluded: ExclusionMap,
}

impl Specifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, spec: PermissionSpecification) -> Result<()> {
        if self.specs.contains_key(&spec.target_name) {
            return Err(Error::Conflict(format!(
                "duplicate specification '{}'",
                spec.target_name
            )));
        }
        self.specs.insert(spec.target_name.clone(), spec);
        Ok(())
    }

    /// Remove every excluded target, remembering why it was removed.
    pub fn apply_exclusions(mut self, exclusions: &ExclusionMap) -> Self {
        for (target, reason) in exclusions {
            if self.specs.remove(target).is_some() {
                debug!(target = %target, reason = %reason, "excluded permission target");
            }
            self.excluded.insert(target.clone(), reason.clone());
        }
        self
    }

    /// Look up a target; excluded targets fail with their reason.
    pub fn get(&self, target: &str) -> Result<&PermissionSpecification> {
        self.specs.get(target).ok_or_else(|| Error::NotFound {
            target: target.to_string(),
            reason: self.excluded.get(target).cloned(),
        })
    }

    pub fn contains(&self, target: &str) -> bool {
        self.specs.contains_key(target)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PermissionSpecification> {
        self.specs.values()
    }

    pub fn excluded(&self) -> impl Iterator<Item = (&str, &str)> {
        self.excluded
            .iter()
            .map(|(target, reason)| (target.as_str(), reason.as_str()))
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
