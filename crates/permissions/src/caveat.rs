//! Caveat types, wire shape, and method decorators.

use std::fmt;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::specification::{MethodRequest, RestrictedMethod};
use crate::{Error, Result};

const RESTRICT_RETURNED_ACCOUNTS: &str = "restrictReturnedAccounts";
const FILTER_RESPONSE: &str = "filterResponse";
const LIMIT_RESPONSE_LENGTH: &str = "limitResponseLength";
const FORCE_PARAMS: &str = "forceParams";

/// The type tag of a caveat.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CaveatType {
    RestrictReturnedAccounts,
    FilterResponse,
    LimitResponseLength,
    ForceParams,
    /// A caveat type unknown to this crate.
    Other(String),
}

impl CaveatType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::RestrictReturnedAccounts => RESTRICT_RETURNED_ACCOUNTS,
            Self::FilterResponse => FILTER_RESPONSE,
            Self::LimitResponseLength => LIMIT_RESPONSE_LENGTH,
            Self::ForceParams => FORCE_PARAMS,
            Self::Other(name) => name,
        }
    }
}

impl From<&str> for CaveatType {
    fn from(name: &str) -> Self {
        match name {
            RESTRICT_RETURNED_ACCOUNTS => Self::RestrictReturnedAccounts,
            FILTER_RESPONSE => Self::FilterResponse,
            LIMIT_RESPONSE_LENGTH => Self::LimitResponseLength,
            FORCE_PARAMS => Self::ForceParams,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for CaveatType {
    fn from(name: String) -> Self {
        Self::from(name.as_str())
    }
}

impl From<CaveatType> for String {
    fn from(ty: CaveatType) -> Self {
        match ty {
            CaveatType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for CaveatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire shape of a caveat: `{ "type": ..., "value": ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCaveat {
    #[serde(rename = "type")]
    pub caveat_type: String,
    pub value: Value,
}

/// A typed constraint attached to a permission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCaveat", into = "RawCaveat")]
pub enum Caveat {
    /// Only these accounts may appear in the result, in result order.
    RestrictReturnedAccounts(Vec<String>),
    /// Only these values may appear in an array result.
    FilterResponse(Vec<Value>),
    /// Array results are truncated to this length.
    LimitResponseLength(u64),
    /// Params are replaced by this value before invocation.
    ForceParams(Value),
    /// Unknown caveat type, carried without interpretation.
    Opaque { caveat_type: String, value: Value },
}

impl Caveat {
    pub fn restrict_returned_accounts<I, S>(accounts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::RestrictReturnedAccounts(dedup(accounts.into_iter().map(Into::into).collect()))
    }

    /// Parse a caveat from its wire shape.
    pub fn from_json(value: Value) -> Result<Self> {
        let raw: RawCaveat = serde_json::from_value(value)
            .map_err(|e| Error::InvalidCaveat(format!("malformed caveat: {e}")))?;
        Self::try_from(raw)
    }

    pub fn caveat_type(&self) -> CaveatType {
        match self {
            Self::RestrictReturnedAccounts(_) => CaveatType::RestrictReturnedAccounts,
            Self::FilterResponse(_) => CaveatType::FilterResponse,
            Self::LimitResponseLength(_) => CaveatType::LimitResponseLength,
            Self::ForceParams(_) => CaveatType::ForceParams,
            Self::Opaque { caveat_type, .. } => CaveatType::Other(caveat_type.clone()),
        }
    }

    pub fn value(&self) -> Value {
        match self {
            Self::RestrictReturnedAccounts(accounts) => Value::from(accounts.clone()),
            Self::FilterResponse(values) => Value::Array(values.clone()),
            Self::LimitResponseLength(limit) => Value::from(*limit),
            Self::ForceParams(value) | Self::Opaque { value, .. } => value.clone(),
        }
    }

    /// Check that this caveat would parse back from its wire shape.
    pub fn validate(&self) -> Result<()> {
        Self::try_from(RawCaveat::from(self.clone())).map(drop)
    }

    /// Wrap `method` so this caveat shapes its params and result.
    pub fn decorate(&self, method: RestrictedMethod) -> RestrictedMethod {
        let caveat = self.clone();
        Arc::new(move |mut request: MethodRequest| {
            let method = method.clone();
            let caveat = caveat.clone();
            async move {
                request.params = caveat.transform_params(request.params);
                let result = method(request).await?;
                caveat.transform_result(result)
            }
            .boxed()
        })
    }

    fn transform_params(&self, params: Value) -> Value {
        match self {
            Self::ForceParams(forced) => forced.clone(),
            _ => params,
        }
    }

    fn transform_result(&self, result: Value) -> Result<Value> {
        match self {
            Self::RestrictReturnedAccounts(permitted) => {
                let items = self.expect_array(result)?;
                Ok(Value::Array(
                    items
                        .into_iter()
                        .filter(|item| {
                            item.as_str()
                                .is_some_and(|account| permitted.iter().any(|p| p == account))
                        })
                        .collect(),
                ))
            }
            Self::FilterResponse(allowed) => {
                let items = self.expect_array(result)?;
                Ok(Value::Array(
                    items.into_iter().filter(|item| allowed.contains(item)).collect(),
                ))
            }
            Self::LimitResponseLength(limit) => {
                let mut items = self.expect_array(result)?;
                items.truncate(usize::try_from(*limit).unwrap_or(usize::MAX));
                Ok(Value::Array(items))
            }
            Self::ForceParams(_) | Self::Opaque { .. } => Ok(result),
        }
    }

    fn expect_array(&self, result: Value) -> Result<Vec<Value>> {
        match result {
            Value::Array(items) => Ok(items),
            other => Err(Error::Method(format!(
                "{} caveat requires an array result, got {other}",
                self.caveat_type()
            ))),
        }
    }
}

impl TryFrom<RawCaveat> for Caveat {
    type Error = Error;

    fn try_from(raw: RawCaveat) -> Result<Self> {
        let RawCaveat { caveat_type, value } = raw;
        let ty = CaveatType::from(caveat_type.as_str());
        let invalid = |why: &str| Error::InvalidCaveat(format!("{ty}: {why}"));

        match &ty {
            CaveatType::RestrictReturnedAccounts => {
                let accounts: Vec<String> = serde_json::from_value(value)
                    .map_err(|_| invalid("value must be an array of account addresses"))?;
                if accounts.is_empty() {
                    return Err(invalid("at least one account is required"));
                }
                Ok(Self::RestrictReturnedAccounts(dedup(accounts)))
            }
            CaveatType::FilterResponse => match value {
                Value::Array(values) => Ok(Self::FilterResponse(dedup(values))),
                _ => Err(invalid("value must be an array")),
            },
            CaveatType::LimitResponseLength => value
                .as_u64()
                .map(Self::LimitResponseLength)
                .ok_or_else(|| invalid("value must be a non-negative integer")),
            CaveatType::ForceParams => Ok(Self::ForceParams(value)),
            CaveatType::Other(name) if name.is_empty() => {
                Err(Error::InvalidCaveat("empty caveat type".into()))
            }
            CaveatType::Other(_) => Ok(Self::Opaque { caveat_type, value }),
        }
    }
}

impl From<Caveat> for RawCaveat {
    fn from(caveat: Caveat) -> Self {
        Self {
            caveat_type: caveat.caveat_type().into(),
            value: caveat.value(),
        }
    }
}

fn dedup<T: PartialEq>(items: Vec<T>) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo() -> RestrictedMethod {
        Arc::new(|request: MethodRequest| async move { Ok::<_, Error>(request.params) }.boxed())
    }

    fn request(params: Value) -> MethodRequest {
        MethodRequest {
            subject: "https://dapp.example".into(),
            target: "test_method".into(),
            params,
        }
    }

    #[test]
    fn parses_known_caveats() {
        let caveat = Caveat::from_json(json!({
            "type": "restrictReturnedAccounts",
            "value": ["0xabc", "0xabc", "0xdef"],
        }))
        .unwrap();
        assert_eq!(caveat, Caveat::restrict_returned_accounts(["0xabc", "0xdef"]));

        let caveat =
            Caveat::from_json(json!({ "type": "limitResponseLength", "value": 2 })).unwrap();
        assert_eq!(caveat, Caveat::LimitResponseLength(2));
    }

    #[test]
    fn unknown_types_are_opaque() {
        let caveat =
            Caveat::from_json(json!({ "type": "rpcOrigin", "value": { "dapps": true } })).unwrap();
        assert_eq!(caveat.caveat_type(), CaveatType::Other("rpcOrigin".into()));
        assert_eq!(caveat.value(), json!({ "dapps": true }));
    }

    #[test]
    fn rejects_malformed_values() {
        for bad in [
            json!({ "type": "restrictReturnedAccounts", "value": "0xabc" }),
            json!({ "type": "restrictReturnedAccounts", "value": [] }),
            json!({ "type": "limitResponseLength", "value": -1 }),
            json!({ "type": "filterResponse", "value": {} }),
            json!({ "type": "", "value": null }),
            json!({ "value": [] }),
        ] {
            assert!(
                matches!(Caveat::from_json(bad.clone()), Err(Error::InvalidCaveat(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn wire_shape() {
        let caveat = Caveat::restrict_returned_accounts(["0xabc"]);
        assert_eq!(
            serde_json::to_value(&caveat).unwrap(),
            json!({ "type": "restrictReturnedAccounts", "value": ["0xabc"] })
        );
    }

    #[tokio::test]
    async fn restrict_returned_accounts_filters_result() {
        let method = Caveat::restrict_returned_accounts(["0xabc"]).decorate(echo());
        let result = method(request(json!(["0xdef", "0xabc", "0x123"]))).await.unwrap();
        assert_eq!(result, json!(["0xabc"]));
    }

    #[tokio::test]
    async fn limit_truncates_and_force_replaces_params() {
        let method = Caveat::LimitResponseLength(1).decorate(echo());
        let method = Caveat::ForceParams(json!(["forced", "extra"])).decorate(method);
        let result = method(request(json!(["original"]))).await.unwrap();
        assert_eq!(result, json!(["forced"]));
    }

    #[tokio::test]
    async fn list_caveats_reject_non_array_results() {
        let method = Caveat::FilterResponse(vec![json!(1)]).decorate(echo());
        let err = method(request(json!({ "not": "an array" }))).await.unwrap_err();
        assert!(matches!(err, Error::Method(_)));
    }
}
