//! Per-type caveat merge policy.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Caveat, CaveatType, Error, Result};

/// How a re-approved caveat combines with the one already granted.
///
/// Every strategy is associative and idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Keep existing entries in order, append new ones.
    Union,
    /// Keep existing entries that the proposal also lists.
    Intersection,
    /// Keep the smaller numeric bound.
    Minimum,
    /// The proposal wins.
    Replace,
}

impl MergeStrategy {
    /// Whether this strategy can merge caveats of type `ty`.
    pub fn supports(self, ty: &CaveatType) -> bool {
        match self {
            Self::Replace => true,
            Self::Union | Self::Intersection => matches!(
                ty,
                CaveatType::RestrictReturnedAccounts | CaveatType::FilterResponse | CaveatType::Other(_)
            ),
            Self::Minimum => matches!(ty, CaveatType::LimitResponseLength | CaveatType::Other(_)),
        }
    }

    /// Merge `proposed` into `existing`. Both must have the same type.
    pub fn merge(self, existing: &Caveat, proposed: &Caveat) -> Result<Caveat> {
        use Caveat::*;

        if existing.caveat_type() != proposed.caveat_type() {
            return Err(Error::InvalidCaveat(format!(
                "cannot merge {} into {}",
                proposed.caveat_type(),
                existing.caveat_type()
            )));
        }

        let merged = match (self, existing, proposed) {
            (Self::Replace, _, proposed) => Some(proposed.clone()),

            (Self::Union, RestrictReturnedAccounts(a), RestrictReturnedAccounts(b)) => {
                Some(RestrictReturnedAccounts(union(a, b)))
            }
            (Self::Union, FilterResponse(a), FilterResponse(b)) => Some(FilterResponse(union(a, b))),
            (Self::Intersection, RestrictReturnedAccounts(a), RestrictReturnedAccounts(b)) => {
                Some(RestrictReturnedAccounts(intersection(a, b)))
            }
            (Self::Intersection, FilterResponse(a), FilterResponse(b)) => {
                Some(FilterResponse(intersection(a, b)))
            }
            (Self::Minimum, LimitResponseLength(a), LimitResponseLength(b)) => {
                Some(LimitResponseLength(*a.min(b)))
            }

            (strategy, Opaque { caveat_type, value: a }, Opaque { value: b, .. }) => {
                merge_opaque(strategy, a, b).map(|value| Opaque {
                    caveat_type: caveat_type.clone(),
                    value,
                })
            }

            _ => None,
        };

        let merged = merged.ok_or_else(|| {
            Error::InvalidCaveat(format!(
                "{self} merge does not apply to {} caveats with value {}",
                existing.caveat_type(),
                proposed.value()
            ))
        })?;
        // A merge result is persisted, so it must parse back.
        merged.validate()?;
        Ok(merged)
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Union => "union",
            Self::Intersection => "intersection",
            Self::Minimum => "minimum",
            Self::Replace => "replace",
        };
        f.write_str(name)
    }
}

fn merge_opaque(strategy: MergeStrategy, a: &Value, b: &Value) -> Option<Value> {
    match (strategy, a, b) {
        (MergeStrategy::Union, Value::Array(a), Value::Array(b)) => Some(Value::Array(union(a, b))),
        (MergeStrategy::Intersection, Value::Array(a), Value::Array(b)) => {
            Some(Value::Array(intersection(a, b)))
        }
        (MergeStrategy::Minimum, Value::Number(x), Value::Number(y)) => {
            let smaller = match (x.as_f64(), y.as_f64()) {
                (Some(x), Some(y)) if y < x => b,
                _ => a,
            };
            Some(smaller.clone())
        }
        _ => None,
    }
}

fn union<T: PartialEq + Clone>(existing: &[T], proposed: &[T]) -> Vec<T> {
    let mut out = existing.to_vec();
    for item in proposed {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

fn intersection<T: PartialEq + Clone>(existing: &[T], proposed: &[T]) -> Vec<T> {
    existing
        .iter()
        .filter(|item| proposed.contains(item))
        .cloned()
        .collect()
}

/// The merge strategy table, keyed by caveat type.
#[derive(Debug, Clone, Default)]
pub struct MergePolicy {
    overrides: HashMap<CaveatType, MergeStrategy>,
}

impl MergePolicy {
    /// Built-in strategy for a caveat type.
    pub fn default_strategy(ty: &CaveatType) -> MergeStrategy {
        match ty {
            CaveatType::RestrictReturnedAccounts | CaveatType::FilterResponse => MergeStrategy::Union,
            CaveatType::LimitResponseLength => MergeStrategy::Minimum,
            CaveatType::ForceParams | CaveatType::Other(_) => MergeStrategy::Replace,
        }
    }

    /// Override the strategy for one caveat type.
    pub fn with_strategy(mut self, ty: CaveatType, strategy: MergeStrategy) -> Result<Self> {
        if !strategy.supports(&ty) {
            return Err(Error::InvalidCaveat(format!(
                "{strategy} merge does not apply to {ty} caveats"
            )));
        }
        self.overrides.insert(ty, strategy);
        Ok(self)
    }

    pub fn strategy_for(&self, ty: &CaveatType) -> MergeStrategy {
        self.overrides
            .get(ty)
            .copied()
            .unwrap_or_else(|| Self::default_strategy(ty))
    }

    pub fn merge(&self, existing: &Caveat, proposed: &Caveat) -> Result<Caveat> {
        self.strategy_for(&existing.caveat_type())
            .merge(existing, proposed)
    }

    /// Fold `proposed` into `existing`, type by type.
    ///
    /// Existing caveats keep their position; caveats of a type not yet
    /// present are appended in proposal order.
    pub fn merge_all(&self, existing: &[Caveat], proposed: &[Caveat]) -> Result<Vec<Caveat>> {
        let mut merged = existing.to_vec();
        for caveat in proposed {
            let ty = caveat.caveat_type();
            match merged.iter().position(|c| c.caveat_type() == ty) {
                Some(index) => {
                    let next = self.merge(&merged[index], caveat)?;
                    merged[index] = next;
                }
                None => merged.push(caveat.clone()),
            }
        }
        Ok(merged)
    }
}
