//! Restricted-method permissions: caveats, specifications and the catalog.
//!
//! Core principle: **every restricted operation is denied unless a subject
//! holds a grant for it**, and a grant may only carry caveats its target
//! declares.
//!
//! # Overview
//!
//! - [`Caveat`] is a typed constraint attached to a [`Permission`]. Known
//!   caveat types are variants of a closed enum; unknown ones travel as
//!   [`Caveat::Opaque`].
//! - [`MergePolicy`] is the per-type table deciding how a re-approved caveat
//!   combines with the one already granted.
//! - [`PermissionSpecification`] declares a restrictable target, the caveat
//!   types it accepts, and its bound implementation.
//! - [`build_specifications`] binds the closed catalog against a
//!   [`HookTable`] supplied by the host, failing at boot on a missing hook.

mod caveat;
mod catalog;
mod error;
mod hooks;
mod merge;
mod permission;
mod specification;
mod subject;

pub use catalog::{
    CATALOG_VERSION, EthAccounts, NetworkAccessEndowment, RpcEndowment, SnapManageAccounts,
    SnapNotify, SpecificationBuilder, build_specifications, hook_names, targets,
};
pub use caveat::{Caveat, CaveatType, RawCaveat};
pub use error::{Error, Result};
pub use hooks::{Hook, HookTable, SelectHooks};
pub use merge::{MergePolicy, MergeStrategy};
pub use permission::{GrantId, Permission};
pub use specification::{
    ExclusionMap, MethodFuture, MethodRequest, ObservedAccounts, PermissionKind,
    PermissionSpecification, RestrictedMethod, Specifications,
};
pub use subject::{Subject, SubjectId, SubjectKind};
