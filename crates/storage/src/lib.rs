//! SQLite-backed persistence for Warden permissions.
//!
//! This crate stores the three durable records of the permission system:
//!
//! 1. **Grants**: the active permission of a subject for a target, with its
//!    caveats in their JSON wire shape.
//!
//! 2. **History**: when each target was last approved or used by each
//!    subject, and which accounts it exposed. History outlives revocation
//!    and its timestamps never move backward.
//!
//! 3. **Activity**: a bounded log of restricted-method invocations.
//!
//! # Example
//!
//! ```no_run
//! use chrono::Utc;
//! use storage::{ActivityEntry, Store};
//!
//! let mut store = Store::open("warden.db")?;
//!
//! store.record_history("https://dapp.example", "eth_accounts", &["0xabc".into()], Utc::now())?;
//! let history = store.query_history("https://dapp.example")?;
//! println!("{:?}", history["eth_accounts"].accounts);
//!
//! let entry = ActivityEntry::begin("https://dapp.example", "eth_accounts").finish(true);
//! store.append_activity(&entry, 100)?;
//! # Ok::<(), storage::Error>(())
//! ```

mod activity;
mod error;
mod grant;
mod history;
mod store;

pub use activity::ActivityEntry;
pub use error::{Error, Result};
pub use grant::GrantRecord;
pub use history::HistoryEntry;
pub use store::{HistoryBySubject, Store};
