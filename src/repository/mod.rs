// src/repository/mod.rs

//! Repository side: schema, identity, access control, and commits
//!
//! The build side produces troves; this side stores them. Everything lives
//! in one SQLite database reached through `db::Database`; access control is
//! role-based with a consolidated per-instance cache kept consistent inside
//! the mutating transaction.

pub mod accessmap;
pub mod auth;
pub mod commit;
pub mod resolver;
pub mod schema;
pub mod troves;
pub mod validator;

pub use commit::{Committer, FileEntry, RedirectTarget, TroveCommit};
pub use resolver::{AuthToken, Identity, Password, Resolver};
pub use troves::TroveType;
pub use validator::{AuthCache, Validator};
