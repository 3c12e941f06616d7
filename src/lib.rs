// src/lib.rs

//! Cookery
//!
//! Source-based package build and repository system. Recipes describe how a
//! package is built; a policy pipeline normalizes and packages the staged
//! install tree; the repository side stores the resulting troves behind
//! role-based access control.
//!
//! # Architecture
//!
//! - Recipes: an action list built through a typed registry, executed by a
//!   runner that tracks file attribution per action
//! - Macros: per-recipe expansion tables with shadow copies, no globals
//! - Policies: four ordered buckets over the staged destdir, errors
//!   accumulated per bucket
//! - Troves: packages, components, and groups, interned into SQLite
//! - Access: role permissions and trove grants consolidated into a
//!   per-instance cache, maintained inside the committing transaction

pub mod db;
pub mod deps;
mod error;
pub mod files;
pub mod flavor;
pub mod label;
pub mod macros;
pub mod magic;
pub mod patch;
pub mod policy;
pub mod recipe;
pub mod repository;
pub mod version;

pub use deps::{DepClass, Dependency, DependencySet};
pub use error::{Error, Result};
pub use flavor::{Flavor, FlavorClass, FlavorSense};
pub use label::{Label, LabelParseError};
pub use macros::Macros;
pub use recipe::{BuildResult, BuildRunner, GroupInfoRecipe, Recipe, RunnerConfig, UserInfoRecipe};
pub use repository::{AuthToken, Committer, Resolver, TroveCommit};
pub use version::{Branch, Revision, Version};
