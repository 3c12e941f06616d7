// src/error.rs

//! Crate-wide error taxonomy
//!
//! Error kinds are grouped the way callers handle them: input validation,
//! authorization, integrity, not-found, conflict, build/policy, and
//! infrastructure. Database driver errors are mapped to this taxonomy in
//! `db::map_sqlite_error` so callers never match on SQLite error codes.

use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // --- Input validation ---
    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("macro name \"{0}\" contains illegal character: \".\"")]
    MacroIllegalKey(String),

    #[error("unknown macro \"{0}\" - check for spelling mistakes")]
    MacroKeyError(String),

    // --- Authorization ---
    /// Deny-by-default. Unknown resources and denied access deliberately
    /// collapse into this one message so callers cannot probe for existence.
    #[error("insufficient permission")]
    InsufficientPermission,

    #[error("invalid entitlement")]
    InvalidEntitlement,

    #[error("entitlement timeout for {0:?}")]
    EntitlementTimeout(Vec<String>),

    // --- Integrity ---
    #[error("integrity error: {0}")]
    IntegrityError(String),

    #[error("trove checksum does not match precalculated value: {0}")]
    TroveChecksumInvalid(String),

    #[error("repository schema version {found:?} is outside supported range (major {supported})")]
    SchemaVersionError { found: (i32, i32), supported: i32 },

    // --- Not found ---
    #[error("trove not found: {0}")]
    TroveNotFound(String),

    #[error("trove missing: {name}={version}")]
    TroveMissing { name: String, version: String },

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("role not found: {0}")]
    RoleNotFound(String),

    #[error("unknown entitlement class: {0}")]
    UnknownEntitlementClass(String),

    // --- Conflict ---
    #[error("user already exists: {0}")]
    UserAlreadyExists(String),

    #[error("role already exists: {0}")]
    RoleAlreadyExists(String),

    #[error("permission already exists")]
    PermissionAlreadyExists,

    #[error("entitlement key already exists")]
    EntitlementKeyAlreadyExists,

    #[error("entitlement class already exists: {0}")]
    EntitlementClassAlreadyExists(String),

    // --- Repository operations ---
    #[error("repository name mismatch: expected one of {expected:?}, got {found}")]
    RepositoryMismatch { expected: Vec<String>, found: String },

    // --- Build / policy ---
    #[error("recipe file error: {0}")]
    RecipeFileError(String),

    #[error("cook error at {action} (line {line}): {message}")]
    CookError {
        action: String,
        line: u32,
        message: String,
    },

    /// Grouped failure for one policy bucket. Individual violations are
    /// collected so one run surfaces every problem in the bucket.
    #[error("policy error:\n{}", .0.join("\n"))]
    PolicyError(Vec<String>),

    // --- Infrastructure ---
    #[error("database error: {0}")]
    DatabaseError(String),

    #[error("database is locked")]
    DatabaseLocked,

    #[error("column value is not unique")]
    ColumnNotUnique,

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("validator unreachable: {0}")]
    ValidatorUnreachable(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IoError(e.to_string())
    }
}

impl Error {
    /// True when the caller may retry the operation after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::DatabaseLocked)
    }
}
