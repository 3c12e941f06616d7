// src/repository/auth.rs

//! Identity store: users, roles, and entitlements
//!
//! Passwords are stored as md5(salt || cleartext) with a random 4-byte salt.
//! The format is a compatibility requirement for existing repository
//! databases, not a recommendation.
//!
//! All operations take a plain connection so they compose under a caller's
//! transaction.

use crate::error::{Error, Result};
use md5::{Digest, Md5};
use rand::RngCore;
use regex::Regex;
use rusqlite::{Connection, OptionalExtension};
use std::sync::OnceLock;
use tracing::{debug, info};

/// Longest entitlement key accepted, in bytes.
pub const MAX_ENTITLEMENT_LENGTH: usize = 255;

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]*$").unwrap())
}

fn check_name(name: &str) -> Result<()> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}

pub fn digest_password(salt: &[u8], password: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

// --- Users -----------------------------------------------------------------

pub fn user_id(conn: &Connection, name: &str) -> Result<i64> {
    conn.query_row(
        "SELECT userId FROM Users WHERE userName = ?1",
        [name],
        |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| Error::UserNotFound(name.to_string()))
}

pub fn add_user(conn: &Connection, name: &str, password: &str) -> Result<i64> {
    check_name(name)?;
    let mut salt = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut salt);
    let digest = digest_password(&salt, password);
    let result = conn.execute(
        "INSERT INTO Users (userName, salt, password) VALUES (?1, ?2, ?3)",
        (name, salt.as_slice(), digest),
    );
    match result {
        Ok(_) => {
            info!(user = name, "added user");
            Ok(conn.last_insert_rowid())
        }
        Err(e) => match e.into() {
            Error::ColumnNotUnique => Err(Error::UserAlreadyExists(name.to_string())),
            other => Err(other),
        },
    }
}

pub fn delete_user(conn: &Connection, name: &str) -> Result<()> {
    let id = user_id(conn, name)?;
    conn.execute("DELETE FROM UserGroupMembers WHERE userId = ?1", [id])?;
    conn.execute("DELETE FROM Users WHERE userId = ?1", [id])?;
    info!(user = name, "deleted user");
    Ok(())
}

pub fn rename_user(conn: &Connection, old: &str, new: &str) -> Result<()> {
    check_name(new)?;
    let id = user_id(conn, old)?;
    conn.execute(
        "UPDATE Users SET userName = ?1 WHERE userId = ?2",
        (new, id),
    )
    .map_err(|e| match e.into() {
        Error::ColumnNotUnique => Error::UserAlreadyExists(new.to_string()),
        other => other,
    })?;
    Ok(())
}

pub fn change_password(conn: &Connection, name: &str, password: &str) -> Result<()> {
    let id = user_id(conn, name)?;
    let mut salt = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut salt);
    let digest = digest_password(&salt, password);
    conn.execute(
        "UPDATE Users SET salt = ?1, password = ?2 WHERE userId = ?3",
        (salt.as_slice(), digest, id),
    )?;
    Ok(())
}

/// Verify a cleartext password against the stored salted digest. An unknown
/// user verifies as false rather than erroring, so callers cannot probe for
/// account existence.
pub fn check_password(conn: &Connection, name: &str, password: &str) -> Result<bool> {
    let row: Option<(Vec<u8>, String)> = conn
        .query_row(
            "SELECT salt, password FROM Users WHERE userName = ?1",
            [name],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    match row {
        Some((salt, stored)) => Ok(digest_password(&salt, password) == stored),
        None => Ok(false),
    }
}

// --- Roles -----------------------------------------------------------------

/// Flags attached to a role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleFlags {
    pub can_mirror: bool,
    pub admin: bool,
    /// Flavor string the request's geo flags must satisfy; empty accepts all.
    pub accept_flags: String,
    pub filter_flags: String,
}

pub fn role_id(conn: &Connection, role: &str) -> Result<i64> {
    conn.query_row(
        "SELECT userGroupId FROM UserGroups WHERE userGroup = ?1",
        [role],
        |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| Error::RoleNotFound(role.to_string()))
}

pub fn add_role(conn: &Connection, role: &str) -> Result<i64> {
    check_name(role)?;
    conn.execute("INSERT INTO UserGroups (userGroup) VALUES (?1)", [role])
        .map_err(|e| match e.into() {
            Error::ColumnNotUnique => Error::RoleAlreadyExists(role.to_string()),
            other => other,
        })?;
    info!(role, "added role");
    Ok(conn.last_insert_rowid())
}

pub fn delete_role(conn: &Connection, role: &str) -> Result<()> {
    let id = role_id(conn, role)?;
    conn.execute("DELETE FROM UserGroupMembers WHERE userGroupId = ?1", [id])?;
    conn.execute("DELETE FROM EntitlementAccessMap WHERE userGroupId = ?1", [id])?;
    conn.execute("DELETE FROM EntitlementOwners WHERE ownerGroupId = ?1", [id])?;
    conn.execute("DELETE FROM UserGroups WHERE userGroupId = ?1", [id])?;
    info!(role, "deleted role");
    Ok(())
}

pub fn rename_role(conn: &Connection, old: &str, new: &str) -> Result<()> {
    check_name(new)?;
    let id = role_id(conn, old)?;
    conn.execute(
        "UPDATE UserGroups SET userGroup = ?1 WHERE userGroupId = ?2",
        (new, id),
    )
    .map_err(|e| match e.into() {
        Error::ColumnNotUnique => Error::RoleAlreadyExists(new.to_string()),
        other => other,
    })?;
    Ok(())
}

pub fn set_role_flags(conn: &Connection, role: &str, flags: &RoleFlags) -> Result<()> {
    let id = role_id(conn, role)?;
    conn.execute(
        "UPDATE UserGroups SET canMirror = ?1, admin = ?2, acceptFlags = ?3,
                filterFlags = ?4
         WHERE userGroupId = ?5",
        (
            flags.can_mirror,
            flags.admin,
            &flags.accept_flags,
            &flags.filter_flags,
            id,
        ),
    )?;
    Ok(())
}

pub fn role_flags(conn: &Connection, role: &str) -> Result<RoleFlags> {
    let id = role_id(conn, role)?;
    let flags = conn.query_row(
        "SELECT canMirror, admin, acceptFlags, filterFlags
         FROM UserGroups WHERE userGroupId = ?1",
        [id],
        |r| {
            Ok(RoleFlags {
                can_mirror: r.get(0)?,
                admin: r.get(1)?,
                accept_flags: r.get(2)?,
                filter_flags: r.get(3)?,
            })
        },
    )?;
    Ok(flags)
}

pub fn add_role_member(conn: &Connection, role: &str, user: &str) -> Result<()> {
    let gid = role_id(conn, role)?;
    let uid = user_id(conn, user)?;
    conn.execute(
        "INSERT OR IGNORE INTO UserGroupMembers (userGroupId, userId) VALUES (?1, ?2)",
        (gid, uid),
    )?;
    debug!(role, user, "added role member");
    Ok(())
}

pub fn remove_role_member(conn: &Connection, role: &str, user: &str) -> Result<()> {
    let gid = role_id(conn, role)?;
    let uid = user_id(conn, user)?;
    conn.execute(
        "DELETE FROM UserGroupMembers WHERE userGroupId = ?1 AND userId = ?2",
        (gid, uid),
    )?;
    Ok(())
}

pub fn roles_for_user(conn: &Connection, user: &str) -> Result<Vec<String>> {
    let uid = user_id(conn, user)?;
    let mut stmt = conn.prepare(
        "SELECT ug.userGroup FROM UserGroups ug
         JOIN UserGroupMembers m ON m.userGroupId = ug.userGroupId
         WHERE m.userId = ?1 ORDER BY ug.userGroup",
    )?;
    let roles = stmt
        .query_map([uid], |r| r.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(roles)
}

pub fn all_roles(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT userGroup FROM UserGroups ORDER BY userGroup")?;
    let roles = stmt
        .query_map([], |r| r.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(roles)
}

// --- Entitlements ----------------------------------------------------------

pub fn entitlement_class_id(conn: &Connection, class: &str) -> Result<i64> {
    conn.query_row(
        "SELECT entGroupId FROM EntitlementGroups WHERE entGroup = ?1",
        [class],
        |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| Error::UnknownEntitlementClass(class.to_string()))
}

pub fn add_entitlement_class(conn: &Connection, class: &str) -> Result<i64> {
    check_name(class)?;
    conn.execute("INSERT INTO EntitlementGroups (entGroup) VALUES (?1)", [class])
        .map_err(|e| match e.into() {
            Error::ColumnNotUnique => Error::EntitlementClassAlreadyExists(class.to_string()),
            other => other,
        })?;
    info!(class, "added entitlement class");
    Ok(conn.last_insert_rowid())
}

pub fn delete_entitlement_class(conn: &Connection, class: &str) -> Result<()> {
    let id = entitlement_class_id(conn, class)?;
    conn.execute("DELETE FROM Entitlements WHERE entGroupId = ?1", [id])?;
    conn.execute("DELETE FROM EntitlementOwners WHERE entGroupId = ?1", [id])?;
    conn.execute("DELETE FROM EntitlementAccessMap WHERE entGroupId = ?1", [id])?;
    conn.execute("DELETE FROM EntitlementGroups WHERE entGroupId = ?1", [id])?;
    Ok(())
}

/// Mark a role as an owner of a class; owners may add and remove keys.
pub fn add_entitlement_class_owner(conn: &Connection, class: &str, role: &str) -> Result<()> {
    let cid = entitlement_class_id(conn, class)?;
    let gid = role_id(conn, role)?;
    conn.execute(
        "INSERT OR IGNORE INTO EntitlementOwners (entGroupId, ownerGroupId) VALUES (?1, ?2)",
        (cid, gid),
    )?;
    Ok(())
}

pub fn role_owns_entitlement_class(conn: &Connection, class: &str, role: &str) -> Result<bool> {
    let cid = entitlement_class_id(conn, class)?;
    let gid = role_id(conn, role)?;
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM EntitlementOwners WHERE entGroupId = ?1 AND ownerGroupId = ?2",
            (cid, gid),
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn add_entitlement_key(conn: &Connection, class: &str, key: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > MAX_ENTITLEMENT_LENGTH {
        return Err(Error::InvalidEntitlement);
    }
    let cid = entitlement_class_id(conn, class)?;
    conn.execute(
        "INSERT INTO Entitlements (entGroupId, entitlement) VALUES (?1, ?2)",
        (cid, key),
    )
    .map_err(|e| match e.into() {
        Error::ColumnNotUnique => Error::EntitlementKeyAlreadyExists,
        other => other,
    })?;
    Ok(())
}

pub fn delete_entitlement_key(conn: &Connection, class: &str, key: &[u8]) -> Result<()> {
    let cid = entitlement_class_id(conn, class)?;
    let removed = conn.execute(
        "DELETE FROM Entitlements WHERE entGroupId = ?1 AND entitlement = ?2",
        (cid, key),
    )?;
    if removed == 0 {
        return Err(Error::InvalidEntitlement);
    }
    Ok(())
}

/// Attach a role to a class: holders of any key in the class act with the
/// role's permissions.
pub fn set_entitlement_class_access(
    conn: &Connection,
    class: &str,
    roles: &[&str],
) -> Result<()> {
    let cid = entitlement_class_id(conn, class)?;
    conn.execute("DELETE FROM EntitlementAccessMap WHERE entGroupId = ?1", [cid])?;
    for role in roles {
        let gid = role_id(conn, role)?;
        conn.execute(
            "INSERT INTO EntitlementAccessMap (entGroupId, userGroupId) VALUES (?1, ?2)",
            (cid, gid),
        )?;
    }
    Ok(())
}

/// Roles granted by a (class, key) pair held in the local store. An unknown
/// class or key yields no roles; external validation is the resolver's job.
pub fn roles_for_entitlement(conn: &Connection, class: &str, key: &[u8]) -> Result<Vec<String>> {
    let cid = match conn
        .query_row(
            "SELECT entGroupId FROM EntitlementGroups WHERE entGroup = ?1",
            [class],
            |r| r.get::<_, i64>(0),
        )
        .optional()?
    {
        Some(id) => id,
        None => return Ok(Vec::new()),
    };
    let known: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM Entitlements WHERE entGroupId = ?1 AND entitlement = ?2",
            (cid, key),
            |r| r.get(0),
        )
        .optional()?;
    if known.is_none() {
        return Ok(Vec::new());
    }
    let mut stmt = conn.prepare(
        "SELECT ug.userGroup FROM UserGroups ug
         JOIN EntitlementAccessMap am ON am.userGroupId = ug.userGroupId
         WHERE am.entGroupId = ?1 ORDER BY ug.userGroup",
    )?;
    let roles = stmt
        .query_map([cid], |r| r.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(roles)
}
