// src/repository/accessmap.rs

//! Accessibility cache: which roles can see which instances
//!
//! Two source tables feed a consolidated cache. UserGroupAllPermissions
//! expands each (label, item-pattern) permission against every matching
//! instance; UserGroupAllTroves expands explicit per-trove grants, walking
//! TroveTroves when the grant is recursive. UserGroupInstancesCache is their
//! union with canWrite OR-ed across contributing rows.
//!
//! Invariant: an instance is readable by a role iff a cache row exists for
//! that (role, instance). Every mutation here must run inside the caller's
//! transaction so observers never see the sources and the cache disagree.

use crate::error::{Error, Result};
use crate::repository::auth;
use crate::repository::troves;
use regex::Regex;
use rusqlite::{Connection, OptionalExtension};
use std::collections::BTreeSet;
use tracing::debug;

/// Wildcard stored in Labels/Items for a permission covering everything.
pub const ALL: &str = "ALL";

fn item_pattern_matches(pattern: &str, name: &str) -> Result<bool> {
    if pattern == ALL {
        return Ok(true);
    }
    let re = Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| Error::ParseError(format!("bad item pattern '{pattern}': {e}")))?;
    Ok(re.is_match(name))
}

fn label_pattern_matches(pattern: &str, label: &str) -> bool {
    pattern == ALL || pattern == label
}

#[derive(Debug, Clone)]
struct PermissionRow {
    permission_id: i64,
    role_id: i64,
    label_pattern: String,
    item_pattern: String,
    can_write: bool,
    can_remove: bool,
}

fn all_permissions(conn: &Connection) -> Result<Vec<PermissionRow>> {
    let mut stmt = conn.prepare(
        "SELECT p.permissionId, p.userGroupId, l.label, it.item, p.canWrite, p.canRemove
         FROM Permissions p
         JOIN Labels l ON l.labelId = p.labelId
         JOIN Items it ON it.itemId = p.itemId",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(PermissionRow {
                permission_id: r.get(0)?,
                role_id: r.get(1)?,
                label_pattern: r.get(2)?,
                item_pattern: r.get(3)?,
                can_write: r.get(4)?,
                can_remove: r.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn all_instances(conn: &Connection) -> Result<Vec<(i64, String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT i.instanceId, it.item, l.label FROM Instances i
         JOIN Items it ON it.itemId = i.itemId
         JOIN Nodes n ON n.itemId = i.itemId AND n.versionId = i.versionId
         JOIN LabelMap lm ON lm.itemId = i.itemId AND lm.branchId = n.branchId
         JOIN Labels l ON l.labelId = lm.labelId",
    )?;
    let rows = stmt
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Rebuild one consolidated row from whatever supports it, deleting the row
/// when nothing does.
fn refresh_cache_row(conn: &Connection, role_id: i64, instance_id: i64) -> Result<()> {
    let from_permissions: Option<bool> = conn
        .query_row(
            "SELECT MAX(canWrite) FROM UserGroupAllPermissions
             WHERE userGroupId = ?1 AND instanceId = ?2",
            (role_id, instance_id),
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    let from_troves: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM UserGroupAllTroves
             WHERE userGroupId = ?1 AND instanceId = ?2 LIMIT 1",
            (role_id, instance_id),
            |r| r.get(0),
        )
        .optional()?;

    match (from_permissions, from_troves) {
        (None, None) => {
            conn.execute(
                "DELETE FROM UserGroupInstancesCache
                 WHERE userGroupId = ?1 AND instanceId = ?2",
                (role_id, instance_id),
            )?;
        }
        (can_write, _) => {
            conn.execute(
                "INSERT INTO UserGroupInstancesCache (userGroupId, instanceId, canWrite)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(userGroupId, instanceId) DO UPDATE SET canWrite = ?3",
                (role_id, instance_id, can_write.unwrap_or(false)),
            )?;
        }
    }
    Ok(())
}

// --- Permissions ------------------------------------------------------------

/// Grant a role access to instances matching (label, item-pattern). `None`
/// patterns cover everything. The cache is brought up to date before
/// returning.
pub fn add_permission(
    conn: &Connection,
    role: &str,
    label: Option<&str>,
    item_pattern: Option<&str>,
    can_write: bool,
    can_remove: bool,
) -> Result<i64> {
    let role_id = auth::role_id(conn, role)?;
    let label_id = troves::intern_label(conn, label.unwrap_or(ALL))?;
    let item_id = troves::intern_item(conn, item_pattern.unwrap_or(ALL))?;
    conn.execute(
        "INSERT INTO Permissions (userGroupId, labelId, itemId, canWrite, canRemove)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        (role_id, label_id, item_id, can_write, can_remove),
    )
    .map_err(|e| match e.into() {
        Error::ColumnNotUnique => Error::PermissionAlreadyExists,
        other => other,
    })?;
    let permission_id = conn.last_insert_rowid();

    let label_pattern = label.unwrap_or(ALL);
    let item = item_pattern.unwrap_or(ALL);
    for (instance_id, name, instance_label) in all_instances(conn)? {
        if label_pattern_matches(label_pattern, &instance_label)
            && item_pattern_matches(item, &name)?
        {
            conn.execute(
                "INSERT INTO UserGroupAllPermissions
                     (permissionId, userGroupId, instanceId, canWrite, canRemove)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (permission_id, role_id, instance_id, can_write, can_remove),
            )?;
            refresh_cache_row(conn, role_id, instance_id)?;
        }
    }
    debug!(role, permission_id, "added permission");
    Ok(permission_id)
}

/// Remove a permission. Instances that lose their last supporting row also
/// lose their consolidated cache row.
pub fn delete_permission(
    conn: &Connection,
    role: &str,
    label: Option<&str>,
    item_pattern: Option<&str>,
) -> Result<()> {
    let role_id = auth::role_id(conn, role)?;
    let permission_id: Option<i64> = conn
        .query_row(
            "SELECT p.permissionId FROM Permissions p
             JOIN Labels l ON l.labelId = p.labelId
             JOIN Items it ON it.itemId = p.itemId
             WHERE p.userGroupId = ?1 AND l.label = ?2 AND it.item = ?3",
            (role_id, label.unwrap_or(ALL), item_pattern.unwrap_or(ALL)),
            |r| r.get(0),
        )
        .optional()?;
    // Unknown permission and denied access read the same to the caller.
    let permission_id = permission_id.ok_or(Error::InsufficientPermission)?;

    let mut stmt = conn.prepare(
        "SELECT instanceId FROM UserGroupAllPermissions WHERE permissionId = ?1",
    )?;
    let affected = stmt
        .query_map([permission_id], |r| r.get(0))?
        .collect::<std::result::Result<Vec<i64>, _>>()?;
    drop(stmt);

    conn.execute(
        "DELETE FROM UserGroupAllPermissions WHERE permissionId = ?1",
        [permission_id],
    )?;
    conn.execute("DELETE FROM Permissions WHERE permissionId = ?1", [permission_id])?;
    for instance_id in affected {
        refresh_cache_row(conn, role_id, instance_id)?;
    }
    Ok(())
}

// --- Trove grants -----------------------------------------------------------

/// Grant a role access to one instance, and transitively to everything it
/// includes when `recursive`.
pub fn add_trove_access(
    conn: &Connection,
    role: &str,
    instance_id: i64,
    recursive: bool,
) -> Result<()> {
    let role_id = auth::role_id(conn, role)?;
    conn.execute(
        "INSERT INTO UserGroupTroves (userGroupId, instanceId, recursive)
         VALUES (?1, ?2, ?3)",
        (role_id, instance_id, recursive),
    )
    .map_err(|e| match e.into() {
        Error::ColumnNotUnique => Error::PermissionAlreadyExists,
        other => other,
    })?;
    let ugt_id = conn.last_insert_rowid();

    let mut members = BTreeSet::from([instance_id]);
    if recursive {
        let mut frontier = vec![instance_id];
        while let Some(current) = frontier.pop() {
            for child in troves::included_instances(conn, current)? {
                if members.insert(child) {
                    frontier.push(child);
                }
            }
        }
    }
    for member in members {
        conn.execute(
            "INSERT INTO UserGroupAllTroves (ugtId, userGroupId, instanceId)
             VALUES (?1, ?2, ?3)",
            (ugt_id, role_id, member),
        )?;
        refresh_cache_row(conn, role_id, member)?;
    }
    Ok(())
}

pub fn delete_trove_access(conn: &Connection, role: &str, instance_id: i64) -> Result<()> {
    let role_id = auth::role_id(conn, role)?;
    let ugt_id: Option<i64> = conn
        .query_row(
            "SELECT ugtId FROM UserGroupTroves WHERE userGroupId = ?1 AND instanceId = ?2",
            (role_id, instance_id),
            |r| r.get(0),
        )
        .optional()?;
    let ugt_id = ugt_id.ok_or(Error::InsufficientPermission)?;

    let mut stmt =
        conn.prepare("SELECT instanceId FROM UserGroupAllTroves WHERE ugtId = ?1")?;
    let affected = stmt
        .query_map([ugt_id], |r| r.get(0))?
        .collect::<std::result::Result<Vec<i64>, _>>()?;
    drop(stmt);

    conn.execute("DELETE FROM UserGroupAllTroves WHERE ugtId = ?1", [ugt_id])?;
    conn.execute("DELETE FROM UserGroupTroves WHERE ugtId = ?1", [ugt_id])?;
    for member in affected {
        refresh_cache_row(conn, role_id, member)?;
    }
    Ok(())
}

// --- Instance fan-out -------------------------------------------------------

/// Fan a newly committed instance out through every role whose permissions
/// match it. Idempotent: the expansion rows for the instance are rebuilt.
pub fn update_cache_for_instance(conn: &Connection, instance_id: i64) -> Result<()> {
    let (name, label) = troves::instance_identity(conn, instance_id)?;
    conn.execute(
        "DELETE FROM UserGroupAllPermissions WHERE instanceId = ?1",
        [instance_id],
    )?;
    let mut touched = BTreeSet::new();
    for permission in all_permissions(conn)? {
        if label_pattern_matches(&permission.label_pattern, &label)
            && item_pattern_matches(&permission.item_pattern, &name)?
        {
            conn.execute(
                "INSERT INTO UserGroupAllPermissions
                     (permissionId, userGroupId, instanceId, canWrite, canRemove)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                (
                    permission.permission_id,
                    permission.role_id,
                    instance_id,
                    permission.can_write,
                    permission.can_remove,
                ),
            )?;
        }
        touched.insert(permission.role_id);
    }
    for role_id in touched {
        refresh_cache_row(conn, role_id, instance_id)?;
    }
    Ok(())
}

/// Extend recursive trove grants covering `parent` down to a newly linked
/// `child`. Called when the commit pipeline records a TroveTroves edge.
pub fn extend_trove_grants(conn: &Connection, parent: i64, child: i64) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT at.ugtId, at.userGroupId
         FROM UserGroupAllTroves at
         JOIN UserGroupTroves ugt ON ugt.ugtId = at.ugtId
         WHERE at.instanceId = ?1 AND ugt.recursive = 1",
    )?;
    let grants = stmt
        .query_map([parent], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    drop(stmt);
    for (ugt_id, role_id) in grants {
        let present: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM UserGroupAllTroves WHERE ugtId = ?1 AND instanceId = ?2",
                (ugt_id, child),
                |r| r.get(0),
            )
            .optional()?;
        if present.is_none() {
            conn.execute(
                "INSERT INTO UserGroupAllTroves (ugtId, userGroupId, instanceId)
                 VALUES (?1, ?2, ?3)",
                (ugt_id, role_id, child),
            )?;
            refresh_cache_row(conn, role_id, child)?;
        }
    }
    Ok(())
}

/// Sever everything the cache knew about an instance marked removed. The
/// instance keeps its identity; only its visibility goes away.
pub fn sever_instance(conn: &Connection, instance_id: i64) -> Result<()> {
    conn.execute(
        "DELETE FROM UserGroupAllPermissions WHERE instanceId = ?1",
        [instance_id],
    )?;
    conn.execute(
        "DELETE FROM UserGroupAllTroves WHERE instanceId = ?1",
        [instance_id],
    )?;
    conn.execute(
        "DELETE FROM UserGroupTroves WHERE instanceId = ?1",
        [instance_id],
    )?;
    conn.execute(
        "DELETE FROM UserGroupInstancesCache WHERE instanceId = ?1",
        [instance_id],
    )?;
    Ok(())
}

// --- Queries ----------------------------------------------------------------

fn role_ids(conn: &Connection, roles: &[String]) -> Result<Vec<i64>> {
    let mut ids = Vec::new();
    for role in roles {
        match auth::role_id(conn, role) {
            Ok(id) => ids.push(id),
            Err(Error::RoleNotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(ids)
}

/// Check one instance against a set of roles.
pub fn check(
    conn: &Connection,
    roles: &[String],
    instance_id: i64,
    write: bool,
) -> Result<bool> {
    for role_id in role_ids(conn, roles)? {
        let can_write: Option<bool> = conn
            .query_row(
                "SELECT canWrite FROM UserGroupInstancesCache
                 WHERE userGroupId = ?1 AND instanceId = ?2",
                (role_id, instance_id),
                |r| r.get(0),
            )
            .optional()?;
        match can_write {
            Some(can_write) if !write || can_write => return Ok(true),
            _ => {}
        }
    }
    Ok(false)
}

/// Batch form of `check`: (read, write) per queried instance. Unknown
/// instances read as inaccessible rather than erroring.
pub fn batch_check(
    conn: &Connection,
    roles: &[String],
    instance_ids: &[i64],
) -> Result<Vec<(bool, bool)>> {
    let ids = role_ids(conn, roles)?;
    let mut results = Vec::with_capacity(instance_ids.len());
    for &instance_id in instance_ids {
        let mut readable = false;
        let mut writable = false;
        for &role_id in &ids {
            let can_write: Option<bool> = conn
                .query_row(
                    "SELECT canWrite FROM UserGroupInstancesCache
                     WHERE userGroupId = ?1 AND instanceId = ?2",
                    (role_id, instance_id),
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(can_write) = can_write {
                readable = true;
                writable = writable || can_write;
            }
        }
        results.push((readable, writable));
    }
    Ok(results)
}

/// Write check against (name, label) for a trove that may not exist yet.
/// Admin roles write anywhere.
pub fn can_write(conn: &Connection, roles: &[String], name: &str, label: &str) -> Result<bool> {
    for role in roles {
        if auth::role_flags(conn, role)?.admin {
            return Ok(true);
        }
    }
    let ids = role_ids(conn, roles)?;
    for permission in all_permissions(conn)? {
        if !ids.contains(&permission.role_id) || !permission.can_write {
            continue;
        }
        if label_pattern_matches(&permission.label_pattern, label)
            && item_pattern_matches(&permission.item_pattern, name)?
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Remove check against (name, label). Admin roles remove anywhere.
pub fn can_remove(conn: &Connection, roles: &[String], name: &str, label: &str) -> Result<bool> {
    for role in roles {
        if auth::role_flags(conn, role)?.admin {
            return Ok(true);
        }
    }
    let ids = role_ids(conn, roles)?;
    for permission in all_permissions(conn)? {
        if !ids.contains(&permission.role_id) || !permission.can_remove {
            continue;
        }
        if label_pattern_matches(&permission.label_pattern, label)
            && item_pattern_matches(&permission.item_pattern, name)?
        {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::flavor::Flavor;
    use crate::repository::schema;
    use crate::repository::troves::{add_instance, add_trove_include, TroveType, TROVETROVES_BY_DEFAULT};
    use crate::version::Version;

    fn store() -> Database {
        let db = Database::open_in_memory().unwrap();
        schema::setup(&db).unwrap();
        db
    }

    fn commit(db: &Database, name: &str, version: &str) -> i64 {
        let v = Version::parse(version).unwrap();
        let id = add_instance(db.conn(), name, &v, &Flavor::empty(), TroveType::Normal, false)
            .unwrap();
        update_cache_for_instance(db.conn(), id).unwrap();
        id
    }

    const V1: &str = "/repo.example.com@cook:devel/1.0-1-1";

    #[test]
    fn test_permission_fan_out_to_new_instance() {
        let db = store();
        auth::add_role(db.conn(), "readers").unwrap();
        add_permission(db.conn(), "readers", None, Some("foo:.*"), false, false).unwrap();

        let foo = commit(&db, "foo:runtime", V1);
        let bar = commit(&db, "bar:runtime", V1);

        assert!(check(db.conn(), &["readers".to_string()], foo, false).unwrap());
        assert!(!check(db.conn(), &["readers".to_string()], foo, true).unwrap());
        assert!(!check(db.conn(), &["readers".to_string()], bar, false).unwrap());
    }

    #[test]
    fn test_permission_add_covers_existing_instances() {
        let db = store();
        let foo = commit(&db, "foo:runtime", V1);
        auth::add_role(db.conn(), "readers").unwrap();
        add_permission(db.conn(), "readers", None, Some("foo:.*"), false, false).unwrap();
        assert!(check(db.conn(), &["readers".to_string()], foo, false).unwrap());
    }

    #[test]
    fn test_write_flag_ors_across_permissions() {
        let db = store();
        auth::add_role(db.conn(), "staff").unwrap();
        add_permission(db.conn(), "staff", None, Some("foo:.*"), false, false).unwrap();
        let foo = commit(&db, "foo:runtime", V1);
        assert_eq!(
            batch_check(db.conn(), &["staff".to_string()], &[foo]).unwrap(),
            vec![(true, false)]
        );

        // A second, writable permission flips the cached write bit.
        add_permission(db.conn(), "staff", None, Some("foo:runtime"), true, false).unwrap();
        assert_eq!(
            batch_check(db.conn(), &["staff".to_string()], &[foo]).unwrap(),
            vec![(true, true)]
        );
    }

    #[test]
    fn test_delete_then_readd_restores_cache() {
        let db = store();
        auth::add_role(db.conn(), "readers").unwrap();
        add_permission(db.conn(), "readers", None, Some("foo:.*"), false, false).unwrap();
        let foo = commit(&db, "foo:runtime", V1);

        let before: Vec<(i64, i64, bool)> = {
            let mut stmt = db
                .conn()
                .prepare("SELECT userGroupId, instanceId, canWrite FROM UserGroupInstancesCache ORDER BY 1, 2")
                .unwrap();
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
                .unwrap()
                .collect::<std::result::Result<Vec<_>, _>>()
                .unwrap();
            rows
        };

        delete_permission(db.conn(), "readers", None, Some("foo:.*")).unwrap();
        assert!(!check(db.conn(), &["readers".to_string()], foo, false).unwrap());

        add_permission(db.conn(), "readers", None, Some("foo:.*"), false, false).unwrap();
        let after: Vec<(i64, i64, bool)> = {
            let mut stmt = db
                .conn()
                .prepare("SELECT userGroupId, instanceId, canWrite FROM UserGroupInstancesCache ORDER BY 1, 2")
                .unwrap();
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
                .unwrap()
                .collect::<std::result::Result<Vec<_>, _>>()
                .unwrap();
            rows
        };
        assert_eq!(before, after);
    }

    #[test]
    fn test_label_scoped_permission() {
        let db = store();
        auth::add_role(db.conn(), "devel").unwrap();
        add_permission(
            db.conn(),
            "devel",
            Some("repo.example.com@cook:devel"),
            None,
            false,
            false,
        )
        .unwrap();
        let on_devel = commit(&db, "foo", V1);
        let elsewhere = commit(&db, "foo", "/other.example.com@cook:1/1.0-1-1");
        assert!(check(db.conn(), &["devel".to_string()], on_devel, false).unwrap());
        assert!(!check(db.conn(), &["devel".to_string()], elsewhere, false).unwrap());
    }

    #[test]
    fn test_recursive_trove_grant() {
        let db = store();
        auth::add_role(db.conn(), "partners").unwrap();
        let group = commit(&db, "group-dist", V1);
        let pkg = commit(&db, "foo", V1);
        let comp = commit(&db, "foo:runtime", V1);
        add_trove_include(db.conn(), group, pkg, TROVETROVES_BY_DEFAULT).unwrap();
        add_trove_include(db.conn(), pkg, comp, TROVETROVES_BY_DEFAULT).unwrap();

        add_trove_access(db.conn(), "partners", group, true).unwrap();
        let roles = ["partners".to_string()];
        assert!(check(db.conn(), &roles, group, false).unwrap());
        assert!(check(db.conn(), &roles, pkg, false).unwrap());
        assert!(check(db.conn(), &roles, comp, false).unwrap());

        delete_trove_access(db.conn(), "partners", group).unwrap();
        assert!(!check(db.conn(), &roles, group, false).unwrap());
        assert!(!check(db.conn(), &roles, comp, false).unwrap());
    }

    #[test]
    fn test_trove_grant_survives_permission_delete() {
        let db = store();
        auth::add_role(db.conn(), "mixed").unwrap();
        let foo = commit(&db, "foo", V1);
        add_permission(db.conn(), "mixed", None, None, false, false).unwrap();
        add_trove_access(db.conn(), "mixed", foo, false).unwrap();

        delete_permission(db.conn(), "mixed", None, None).unwrap();
        // The explicit grant still supports the cache row.
        assert!(check(db.conn(), &["mixed".to_string()], foo, false).unwrap());
    }

    #[test]
    fn test_sever_removed_instance() {
        let db = store();
        auth::add_role(db.conn(), "readers").unwrap();
        add_permission(db.conn(), "readers", None, None, false, false).unwrap();
        let foo = commit(&db, "foo", V1);
        assert!(check(db.conn(), &["readers".to_string()], foo, false).unwrap());

        troves::mark_removed(db.conn(), foo).unwrap();
        sever_instance(db.conn(), foo).unwrap();
        assert!(!check(db.conn(), &["readers".to_string()], foo, false).unwrap());
        // Identity survives severing.
        let present: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM Instances WHERE instanceId = ?1", [foo], |r| r.get(0))
            .unwrap();
        assert_eq!(present, 1);
    }

    #[test]
    fn test_extend_trove_grants_on_new_edge() {
        let db = store();
        auth::add_role(db.conn(), "partners").unwrap();
        let group = commit(&db, "group-dist", V1);
        add_trove_access(db.conn(), "partners", group, true).unwrap();

        let late = commit(&db, "late:runtime", V1);
        add_trove_include(db.conn(), group, late, TROVETROVES_BY_DEFAULT).unwrap();
        extend_trove_grants(db.conn(), group, late).unwrap();
        assert!(check(db.conn(), &["partners".to_string()], late, false).unwrap());
    }

    #[test]
    fn test_can_write_by_pattern_and_admin() {
        let db = store();
        auth::add_role(db.conn(), "writers").unwrap();
        auth::add_role(db.conn(), "admins").unwrap();
        auth::set_role_flags(
            db.conn(),
            "admins",
            &auth::RoleFlags { admin: true, ..Default::default() },
        )
        .unwrap();
        add_permission(db.conn(), "writers", None, Some("foo.*"), true, false).unwrap();

        let writers = ["writers".to_string()];
        assert!(can_write(db.conn(), &writers, "foo:runtime", "any@label:here").unwrap());
        assert!(!can_write(db.conn(), &writers, "bar", "any@label:here").unwrap());
        let admins = ["admins".to_string()];
        assert!(can_write(db.conn(), &admins, "bar", "any@label:here").unwrap());
    }

    #[test]
    fn test_duplicate_permission_rejected() {
        let db = store();
        auth::add_role(db.conn(), "readers").unwrap();
        add_permission(db.conn(), "readers", None, Some("foo:.*"), false, false).unwrap();
        let err =
            add_permission(db.conn(), "readers", None, Some("foo:.*"), false, false).unwrap_err();
        assert!(matches!(err, Error::PermissionAlreadyExists));
    }
}
