// src/repository/troves.rs

//! Trove storage: interning, instances, file streams, and dependencies
//!
//! Names, versions, branches, labels, and flavors are interned into their
//! own tables; an instance is the (item, version, flavor) triple everything
//! else hangs off. File streams are deduplicated by content sha1; a stream
//! with no content is a cross-repository reference stored with a null sha1.

use crate::deps::DependencySet;
use crate::error::{Error, Result};
use crate::flavor::Flavor;
use crate::version::Version;
use rusqlite::{Connection, OptionalExtension};
use sha1::{Digest, Sha1};
use tracing::debug;

/// TroveTroves flag bits.
pub const TROVETROVES_BY_DEFAULT: i64 = 1;
pub const TROVETROVES_WEAK_REF: i64 = 2;

/// Instances.troveType values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TroveType {
    Normal = 0,
    Redirect = 1,
    /// Tombstone: the identity persists but the content is gone.
    Removed = 2,
}

fn intern(conn: &Connection, table: &str, column: &str, value: &str) -> Result<i64> {
    // Two statements instead of RETURNING keeps the SQL portable.
    conn.execute(
        &format!("INSERT OR IGNORE INTO {table} ({column}) VALUES (?1)"),
        [value],
    )?;
    let id = conn.query_row(
        &format!("SELECT {column}Id FROM {table} WHERE {column} = ?1"),
        [value],
        |r| r.get(0),
    )?;
    Ok(id)
}

pub fn intern_item(conn: &Connection, name: &str) -> Result<i64> {
    intern(conn, "Items", "item", name)
}

pub fn intern_flavor(conn: &Connection, flavor: &Flavor) -> Result<i64> {
    intern(conn, "Flavors", "flavor", &flavor.freeze())
}

pub fn intern_label(conn: &Connection, label: &str) -> Result<i64> {
    intern(conn, "Labels", "label", label)
}

/// Intern the version string plus its branch and label, wiring the LabelMap
/// row for `item` so permission matching can find the label later.
pub fn intern_version(conn: &Connection, item_id: i64, version: &Version) -> Result<(i64, i64)> {
    let version_id = intern(conn, "Versions", "version", &version.to_string())?;
    let branch_id = intern(conn, "Branches", "branch", &version.branch.to_string())?;
    let label_id = intern_label(conn, &version.label().to_string())?;
    let present: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM LabelMap WHERE itemId = ?1 AND branchId = ?2 AND labelId = ?3",
            (item_id, branch_id, label_id),
            |r| r.get(0),
        )
        .optional()?;
    if present.is_none() {
        conn.execute(
            "INSERT INTO LabelMap (itemId, branchId, labelId) VALUES (?1, ?2, ?3)",
            (item_id, branch_id, label_id),
        )?;
    }
    let node: Option<i64> = conn
        .query_row(
            "SELECT nodeId FROM Nodes WHERE itemId = ?1 AND versionId = ?2",
            (item_id, version_id),
            |r| r.get(0),
        )
        .optional()?;
    if node.is_none() {
        conn.execute(
            "INSERT INTO Nodes (itemId, branchId, versionId, finalTimeStamp)
             VALUES (?1, ?2, ?3, ?4)",
            (item_id, branch_id, version_id, version.final_timestamp()),
        )?;
    }
    Ok((version_id, branch_id))
}

/// Insert a new instance. A duplicate (name, version, flavor) surfaces as
/// ColumnNotUnique from the unique index.
pub fn add_instance(
    conn: &Connection,
    name: &str,
    version: &Version,
    flavor: &Flavor,
    trove_type: TroveType,
    hidden: bool,
) -> Result<i64> {
    let item_id = intern_item(conn, name)?;
    let (version_id, _) = intern_version(conn, item_id, version)?;
    let flavor_id = intern_flavor(conn, flavor)?;
    conn.execute(
        "INSERT INTO Instances (itemId, versionId, flavorId, troveType, isPresent, isHidden)
         VALUES (?1, ?2, ?3, ?4, 1, ?5)",
        (item_id, version_id, flavor_id, trove_type as i64, hidden),
    )?;
    let id = conn.last_insert_rowid();
    debug!(name, version = %version, instance = id, "inserted instance");
    Ok(id)
}

pub fn instance_id(
    conn: &Connection,
    name: &str,
    version: &Version,
    flavor: &Flavor,
) -> Result<i64> {
    conn.query_row(
        "SELECT i.instanceId FROM Instances i
         JOIN Items it ON it.itemId = i.itemId
         JOIN Versions v ON v.versionId = i.versionId
         JOIN Flavors f ON f.flavorId = i.flavorId
         WHERE it.item = ?1 AND v.version = ?2 AND f.flavor = ?3",
        (name, version.to_string(), flavor.freeze()),
        |r| r.get(0),
    )
    .optional()?
    .ok_or_else(|| Error::TroveNotFound(format!("{name}={version}[{}]", flavor.freeze())))
}

/// (name, label) of an instance, for permission matching.
pub fn instance_identity(conn: &Connection, instance_id: i64) -> Result<(String, String)> {
    conn.query_row(
        "SELECT it.item, l.label FROM Instances i
         JOIN Items it ON it.itemId = i.itemId
         JOIN Nodes n ON n.itemId = i.itemId AND n.versionId = i.versionId
         JOIN LabelMap lm ON lm.itemId = i.itemId AND lm.branchId = n.branchId
         JOIN Labels l ON l.labelId = lm.labelId
         WHERE i.instanceId = ?1",
        [instance_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .optional()?
    .ok_or_else(|| Error::TroveNotFound(format!("instance {instance_id}")))
}

/// Mark an instance as a removed tombstone.
pub fn mark_removed(conn: &Connection, instance_id: i64) -> Result<()> {
    let changed = conn.execute(
        "UPDATE Instances SET troveType = ?1, isPresent = 0 WHERE instanceId = ?2",
        (TroveType::Removed as i64, instance_id),
    )?;
    if changed == 0 {
        return Err(Error::TroveNotFound(format!("instance {instance_id}")));
    }
    Ok(())
}

/// Promote a hidden instance to visible.
pub fn unhide_instance(conn: &Connection, instance_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE Instances SET isHidden = 0 WHERE instanceId = ?1",
        [instance_id],
    )?;
    Ok(())
}

// --- File streams ----------------------------------------------------------

/// Store one file stream. A stream already present under the same fileId is
/// verified rather than rewritten: differing sha1 for the same fileId is an
/// integrity error. `None` content records a cross-repository reference.
pub fn add_file_stream(conn: &Connection, file_id: &[u8], stream: Option<&[u8]>) -> Result<i64> {
    let sha1: Option<Vec<u8>> = stream.map(|bytes| Sha1::digest(bytes).to_vec());
    let existing: Option<(i64, Option<Vec<u8>>)> = conn
        .query_row(
            "SELECT streamId, sha1 FROM FileStreams WHERE fileId = ?1",
            [file_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    if let Some((stream_id, stored_sha1)) = existing {
        match (&stored_sha1, &sha1) {
            // Reference row being filled in with real content.
            (None, Some(_)) => {
                conn.execute(
                    "UPDATE FileStreams SET stream = ?1, sha1 = ?2 WHERE streamId = ?3",
                    (stream, &sha1, stream_id),
                )?;
            }
            (Some(stored), Some(incoming)) if stored != incoming => {
                return Err(Error::IntegrityError(format!(
                    "file stream {} contents changed",
                    hex::encode(file_id)
                )));
            }
            _ => {}
        }
        return Ok(stream_id);
    }
    conn.execute(
        "INSERT INTO FileStreams (fileId, stream, sha1) VALUES (?1, ?2, ?3)",
        (file_id, stream, &sha1),
    )?;
    Ok(conn.last_insert_rowid())
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some(("", base)) => ("/", base),
        Some((dir, base)) => (dir, base),
        None => ("", path),
    }
}

/// Attach a file to an instance at `path`, interning the dirname/basename
/// pair.
pub fn add_trove_file(
    conn: &Connection,
    instance_id: i64,
    path: &str,
    path_id: &[u8],
    stream_id: i64,
    version_id: i64,
) -> Result<()> {
    let (dir, base) = split_path(path);
    let dirname_id = intern(conn, "Dirnames", "dirname", dir)?;
    let basename_id = intern(conn, "Basenames", "basename", base)?;
    conn.execute(
        "INSERT INTO FilePaths (pathId, dirnameId, basenameId) VALUES (?1, ?2, ?3)",
        (path_id, dirname_id, basename_id),
    )?;
    let file_path_id = conn.last_insert_rowid();
    conn.execute(
        "INSERT INTO TroveFiles (instanceId, streamId, filePathId, versionId)
         VALUES (?1, ?2, ?3, ?4)",
        (instance_id, stream_id, file_path_id, version_id),
    )?;
    Ok(())
}

/// Retrieve a stream's bytes by (pathId, fileId). The pathId narrows the
/// lookup to files actually present at a path.
pub fn file_stream(conn: &Connection, path_id: &[u8], file_id: &[u8]) -> Result<Vec<u8>> {
    let stream: Option<Option<Vec<u8>>> = conn
        .query_row(
            "SELECT fs.stream FROM FileStreams fs
             JOIN TroveFiles tf ON tf.streamId = fs.streamId
             JOIN FilePaths fp ON fp.filePathId = tf.filePathId
             WHERE fp.pathId = ?1 AND fs.fileId = ?2",
            (path_id, file_id),
            |r| r.get(0),
        )
        .optional()?;
    match stream {
        Some(Some(bytes)) => Ok(bytes),
        Some(None) => Err(Error::IntegrityError(format!(
            "file stream {} is a reference with no content",
            hex::encode(file_id)
        ))),
        None => Err(Error::TroveNotFound(format!(
            "file stream {}",
            hex::encode(file_id)
        ))),
    }
}

// --- Containment and dependencies ------------------------------------------

pub fn add_trove_include(
    conn: &Connection,
    instance_id: i64,
    included_id: i64,
    flags: i64,
) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO TroveTroves (instanceId, includedId, flags)
         VALUES (?1, ?2, ?3)",
        (instance_id, included_id, flags),
    )?;
    Ok(())
}

pub fn included_instances(conn: &Connection, instance_id: i64) -> Result<Vec<i64>> {
    let mut stmt =
        conn.prepare("SELECT includedId FROM TroveTroves WHERE instanceId = ?1")?;
    let ids = stmt
        .query_map([instance_id], |r| r.get(0))?
        .collect::<std::result::Result<Vec<i64>, _>>()?;
    Ok(ids)
}

fn intern_dependency(conn: &Connection, class: i64, name: &str, flag: &str) -> Result<i64> {
    conn.execute(
        "INSERT OR IGNORE INTO Dependencies (class, name, flag) VALUES (?1, ?2, ?3)",
        (class, name, flag),
    )?;
    let id = conn.query_row(
        "SELECT depId FROM Dependencies WHERE class = ?1 AND name = ?2 AND flag = ?3",
        (class, name, flag),
        |r| r.get(0),
    )?;
    Ok(id)
}

fn store_dep_set(
    conn: &Connection,
    table: &str,
    instance_id: i64,
    deps: &DependencySet,
) -> Result<()> {
    for dep in deps.iter() {
        // One row per flag, plus a flagless row carrying the bare name.
        let class = dep.class.id();
        let dep_id = intern_dependency(conn, class, &dep.name, "")?;
        conn.execute(
            &format!("INSERT INTO {table} (instanceId, depId) VALUES (?1, ?2)"),
            (instance_id, dep_id),
        )?;
        for flag in &dep.flags {
            let dep_id = intern_dependency(conn, class, &dep.name, flag)?;
            conn.execute(
                &format!("INSERT INTO {table} (instanceId, depId) VALUES (?1, ?2)"),
                (instance_id, dep_id),
            )?;
        }
    }
    Ok(())
}

pub fn add_provides(conn: &Connection, instance_id: i64, deps: &DependencySet) -> Result<()> {
    store_dep_set(conn, "Provides", instance_id, deps)
}

pub fn add_requires(conn: &Connection, instance_id: i64, deps: &DependencySet) -> Result<()> {
    store_dep_set(conn, "Requires", instance_id, deps)
}
