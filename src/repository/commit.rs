// src/repository/commit.rs

//! Commit pipeline
//!
//! Incoming troves pass through: server-name check, write-permission check,
//! redirect validation, file-stream dedup, instance insert, and cache
//! fan-out. The whole batch runs under one transaction holding the commit
//! lock row, so concurrent committers serialize and readers never observe a
//! half-committed batch.

use crate::db::Database;
use crate::deps::DependencySet;
use crate::error::{Error, Result};
use crate::flavor::Flavor;
use crate::repository::accessmap;
use crate::repository::troves::{self, TroveType, TROVETROVES_BY_DEFAULT};
use crate::version::{Branch, Version};
use rusqlite::{Connection, OptionalExtension};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use tracing::{debug, info};

/// One file carried by an incoming trove. `stream` is `None` for a
/// cross-repository reference whose bytes live elsewhere.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub path: String,
    pub path_id: Vec<u8>,
    pub file_id: Vec<u8>,
    pub stream: Option<Vec<u8>>,
}

/// Where a redirect points.
#[derive(Debug, Clone)]
pub struct RedirectTarget {
    pub name: String,
    pub branch: Branch,
    pub flavor: Option<Flavor>,
}

/// One trove submitted for commit.
#[derive(Debug, Clone)]
pub struct TroveCommit {
    pub name: String,
    pub version: Version,
    pub flavor: Flavor,
    pub files: Vec<FileEntry>,
    /// Children by (name, version, flavor); either already present or
    /// earlier in the same batch.
    pub includes: Vec<(String, Version, Flavor)>,
    pub provides: DependencySet,
    pub requires: DependencySet,
    pub redirects: Vec<RedirectTarget>,
    /// Committed invisible, promoted later with `reveal`.
    pub hidden: bool,
    /// Precalculated checksum the stored trove must reproduce.
    pub checksum: Option<Vec<u8>>,
}

impl TroveCommit {
    pub fn new(name: &str, version: Version, flavor: Flavor) -> Self {
        Self {
            name: name.to_string(),
            version,
            flavor,
            files: Vec::new(),
            includes: Vec::new(),
            provides: DependencySet::new(),
            requires: DependencySet::new(),
            redirects: Vec::new(),
            hidden: false,
            checksum: None,
        }
    }

    fn is_group(&self) -> bool {
        self.name.starts_with("group-")
    }

    fn trove_type(&self) -> TroveType {
        if self.redirects.is_empty() {
            TroveType::Normal
        } else {
            TroveType::Redirect
        }
    }

    /// Deterministic digest over identity and file ids, compared against the
    /// submitted checksum.
    pub fn computed_checksum(&self) -> Vec<u8> {
        let mut hasher = Sha1::new();
        hasher.update(self.name.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.version.to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(self.flavor.freeze().as_bytes());
        let mut ids: Vec<&[u8]> = self.files.iter().map(|f| f.file_id.as_slice()).collect();
        ids.sort();
        for id in ids {
            hasher.update(id);
        }
        hasher.finalize().to_vec()
    }
}

/// Repository-side committer bound to the configured server names.
pub struct Committer {
    server_names: Vec<String>,
}

impl Committer {
    pub fn new<I, S>(server_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            server_names: server_names.into_iter().map(Into::into).collect(),
        }
    }

    /// Commit a batch. Returns the new instance ids in batch order. Any
    /// failure rolls the whole batch back.
    pub fn commit(
        &self,
        db: &mut Database,
        roles: &[String],
        batch: &[TroveCommit],
    ) -> Result<Vec<i64>> {
        let server_names = self.server_names.clone();
        db.transaction(|tx| {
            take_commit_lock(tx, roles)?;
            let mut committed: HashMap<(String, String, String), i64> = HashMap::new();
            let mut ids = Vec::with_capacity(batch.len());
            for trove in batch {
                let id = commit_one(tx, &server_names, roles, trove, &committed)?;
                committed.insert(
                    (
                        trove.name.clone(),
                        trove.version.to_string(),
                        trove.flavor.freeze(),
                    ),
                    id,
                );
                ids.push(id);
            }
            release_commit_lock(tx)?;
            info!(troves = ids.len(), "committed batch");
            Ok(ids)
        })
    }

    /// Promote hidden instances to visible and fan their access out.
    pub fn reveal(
        &self,
        db: &mut Database,
        name: &str,
        version: &Version,
        flavor: &Flavor,
    ) -> Result<()> {
        db.transaction(|tx| {
            let id = troves::instance_id(tx, name, version, flavor)?;
            troves::unhide_instance(tx, id)?;
            accessmap::update_cache_for_instance(tx, id)?;
            Ok(())
        })
    }

    /// Replace a trove with a removed tombstone, severing its cache rows.
    pub fn remove(
        &self,
        db: &mut Database,
        roles: &[String],
        name: &str,
        version: &Version,
        flavor: &Flavor,
    ) -> Result<()> {
        db.transaction(|tx| {
            let id = troves::instance_id(tx, name, version, flavor)?;
            if !accessmap::can_remove(tx, roles, name, &version.label().to_string())? {
                return Err(Error::InsufficientPermission);
            }
            troves::mark_removed(tx, id)?;
            accessmap::sever_instance(tx, id)?;
            info!(name, version = %version, "removed trove");
            Ok(())
        })
    }
}

/// Claim the commit lock row. The UPDATE takes SQLite's write lock, which
/// serializes mutators; the annotation is for post-mortem diagnosis only.
fn take_commit_lock(conn: &Connection, roles: &[String]) -> Result<()> {
    conn.execute(
        "UPDATE CommitLock SET lockedBy = ?1, lockedAt = ?2 WHERE lockId = 0",
        (roles.join(","), chrono::Utc::now().timestamp() as f64),
    )?;
    Ok(())
}

fn release_commit_lock(conn: &Connection) -> Result<()> {
    conn.execute(
        "UPDATE CommitLock SET lockedBy = NULL, lockedAt = NULL WHERE lockId = 0",
        [],
    )?;
    Ok(())
}

fn commit_one(
    conn: &Connection,
    server_names: &[String],
    roles: &[String],
    trove: &TroveCommit,
    earlier: &HashMap<(String, String, String), i64>,
) -> Result<i64> {
    let host = trove.version.host();
    if !server_names.iter().any(|s| s == host) {
        return Err(Error::RepositoryMismatch {
            expected: server_names.to_vec(),
            found: host.to_string(),
        });
    }

    let label = trove.version.label().to_string();
    if !accessmap::can_write(conn, roles, &trove.name, &label)? {
        return Err(Error::InsufficientPermission);
    }

    if let Some(expected) = &trove.checksum {
        let computed = trove.computed_checksum();
        if *expected != computed {
            return Err(Error::TroveChecksumInvalid(format!(
                "{}={}",
                trove.name, trove.version
            )));
        }
    }

    validate_redirects(conn, trove)?;

    // Streams before the instance that references them.
    let mut stream_ids = Vec::with_capacity(trove.files.len());
    for file in &trove.files {
        let id = troves::add_file_stream(conn, &file.file_id, file.stream.as_deref())?;
        stream_ids.push(id);
    }

    let instance_id = troves::add_instance(
        conn,
        &trove.name,
        &trove.version,
        &trove.flavor,
        trove.trove_type(),
        trove.hidden,
    )?;
    debug!(name = %trove.name, instance_id, "committing trove");

    let version_id = conn.query_row(
        "SELECT versionId FROM Versions WHERE version = ?1",
        [trove.version.to_string()],
        |r| r.get(0),
    )?;
    for (file, stream_id) in trove.files.iter().zip(stream_ids) {
        troves::add_trove_file(
            conn,
            instance_id,
            &file.path,
            &file.path_id,
            stream_id,
            version_id,
        )?;
    }

    for (name, version, flavor) in &trove.includes {
        let key = (name.clone(), version.to_string(), flavor.freeze());
        let child = match earlier.get(&key) {
            Some(&id) => id,
            None => troves::instance_id(conn, name, version, flavor)?,
        };
        troves::add_trove_include(conn, instance_id, child, TROVETROVES_BY_DEFAULT)?;
        accessmap::extend_trove_grants(conn, instance_id, child)?;
    }

    troves::add_provides(conn, instance_id, &trove.provides)?;
    troves::add_requires(conn, instance_id, &trove.requires)?;

    store_redirects(conn, instance_id, trove)?;
    accessmap::update_cache_for_instance(conn, instance_id)?;
    Ok(instance_id)
}

/// Every redirect target must resolve to an existing trove on its branch,
/// and a group may only point at packages or other groups, never straight
/// at a component.
fn validate_redirects(conn: &Connection, trove: &TroveCommit) -> Result<()> {
    for target in &trove.redirects {
        if trove.is_group() && target.name.contains(':') {
            return Err(Error::IntegrityError(format!(
                "group {} cannot redirect to component {}",
                trove.name, target.name
            )));
        }
        let found: Option<i64> = conn
            .query_row(
                "SELECT i.instanceId FROM Instances i
                 JOIN Items it ON it.itemId = i.itemId
                 JOIN Nodes n ON n.itemId = i.itemId AND n.versionId = i.versionId
                 JOIN Branches b ON b.branchId = n.branchId
                 WHERE it.item = ?1 AND b.branch = ?2 LIMIT 1",
                (&target.name, target.branch.to_string()),
                |r| r.get(0),
            )
            .optional()?;
        if found.is_none() {
            return Err(Error::TroveNotFound(format!(
                "redirect target {}={}",
                target.name, target.branch
            )));
        }
    }
    Ok(())
}

fn store_redirects(conn: &Connection, instance_id: i64, trove: &TroveCommit) -> Result<()> {
    for target in &trove.redirects {
        let item_id = troves::intern_item(conn, &target.name)?;
        let branch_id = {
            conn.execute(
                "INSERT OR IGNORE INTO Branches (branch) VALUES (?1)",
                [target.branch.to_string()],
            )?;
            conn.query_row(
                "SELECT branchId FROM Branches WHERE branch = ?1",
                [target.branch.to_string()],
                |r| r.get::<_, i64>(0),
            )?
        };
        let flavor_id = match &target.flavor {
            Some(flavor) => Some(troves::intern_flavor(conn, flavor)?),
            None => None,
        };
        conn.execute(
            "INSERT INTO TroveRedirects (instanceId, itemId, branchId, flavorId)
             VALUES (?1, ?2, ?3, ?4)",
            (instance_id, item_id, branch_id, flavor_id),
        )?;
    }
    Ok(())
}
