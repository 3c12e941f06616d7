// src/repository/schema.rs

//! Repository relational schema
//!
//! The schema version is a (major, minor) pair stored in DatabaseVersion.
//! A different major is fatal; a smaller minor within the supported major
//! is migrated forward in place.

use crate::db::Database;
use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

pub const SCHEMA_MAJOR: i32 = 1;
pub const SCHEMA_MINOR: i32 = 0;

fn create_tables(conn: &Connection) -> Result<()> {
    debug!("creating repository schema {SCHEMA_MAJOR}.{SCHEMA_MINOR}");
    conn.execute_batch(
        "
        CREATE TABLE DatabaseVersion (
            major INTEGER NOT NULL,
            minor INTEGER NOT NULL
        );

        -- Interned name fragments -------------------------------------

        CREATE TABLE Items (
            itemId INTEGER PRIMARY KEY AUTOINCREMENT,
            item TEXT NOT NULL UNIQUE
        );

        CREATE TABLE Versions (
            versionId INTEGER PRIMARY KEY AUTOINCREMENT,
            version TEXT NOT NULL UNIQUE
        );

        CREATE TABLE Branches (
            branchId INTEGER PRIMARY KEY AUTOINCREMENT,
            branch TEXT NOT NULL UNIQUE
        );

        CREATE TABLE Labels (
            labelId INTEGER PRIMARY KEY AUTOINCREMENT,
            label TEXT NOT NULL UNIQUE
        );

        CREATE TABLE LabelMap (
            itemId INTEGER NOT NULL REFERENCES Items(itemId),
            branchId INTEGER NOT NULL REFERENCES Branches(branchId),
            labelId INTEGER NOT NULL REFERENCES Labels(labelId)
        );
        CREATE INDEX LabelMapItemIdx ON LabelMap(itemId);
        CREATE INDEX LabelMapLabelIdx ON LabelMap(labelId);

        CREATE TABLE Flavors (
            flavorId INTEGER PRIMARY KEY AUTOINCREMENT,
            flavor TEXT NOT NULL UNIQUE
        );

        CREATE TABLE FlavorMap (
            flavorId INTEGER NOT NULL REFERENCES Flavors(flavorId),
            base TEXT NOT NULL,
            sense INTEGER NOT NULL,
            depClass INTEGER NOT NULL
        );
        CREATE INDEX FlavorMapIdx ON FlavorMap(flavorId);

        CREATE TABLE FlavorScores (
            request INTEGER NOT NULL,
            present INTEGER NOT NULL,
            value INTEGER NOT NULL
        );

        -- Troves --------------------------------------------------------

        CREATE TABLE Instances (
            instanceId INTEGER PRIMARY KEY AUTOINCREMENT,
            itemId INTEGER NOT NULL REFERENCES Items(itemId),
            versionId INTEGER NOT NULL REFERENCES Versions(versionId),
            flavorId INTEGER NOT NULL REFERENCES Flavors(flavorId),
            troveType INTEGER NOT NULL DEFAULT 0,
            isPresent INTEGER NOT NULL DEFAULT 1,
            isHidden INTEGER NOT NULL DEFAULT 0,
            UNIQUE(itemId, versionId, flavorId)
        );

        CREATE TABLE Nodes (
            nodeId INTEGER PRIMARY KEY AUTOINCREMENT,
            itemId INTEGER NOT NULL REFERENCES Items(itemId),
            branchId INTEGER NOT NULL REFERENCES Branches(branchId),
            versionId INTEGER NOT NULL REFERENCES Versions(versionId),
            timeStamps TEXT,
            finalTimeStamp REAL,
            UNIQUE(itemId, versionId)
        );

        -- File streams and paths ---------------------------------------

        CREATE TABLE FileStreams (
            streamId INTEGER PRIMARY KEY AUTOINCREMENT,
            fileId BLOB NOT NULL UNIQUE,
            stream BLOB,
            sha1 BLOB
        );
        CREATE INDEX FileStreamsSha1Idx ON FileStreams(sha1);

        CREATE TABLE Dirnames (
            dirnameId INTEGER PRIMARY KEY AUTOINCREMENT,
            dirname TEXT NOT NULL UNIQUE
        );

        CREATE TABLE Basenames (
            basenameId INTEGER PRIMARY KEY AUTOINCREMENT,
            basename TEXT NOT NULL UNIQUE
        );

        CREATE TABLE FilePaths (
            filePathId INTEGER PRIMARY KEY AUTOINCREMENT,
            pathId BLOB NOT NULL,
            dirnameId INTEGER NOT NULL REFERENCES Dirnames(dirnameId),
            basenameId INTEGER NOT NULL REFERENCES Basenames(basenameId)
        );
        CREATE INDEX FilePathsPathIdx ON FilePaths(pathId);

        CREATE TABLE TroveFiles (
            instanceId INTEGER NOT NULL REFERENCES Instances(instanceId),
            streamId INTEGER NOT NULL REFERENCES FileStreams(streamId),
            filePathId INTEGER NOT NULL REFERENCES FilePaths(filePathId),
            versionId INTEGER NOT NULL REFERENCES Versions(versionId)
        );
        CREATE INDEX TroveFilesInstanceIdx ON TroveFiles(instanceId);

        CREATE TABLE TroveTroves (
            instanceId INTEGER NOT NULL REFERENCES Instances(instanceId),
            includedId INTEGER NOT NULL REFERENCES Instances(instanceId),
            flags INTEGER NOT NULL DEFAULT 0,
            UNIQUE(instanceId, includedId)
        );
        CREATE INDEX TroveTrovesIncludedIdx ON TroveTroves(includedId);

        CREATE TABLE Dependencies (
            depId INTEGER PRIMARY KEY AUTOINCREMENT,
            class INTEGER NOT NULL,
            name TEXT NOT NULL,
            flag TEXT NOT NULL DEFAULT '',
            UNIQUE(class, name, flag)
        );

        CREATE TABLE Provides (
            instanceId INTEGER NOT NULL REFERENCES Instances(instanceId),
            depId INTEGER NOT NULL REFERENCES Dependencies(depId)
        );
        CREATE INDEX ProvidesInstanceIdx ON Provides(instanceId);

        CREATE TABLE Requires (
            instanceId INTEGER NOT NULL REFERENCES Instances(instanceId),
            depId INTEGER NOT NULL REFERENCES Dependencies(depId)
        );
        CREATE INDEX RequiresInstanceIdx ON Requires(instanceId);

        CREATE TABLE TroveInfo (
            instanceId INTEGER NOT NULL REFERENCES Instances(instanceId),
            infoType INTEGER NOT NULL,
            data BLOB NOT NULL
        );
        CREATE INDEX TroveInfoInstanceIdx ON TroveInfo(instanceId);

        CREATE TABLE TroveRedirects (
            instanceId INTEGER NOT NULL REFERENCES Instances(instanceId),
            itemId INTEGER NOT NULL REFERENCES Items(itemId),
            branchId INTEGER NOT NULL REFERENCES Branches(branchId),
            flavorId INTEGER REFERENCES Flavors(flavorId)
        );

        -- Identity ------------------------------------------------------

        CREATE TABLE Users (
            userId INTEGER PRIMARY KEY AUTOINCREMENT,
            userName TEXT NOT NULL UNIQUE,
            salt BLOB NOT NULL,
            password TEXT NOT NULL
        );

        CREATE TABLE UserGroups (
            userGroupId INTEGER PRIMARY KEY AUTOINCREMENT,
            userGroup TEXT NOT NULL UNIQUE,
            canMirror INTEGER NOT NULL DEFAULT 0,
            admin INTEGER NOT NULL DEFAULT 0,
            acceptFlags TEXT NOT NULL DEFAULT '',
            filterFlags TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE UserGroupMembers (
            userGroupId INTEGER NOT NULL REFERENCES UserGroups(userGroupId),
            userId INTEGER NOT NULL REFERENCES Users(userId),
            UNIQUE(userGroupId, userId)
        );
        CREATE INDEX UserGroupMembersUserIdx ON UserGroupMembers(userId);

        CREATE TABLE Permissions (
            permissionId INTEGER PRIMARY KEY AUTOINCREMENT,
            userGroupId INTEGER NOT NULL REFERENCES UserGroups(userGroupId),
            labelId INTEGER NOT NULL,
            itemId INTEGER NOT NULL,
            canWrite INTEGER NOT NULL DEFAULT 0,
            canRemove INTEGER NOT NULL DEFAULT 0,
            UNIQUE(userGroupId, labelId, itemId)
        );

        -- Entitlements --------------------------------------------------

        CREATE TABLE EntitlementGroups (
            entGroupId INTEGER PRIMARY KEY AUTOINCREMENT,
            entGroup TEXT NOT NULL UNIQUE
        );

        CREATE TABLE Entitlements (
            entGroupId INTEGER NOT NULL REFERENCES EntitlementGroups(entGroupId),
            entitlement BLOB NOT NULL,
            UNIQUE(entGroupId, entitlement)
        );

        CREATE TABLE EntitlementOwners (
            entGroupId INTEGER NOT NULL REFERENCES EntitlementGroups(entGroupId),
            ownerGroupId INTEGER NOT NULL REFERENCES UserGroups(userGroupId),
            UNIQUE(entGroupId, ownerGroupId)
        );

        CREATE TABLE EntitlementAccessMap (
            entGroupId INTEGER NOT NULL REFERENCES EntitlementGroups(entGroupId),
            userGroupId INTEGER NOT NULL REFERENCES UserGroups(userGroupId),
            UNIQUE(entGroupId, userGroupId)
        );

        -- Accessibility cache -------------------------------------------

        CREATE TABLE UserGroupTroves (
            ugtId INTEGER PRIMARY KEY AUTOINCREMENT,
            userGroupId INTEGER NOT NULL REFERENCES UserGroups(userGroupId),
            instanceId INTEGER NOT NULL REFERENCES Instances(instanceId),
            recursive INTEGER NOT NULL DEFAULT 0,
            UNIQUE(userGroupId, instanceId)
        );

        CREATE TABLE UserGroupAllTroves (
            ugtId INTEGER NOT NULL REFERENCES UserGroupTroves(ugtId),
            userGroupId INTEGER NOT NULL REFERENCES UserGroups(userGroupId),
            instanceId INTEGER NOT NULL REFERENCES Instances(instanceId)
        );
        CREATE INDEX UserGroupAllTrovesIdx ON UserGroupAllTroves(userGroupId, instanceId);

        CREATE TABLE UserGroupAllPermissions (
            permissionId INTEGER NOT NULL REFERENCES Permissions(permissionId),
            userGroupId INTEGER NOT NULL REFERENCES UserGroups(userGroupId),
            instanceId INTEGER NOT NULL REFERENCES Instances(instanceId),
            canWrite INTEGER NOT NULL DEFAULT 0,
            canRemove INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX UserGroupAllPermissionsIdx
            ON UserGroupAllPermissions(userGroupId, instanceId);

        CREATE TABLE UserGroupInstancesCache (
            userGroupId INTEGER NOT NULL REFERENCES UserGroups(userGroupId),
            instanceId INTEGER NOT NULL REFERENCES Instances(instanceId),
            canWrite INTEGER NOT NULL DEFAULT 0,
            UNIQUE(userGroupId, instanceId)
        );
        CREATE INDEX UserGroupInstancesCacheIdx
            ON UserGroupInstancesCache(instanceId);

        -- Bookkeeping ---------------------------------------------------

        CREATE TABLE LatestCache (
            itemId INTEGER NOT NULL REFERENCES Items(itemId),
            branchId INTEGER NOT NULL REFERENCES Branches(branchId),
            flavorId INTEGER NOT NULL REFERENCES Flavors(flavorId),
            versionId INTEGER NOT NULL REFERENCES Versions(versionId),
            latestType INTEGER NOT NULL
        );
        CREATE INDEX LatestCacheIdx ON LatestCache(itemId, branchId);

        CREATE TABLE CommitLock (
            lockId INTEGER PRIMARY KEY CHECK (lockId = 0),
            lockedBy TEXT,
            lockedAt REAL
        );
        INSERT INTO CommitLock (lockId, lockedBy, lockedAt) VALUES (0, NULL, NULL);
        ",
    )?;
    conn.execute(
        "INSERT INTO DatabaseVersion (major, minor) VALUES (?1, ?2)",
        (SCHEMA_MAJOR, SCHEMA_MINOR),
    )?;
    Ok(())
}

fn stored_version(conn: &Connection) -> Result<Option<(i32, i32)>> {
    let has_table: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type='table' AND name='DatabaseVersion'",
            [],
            |r| r.get(0),
        )
        .optional()?;
    if has_table.is_none() {
        return Ok(None);
    }
    let version = conn
        .query_row("SELECT major, minor FROM DatabaseVersion", [], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .optional()?;
    Ok(version)
}

/// Create the schema on an empty database, or verify an existing one.
///
/// A major mismatch is fatal. A smaller minor within the current major is
/// accepted and stamped forward; a larger minor (written by a newer peer
/// within the same major) is compatible by construction.
pub fn setup(db: &Database) -> Result<()> {
    match stored_version(db.conn())? {
        None => {
            create_tables(db.conn())?;
            info!("initialized schema {SCHEMA_MAJOR}.{SCHEMA_MINOR}");
            Ok(())
        }
        Some((major, minor)) if major != SCHEMA_MAJOR => Err(Error::SchemaVersionError {
            found: (major, minor),
            supported: SCHEMA_MAJOR,
        }),
        Some((_, minor)) => {
            if minor < SCHEMA_MINOR {
                db.conn().execute(
                    "UPDATE DatabaseVersion SET minor = ?1",
                    [SCHEMA_MINOR],
                )?;
                info!("schema minor updated {minor} -> {SCHEMA_MINOR}");
            }
            Ok(())
        }
    }
}
