// src/repository/resolver.rs

//! Permission resolver: AuthToken to the set of roles in force
//!
//! Role resolution draws from three sources: the user's password (with an
//! anonymous fallback), entitlement keys (local store first, then the
//! external validator), and the geo accept-flags attached to each role.
//! The result is a set; callers must not depend on order beyond the sorted
//! form returned here.

use crate::error::{Error, Result};
use crate::flavor::Flavor;
use crate::repository::auth;
use crate::repository::validator::{cache_key, AuthCache, EntitlementAnswer, Validator, DEFAULT_CACHE_TTL};
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

/// Account consulted when a password check fails or no user is named.
pub const ANONYMOUS: &str = "anonymous";

/// Who the caller claims to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// A named account whose password must check out.
    User(String),
    /// Trusted in-process caller assuming membership in the named roles,
    /// skipping the account lookup entirely.
    ValidUser(Vec<String>),
    /// `ValidUser('*')`: membership in every role.
    AnyRole,
}

/// Password presented with a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Password {
    Cleartext(String),
    /// `ValidPasswordToken`: any password is correct for the named user.
    /// Only reachable from already-authenticated in-process contexts.
    Valid,
}

/// Everything known about one request's caller.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub identity: Identity,
    pub password: Password,
    /// (class, key) pairs presented by the caller.
    pub entitlements: Vec<(String, String)>,
    pub remote_ip: Option<String>,
    pub forwarded_for: Option<String>,
}

impl AuthToken {
    pub fn anonymous() -> Self {
        Self {
            identity: Identity::User(ANONYMOUS.to_string()),
            password: Password::Cleartext(ANONYMOUS.to_string()),
            entitlements: Vec::new(),
            remote_ip: None,
            forwarded_for: None,
        }
    }

    pub fn user(name: &str, password: &str) -> Self {
        Self {
            identity: Identity::User(name.to_string()),
            password: Password::Cleartext(password.to_string()),
            entitlements: Vec::new(),
            remote_ip: None,
            forwarded_for: None,
        }
    }
}

/// Source of request geo flags (country codes). The default derives nothing;
/// deployments wire in a GeoIP lookup.
pub trait FlagSource {
    fn flags(&self, remote_ip: Option<&str>, forwarded_for: Option<&str>) -> Vec<String>;
}

/// No geo information available.
pub struct NoFlags;

impl FlagSource for NoFlags {
    fn flags(&self, _remote_ip: Option<&str>, _forwarded_for: Option<&str>) -> Vec<String> {
        Vec::new()
    }
}

/// Resolver over one open store.
pub struct Resolver<'a> {
    conn: &'a Connection,
    cache: &'a AuthCache,
    server_name: String,
    password_validator: Option<&'a Validator>,
    entitlement_validator: Option<&'a Validator>,
    flag_source: &'a dyn FlagSource,
}

impl<'a> Resolver<'a> {
    pub fn new(conn: &'a Connection, cache: &'a AuthCache, server_name: &str) -> Self {
        Self {
            conn,
            cache,
            server_name: server_name.to_string(),
            password_validator: None,
            entitlement_validator: None,
            flag_source: &NoFlags,
        }
    }

    pub fn with_password_validator(mut self, validator: &'a Validator) -> Self {
        self.password_validator = Some(validator);
        self
    }

    pub fn with_entitlement_validator(mut self, validator: &'a Validator) -> Self {
        self.entitlement_validator = Some(validator);
        self
    }

    pub fn with_flag_source(mut self, source: &'a dyn FlagSource) -> Self {
        self.flag_source = source;
        self
    }

    /// Resolve the set of roles in force for `token`. The returned roles are
    /// sorted; the order carries no meaning.
    pub fn resolve(&self, token: &AuthToken) -> Result<Vec<String>> {
        let mut roles: BTreeSet<String> = BTreeSet::new();

        match &token.identity {
            Identity::AnyRole => {
                roles.extend(auth::all_roles(self.conn)?);
            }
            Identity::ValidUser(named) => {
                roles.extend(named.iter().cloned());
            }
            Identity::User(name) => {
                roles.extend(self.password_roles(name, &token.password, token)?);
            }
        }

        roles.extend(self.entitlement_roles(token)?);
        self.check_accept_flags(&roles, token)?;
        Ok(roles.into_iter().collect())
    }

    fn password_roles(
        &self,
        name: &str,
        password: &Password,
        token: &AuthToken,
    ) -> Result<Vec<String>> {
        let authenticated = match password {
            Password::Valid => true,
            Password::Cleartext(cleartext) => self.verify_password(name, cleartext, token)?,
        };
        if authenticated {
            return auth::roles_for_user(self.conn, name);
        }
        debug!(user = name, "password check failed, trying anonymous");
        self.anonymous_roles()
    }

    /// Roles the anonymous account carries, with mirror-capable roles
    /// stripped: mirror access always requires real authentication.
    fn anonymous_roles(&self) -> Result<Vec<String>> {
        let all = match auth::roles_for_user(self.conn, ANONYMOUS) {
            Ok(roles) => roles,
            Err(Error::UserNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut kept = Vec::new();
        for role in all {
            if !auth::role_flags(self.conn, &role)?.can_mirror {
                kept.push(role);
            }
        }
        Ok(kept)
    }

    fn verify_password(&self, name: &str, cleartext: &str, token: &AuthToken) -> Result<bool> {
        let key = cache_key(name, cleartext.as_bytes());
        if let Some((valid, _, _)) = self.cache.get(&key) {
            return Ok(valid);
        }
        let valid = if auth::check_password(self.conn, name, cleartext)? {
            true
        } else if let Some(validator) = self.password_validator {
            validator.check_password(name, cleartext, token.remote_ip.as_deref())?
        } else {
            false
        };
        self.cache
            .put(key, valid, Vec::new(), DEFAULT_CACHE_TTL, false);
        Ok(valid)
    }

    fn entitlement_roles(&self, token: &AuthToken) -> Result<Vec<String>> {
        let mut roles = Vec::new();
        let mut timed_out = Vec::new();
        for (class, key) in &token.entitlements {
            let digest = cache_key(class, key.as_bytes());
            if let Some((valid, cached, _)) = self.cache.get(&digest) {
                if valid {
                    roles.extend(cached);
                }
                continue;
            }
            let local = auth::roles_for_entitlement(self.conn, class, key.as_bytes())?;
            if !local.is_empty() {
                roles.extend(local);
                continue;
            }
            let Some(validator) = self.entitlement_validator else {
                continue;
            };
            let answer = validator.check_entitlement(
                &self.server_name,
                class,
                key,
                token.remote_ip.as_deref(),
            )?;
            match self.accept_answer(class, key, &answer)? {
                Some(granted) => roles.extend(granted),
                None => timed_out.push(format!("{class}/{key}")),
            }
        }
        if !timed_out.is_empty() {
            return Err(Error::EntitlementTimeout(timed_out));
        }
        Ok(roles)
    }

    /// Fold one validator answer into the cache. `Ok(None)` marks a
    /// negative-timeout answer the caller must report as EntitlementTimeout.
    fn accept_answer(
        &self,
        class: &str,
        key: &str,
        answer: &EntitlementAnswer,
    ) -> Result<Option<Vec<String>>> {
        if let Some(timeout) = answer.timeout {
            if timeout < 0 {
                warn!(class, "validator returned negative timeout");
                return Ok(None);
            }
        }
        let granted = if answer.valid {
            self.class_roles(class)?
        } else {
            Vec::new()
        };
        let ttl = answer
            .timeout
            .map(|t| Duration::from_secs(t as u64))
            .unwrap_or(DEFAULT_CACHE_TTL);
        self.cache.put(
            cache_key(class, key.as_bytes()),
            answer.valid,
            granted.clone(),
            ttl,
            answer.retry,
        );
        Ok(Some(granted))
    }

    /// Roles attached to an entitlement class, regardless of which keys the
    /// local store knows. Used when an external validator vouched for a key.
    fn class_roles(&self, class: &str) -> Result<Vec<String>> {
        let cid = match auth::entitlement_class_id(self.conn, class) {
            Ok(id) => id,
            Err(Error::UnknownEntitlementClass(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut stmt = self.conn.prepare(
            "SELECT ug.userGroup FROM UserGroups ug
             JOIN EntitlementAccessMap am ON am.userGroupId = ug.userGroupId
             WHERE am.entGroupId = ?1 ORDER BY ug.userGroup",
        )?;
        let roles = stmt
            .query_map([cid], |r| r.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(roles)
    }

    /// Every role in force must accept the request's geo flags. One mismatch
    /// fails the whole call.
    fn check_accept_flags(&self, roles: &BTreeSet<String>, token: &AuthToken) -> Result<()> {
        let flags = self.flag_source.flags(
            token.remote_ip.as_deref(),
            token.forwarded_for.as_deref(),
        );
        let present = Flavor::from_present(flags.iter().map(String::as_str));
        for role in roles {
            let stored = match auth::role_flags(self.conn, role) {
                Ok(flags) => flags.accept_flags,
                // ValidUser may name roles the store has never seen.
                Err(Error::RoleNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if stored.is_empty() {
                continue;
            }
            let accept = Flavor::parse(&stored)?;
            if !present.satisfies(&accept) {
                debug!(role, "geo flags rejected by accept_flags");
                return Err(Error::InsufficientPermission);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::repository::auth::RoleFlags;
    use crate::repository::schema;

    fn store() -> Database {
        let db = Database::open_in_memory().unwrap();
        schema::setup(&db).unwrap();
        db
    }

    struct FixedFlags(Vec<String>);

    impl FlagSource for FixedFlags {
        fn flags(&self, _remote_ip: Option<&str>, _forwarded_for: Option<&str>) -> Vec<String> {
            self.0.clone()
        }
    }

    #[test]
    fn test_password_grants_user_roles() {
        let db = store();
        auth::add_user(db.conn(), "alice", "pw").unwrap();
        auth::add_role(db.conn(), "writers").unwrap();
        auth::add_role_member(db.conn(), "writers", "alice").unwrap();

        let cache = AuthCache::new();
        let resolver = Resolver::new(db.conn(), &cache, "repo.example.com");
        let roles = resolver.resolve(&AuthToken::user("alice", "pw")).unwrap();
        assert_eq!(roles, vec!["writers".to_string()]);
    }

    #[test]
    fn test_wrong_password_falls_back_to_anonymous() {
        let db = store();
        auth::add_user(db.conn(), "alice", "pw").unwrap();
        auth::add_user(db.conn(), ANONYMOUS, ANONYMOUS).unwrap();
        auth::add_role(db.conn(), "public").unwrap();
        auth::add_role(db.conn(), "mirror").unwrap();
        auth::set_role_flags(
            db.conn(),
            "mirror",
            &RoleFlags { can_mirror: true, ..Default::default() },
        )
        .unwrap();
        auth::add_role_member(db.conn(), "public", ANONYMOUS).unwrap();
        auth::add_role_member(db.conn(), "mirror", ANONYMOUS).unwrap();

        let cache = AuthCache::new();
        let resolver = Resolver::new(db.conn(), &cache, "repo.example.com");
        let roles = resolver.resolve(&AuthToken::user("alice", "bad")).unwrap();
        // The mirror-capable role never comes from the anonymous fallback.
        assert_eq!(roles, vec!["public".to_string()]);
    }

    #[test]
    fn test_valid_password_token_bypasses_check() {
        let db = store();
        auth::add_user(db.conn(), "alice", "pw").unwrap();
        auth::add_role(db.conn(), "writers").unwrap();
        auth::add_role_member(db.conn(), "writers", "alice").unwrap();

        let cache = AuthCache::new();
        let resolver = Resolver::new(db.conn(), &cache, "repo.example.com");
        let token = AuthToken {
            identity: Identity::User("alice".to_string()),
            password: Password::Valid,
            entitlements: Vec::new(),
            remote_ip: None,
            forwarded_for: None,
        };
        assert_eq!(resolver.resolve(&token).unwrap(), vec!["writers".to_string()]);
    }

    #[test]
    fn test_valid_user_star_gets_all_roles() {
        let db = store();
        auth::add_role(db.conn(), "a").unwrap();
        auth::add_role(db.conn(), "b").unwrap();
        let cache = AuthCache::new();
        let resolver = Resolver::new(db.conn(), &cache, "repo.example.com");
        let token = AuthToken {
            identity: Identity::AnyRole,
            password: Password::Valid,
            entitlements: Vec::new(),
            remote_ip: None,
            forwarded_for: None,
        };
        assert_eq!(
            resolver.resolve(&token).unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_entitlement_resolves_through_access_map() {
        let db = store();
        auth::add_role(db.conn(), "owner").unwrap();
        auth::add_role(db.conn(), "customers").unwrap();
        auth::add_entitlement_class(db.conn(), "cust1").unwrap();
        auth::add_entitlement_class_owner(db.conn(), "cust1", "owner").unwrap();
        auth::set_entitlement_class_access(db.conn(), "cust1", &["customers"]).unwrap();
        auth::add_entitlement_key(db.conn(), "cust1", b"ENTITLEMENT0").unwrap();

        let cache = AuthCache::new();
        let resolver = Resolver::new(db.conn(), &cache, "repo.example.com");
        let mut token = AuthToken::anonymous();
        token.entitlements = vec![("cust1".to_string(), "ENTITLEMENT0".to_string())];
        assert_eq!(resolver.resolve(&token).unwrap(), vec!["customers".to_string()]);
    }

    #[test]
    fn test_cached_entitlement_skips_store() {
        let db = store();
        let cache = AuthCache::new();
        cache.put(
            cache_key("cust1", b"KEY"),
            true,
            vec!["cached-role".to_string()],
            Duration::from_secs(60),
            false,
        );
        let resolver = Resolver::new(db.conn(), &cache, "repo.example.com");
        let mut token = AuthToken::anonymous();
        token.entitlements = vec![("cust1".to_string(), "KEY".to_string())];
        // No such class exists in the store; only the cache can answer.
        assert_eq!(resolver.resolve(&token).unwrap(), vec!["cached-role".to_string()]);
    }

    #[test]
    fn test_negative_timeout_raises_entitlement_timeout() {
        let db = store();
        let cache = AuthCache::new();
        let resolver = Resolver::new(db.conn(), &cache, "repo.example.com");
        let answer = EntitlementAnswer {
            valid: false,
            timeout: Some(-1),
            retry: true,
        };
        assert!(resolver.accept_answer("cust1", "KEY", &answer).unwrap().is_none());
    }

    #[test]
    fn test_accept_flags_mismatch_denies() {
        let db = store();
        auth::add_user(db.conn(), "alice", "pw").unwrap();
        auth::add_role(db.conn(), "domestic").unwrap();
        auth::add_role_member(db.conn(), "domestic", "alice").unwrap();
        auth::set_role_flags(
            db.conn(),
            "domestic",
            &RoleFlags { accept_flags: "use.US".to_string(), ..Default::default() },
        )
        .unwrap();

        let cache = AuthCache::new();
        let flags = FixedFlags(vec!["use.DE".to_string()]);
        let resolver = Resolver::new(db.conn(), &cache, "repo.example.com")
            .with_flag_source(&flags);
        let err = resolver.resolve(&AuthToken::user("alice", "pw")).unwrap_err();
        assert!(matches!(err, Error::InsufficientPermission));

        let good = FixedFlags(vec!["use.US".to_string()]);
        let resolver = Resolver::new(db.conn(), &cache, "repo.example.com")
            .with_flag_source(&good);
        assert_eq!(
            resolver.resolve(&AuthToken::user("alice", "pw")).unwrap(),
            vec!["domestic".to_string()]
        );
    }
}
