// src/recipe/infopkg.rs

//! Info recipes: packages that carry user and group account definitions
//!
//! An info package installs a single key=value file under the system
//! userinfo or groupinfo directory and expresses account relationships as
//! dependencies: the package provides `userinfo: <name>` and requires
//! `groupinfo: <group>` for its primary and supplemental groups, so account
//! creation ordering falls out of ordinary dependency resolution.

use crate::deps::{DepClass, Dependency, DependencySet};
use crate::error::{Error, Result};
use crate::recipe::Recipe;

/// One user account definition
#[derive(Debug, Clone)]
pub struct UserDef {
    pub name: String,
    pub preferred_uid: u32,
    /// Defaults to the user name when unset.
    pub group: Option<String>,
    pub groupid: Option<u32>,
    pub homedir: Option<String>,
    pub comment: Option<String>,
    pub shell: String,
    pub supplemental: Vec<String>,
    pub salted_password: Option<String>,
}

impl UserDef {
    pub fn new(name: &str, preferred_uid: u32) -> Self {
        Self {
            name: name.to_string(),
            preferred_uid,
            group: None,
            groupid: None,
            homedir: None,
            comment: None,
            shell: "/sbin/nologin".to_string(),
            supplemental: Vec::new(),
            salted_password: None,
        }
    }

    pub fn group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    pub fn groupid(mut self, gid: u32) -> Self {
        self.groupid = Some(gid);
        self
    }

    pub fn homedir(mut self, dir: &str) -> Self {
        self.homedir = Some(dir.to_string());
        self
    }

    pub fn comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }

    pub fn shell(mut self, shell: &str) -> Self {
        self.shell = shell.to_string();
        self
    }

    pub fn supplemental(mut self, groups: &[&str]) -> Self {
        self.supplemental = groups.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn salted_password(mut self, password: &str) -> Self {
        self.salted_password = Some(password.to_string());
        self
    }

    fn group_name(&self) -> &str {
        self.group.as_deref().unwrap_or(&self.name)
    }

    /// The userinfo file body, one key=value per line.
    fn render(&self) -> String {
        let mut out = format!("PREFERRED_UID={}\n", self.preferred_uid);
        if let Some(group) = &self.group {
            out.push_str(&format!("GROUP={group}\n"));
        }
        if let Some(gid) = self.groupid {
            out.push_str(&format!("GROUPID={gid}\n"));
        }
        if let Some(homedir) = &self.homedir {
            out.push_str(&format!("HOMEDIR={homedir}\n"));
        }
        if let Some(comment) = &self.comment {
            out.push_str(&format!("COMMENT={comment}\n"));
        }
        out.push_str(&format!("SHELL={}\n", self.shell));
        if !self.supplemental.is_empty() {
            out.push_str(&format!("SUPPLEMENTAL={}\n", self.supplemental.join(",")));
        }
        if let Some(password) = &self.salted_password {
            out.push_str(&format!("PASSWORD={password}\n"));
        }
        out
    }
}

/// A recipe whose sole product is a userinfo file
pub struct UserInfoRecipe {
    pub recipe: Recipe,
    user: Option<UserDef>,
}

impl UserInfoRecipe {
    /// Info package names are `info-<account>`.
    pub fn new(name: &str, version: &str) -> Result<Self> {
        if !name.starts_with("info-") {
            return Err(Error::InvalidName(name.to_string()));
        }
        Ok(Self {
            recipe: Recipe::new(name, version)?,
            user: None,
        })
    }

    /// `r.User(...)`: declare the account and append the action that writes
    /// its userinfo file. Each info recipe defines exactly one account,
    /// named after the package.
    pub fn user(&mut self, user: UserDef) -> Result<()> {
        if self.user.is_some() {
            return Err(Error::RecipeFileError(
                "only one User per info recipe".to_string(),
            ));
        }
        if self.recipe.name != format!("info-{}", user.name) {
            return Err(Error::RecipeFileError(format!(
                "user name '{}' must match package name '{}'",
                user.name, self.recipe.name
            )));
        }
        if let Some(password) = &user.salted_password {
            if !password.starts_with('$') || password.len() != 34 {
                return Err(Error::RecipeFileError(format!(
                    "'{password}' is not a valid md5 salted password"
                )));
            }
        }
        let path = format!("%(userinfodir)s/{}", user.name);
        self.recipe.create(&path, &user.render(), 0o644)?;
        self.user = Some(user);
        Ok(())
    }

    /// `userinfo: <name>`
    pub fn provides(&self) -> DependencySet {
        let mut set = DependencySet::new();
        if let Some(user) = &self.user {
            set.add(Dependency::new(DepClass::UserInfo, &user.name));
        }
        set
    }

    /// `groupinfo: <group>` for the primary and supplemental groups.
    pub fn requires(&self) -> DependencySet {
        let mut set = DependencySet::new();
        if let Some(user) = &self.user {
            set.add(Dependency::new(DepClass::GroupInfo, user.group_name()));
            for group in &user.supplemental {
                set.add(Dependency::new(DepClass::GroupInfo, group));
            }
        }
        set
    }
}

/// A recipe whose sole product is a groupinfo file
pub struct GroupInfoRecipe {
    pub recipe: Recipe,
    group: Option<String>,
    /// User required when this is a supplemental group.
    member: Option<String>,
}

impl GroupInfoRecipe {
    pub fn new(name: &str, version: &str) -> Result<Self> {
        if !name.starts_with("info-") {
            return Err(Error::InvalidName(name.to_string()));
        }
        Ok(Self {
            recipe: Recipe::new(name, version)?,
            group: None,
            member: None,
        })
    }

    fn check_group(&self, name: &str) -> Result<()> {
        if self.group.is_some() {
            return Err(Error::RecipeFileError(
                "only one Group per info recipe".to_string(),
            ));
        }
        if self.recipe.name != format!("info-{name}") {
            return Err(Error::RecipeFileError(format!(
                "group name '{name}' must match package name '{}'",
                self.recipe.name
            )));
        }
        Ok(())
    }

    /// `r.Group(name, gid)`: a standalone group.
    pub fn group(&mut self, name: &str, preferred_gid: u32) -> Result<()> {
        self.check_group(name)?;
        let path = format!("%(groupinfodir)s/{name}");
        let body = format!("PREFERRED_GID={preferred_gid}\n");
        self.recipe.create(&path, &body, 0o644)?;
        self.group = Some(name.to_string());
        Ok(())
    }

    /// `r.SupplementalGroup(user, group, gid)`: a group whose only purpose
    /// is supplemental membership for an existing user.
    pub fn supplemental_group(&mut self, user: &str, name: &str, preferred_gid: u32) -> Result<()> {
        self.check_group(name)?;
        let path = format!("%(groupinfodir)s/{name}");
        let body = format!("PREFERRED_GID={preferred_gid}\nUSER={user}\n");
        self.recipe.create(&path, &body, 0o644)?;
        self.group = Some(name.to_string());
        self.member = Some(user.to_string());
        Ok(())
    }

    /// `groupinfo: <name>`
    pub fn provides(&self) -> DependencySet {
        let mut set = DependencySet::new();
        if let Some(group) = &self.group {
            set.add(Dependency::new(DepClass::GroupInfo, group));
        }
        set
    }

    /// `userinfo: <user>` for supplemental groups, empty otherwise.
    pub fn requires(&self) -> DependencySet {
        let mut set = DependencySet::new();
        if let Some(user) = &self.member {
            set.add(Dependency::new(DepClass::UserInfo, user));
        }
        set
    }
}
