use nix::unistd::{Gid, Group, Uid, User};
use serde::Serialize;
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::PathBuf;

const DEFAULT_PASSWD_PATH: &str = "/etc/passwd";
const DEFAULT_LOGIN_DEFS_PATH: &str = "/etc/login.defs";
const DEFAULT_UID_MIN: u32 = 1000;

/// Name lookups for the POSIX identities that own addon trees.
///
/// Everything the permission engine knows about users and groups goes through this
/// trait, so tests can substitute a fixed identity table for the host database.
pub trait IdentityResolver: Send + Sync {
    fn user_name(&self, uid: u32) -> Option<String>;
    fn group_name(&self, gid: u32) -> Option<String>;
    fn uid_of(&self, user: &str) -> Option<u32>;
    fn gid_of(&self, group: &str) -> Option<u32>;
    /// Secondary members of `group` plus every user whose primary group it is.
    fn members_of(&self, group: &str) -> GroupMembership;
    /// Primary group first, then supplementary groups.
    fn groups_of(&self, user: &str) -> Vec<String>;
    /// The user on whose behalf the process runs (`$SUDO_USER` wins over the real uid).
    fn current_user(&self) -> Option<String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupMembership {
    pub group: String,
    pub exists: bool,
    pub members: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl GroupMembership {
    pub fn missing(group: &str, warning: impl Into<String>) -> Self {
        Self {
            group: group.to_string(),
            exists: false,
            members: BTreeSet::new(),
            warning: Some(warning.into()),
        }
    }

    pub fn contains(&self, user: &str) -> bool {
        self.members.contains(user)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub shell: String,
}

pub fn parse_passwd(content: &str) -> Vec<PasswdEntry> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 7 {
                return None;
            }
            Some(PasswdEntry {
                name: fields[0].to_string(),
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
                home: fields[5].to_string(),
                shell: fields[6].to_string(),
            })
        })
        .collect()
}

pub fn parse_uid_min(content: &str) -> Option<u32> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()? != "UID_MIN" {
            return None;
        }
        parts.next()?.parse().ok()
    })
}

pub fn read_uid_min() -> u32 {
    match fs::read_to_string(DEFAULT_LOGIN_DEFS_PATH) {
        Ok(content) => parse_uid_min(&content).unwrap_or(DEFAULT_UID_MIN),
        Err(err) => {
            tracing::warn!(
                error = %err,
                "could not read {DEFAULT_LOGIN_DEFS_PATH}, using UID_MIN={DEFAULT_UID_MIN}"
            );
            DEFAULT_UID_MIN
        }
    }
}

/// Host identity database: libc lookups through `nix`, enumeration through the passwd file.
#[derive(Debug, Clone)]
pub struct SystemIdentity {
    passwd_path: PathBuf,
}

impl Default for SystemIdentity {
    fn default() -> Self {
        Self {
            passwd_path: PathBuf::from(DEFAULT_PASSWD_PATH),
        }
    }
}

impl SystemIdentity {
    pub fn passwd_entries(&self) -> Vec<PasswdEntry> {
        match fs::read_to_string(&self.passwd_path) {
            Ok(content) => parse_passwd(&content),
            Err(err) => {
                tracing::warn!(
                    path = %self.passwd_path.display(),
                    error = %err,
                    "failed to read passwd database"
                );
                Vec::new()
            }
        }
    }
}

impl IdentityResolver for SystemIdentity {
    fn user_name(&self, uid: u32) -> Option<String> {
        User::from_uid(Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|user| user.name)
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        Group::from_gid(Gid::from_raw(gid))
            .ok()
            .flatten()
            .map(|group| group.name)
    }

    fn uid_of(&self, user: &str) -> Option<u32> {
        User::from_name(user)
            .ok()
            .flatten()
            .map(|user| user.uid.as_raw())
    }

    fn gid_of(&self, group: &str) -> Option<u32> {
        Group::from_name(group)
            .ok()
            .flatten()
            .map(|group| group.gid.as_raw())
    }

    fn members_of(&self, group: &str) -> GroupMembership {
        let found = match Group::from_name(group) {
            Ok(Some(found)) => found,
            Ok(None) => {
                tracing::warn!(group, "group does not exist; membership is empty");
                return GroupMembership::missing(group, format!("group '{group}' does not exist"));
            }
            Err(err) => {
                tracing::warn!(group, error = %err, "group lookup failed");
                return GroupMembership::missing(
                    group,
                    format!("group '{group}' lookup failed: {err}"),
                );
            }
        };
        let gid = found.gid.as_raw();
        let mut members: BTreeSet<String> = found.mem.into_iter().collect();
        for entry in self.passwd_entries() {
            if entry.gid == gid {
                members.insert(entry.name);
            }
        }
        GroupMembership {
            group: group.to_string(),
            exists: true,
            members,
            warning: None,
        }
    }

    fn groups_of(&self, user: &str) -> Vec<String> {
        let Some(found) = User::from_name(user).ok().flatten() else {
            return Vec::new();
        };
        let mut groups = Vec::new();
        if let Some(primary) = self.group_name(found.gid.as_raw()) {
            groups.push(primary);
        }
        #[cfg(target_os = "linux")]
        {
            if let Ok(name) = std::ffi::CString::new(user) {
                match nix::unistd::getgrouplist(&name, found.gid) {
                    Ok(gids) => {
                        for gid in gids {
                            if let Some(group) = self.group_name(gid.as_raw()) {
                                if !groups.contains(&group) {
                                    groups.push(group);
                                }
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(user, error = %err, "supplementary group lookup failed");
                    }
                }
            }
        }
        groups
    }

    fn current_user(&self) -> Option<String> {
        if let Ok(sudo_user) = env::var("SUDO_USER") {
            if !sudo_user.trim().is_empty() {
                return Some(sudo_user.trim().to_string());
            }
        }
        self.user_name(nix::unistd::getuid().as_raw())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HumanUser {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub shell: String,
    pub groups: Vec<String>,
    pub in_odoo_group: bool,
}

fn is_login_shell(shell: &str) -> bool {
    !(shell.ends_with("nologin") || shell.ends_with("false"))
}

/// Interactive accounts (uid at or above `uid_min`, real login shell) with their groups.
pub fn human_users(
    identity: &dyn IdentityResolver,
    entries: &[PasswdEntry],
    uid_min: u32,
    odoo_group: &str,
) -> Vec<HumanUser> {
    let membership = identity.members_of(odoo_group);
    entries
        .iter()
        .filter(|entry| entry.uid >= uid_min && is_login_shell(&entry.shell))
        .map(|entry| HumanUser {
            username: entry.name.clone(),
            uid: entry.uid,
            gid: entry.gid,
            home: entry.home.clone(),
            shell: entry.shell.clone(),
            groups: identity.groups_of(&entry.name),
            in_odoo_group: membership.contains(&entry.name),
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Fixed identity table for tests; never touches the host database.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct FakeIdentity {
        pub users: BTreeMap<u32, String>,
        pub groups: BTreeMap<u32, String>,
        pub members: BTreeMap<String, BTreeSet<String>>,
        pub current: Option<String>,
    }

    impl FakeIdentity {
        pub(crate) fn single(uid: u32, gid: u32, user: &str, group: &str) -> Self {
            let mut identity = Self::default();
            identity.users.insert(uid, user.to_string());
            identity.groups.insert(gid, group.to_string());
            identity
                .members
                .insert(group.to_string(), BTreeSet::from([user.to_string()]));
            identity.current = Some(user.to_string());
            identity
        }
    }

    impl IdentityResolver for FakeIdentity {
        fn user_name(&self, uid: u32) -> Option<String> {
            self.users.get(&uid).cloned()
        }

        fn group_name(&self, gid: u32) -> Option<String> {
            self.groups.get(&gid).cloned()
        }

        fn uid_of(&self, user: &str) -> Option<u32> {
            self.users
                .iter()
                .find(|(_, name)| name.as_str() == user)
                .map(|(uid, _)| *uid)
        }

        fn gid_of(&self, group: &str) -> Option<u32> {
            self.groups
                .iter()
                .find(|(_, name)| name.as_str() == group)
                .map(|(gid, _)| *gid)
        }

        fn members_of(&self, group: &str) -> GroupMembership {
            match self.members.get(group) {
                Some(members) => GroupMembership {
                    group: group.to_string(),
                    exists: true,
                    members: members.clone(),
                    warning: None,
                },
                None => GroupMembership::missing(group, format!("group '{group}' does not exist")),
            }
        }

        fn groups_of(&self, user: &str) -> Vec<String> {
            self.members
                .iter()
                .filter(|(_, members)| members.contains(user))
                .map(|(group, _)| group.clone())
                .collect()
        }

        fn current_user(&self) -> Option<String> {
            self.current.clone()
        }
    }

    const PASSWD: &str = "root:x:0:0:root:/root:/bin/bash
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
odoo:x:112:118:Odoo:/var/lib/odoo:/bin/false
alice:x:1000:1000:Alice:/home/alice:/bin/bash
# comment line
broken-line
bob:x:1001:118:Bob:/home/bob:/bin/zsh
svc:x:1002:1002::/srv:/usr/sbin/nologin
";

    #[test]
    fn passwd_parsing_skips_comments_and_malformed_lines() {
        let entries = parse_passwd(PASSWD);
        let names: Vec<&str> = entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, vec!["root", "daemon", "odoo", "alice", "bob", "svc"]);
        assert_eq!(entries[3].uid, 1000);
        assert_eq!(entries[4].gid, 118);
        assert_eq!(entries[4].shell, "/bin/zsh");
    }

    #[test]
    fn uid_min_is_read_from_login_defs() {
        let content = "# defaults\nMAIL_DIR /var/mail\nUID_MIN\t\t\t 1500\nUID_MAX 60000\n";
        assert_eq!(parse_uid_min(content), Some(1500));
        assert_eq!(parse_uid_min("UID_MAX 60000\n"), None);
    }

    #[test]
    fn human_users_excludes_system_and_nologin_accounts() {
        let mut identity = FakeIdentity::default();
        identity
            .members
            .insert("odoo".to_string(), BTreeSet::from(["bob".to_string()]));
        let users = human_users(&identity, &parse_passwd(PASSWD), 1000, "odoo");
        let names: Vec<&str> = users.iter().map(|user| user.username.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert!(!users[0].in_odoo_group);
        assert!(users[1].in_odoo_group);
        assert_eq!(users[1].groups, vec!["odoo".to_string()]);
    }

    #[test]
    fn system_identity_missing_group_is_empty_not_error() {
        let identity = SystemIdentity::default();
        let membership = identity.members_of("odmon-no-such-group-7f3a");
        assert!(!membership.exists);
        assert!(membership.members.is_empty());
        assert!(membership
            .warning
            .as_deref()
            .unwrap_or_default()
            .contains("does not exist"));
    }

    #[test]
    fn system_identity_root_group_resolves() {
        let identity = SystemIdentity::default();
        assert_eq!(identity.user_name(0).as_deref(), Some("root"));
        assert_eq!(identity.uid_of("root"), Some(0));
        assert!(identity.uid_of("odmon-no-such-user-7f3a").is_none());
    }
}
