//! Assembly of the in-memory role set.
//!
//! The role set is the disjoint union of system roles (superuser,
//! replication), infrastructure roles (from a referenced secret), robot
//! users declared in the manifest, and team-derived human users. On name
//! collision infrastructure wins over manifest wins over team; system names
//! are reserved and silently skipped.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::config::Config;
use crate::util::random_password;

/// Length of generated role passwords.
pub const PASSWORD_LENGTH: usize = 64;

pub const ROLE_FLAG_SUPERUSER: &str = "SUPERUSER";
pub const ROLE_FLAG_INHERIT: &str = "INHERIT";
pub const ROLE_FLAG_LOGIN: &str = "LOGIN";
pub const ROLE_FLAG_NOLOGIN: &str = "NOLOGIN";
pub const ROLE_FLAG_CREATEROLE: &str = "CREATEROLE";
pub const ROLE_FLAG_CREATEDB: &str = "CREATEDB";
pub const ROLE_FLAG_REPLICATION: &str = "REPLICATION";
pub const ROLE_FLAG_BYPASSRLS: &str = "BYPASSRLS";

/// Key of the superuser entry in the system-user map
pub const SUPERUSER_KEY: &str = "superuser";
/// Key of the replication entry in the system-user map
pub const REPLICATION_USER_KEY: &str = "replication";

static USERNAME_REGEXP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-_a-z0-9]*[a-z0-9])?$").expect("valid regex"));
static ALPHA_NUMERIC_REGEXP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9]*$").expect("valid regex"));

/// Where a role definition came from; decides collision precedence and
/// whether a credentials secret is rendered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RoleOrigin {
    System,
    Infrastructure,
    Manifest,
    TeamsApi,
}

/// One PostgreSQL role the operator manages.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PgUser {
    pub name: String,
    pub password: String,
    pub flags: Vec<String>,
    pub member_of: Vec<String>,
    pub origin: RoleOrigin,
}

impl PgUser {
    pub fn new(name: &str, password: String, origin: RoleOrigin) -> Self {
        Self {
            name: name.to_string(),
            password,
            flags: Vec::new(),
            member_of: Vec::new(),
            origin,
        }
    }
}

/// All managed roles of one cluster, keyed by role name.
pub type PgUserMap = BTreeMap<String, PgUser>;

#[derive(Error, Debug, PartialEq)]
pub enum UserError {
    #[error("invalid username: {0:?}")]
    InvalidUsername(String),

    #[error("invalid flags for user {user:?}: {source}")]
    InvalidFlags { user: String, source: FlagError },
}

#[derive(Error, Debug, PartialEq)]
pub enum FlagError {
    #[error("user flag {0:?} is not alphanumeric")]
    NotAlphanumeric(String),

    #[error("user flag {0:?} is not valid")]
    NotValid(String),

    #[error("conflicting user flags: {0:?} and {1:?}")]
    Conflicting(String, String),
}

fn is_valid_username(username: &str) -> bool {
    USERNAME_REGEXP.is_match(username)
}

fn is_valid_flag(flag: &str) -> bool {
    [
        ROLE_FLAG_SUPERUSER,
        ROLE_FLAG_LOGIN,
        ROLE_FLAG_CREATEDB,
        ROLE_FLAG_INHERIT,
        ROLE_FLAG_REPLICATION,
        ROLE_FLAG_BYPASSRLS,
        ROLE_FLAG_CREATEROLE,
    ]
    .iter()
    .any(|valid| flag == *valid || flag == format!("NO{valid}"))
}

fn invert_flag(flag: &str) -> String {
    match flag.strip_prefix("NO") {
        Some(stripped) => stripped.to_string(),
        None => format!("NO{flag}"),
    }
}

/// Normalize manifest capability flags: alphanumeric only, upper-cased,
/// `LOGIN` implicit unless `NOLOGIN` is given, `X`/`NOX` pairs rejected.
/// The result is sorted; `NOLOGIN` itself is dropped to stay consistent
/// with what the catalog query returns.
pub fn normalize_user_flags(user_flags: &[String]) -> Result<Vec<String>, FlagError> {
    let mut unique = Vec::new();
    let mut add_login = true;

    for flag in user_flags {
        if !ALPHA_NUMERIC_REGEXP.is_match(flag) {
            return Err(FlagError::NotAlphanumeric(flag.clone()));
        }
        let flag = flag.to_uppercase();
        if unique.contains(&flag) {
            continue;
        }
        if !is_valid_flag(&flag) {
            return Err(FlagError::NotValid(flag));
        }
        let inverted = invert_flag(&flag);
        if unique.contains(&inverted) {
            return Err(FlagError::Conflicting(flag, inverted));
        }
        unique.push(flag);
    }

    let mut flags = Vec::new();
    for flag in unique {
        if flag == ROLE_FLAG_LOGIN || flag == ROLE_FLAG_NOLOGIN {
            add_login = false;
            if flag == ROLE_FLAG_NOLOGIN {
                continue;
            }
        }
        flags.push(flag);
    }
    if add_login {
        flags.push(ROLE_FLAG_LOGIN.to_string());
    }
    flags.sort();

    Ok(flags)
}

/// Role names the manifest and the teams directory may not (re)define.
fn is_reserved_name(config: &Config, name: &str) -> bool {
    name == config.super_username
        || name == config.replication_username
        || config.protected_role_names.iter().any(|p| p == name)
}

/// The two system roles every cluster carries.
pub fn init_system_users(config: &Config) -> PgUserMap {
    let mut users = PgUserMap::new();
    users.insert(
        SUPERUSER_KEY.to_string(),
        PgUser {
            name: config.super_username.clone(),
            password: random_password(PASSWORD_LENGTH),
            flags: vec![ROLE_FLAG_SUPERUSER.to_string()],
            member_of: Vec::new(),
            origin: RoleOrigin::System,
        },
    );
    users.insert(
        REPLICATION_USER_KEY.to_string(),
        PgUser {
            name: config.replication_username.clone(),
            password: random_password(PASSWORD_LENGTH),
            flags: vec![ROLE_FLAG_REPLICATION.to_string()],
            member_of: Vec::new(),
            origin: RoleOrigin::System,
        },
    );
    users
}

/// Fold the manifest's robot users into `pg_users`. Reserved names are
/// dropped silently; a preloaded infrastructure role keeps its password and
/// only picks up the normalized manifest flags.
pub fn init_robot_users(
    config: &Config,
    manifest_users: &BTreeMap<String, Vec<String>>,
    pg_users: &mut PgUserMap,
) -> Result<(), UserError> {
    for (username, flags) in manifest_users {
        if !is_valid_username(username) {
            return Err(UserError::InvalidUsername(username.clone()));
        }
        if is_reserved_name(config, username) {
            continue;
        }
        let flags = normalize_user_flags(flags).map_err(|source| UserError::InvalidFlags {
            user: username.clone(),
            source,
        })?;

        match pg_users.get_mut(username) {
            Some(existing) => existing.flags = flags,
            None => {
                pg_users.insert(
                    username.clone(),
                    PgUser {
                        name: username.clone(),
                        password: random_password(PASSWORD_LENGTH),
                        flags,
                        member_of: Vec::new(),
                        origin: RoleOrigin::Manifest,
                    },
                );
            }
        }
    }
    Ok(())
}

/// Fold team members into `pg_users` as human users. They authenticate via
/// PAM (no password), are members of the PAM role, and get `SUPERUSER` when
/// the team-superuser rules apply.
pub fn init_human_users(
    config: &Config,
    team_id: &str,
    members: &[String],
    pg_users: &mut PgUserMap,
) -> Result<(), UserError> {
    let team_superuser = config.enable_team_superuser
        || config
            .postgres_superuser_teams
            .iter()
            .any(|t| t.eq_ignore_ascii_case(team_id));

    for member in members {
        if is_reserved_name(config, member) {
            continue;
        }
        let mut flags = vec![ROLE_FLAG_LOGIN.to_string()];
        if team_superuser {
            flags.push(ROLE_FLAG_SUPERUSER.to_string());
        }
        flags.sort();

        pg_users.insert(
            member.clone(),
            PgUser {
                name: member.clone(),
                password: String::new(),
                flags,
                member_of: vec![config.pam_role_name.clone()],
                origin: RoleOrigin::TeamsApi,
            },
        );
    }
    Ok(())
}

/// Parse infrastructure roles out of the referenced secret. The secret
/// carries numbered triplets `user1`/`password1`/`inrole1`, `user2`/... —
/// a missing user key ends the sequence.
pub fn parse_infrastructure_roles(
    data: &BTreeMap<String, Vec<u8>>,
) -> Result<PgUserMap, String> {
    let get = |key: &str| -> Result<Option<String>, String> {
        match data.get(key) {
            Some(raw) => String::from_utf8(raw.clone())
                .map(Some)
                .map_err(|_| format!("secret key {key:?} is not valid UTF-8")),
            None => Ok(None),
        }
    };

    let mut roles = PgUserMap::new();
    for index in 1.. {
        let Some(name) = get(&format!("user{index}"))? else {
            break;
        };
        let password = get(&format!("password{index}"))?.unwrap_or_default();
        let member_of = get(&format!("inrole{index}"))?
            .map(|role| vec![role])
            .unwrap_or_default();

        roles.insert(
            name.clone(),
            PgUser {
                name,
                password,
                flags: vec![ROLE_FLAG_LOGIN.to_string()],
                member_of,
                origin: RoleOrigin::Infrastructure,
            },
        );
    }
    Ok(roles)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            super_username: "postgres".to_string(),
            replication_username: "standby".to_string(),
            protected_role_names: vec!["admin".to_string()],
            pam_role_name: "zalandos".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn robot_users_with_preloaded_infra_role() {
        let config = test_config();
        let manifest = BTreeMap::from([(
            "foo".to_string(),
            vec!["superuser".to_string(), "createdb".to_string()],
        )]);
        let mut pg_users = PgUserMap::from([(
            "foo".to_string(),
            PgUser::new("foo", "bar".to_string(), RoleOrigin::Infrastructure),
        )]);

        init_robot_users(&config, &manifest, &mut pg_users).unwrap();

        let foo = &pg_users["foo"];
        assert_eq!(foo.password, "bar");
        assert_eq!(foo.flags, vec!["CREATEDB", "LOGIN", "SUPERUSER"]);
    }

    #[test]
    fn robot_user_invalid_username() {
        let config = test_config();
        let manifest = BTreeMap::from([(
            "!fooBar".to_string(),
            vec!["superuser".to_string(), "createdb".to_string()],
        )]);
        let err = init_robot_users(&config, &manifest, &mut PgUserMap::new()).unwrap_err();
        assert_eq!(err.to_string(), r#"invalid username: "!fooBar""#);
    }

    #[test]
    fn robot_user_flag_errors() {
        let config = test_config();

        let manifest = BTreeMap::from([(
            "foobar".to_string(),
            vec!["!superuser".to_string(), "createdb".to_string()],
        )]);
        let err = init_robot_users(&config, &manifest, &mut PgUserMap::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"invalid flags for user "foobar": user flag "!superuser" is not alphanumeric"#
        );

        let manifest = BTreeMap::from([(
            "foobar".to_string(),
            vec!["superuser1".to_string(), "createdb".to_string()],
        )]);
        let err = init_robot_users(&config, &manifest, &mut PgUserMap::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"invalid flags for user "foobar": user flag "SUPERUSER1" is not valid"#
        );

        let manifest = BTreeMap::from([(
            "foobar".to_string(),
            vec!["inherit".to_string(), "noinherit".to_string()],
        )]);
        let err = init_robot_users(&config, &manifest, &mut PgUserMap::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"invalid flags for user "foobar": conflicting user flags: "NOINHERIT" and "INHERIT""#
        );
    }

    #[test]
    fn reserved_names_are_dropped_silently() {
        let config = test_config();
        let manifest = BTreeMap::from([
            ("admin".to_string(), vec!["superuser".to_string()]),
            ("postgres".to_string(), vec!["createdb".to_string()]),
            ("standby".to_string(), vec!["replication".to_string()]),
        ]);
        let mut pg_users = PgUserMap::new();
        init_robot_users(&config, &manifest, &mut pg_users).unwrap();
        assert!(pg_users.is_empty());
    }

    #[test]
    fn nologin_is_not_materialized() {
        let flags = normalize_user_flags(&["nologin".to_string(), "createdb".to_string()]).unwrap();
        assert_eq!(flags, vec!["CREATEDB"]);

        let flags = normalize_user_flags(&[]).unwrap();
        assert_eq!(flags, vec!["LOGIN"]);
    }

    #[test]
    fn human_users_with_team_superuser() {
        let mut config = test_config();
        config.enable_team_superuser = true;

        let mut pg_users = PgUserMap::from([
            (
                "foo".to_string(),
                PgUser {
                    name: "foo".to_string(),
                    password: String::new(),
                    flags: vec!["NOLOGIN".to_string()],
                    member_of: Vec::new(),
                    origin: RoleOrigin::Manifest,
                },
            ),
            (
                "bar".to_string(),
                PgUser {
                    name: "bar".to_string(),
                    password: String::new(),
                    flags: vec!["NOLOGIN".to_string()],
                    member_of: Vec::new(),
                    origin: RoleOrigin::Manifest,
                },
            ),
        ]);

        init_human_users(&config, "test", &["foo".to_string()], &mut pg_users).unwrap();

        let foo = &pg_users["foo"];
        assert_eq!(foo.flags, vec!["LOGIN", "SUPERUSER"]);
        assert_eq!(foo.member_of, vec!["zalandos"]);
        assert_eq!(pg_users["bar"].flags, vec!["NOLOGIN"]);
    }

    #[test]
    fn human_users_skip_reserved_names() {
        let config = test_config();
        let mut pg_users = PgUserMap::new();
        init_human_users(
            &config,
            "test",
            &["admin".to_string(), "standby".to_string()],
            &mut pg_users,
        )
        .unwrap();
        assert!(pg_users.is_empty());
    }

    #[test]
    fn infrastructure_roles_from_secret() {
        let data = BTreeMap::from([
            ("user1".to_string(), b"robot_zmon".to_vec()),
            ("password1".to_string(), b"secret".to_vec()),
            ("inrole1".to_string(), b"admin".to_vec()),
            ("user2".to_string(), b"robot_wal".to_vec()),
            ("password2".to_string(), b"secret2".to_vec()),
        ]);
        let roles = parse_infrastructure_roles(&data).unwrap();
        assert_eq!(roles.len(), 2);
        assert_eq!(roles["robot_zmon"].member_of, vec!["admin"]);
        assert_eq!(roles["robot_wal"].member_of, Vec::<String>::new());
        assert_eq!(roles["robot_zmon"].origin, RoleOrigin::Infrastructure);
    }
}
