//! SQL sync plans: role convergence is minimal and idempotent, databases
//! are created and re-owned but never dropped.

use std::collections::BTreeMap;

use postgresql_operator::cluster::pg::{plan_database_sync, plan_role_sync};
use postgresql_operator::cluster::users::{PgUser, PgUserMap, RoleOrigin};
use postgresql_operator::util::pg_user_password;

fn user(name: &str, password: &str, flags: &[&str]) -> PgUser {
    PgUser {
        name: name.to_string(),
        password: password.to_string(),
        flags: flags.iter().map(|s| s.to_string()).collect(),
        member_of: Vec::new(),
        origin: RoleOrigin::Manifest,
    }
}

/// The E5 scenario at plan level: a fresh robot user is created once, and
/// the next sync against the resulting catalog state is a no-op.
#[test]
fn second_sync_is_a_noop() {
    let desired = PgUserMap::from([(
        "app".to_string(),
        user("app", "generated-password", &["CREATEDB", "LOGIN"]),
    )]);

    let first = plan_role_sync(&desired, &PgUserMap::new());
    assert_eq!(first.len(), 1);
    assert!(first[0].starts_with("CREATE ROLE \"app\""));

    // what the catalog returns after the first sync: md5 digest stored,
    // INHERIT granted by default
    let present = PgUserMap::from([(
        "app".to_string(),
        user(
            "app",
            &pg_user_password("app", "generated-password"),
            &["INHERIT", "CREATEDB", "LOGIN"],
        ),
    )]);
    assert!(plan_role_sync(&desired, &present).is_empty());
}

#[test]
fn role_password_digests_are_idempotent() {
    // a digest fed back in stays byte-identical, so repeated syncs do not
    // flap on the password
    let digest = pg_user_password("app", "secret");
    assert_eq!(pg_user_password("app", &digest), digest);
}

#[test]
fn databases_converge_without_drops() {
    let pg_users = PgUserMap::from([
        ("app".to_string(), user("app", "x", &["LOGIN"])),
        ("analytics".to_string(), user("analytics", "x", &["LOGIN"])),
    ]);

    let desired = BTreeMap::from([
        ("app_db".to_string(), "app".to_string()),
        ("metrics".to_string(), "analytics".to_string()),
    ]);
    let present = BTreeMap::from([
        ("app_db".to_string(), "postgres".to_string()),
        ("stale_db".to_string(), "app".to_string()),
        ("postgres".to_string(), "postgres".to_string()),
    ]);

    let ddl = plan_database_sync(&desired, &present, &pg_users);
    assert_eq!(
        ddl,
        vec![
            "ALTER DATABASE \"app_db\" OWNER TO \"app\"",
            "CREATE DATABASE \"metrics\" OWNER \"analytics\"",
        ]
    );
    // nothing in the plan touches the databases missing from the manifest
    assert!(ddl.iter().all(|s| !s.contains("stale_db")));
}
