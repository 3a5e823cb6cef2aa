//! In-database state: role and database synchronization.
//!
//! The synchronizer connects to the cluster's master service with the
//! superuser credentials, reads the managed roles and databases in one
//! query each, and issues the minimal DDL to converge them. Planning is
//! separated from execution so the DDL set is testable without a server.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use rustls::pki_types::{CertificateDer, ServerName};
use thiserror::Error;
use tokio_postgres::types::ToSql;
use tokio_postgres_rustls_improved::MakeRustlsConnect;
use tracing::{debug, info};

use crate::cluster::users::{PgUser, PgUserMap, RoleOrigin};
use crate::config::Config;
use crate::util::pg_user_password;

static DATABASE_NAME_REGEXP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("valid regex"));

const GET_USERS_SQL: &str = r#"
    SELECT a.rolname, COALESCE(a.rolpassword, ''), a.rolsuper, a.rolinherit,
           a.rolcreaterole, a.rolcreatedb, a.rolcanlogin,
           ARRAY(SELECT b.rolname
                   FROM pg_catalog.pg_auth_members m
                   JOIN pg_catalog.pg_authid b ON (m.roleid = b.oid)
                  WHERE m.member = a.oid) AS memberof
      FROM pg_catalog.pg_authid a
     WHERE a.rolname = ANY($1)
     ORDER BY 1
"#;

const GET_DATABASES_SQL: &str =
    "SELECT datname, pg_get_userbyid(datdba) AS owner FROM pg_database";

#[derive(Error, Debug)]
pub enum PgError {
    #[error("could not connect to PostgreSQL database: {0}")]
    Connect(tokio_postgres::Error),

    #[error("connection retries exhausted after {0:?}")]
    ConnectTimeout(std::time::Duration),

    #[error("query failed: {0}")]
    Query(#[from] tokio_postgres::Error),
}

/// Quote a SQL identifier with PostgreSQL double-quote escaping.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Escape a SQL string literal by doubling single quotes.
pub fn escape_literal(s: &str) -> String {
    s.replace('\'', "''")
}

/// Reject database names that are not plain identifiers.
pub fn is_valid_database_name(name: &str) -> bool {
    DATABASE_NAME_REGEXP.is_match(name)
}

/// Network-level errors keep the connect loop polling; anything the server
/// itself reports (bad password, missing role) aborts immediately.
fn is_transient(err: &tokio_postgres::Error) -> bool {
    err.as_db_error().is_none()
}

/// A privileged connection to one cluster, held for the duration of a
/// single role-and-database phase.
pub struct PgConnection {
    client: tokio_postgres::Client,
}

/// Certificate verifier that accepts the in-cluster self-signed
/// certificate; `sslmode=require` only asks for transport encryption.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

fn tls_connector() -> MakeRustlsConnect {
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth();
    MakeRustlsConnect::new(config)
}

impl PgConnection {
    /// Connect to `host` as the given superuser, retrying transient network
    /// errors at `postgres_connect_timeout` intervals up to
    /// `postgres_connect_retry_timeout`.
    pub async fn connect(
        config: &Config,
        host: &str,
        user: &str,
        password: &str,
    ) -> Result<Self, PgError> {
        let conn_string = format!(
            "host={host} port=5432 dbname=postgres user={user} password={password} \
             sslmode=require connect_timeout={}",
            config.postgres_connect_timeout.as_secs().max(1)
        );

        let interval = config.postgres_connect_timeout;
        let timeout = config.postgres_connect_retry_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio_postgres::connect(&conn_string, tls_connector()).await {
                Ok((client, connection)) => {
                    tokio::spawn(async move {
                        if let Err(e) = connection.await {
                            debug!("PostgreSQL connection closed: {e}");
                        }
                    });
                    return Ok(Self { client });
                }
                Err(e) if is_transient(&e) => {
                    debug!("could not connect to PostgreSQL database: {e}");
                    if tokio::time::Instant::now() + interval > deadline {
                        return Err(PgError::ConnectTimeout(timeout));
                    }
                    tokio::time::sleep(interval).await;
                }
                Err(e) => return Err(PgError::Connect(e)),
            }
        }
    }

    /// Read the managed subset of `pg_authid`, with capability flags and
    /// role membership.
    pub async fn read_pg_users(&self, user_names: &[String]) -> Result<PgUserMap, PgError> {
        let params: &[&(dyn ToSql + Sync)] = &[&user_names];
        let rows = self.client.query(GET_USERS_SQL, params).await?;

        let mut users = PgUserMap::new();
        for row in rows {
            let name: String = row.get(0);
            let password: String = row.get(1);
            let mut flags = Vec::new();
            if row.get::<_, bool>(2) {
                flags.push("SUPERUSER".to_string());
            }
            if row.get::<_, bool>(3) {
                flags.push("INHERIT".to_string());
            }
            if row.get::<_, bool>(4) {
                flags.push("CREATEROLE".to_string());
            }
            if row.get::<_, bool>(5) {
                flags.push("CREATEDB".to_string());
            }
            if row.get::<_, bool>(6) {
                flags.push("LOGIN".to_string());
            }
            let member_of: Vec<String> = row.get(7);

            users.insert(
                name.clone(),
                PgUser {
                    name,
                    password,
                    flags,
                    member_of,
                    origin: RoleOrigin::System,
                },
            );
        }
        Ok(users)
    }

    /// Current databases with their owners.
    pub async fn get_databases(&self) -> Result<BTreeMap<String, String>, PgError> {
        let rows = self.client.query(GET_DATABASES_SQL, &[]).await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get(0), row.get(1)))
            .collect())
    }

    pub async fn execute(&self, sql: &str) -> Result<(), PgError> {
        self.client.batch_execute(sql).await?;
        Ok(())
    }
}

/// Plan the DDL converging the present roles to the desired set. An empty
/// plan means the sync is a no-op.
pub fn plan_role_sync(desired: &PgUserMap, present: &PgUserMap) -> Vec<String> {
    let mut ddl = Vec::new();

    for user in desired.values() {
        let Some(existing) = present.get(&user.name) else {
            ddl.push(create_role_sql(user));
            continue;
        };

        if !user.password.is_empty() {
            let digest = pg_user_password(&user.name, &user.password);
            if digest != existing.password {
                ddl.push(format!(
                    "ALTER ROLE {} WITH PASSWORD '{}'",
                    quote_identifier(&user.name),
                    escape_literal(&digest)
                ));
            }
        }

        let missing_flags: Vec<&String> = user
            .flags
            .iter()
            .filter(|f| !existing.flags.contains(f))
            .collect();
        if !missing_flags.is_empty() {
            ddl.push(format!(
                "ALTER ROLE {} WITH {}",
                quote_identifier(&user.name),
                user.flags.join(" ")
            ));
        }

        for group in &user.member_of {
            if !existing.member_of.contains(group) {
                ddl.push(format!(
                    "GRANT {} TO {}",
                    quote_identifier(group),
                    quote_identifier(&user.name)
                ));
            }
        }
    }

    ddl
}

fn create_role_sql(user: &PgUser) -> String {
    let mut sql = format!("CREATE ROLE {}", quote_identifier(&user.name));
    if !user.flags.is_empty() {
        sql.push(' ');
        sql.push_str(&user.flags.join(" "));
    }
    if !user.password.is_empty() {
        sql.push_str(&format!(
            " PASSWORD '{}'",
            escape_literal(&pg_user_password(&user.name, &user.password))
        ));
    }
    if !user.member_of.is_empty() {
        sql.push_str(&format!(
            " IN ROLE {}",
            user.member_of
                .iter()
                .map(|g| quote_identifier(g))
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    sql
}

/// Plan the DDL converging present databases to the declared set. Creation
/// is skipped (with a log line) for unknown owners and invalid names;
/// databases absent from the manifest are never dropped.
pub fn plan_database_sync(
    desired: &BTreeMap<String, String>,
    present: &BTreeMap<String, String>,
    pg_users: &PgUserMap,
) -> Vec<String> {
    let mut ddl = Vec::new();

    for (datname, owner) in desired {
        if !pg_users.contains_key(owner) {
            info!(
                database = %datname,
                owner = %owner,
                "skipping creation of the database, owner does not exist"
            );
            continue;
        }
        if !is_valid_database_name(datname) {
            info!(database = %datname, "database has an invalid name");
            continue;
        }

        match present.get(datname) {
            None => ddl.push(format!(
                "CREATE DATABASE {} OWNER {}",
                quote_identifier(datname),
                quote_identifier(owner)
            )),
            Some(current_owner) if current_owner != owner => ddl.push(format!(
                "ALTER DATABASE {} OWNER TO {}",
                quote_identifier(datname),
                quote_identifier(owner)
            )),
            Some(_) => {}
        }
    }

    ddl
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str, password: &str, flags: &[&str], member_of: &[&str]) -> PgUser {
        PgUser {
            name: name.to_string(),
            password: password.to_string(),
            flags: flags.iter().map(|s| s.to_string()).collect(),
            member_of: member_of.iter().map(|s| s.to_string()).collect(),
            origin: RoleOrigin::Manifest,
        }
    }

    #[test]
    fn identifier_quoting() {
        assert_eq!(quote_identifier("simple"), "\"simple\"");
        assert_eq!(quote_identifier("with\"quote"), "\"with\"\"quote\"");
        assert_eq!(escape_literal("it's"), "it''s");
    }

    #[test]
    fn new_role_is_created_with_digest_password() {
        let desired = PgUserMap::from([(
            "app".to_string(),
            user("app", "secret", &["CREATEDB", "LOGIN"], &[]),
        )]);
        let ddl = plan_role_sync(&desired, &PgUserMap::new());
        assert_eq!(ddl.len(), 1);
        assert!(ddl[0].starts_with("CREATE ROLE \"app\" CREATEDB LOGIN PASSWORD 'md5"));
    }

    #[test]
    fn matching_role_is_a_noop() {
        let digest = pg_user_password("app", "secret");
        let desired = PgUserMap::from([(
            "app".to_string(),
            user("app", "secret", &["CREATEDB", "LOGIN"], &[]),
        )]);
        let present = PgUserMap::from([(
            "app".to_string(),
            user("app", &digest, &["INHERIT", "CREATEDB", "LOGIN"], &[]),
        )]);
        assert!(plan_role_sync(&desired, &present).is_empty());
    }

    #[test]
    fn changed_password_alters_the_role() {
        let desired = PgUserMap::from([(
            "app".to_string(),
            user("app", "newsecret", &["LOGIN"], &[]),
        )]);
        let present = PgUserMap::from([(
            "app".to_string(),
            user("app", &pg_user_password("app", "old"), &["LOGIN"], &[]),
        )]);
        let ddl = plan_role_sync(&desired, &present);
        assert_eq!(ddl.len(), 1);
        assert!(ddl[0].starts_with("ALTER ROLE \"app\" WITH PASSWORD 'md5"));
    }

    #[test]
    fn missing_flags_alter_with_the_full_set() {
        let digest = pg_user_password("app", "secret");
        let desired = PgUserMap::from([(
            "app".to_string(),
            user("app", "secret", &["CREATEDB", "LOGIN"], &[]),
        )]);
        let present = PgUserMap::from([(
            "app".to_string(),
            user("app", &digest, &["LOGIN"], &[]),
        )]);
        let ddl = plan_role_sync(&desired, &present);
        assert_eq!(ddl, vec!["ALTER ROLE \"app\" WITH CREATEDB LOGIN"]);
    }

    #[test]
    fn membership_is_granted() {
        let desired = PgUserMap::from([(
            "jdoe".to_string(),
            user("jdoe", "", &["LOGIN"], &["zalandos"]),
        )]);
        let present = PgUserMap::from([(
            "jdoe".to_string(),
            user("jdoe", "", &["LOGIN"], &[]),
        )]);
        let ddl = plan_role_sync(&desired, &present);
        assert_eq!(ddl, vec!["GRANT \"zalandos\" TO \"jdoe\""]);
    }

    #[test]
    fn human_users_are_created_without_password() {
        let desired = PgUserMap::from([(
            "jdoe".to_string(),
            user("jdoe", "", &["LOGIN"], &["zalandos"]),
        )]);
        let ddl = plan_role_sync(&desired, &PgUserMap::new());
        assert_eq!(ddl, vec!["CREATE ROLE \"jdoe\" LOGIN IN ROLE \"zalandos\""]);
    }

    #[test]
    fn database_plan_creates_and_alters() {
        let pg_users = PgUserMap::from([
            ("app".to_string(), user("app", "x", &["LOGIN"], &[])),
            ("other".to_string(), user("other", "x", &["LOGIN"], &[])),
        ]);
        let desired = BTreeMap::from([
            ("orders".to_string(), "app".to_string()),
            ("billing".to_string(), "other".to_string()),
        ]);
        let present = BTreeMap::from([
            ("billing".to_string(), "app".to_string()),
            ("postgres".to_string(), "postgres".to_string()),
        ]);

        let ddl = plan_database_sync(&desired, &present, &pg_users);
        assert_eq!(
            ddl,
            vec![
                "ALTER DATABASE \"billing\" OWNER TO \"other\"",
                "CREATE DATABASE \"orders\" OWNER \"app\"",
            ]
        );
    }

    #[test]
    fn database_plan_skips_invalid_entries() {
        let pg_users = PgUserMap::from([("app".to_string(), user("app", "x", &["LOGIN"], &[]))]);
        let desired = BTreeMap::from([
            ("1orders".to_string(), "app".to_string()),
            ("orders".to_string(), "ghost".to_string()),
        ]);
        assert!(plan_database_sync(&desired, &BTreeMap::new(), &pg_users).is_empty());
    }

    #[test]
    fn databases_are_never_dropped() {
        let pg_users = PgUserMap::new();
        let present = BTreeMap::from([("legacy".to_string(), "app".to_string())]);
        assert!(plan_database_sync(&BTreeMap::new(), &present, &pg_users).is_empty());
    }
}
