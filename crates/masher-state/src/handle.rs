//! Store connection for masher state.
//!
//! Pushes and locks live in the `masher` namespace of whichever SurrealDB
//! the operator points at: `mem://` for tests, `surrealkv://` for a single
//! host, or a remote `ws(s)://` server with a login. Every constructor runs
//! the schema migrations before returning.

use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{info, instrument};

use crate::error::StateError;
use crate::migrations;
use crate::surreal_store::{SurrealLockStore, SurrealPushStore};
use crate::Result;

const NAMESPACE: &str = "masher";
const DEFAULT_DATABASE: &str = "main";

/// Which SurrealDB user table a login is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginScope {
    /// Server-wide user.
    Root,
    /// User defined on the masher database only.
    Database,
}

/// Where the masher keeps its state and how it signs in.
#[derive(Debug, Clone)]
pub struct StoreTarget {
    pub url: String,
    pub database: String,
    /// `None` for engines without auth (`mem://`, `surrealkv://`).
    pub login: Option<StoreLogin>,
}

#[derive(Debug, Clone)]
pub struct StoreLogin {
    pub scope: LoginScope,
    pub username: String,
    pub password: String,
}

impl StoreTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: DEFAULT_DATABASE.to_string(),
            login: None,
        }
    }

    pub fn with_login(
        mut self,
        scope: LoginScope,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.login = Some(StoreLogin {
            scope,
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Build a target from `SURREALDB_*` variables, looked up through `var`.
    ///
    /// `SURREALDB_URL` selects the server; without it there is no target.
    /// `SURREALDB_USER` and `SURREALDB_PASS` add a database login, or a root
    /// login when `SURREALDB_ROOT=true`. `SURREALDB_DATABASE` overrides the
    /// database name. A user without a password is a configuration error.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Option<Self>> {
        let Some(url) = var("SURREALDB_URL") else {
            return Ok(None);
        };
        let mut target = Self::new(url);
        if let Some(database) = var("SURREALDB_DATABASE") {
            target.database = database;
        }
        if let Some(username) = var("SURREALDB_USER") {
            let password = var("SURREALDB_PASS").ok_or_else(|| {
                StateError::Connection(format!("SURREALDB_PASS not set for user {username}"))
            })?;
            let scope = match var("SURREALDB_ROOT").as_deref() {
                Some(v) if v.eq_ignore_ascii_case("true") => LoginScope::Root,
                _ => LoginScope::Database,
            };
            target = target.with_login(scope, username, password);
        }
        Ok(Some(target))
    }
}

/// SurrealDB connection shared by the push and lock stores.
#[derive(Clone)]
pub struct MasherDb {
    db: Surreal<Any>,
}

impl MasherDb {
    /// Connect to SurrealDB in-memory and set up schema.
    #[instrument(skip_all)]
    pub async fn in_memory() -> Result<Self> {
        Self::connect_url("mem://").await
    }

    /// Connect to a SurrealDB URL that needs no login.
    pub async fn connect_url(url: &str) -> Result<Self> {
        Self::connect(&StoreTarget::new(url)).await
    }

    #[instrument(skip(target), fields(url = %target.url, database = %target.database))]
    pub async fn connect(target: &StoreTarget) -> Result<Self> {
        let db = surrealdb::engine::any::connect(target.url.as_str())
            .await
            .map_err(|e| {
                StateError::Connection(format!("Failed to connect to {}: {e}", target.url))
            })?;

        if let Some(login) = &target.login {
            let signed_in = match login.scope {
                LoginScope::Root => {
                    db.signin(Root {
                        username: &login.username,
                        password: &login.password,
                    })
                    .await
                }
                LoginScope::Database => {
                    db.signin(Database {
                        namespace: NAMESPACE,
                        database: &target.database,
                        username: &login.username,
                        password: &login.password,
                    })
                    .await
                }
            };
            signed_in.map_err(|e| {
                StateError::Connection(format!("Sign-in as {} failed: {e}", login.username))
            })?;
        }

        db.use_ns(NAMESPACE)
            .use_db(&target.database)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!(url = %target.url, "masher state store ready");
        Ok(Self { db })
    }

    /// Connect to the store named by the `SURREALDB_*` environment, or an
    /// in-memory one when `SURREALDB_URL` is unset.
    #[instrument(skip_all)]
    pub async fn from_env() -> Result<Self> {
        match StoreTarget::from_vars(|name| std::env::var(name).ok())? {
            Some(target) => Self::connect(&target).await,
            None => {
                info!("SURREALDB_URL not set, state is kept in memory");
                Self::in_memory().await
            }
        }
    }

    pub fn push_store(&self) -> SurrealPushStore {
        SurrealPushStore::new(self.db.clone())
    }

    pub fn lock_store(&self) -> SurrealLockStore {
        SurrealLockStore::new(self.db.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_target_absent_without_url() {
        let target = StoreTarget::from_vars(vars(&[("SURREALDB_USER", "masher")])).unwrap();
        assert!(target.is_none());
    }

    #[test]
    fn test_target_with_database_login() {
        let target = StoreTarget::from_vars(vars(&[
            ("SURREALDB_URL", "wss://state.example"),
            ("SURREALDB_USER", "masher"),
            ("SURREALDB_PASS", "pw"),
            ("SURREALDB_DATABASE", "staging"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(target.url, "wss://state.example");
        assert_eq!(target.database, "staging");
        let login = target.login.unwrap();
        assert_eq!(login.scope, LoginScope::Database);
        assert_eq!(login.username, "masher");
    }

    #[test]
    fn test_root_login_and_missing_password() {
        let target = StoreTarget::from_vars(vars(&[
            ("SURREALDB_URL", "ws://localhost:8000"),
            ("SURREALDB_USER", "root"),
            ("SURREALDB_PASS", "root"),
            ("SURREALDB_ROOT", "TRUE"),
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(target.database, "main");
        assert_eq!(target.login.unwrap().scope, LoginScope::Root);

        let err = StoreTarget::from_vars(vars(&[
            ("SURREALDB_URL", "ws://localhost:8000"),
            ("SURREALDB_USER", "masher"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("SURREALDB_PASS"));
    }

    #[tokio::test]
    async fn test_in_memory_connects_and_migrates() {
        let db = MasherDb::in_memory().await.expect("connect");
        // Migrations are idempotent.
        migrations::init_schema(&db.db).await.expect("re-run schema");
    }
}
