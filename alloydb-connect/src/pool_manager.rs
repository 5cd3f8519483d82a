//! 数据库连接池管理
//!
//! 为连通性检查建立连接池：先创建拨号器，再创建连接池，
//! 池中每一条物理连接都经由拨号器建立。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use common::config::AppConfig;
use common::errors::{AppError, AppResult};
use common::models::{AuthType, InstanceUri};

use crate::dialer::{AlloyDbDialer, Dialer, DialerOptions};
use crate::relay::LoopbackRelay;

/// Query used to confirm the session is live.
pub const CHECK_QUERY: &str = "SELECT NOW()";

/// A pool that can answer the connectivity check.
#[async_trait]
pub trait CheckPool: Send + Sync {
    /// Returns the database server's current timestamp.
    async fn server_now(&self) -> AppResult<DateTime<Utc>>;

    /// Closes all pooled connections.
    async fn close(&self);
}

/// Creates the dialer and the pool on top of it.
#[async_trait]
pub trait Connector: Send + Sync {
    type Dialer: Dialer + 'static;
    type Pool: CheckPool;

    async fn new_dialer(&self, auth_type: AuthType) -> AppResult<Self::Dialer>;

    /// Opens a pool for `options` whose connections go through `dialer` to
    /// `instance` instead of the host and port in `options`.
    async fn new_pool(
        &self,
        options: PgConnectOptions,
        dialer: Arc<Self::Dialer>,
        instance: &InstanceUri,
    ) -> AppResult<Self::Pool>;
}

/// Owns the dialer for the lifetime of a run and closes it exactly once,
/// when dropped.
pub struct DialerGuard<D: Dialer + ?Sized> {
    dialer: Arc<D>,
}

impl<D: Dialer + ?Sized> DialerGuard<D> {
    pub fn new(dialer: Arc<D>) -> Self {
        Self { dialer }
    }

    pub fn dialer(&self) -> Arc<D> {
        Arc::clone(&self.dialer)
    }
}

impl<D: Dialer + ?Sized> Drop for DialerGuard<D> {
    fn drop(&mut self) {
        self.dialer.close();
        tracing::debug!("dialer released");
    }
}

/// Connection string for the pool client.
///
/// Transport security belongs to the dialer, so the string itself disables
/// TLS. Values are interpolated as-is.
pub fn connect_string(user: &str, db_name: &str) -> String {
    format!("postgres://localhost/?user={user}&dbname={db_name}&sslmode=disable")
}

pub fn parse_connect_options(dsn: &str) -> AppResult<PgConnectOptions> {
    dsn.parse::<PgConnectOptions>()
        .map_err(|e| AppError::ConfigParse(e.to_string()))
}

/// Establishes a pooled connection to `instance`.
///
/// On success the caller owns both the pool and the dialer guard. On failure
/// after the dialer exists, the guard has already been dropped and the dialer
/// closed.
pub async fn connect_pool<C: Connector>(
    connector: &C,
    instance: &InstanceUri,
    user: &str,
    db_name: &str,
    auth_type: AuthType,
) -> AppResult<(C::Pool, DialerGuard<C::Dialer>)> {
    let dialer = connector.new_dialer(auth_type).await.map_err(|e| match e {
        AppError::DialerInit(_) => e,
        other => AppError::DialerInit(other.to_string()),
    })?;
    let guard = DialerGuard::new(Arc::new(dialer));

    let options = parse_connect_options(&connect_string(user, db_name))?;

    let pool = connector
        .new_pool(options, guard.dialer(), instance)
        .await
        .map_err(|e| match e {
            AppError::DatabaseConnection(_) => e,
            other => AppError::DatabaseConnection(other.to_string()),
        })?;

    tracing::info!(instance = %instance, user, db_name, "connection pool ready");
    Ok((pool, guard))
}

/// Production connector: [`AlloyDbDialer`] plus a sqlx Postgres pool behind a
/// [`LoopbackRelay`].
pub struct PgConnector {
    dialer_options: DialerOptions,
    max_connections: u32,
    acquire_timeout: Duration,
}

impl PgConnector {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            dialer_options: DialerOptions::from_config(config),
            max_connections: config.max_connections,
            acquire_timeout: config.connect_timeout(),
        }
    }

    /// Starts a relay in front of `dialer` and opens the sqlx pool against it.
    async fn open_pool<D>(
        &self,
        options: PgConnectOptions,
        dialer: Arc<D>,
        instance: &InstanceUri,
    ) -> AppResult<AlloyPool>
    where
        D: Dialer + ?Sized + 'static,
    {
        let relay = LoopbackRelay::start(dialer, instance.clone()).await?;
        let addr = relay.local_addr();
        let options = options.host(&addr.ip().to_string()).port(addr.port());

        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|e| match relay.last_error() {
                Some(dial) => AppError::DatabaseConnection(format!("{e} (dial: {dial})")),
                None => AppError::DatabaseConnection(e.to_string()),
            })?;

        Ok(AlloyPool { pool, relay })
    }
}

/// sqlx pool plus the relay its connections run through.
pub struct AlloyPool {
    pool: PgPool,
    relay: LoopbackRelay,
}

#[async_trait]
impl CheckPool for AlloyPool {
    async fn server_now(&self) -> AppResult<DateTime<Utc>> {
        sqlx::query_scalar::<_, DateTime<Utc>>(CHECK_QUERY)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseQuery(e.to_string()))
    }

    async fn close(&self) {
        self.pool.close().await;
        self.relay.shutdown().await;
        tracing::debug!("connection pool closed");
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Dialer = AlloyDbDialer;
    type Pool = AlloyPool;

    async fn new_dialer(&self, auth_type: AuthType) -> AppResult<AlloyDbDialer> {
        AlloyDbDialer::new(self.dialer_options.clone().with_auth_type(auth_type)).await
    }

    async fn new_pool(
        &self,
        options: PgConnectOptions,
        dialer: Arc<AlloyDbDialer>,
        instance: &InstanceUri,
    ) -> AppResult<AlloyPool> {
        self.open_pool(options, dialer, instance).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use sqlx::postgres::PgSslMode;

    use common::models::IpType;

    use super::*;
    use crate::dialer::BoxedStream;

    #[derive(Default)]
    struct RefusingDialer {
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for RefusingDialer {
        async fn dial(&self, _instance: &InstanceUri) -> AppResult<BoxedStream> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Dial("instance unreachable".into()))
        }

        fn close(&self) {}
    }

    fn connector() -> PgConnector {
        PgConnector {
            dialer_options: DialerOptions {
                auth_type: AuthType::Iam,
                ip_type: IpType::Private,
                admin_endpoint: "http://127.0.0.1:9".into(),
                timeout: Duration::from_secs(5),
                access_token: Some("tok".into()),
            },
            max_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_connect_string_disables_tls() {
        assert_eq!(
            connect_string("svc@proj.iam", "orders"),
            "postgres://localhost/?user=svc@proj.iam&dbname=orders&sslmode=disable"
        );
    }

    #[test]
    fn test_parse_connect_options() {
        let options = parse_connect_options(&connect_string("svc@proj.iam", "orders")).unwrap();
        assert_eq!(options.get_username(), "svc@proj.iam");
        assert_eq!(options.get_database(), Some("orders"));
        assert!(matches!(options.get_ssl_mode(), PgSslMode::Disable));
    }

    #[test]
    fn test_parse_rejects_malformed_string() {
        let err = parse_connect_options("postgres://localhost/?sslmode=sometimes").unwrap_err();
        assert!(matches!(err, AppError::ConfigParse(_)));

        let err = parse_connect_options("user=alice dbname=orders").unwrap_err();
        assert!(matches!(err, AppError::ConfigParse(_)));
    }

    #[tokio::test]
    async fn test_pool_connections_go_through_dialer() {
        let dialer = Arc::new(RefusingDialer::default());
        let options = parse_connect_options(&connect_string("svc@proj.iam", "orders")).unwrap();
        let instance = InstanceUri::new("p", "r", "c", "i");

        let err = match connector().open_pool(options, dialer.clone(), &instance).await {
            Ok(_) => panic!("pool should not open when every dial is refused"),
            Err(e) => e,
        };

        assert!(
            matches!(err, AppError::DatabaseConnection(ref m) if m.contains("dial: failed to dial instance")),
            "unexpected error: {err}"
        );
        assert!(dialer.dials.load(Ordering::SeqCst) >= 1);
    }
}
