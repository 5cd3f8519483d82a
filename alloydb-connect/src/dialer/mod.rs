//! 安全拨号器
//!
//! [`Dialer`] 为 AlloyDB 实例建立经过认证的加密字节流。
//! [`AlloyDbDialer`] 为生产实现，主要功能包括：
//! - 通过 Admin API 获取实例地址与短期客户端证书
//! - 基于 TLS 1.3 建立连接
//! - 完成携带 IAM 令牌的元数据交换

pub mod admin;
pub mod cache;
pub mod credentials;
pub mod metadata;
pub mod tls;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use common::config::AppConfig;
use common::errors::{AppError, AppResult};
use common::models::{AuthType, InstanceUri, IpType};

use admin::AdminClient;
use cache::InstanceCache;
use credentials::Credentials;
use metadata::MetadataExchangeRequest;
use tls::ClientIdentity;

/// AlloyDB instances accept connector traffic on this port.
const SERVER_PROXY_PORT: u16 = 5433;

/// Certificates are re-issued this long before they lapse.
const REFRESH_BUFFER: Duration = Duration::from_secs(4 * 60);

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// A bidirectional byte stream to an instance.
pub trait InstanceStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> InstanceStream for T {}

pub type BoxedStream = Box<dyn InstanceStream>;

/// Opens secure connections to instances.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Opens a new authenticated stream to `instance`.
    async fn dial(&self, instance: &InstanceUri) -> AppResult<BoxedStream>;

    /// Releases background resources. Dials after close fail.
    fn close(&self);
}

/// Dialer settings.
#[derive(Debug, Clone)]
pub struct DialerOptions {
    pub auth_type: AuthType,
    pub ip_type: IpType,
    pub admin_endpoint: String,
    pub timeout: Duration,
    pub access_token: Option<String>,
}

impl DialerOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            auth_type: config.auth_type,
            ip_type: config.ip_type,
            admin_endpoint: config.admin_endpoint.clone(),
            timeout: config.connect_timeout(),
            access_token: config.access_token.clone(),
        }
    }

    pub fn with_auth_type(mut self, auth_type: AuthType) -> Self {
        self.auth_type = auth_type;
        self
    }
}

struct InstanceInfo {
    address: String,
    port: u16,
    tls: Arc<rustls::ClientConfig>,
}

/// Dialer backed by the AlloyDB Admin API.
pub struct AlloyDbDialer {
    options: DialerOptions,
    admin: AdminClient,
    credentials: Credentials,
    identity: ClientIdentity,
    instances: InstanceCache<InstanceInfo>,
    refresh: Mutex<()>,
    closed: CancellationToken,
}

impl AlloyDbDialer {
    /// Creates a dialer: resolves credentials, builds the HTTP client and
    /// generates the client key.
    ///
    /// # Errors
    /// Returns `AppError::DialerInit` if any of those steps fails.
    pub async fn new(options: DialerOptions) -> AppResult<Self> {
        let credentials = Credentials::discover(options.access_token.as_deref())
            .map_err(|e| AppError::DialerInit(e.to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(options.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| AppError::DialerInit(format!("cannot build HTTP client: {e}")))?;

        let identity = tokio::task::spawn_blocking(ClientIdentity::generate)
            .await
            .map_err(|e| AppError::DialerInit(format!("key generation task failed: {e}")))?
            .map_err(|e| AppError::DialerInit(e.to_string()))?;

        tracing::info!(
            credentials = credentials.describe(),
            auth_type = %options.auth_type,
            ip_type = %options.ip_type,
            "dialer initialised"
        );

        let admin = AdminClient::new(http, options.admin_endpoint.clone());
        Ok(Self::from_parts(options, admin, credentials, identity))
    }

    fn from_parts(
        options: DialerOptions,
        admin: AdminClient,
        credentials: Credentials,
        identity: ClientIdentity,
    ) -> Self {
        Self {
            options,
            admin,
            credentials,
            identity,
            instances: InstanceCache::new(REFRESH_BUFFER),
            refresh: Mutex::new(()),
            closed: CancellationToken::new(),
        }
    }

    /// Returns cached address and TLS settings, refreshing them near expiry.
    async fn instance_info(&self, instance: &InstanceUri) -> AppResult<Arc<InstanceInfo>> {
        let key = instance.to_string();
        if let Some(info) = self.instances.get(&key) {
            return Ok(info);
        }

        // One refresh at a time; concurrent dials reuse its result.
        let _refresh = self.refresh.lock().await;
        if let Some(info) = self.instances.get(&key) {
            return Ok(info);
        }

        let token = self.credentials.token().await?;
        let (conn_info, cert) = tokio::try_join!(
            self.admin.connection_info(instance, &token),
            self.admin
                .generate_client_certificate(instance, &token, self.identity.public_key_pem()),
        )?;

        let expires_at = tls::leaf_not_after(&cert.pem_certificate_chain)?;
        let info = Arc::new(InstanceInfo {
            address: conn_info.address(self.options.ip_type)?,
            port: SERVER_PROXY_PORT,
            tls: tls::client_config(&self.identity, &cert.pem_certificate_chain, &cert.ca_cert)?,
        });
        tracing::info!(
            instance = %instance,
            address = %info.address,
            instance_uid = conn_info.instance_uid.as_deref().unwrap_or(""),
            "client certificate issued"
        );
        self.instances.insert(key, Arc::clone(&info), expires_at);
        Ok(info)
    }

    async fn dial_inner(&self, instance: &InstanceUri) -> AppResult<BoxedStream> {
        let info = self.instance_info(instance).await?;

        // A rotated CA or revoked certificate only clears with a fresh one.
        self.connect(&info).await.map_err(|e| {
            if self.instances.invalidate(&instance.to_string()) {
                tracing::warn!(instance = %instance, error = %e, "dial failed, cached certificate discarded");
            }
            e
        })
    }

    async fn connect(&self, info: &InstanceInfo) -> AppResult<BoxedStream> {
        let tcp = tokio::time::timeout(
            self.options.timeout,
            TcpStream::connect((info.address.as_str(), info.port)),
        )
        .await
        .map_err(|_| AppError::Dial(format!("timed out connecting to {}", info.address)))?
        .map_err(|e| AppError::Dial(format!("{}:{}: {e}", info.address, info.port)))?;
        tcp.set_nodelay(true)?;

        let server_name = ServerName::try_from(info.address.clone())
            .map_err(|e| AppError::Dial(format!("invalid server name {}: {e}", info.address)))?;
        let mut stream = tokio::time::timeout(
            self.options.timeout,
            TlsConnector::from(Arc::clone(&info.tls)).connect(server_name, tcp),
        )
        .await
        .map_err(|_| AppError::Tls("handshake timed out".into()))?
        .map_err(|e| AppError::Tls(format!("handshake failed: {e}")))?;

        let token = self.credentials.token().await?;
        let request = MetadataExchangeRequest::new(USER_AGENT, self.options.auth_type, &token);
        metadata::exchange(&mut stream, &request).await?;

        Ok(Box::new(stream))
    }
}

#[async_trait]
impl Dialer for AlloyDbDialer {
    async fn dial(&self, instance: &InstanceUri) -> AppResult<BoxedStream> {
        if self.closed.is_cancelled() {
            return Err(AppError::Dial("dialer is closed".into()));
        }
        tokio::select! {
            result = self.dial_inner(instance) => result,
            _ = self.closed.cancelled() => Err(AppError::Dial("dialer closed during dial".into())),
        }
    }

    fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::debug!("dialer closed");
        }
        self.closed.cancel();
    }
}
