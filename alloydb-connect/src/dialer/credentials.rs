//! 访问令牌
//!
//! 令牌来源按以下顺序确定：
//! - 显式配置的静态令牌（`GOOGLE_OAUTH_ACCESS_TOKEN`）
//! - 应用默认凭据（由 google-cloud-auth 解析，支持 `service_account`、
//!   `authorized_user`、`external_account`、`impersonated_service_account`
//!   凭据文件以及计算引擎元数据服务器）

use google_cloud_auth::credentials::{Builder, CacheableResource, Credentials as AdcCredentials};
use http::header::AUTHORIZATION;
use http::{Extensions, HeaderMap};

use common::errors::{AppError, AppResult};

/// Where access tokens come from.
#[derive(Clone)]
pub enum Credentials {
    /// Caller-supplied token, sent as-is.
    Static(String),
    /// Application default credentials. Refresh and caching happen inside
    /// google-cloud-auth.
    Ambient(AdcCredentials),
}

impl Credentials {
    /// Resolves the token source for this process.
    ///
    /// # Errors
    /// Returns `AppError::Credentials` when no static token is given and the
    /// application default credentials cannot be loaded.
    pub fn discover(static_token: Option<&str>) -> AppResult<Self> {
        if let Some(token) = static_token {
            return Ok(Credentials::Static(token.to_string()));
        }

        let credentials = Builder::default().build().map_err(|e| {
            AppError::Credentials(format!("cannot load application default credentials: {e}"))
        })?;
        Ok(Credentials::Ambient(credentials))
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Credentials::Static(_) => "static token",
            Credentials::Ambient(_) => "application default credentials",
        }
    }

    /// Returns a current OAuth2 access token.
    pub async fn token(&self) -> AppResult<String> {
        let credentials = match self {
            Credentials::Static(token) => return Ok(token.clone()),
            Credentials::Ambient(credentials) => credentials,
        };

        let headers = credentials
            .headers(Extensions::new())
            .await
            .map_err(|e| AppError::Credentials(format!("cannot obtain access token: {e}")))?;
        match headers {
            CacheableResource::New { data, .. } => bearer_token(&data),
            CacheableResource::NotModified => Err(AppError::Credentials(
                "credentials returned no authorization headers".into(),
            )),
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> AppResult<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .ok_or_else(|| AppError::Credentials("credentials did not yield a bearer token".into()))
}
