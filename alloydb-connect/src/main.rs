//! AlloyDB 连通性检查
//!
//! 从环境变量读取实例配置，通过安全连接器建立连接池，
//! 执行一次 `SELECT NOW()` 并输出数据库服务器时间。

mod dialer;
mod pool_manager;
mod relay;
mod service;

use std::process::ExitCode;

use common::config::AppConfig;
use pool_manager::PgConnector;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // 优先加载 .env 文件（如果存在）
    load_dotenv();

    // 初始化日志追踪（stdout 只输出结果行）
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // 凭据库与 TLS 共用 ring 作为默认加密实现
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        tracing::debug!("default crypto provider already installed");
    }

    let mut stdout = std::io::stdout();
    match service::bootstrap(AppConfig::from_env, PgConnector::new, &mut stdout).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(kind = e.kind(), "{e}");
            ExitCode::FAILURE
        }
    }
}

/// Load .env file from the working directory (best-effort, no error if missing).
fn load_dotenv() {
    let env_path = std::path::Path::new(".env");
    let Ok(content) = std::fs::read_to_string(env_path) else {
        return;
    };
    for (key, value) in parse_dotenv(&content) {
        // Only set if not already set by the environment
        if std::env::var_os(key).is_none() {
            std::env::set_var(key, value);
        }
    }
}

fn parse_dotenv(content: &str) -> Vec<(&str, &str)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let key = key.trim().trim_start_matches("export ").trim();
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            (key, value)
        })
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dotenv() {
        let content = "\
# instance settings
PROJECT_ID=proj1
export DB_REGION = us-central1
DB_USER=\"svc@proj1.iam\"

not a pair
=orphan
";
        assert_eq!(
            parse_dotenv(content),
            vec![
                ("PROJECT_ID", "proj1"),
                ("DB_REGION", "us-central1"),
                ("DB_USER", "svc@proj1.iam"),
            ]
        );
    }
}
