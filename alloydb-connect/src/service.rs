//! 连通性检查服务
//!
//! 线性流程：加载配置、组装实例 URI、建立连接、执行检查查询、输出结果、
//! 释放资源。这里不会退出进程，所有错误都返回给 `main` 处理。

use std::io::Write;

use chrono::{DateTime, Utc};
use tracing::info;

use common::config::AppConfig;
use common::errors::AppResult;

use crate::pool_manager::{connect_pool, Connector, CheckPool};

/// Loads configuration with `load`, builds a connector for it and runs the
/// check. The connector is never built if configuration is incomplete.
pub async fn bootstrap<L, F, C, W>(load: L, make_connector: F, out: &mut W) -> AppResult<DateTime<Utc>>
where
    L: FnOnce() -> AppResult<AppConfig>,
    F: FnOnce(&AppConfig) -> C,
    C: Connector,
    W: Write,
{
    let config = load()?;
    let connector = make_connector(&config);
    run(&connector, &config, out).await
}

/// Runs the check against the instance named by `config` and writes the
/// server timestamp to `out`.
///
/// The pool is closed and the dialer released on every path once they exist,
/// pool first.
pub async fn run<C, W>(connector: &C, config: &AppConfig, out: &mut W) -> AppResult<DateTime<Utc>>
where
    C: Connector,
    W: Write,
{
    let instance = config.instance_uri();
    info!(instance = %instance, "connecting to instance");

    let (pool, dialer) = connect_pool(
        connector,
        &instance,
        &config.db_user,
        &config.db_name,
        config.auth_type,
    )
    .await?;

    let result = verify_connectivity(&pool).await;
    pool.close().await;
    drop(dialer);

    let now = result?;
    writeln!(out, "Current timestamp from database: {now}")?;
    Ok(now)
}

/// Executes the check query.
pub async fn verify_connectivity<P: CheckPool + ?Sized>(pool: &P) -> AppResult<DateTime<Utc>> {
    let now = pool.server_now().await?;
    info!(server_time = %now, "connectivity verified");
    Ok(now)
}
