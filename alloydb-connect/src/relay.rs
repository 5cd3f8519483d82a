//! 本地回环中继
//!
//! sqlx 只能按 host:port 建立连接，因此拨号覆盖在这里实现：中继监听一个
//! 临时回环端口，每接受一个连接就调用一次 [`Dialer::dial`]，随后双向转发
//! 字节直至任一端关闭。

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use common::errors::AppResult;
use common::models::InstanceUri;

use crate::dialer::Dialer;

const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

pub struct LoopbackRelay {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl LoopbackRelay {
    /// Binds `127.0.0.1:0` and starts accepting.
    pub async fn start<D>(dialer: Arc<D>, instance: InstanceUri) -> AppResult<Self>
    where
        D: Dialer + ?Sized + 'static,
    {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let last_error = Arc::new(Mutex::new(None));

        let task = tokio::spawn(accept_loop(
            listener,
            dialer,
            Arc::new(instance),
            cancel.clone(),
            last_error.clone(),
        ));
        info!(address = %local_addr, "relay listening");

        Ok(Self {
            local_addr,
            cancel,
            task: tokio::sync::Mutex::new(Some(task)),
            last_error,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Most recent dial failure, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    /// Stops accepting, aborts live tunnels and waits for the accept loop.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("relay task ended abnormally: {e}");
                }
            }
        }
    }
}

impl Drop for LoopbackRelay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop<D>(
    listener: TcpListener,
    dialer: Arc<D>,
    instance: Arc<InstanceUri>,
    cancel: CancellationToken,
    last_error: Arc<Mutex<Option<String>>>,
) where
    D: Dialer + ?Sized + 'static,
{
    let mut tunnels = JoinSet::new();
    let mut accept_failures = 0u32;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        accept_failures = accept_failures.saturating_add(1);
                        let delay = accept_backoff(accept_failures);
                        warn!(failures = accept_failures, ?delay, "relay accept failed: {e}");
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => break,
                        }
                        continue;
                    }
                };
                accept_failures = 0;

                let session_id = Uuid::new_v4();
                let dialer = Arc::clone(&dialer);
                let instance = Arc::clone(&instance);
                let last_error = Arc::clone(&last_error);
                tunnels.spawn(
                    async move {
                        if let Err(e) = tunnel(socket, dialer.as_ref(), &instance).await {
                            warn!(error = %e, "tunnel closed with error");
                            if let Ok(mut slot) = last_error.lock() {
                                *slot = Some(e.to_string());
                            }
                        }
                    }
                    .instrument(tracing::info_span!("tunnel", %session_id, %peer)),
                );
            }
            Some(_) = tunnels.join_next(), if !tunnels.is_empty() => {}
            _ = cancel.cancelled() => break,
        }
    }

    drop(listener);
    tunnels.shutdown().await;
    debug!("relay stopped");
}

/// Pause before retrying after the `failures`-th consecutive accept error.
fn accept_backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_BASE
        .saturating_mul(1 << exponent)
        .min(ACCEPT_BACKOFF_MAX)
}

async fn tunnel<D>(mut client: TcpStream, dialer: &D, instance: &InstanceUri) -> AppResult<()>
where
    D: Dialer + ?Sized,
{
    client.set_nodelay(true)?;
    let mut upstream = dialer.dial(instance).await?;
    debug!("tunnel established");

    let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    debug!(sent, received, "tunnel finished");
    Ok(())
}
