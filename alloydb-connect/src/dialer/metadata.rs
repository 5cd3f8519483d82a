//! 连接元数据交换
//!
//! 每条隧道在 TLS 握手之后、任何 Postgres 流量之前执行一次。
//! 请求与响应均为 protobuf 编码，并以 4 字节大端长度前缀分帧。

use std::time::Duration;

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use common::errors::{AppError, AppResult};
use common::models::AuthType;

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RESPONSE_LEN: usize = 64 * 1024;

#[derive(Clone, PartialEq, Message)]
pub struct MetadataExchangeRequest {
    #[prost(string, tag = "1")]
    pub user_agent: String,
    #[prost(int32, tag = "2")]
    pub auth_type: i32,
    #[prost(string, tag = "3")]
    pub oauth2_token: String,
}

impl MetadataExchangeRequest {
    pub fn new(user_agent: &str, auth_type: AuthType, oauth2_token: &str) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            auth_type: auth_type.wire_value(),
            oauth2_token: oauth2_token.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum ResponseCode {
    Unspecified = 0,
    Ok = 1,
    Error = 2,
}

#[derive(Clone, PartialEq, Message)]
pub struct MetadataExchangeResponse {
    #[prost(enumeration = "ResponseCode", tag = "1")]
    pub response_code: i32,
    #[prost(string, tag = "2")]
    pub error: String,
}

/// Sends `request` over `stream` and waits for the server's verdict.
pub async fn exchange<S>(stream: &mut S, request: &MetadataExchangeRequest) -> AppResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(EXCHANGE_TIMEOUT, exchange_inner(stream, request))
        .await
        .map_err(|_| AppError::MetadataExchange("timed out waiting for the server".into()))?
}

async fn exchange_inner<S>(stream: &mut S, request: &MetadataExchangeRequest) -> AppResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_frame(stream, &request.encode_to_vec()).await?;

    let len = stream.read_u32().await? as usize;
    if len > MAX_RESPONSE_LEN {
        return Err(AppError::MetadataExchange(format!(
            "response of {len} bytes exceeds limit"
        )));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;

    let response = MetadataExchangeResponse::decode(buf.as_slice())
        .map_err(|e| AppError::MetadataExchange(format!("malformed response: {e}")))?;

    match ResponseCode::try_from(response.response_code) {
        Ok(ResponseCode::Ok) => Ok(()),
        Ok(ResponseCode::Error) if !response.error.is_empty() => {
            Err(AppError::MetadataExchange(response.error))
        }
        _ => Err(AppError::MetadataExchange(format!(
            "server returned response code {}",
            response.response_code
        ))),
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, body: &[u8]) -> AppResult<()> {
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    async fn read_request<S: AsyncRead + Unpin>(server: &mut S) -> MetadataExchangeRequest {
        let len = server.read_u32().await.unwrap() as usize;
        let mut buf = vec![0u8; len];
        server.read_exact(&mut buf).await.unwrap();
        MetadataExchangeRequest::decode(buf.as_slice()).unwrap()
    }

    #[tokio::test]
    async fn test_exchange_accepted() {
        let (mut client, mut server) = duplex(4096);
        let server_task = tokio::spawn(async move {
            let request = read_request(&mut server).await;
            let response = MetadataExchangeResponse {
                response_code: ResponseCode::Ok as i32,
                error: String::new(),
            };
            write_frame(&mut server, &response.encode_to_vec()).await.unwrap();
            request
        });

        let request = MetadataExchangeRequest::new("alloydb-connect/0.1.0", AuthType::Iam, "tok");
        exchange(&mut client, &request).await.unwrap();

        let seen = server_task.await.unwrap();
        assert_eq!(seen.auth_type, 2);
        assert_eq!(seen.oauth2_token, "tok");
        assert_eq!(seen.user_agent, "alloydb-connect/0.1.0");
    }

    #[tokio::test]
    async fn test_exchange_rejected_carries_server_error() {
        let (mut client, mut server) = duplex(4096);
        tokio::spawn(async move {
            read_request(&mut server).await;
            let response = MetadataExchangeResponse {
                response_code: ResponseCode::Error as i32,
                error: "IAM authentication failed".into(),
            };
            write_frame(&mut server, &response.encode_to_vec()).await.unwrap();
        });

        let request = MetadataExchangeRequest::new("ua", AuthType::Iam, "tok");
        let err = exchange(&mut client, &request).await.unwrap_err();
        assert!(matches!(err, AppError::MetadataExchange(ref m) if m == "IAM authentication failed"));
    }

    #[tokio::test]
    async fn test_unspecified_response_code_is_rejected() {
        let (mut client, mut server) = duplex(4096);
        tokio::spawn(async move {
            read_request(&mut server).await;
            let response = MetadataExchangeResponse {
                response_code: ResponseCode::Unspecified as i32,
                error: String::new(),
            };
            write_frame(&mut server, &response.encode_to_vec()).await.unwrap();
        });

        let request = MetadataExchangeRequest::new("ua", AuthType::Iam, "tok");
        let err = exchange(&mut client, &request).await.unwrap_err();
        assert!(matches!(err, AppError::MetadataExchange(ref m) if m.contains("response code 0")));
    }

    #[tokio::test]
    async fn test_exchange_server_hangs_up() {
        let (mut client, mut server) = duplex(4096);
        tokio::spawn(async move {
            read_request(&mut server).await;
            drop(server);
        });

        let request = MetadataExchangeRequest::new("ua", AuthType::Native, "tok");
        let err = exchange(&mut client, &request).await.unwrap_err();
        assert!(matches!(err, AppError::Io(_)));
    }

    #[tokio::test]
    async fn test_oversized_response_is_rejected() {
        let (mut client, mut server) = duplex(4096);
        tokio::spawn(async move {
            read_request(&mut server).await;
            server.write_u32(u32::MAX).await.unwrap();
        });

        let request = MetadataExchangeRequest::new("ua", AuthType::Iam, "tok");
        let err = exchange(&mut client, &request).await.unwrap_err();
        assert!(matches!(err, AppError::MetadataExchange(_)));
    }
}
