//! AlloyDB Admin API 客户端
//!
//! 只包含连接器需要的两个调用：
//! - 查询实例连接信息
//! - 签发短期客户端证书

use serde::{Deserialize, Serialize};

use common::errors::{AppError, AppResult};
use common::models::{InstanceUri, IpType};

const API_VERSION: &str = "v1";

/// Requested lifetime of an ephemeral client certificate.
pub const CERT_DURATION_SECS: u64 = 3600;

/// Address information for an instance.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub public_ip_address: Option<String>,
    #[serde(default)]
    pub psc_dns_name: Option<String>,
    #[serde(default)]
    pub instance_uid: Option<String>,
}

impl ConnectionInfo {
    /// Picks the address for the requested IP type.
    pub fn address(&self, ip_type: IpType) -> AppResult<String> {
        let address = match ip_type {
            IpType::Private => &self.ip_address,
            IpType::Public => &self.public_ip_address,
            IpType::Psc => &self.psc_dns_name,
        };
        address
            .as_deref()
            .map(|a| a.trim_end_matches('.'))
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                AppError::AdminApi(format!("instance has no {ip_type} address"))
            })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateClientCertificateRequest<'a> {
    public_key: &'a str,
    cert_duration: String,
    use_metadata_exchange: bool,
}

/// Client certificate chain plus the cluster CA that signs server certificates.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCertificate {
    pub pem_certificate_chain: Vec<String>,
    pub ca_cert: String,
}

pub struct AdminClient {
    http: reqwest::Client,
    endpoint: String,
}

impl AdminClient {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }

    pub fn connection_info_url(&self, instance: &InstanceUri) -> String {
        format!("{}/{API_VERSION}/{instance}/connectionInfo", self.endpoint)
    }

    pub fn generate_certificate_url(&self, instance: &InstanceUri) -> String {
        format!(
            "{}/{API_VERSION}/{}:generateClientCertificate",
            self.endpoint,
            instance.cluster_path()
        )
    }

    pub async fn connection_info(
        &self,
        instance: &InstanceUri,
        token: &str,
    ) -> AppResult<ConnectionInfo> {
        let response = self
            .http
            .get(self.connection_info_url(instance))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AppError::AdminApi(format!("connectionInfo request failed: {e}")))?;
        decode(response, "connectionInfo").await
    }

    pub async fn generate_client_certificate(
        &self,
        instance: &InstanceUri,
        token: &str,
        public_key_pem: &str,
    ) -> AppResult<ClientCertificate> {
        let body = GenerateClientCertificateRequest {
            public_key: public_key_pem,
            cert_duration: format!("{CERT_DURATION_SECS}s"),
            use_metadata_exchange: true,
        };
        let response = self
            .http
            .post(self.generate_certificate_url(instance))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                AppError::AdminApi(format!("generateClientCertificate request failed: {e}"))
            })?;
        decode(response, "generateClientCertificate").await
    }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    call: &str,
) -> AppResult<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::AdminApi(format!("{call} returned {status}: {body}")));
    }
    response
        .json::<T>()
        .await
        .map_err(|e| AppError::AdminApi(format!("malformed {call} response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> AdminClient {
        AdminClient::new(reqwest::Client::new(), "https://alloydb.googleapis.com")
    }

    #[test]
    fn test_urls() {
        let uri = InstanceUri::new("p", "us-central1", "c", "i");
        assert_eq!(
            client().connection_info_url(&uri),
            "https://alloydb.googleapis.com/v1/projects/p/locations/us-central1/clusters/c/instances/i/connectionInfo"
        );
        assert_eq!(
            client().generate_certificate_url(&uri),
            "https://alloydb.googleapis.com/v1/projects/p/locations/us-central1/clusters/c:generateClientCertificate"
        );
    }

    #[test]
    fn test_connection_info_address_selection() {
        let info: ConnectionInfo = serde_json::from_str(
            r#"{
                "name": "projects/p/locations/r/clusters/c/instances/i/connectionInfo",
                "ipAddress": "10.0.0.2",
                "publicIpAddress": "34.1.2.3",
                "pscDnsName": "abc.psc.alloydb.goog.",
                "instanceUid": "uid-1"
            }"#,
        )
        .unwrap();
        assert_eq!(info.address(IpType::Private).unwrap(), "10.0.0.2");
        assert_eq!(info.address(IpType::Public).unwrap(), "34.1.2.3");
        assert_eq!(info.address(IpType::Psc).unwrap(), "abc.psc.alloydb.goog");
    }

    #[test]
    fn test_missing_address_is_an_error() {
        let info: ConnectionInfo = serde_json::from_str(r#"{"ipAddress": "10.0.0.2"}"#).unwrap();
        let err = info.address(IpType::Public).unwrap_err();
        assert!(err.to_string().contains("PUBLIC"));
    }

    #[test]
    fn test_certificate_request_body() {
        let body = GenerateClientCertificateRequest {
            public_key: "PEM",
            cert_duration: format!("{CERT_DURATION_SECS}s"),
            use_metadata_exchange: true,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "publicKey": "PEM",
                "certDuration": "3600s",
                "useMetadataExchange": true
            })
        );
    }
}
