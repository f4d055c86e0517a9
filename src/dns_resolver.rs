use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::dns::DnsError;

/// Backend that turns a hostname into addresses. Results are cached by
/// [`crate::dns::DnsCache`], so implementations do no caching of their own.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, DnsError>;
}

/// Operating system resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDnsResolver;

#[async_trait]
impl Resolver for SystemDnsResolver {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, DnsError> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((hostname, 0))
            .await
            .map_err(|e| DnsError::ResolutionFailed(format!("{}: {}", hostname, e)))?
            .map(|addr| addr.ip())
            .collect();

        if addrs.is_empty() {
            Err(DnsError::NoRecords(hostname.to_string()))
        } else {
            Ok(addrs)
        }
    }
}

#[derive(Deserialize)]
struct DohResponse {
    #[serde(rename = "Answer")]
    answer: Option<Vec<DohAnswer>>,
}

#[derive(Deserialize)]
struct DohAnswer {
    #[serde(rename = "data")]
    data: String,
}

/// DNS-over-HTTPS resolver speaking the JSON API (`application/dns-json`).
pub struct DohResolver {
    client: reqwest::Client,
    endpoint: String,
    #[cfg(feature = "doh_fallback")]
    fallback: SystemDnsResolver,
}

impl DohResolver {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            #[cfg(feature = "doh_fallback")]
            fallback: SystemDnsResolver,
        }
    }

    async fn query(&self, hostname: &str) -> Result<Vec<IpAddr>, String> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("name", hostname), ("type", "A")])
            .header("Accept", "application/dns-json")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| e.to_string())?
            .json::<DohResponse>()
            .await
            .map_err(|e| e.to_string())?;

        Ok(response
            .answer
            .unwrap_or_default()
            .iter()
            .filter_map(|answer| answer.data.parse::<IpAddr>().ok())
            .collect())
    }
}

#[async_trait]
impl Resolver for DohResolver {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>, DnsError> {
        let mut last_error = None;
        for attempt in 0..2 {
            match self.query(hostname).await {
                Ok(ips) if !ips.is_empty() => return Ok(ips),
                Ok(_) => {
                    last_error = Some(DnsError::NoRecords(hostname.to_string()));
                    break;
                }
                Err(e) => {
                    debug!("[dns] doh attempt {} for {} failed: {}", attempt + 1, hostname, e);
                    last_error = Some(DnsError::ResolutionFailed(format!("{}: {}", hostname, e)));
                }
            }
        }

        #[cfg(feature = "doh_fallback")]
        {
            let _ = last_error;
            self.fallback.resolve(hostname).await
        }
        #[cfg(not(feature = "doh_fallback"))]
        {
            Err(last_error.unwrap_or_else(|| DnsError::ResolutionFailed(hostname.to_string())))
        }
    }
}
