use std::sync::Arc;

use tracing::info;

use crate::balancer::{Balancer, TcpProber};
use crate::config::Config;
use crate::dns::DnsCache;
use crate::dns_resolver::{DohResolver, Resolver, SystemDnsResolver};
use crate::error::Result;
use crate::transport::{Dialer, TcpDialer};
use crate::tunnel_stats::TrafficStats;

/// Process-wide state handed to every connection. Built once at startup
/// from a validated [`Config`] and never mutated afterwards; the cache,
/// balancer and counters manage their own interior state.
pub struct Context {
    pub config: Arc<Config>,
    pub dns: Arc<DnsCache>,
    /// Present only in the client role.
    pub balancer: Option<Arc<Balancer>>,
    pub stats: Arc<TrafficStats>,
    pub dialer: Arc<dyn Dialer>,
}

impl Context {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let config = config.validated()?;

        let resolver: Arc<dyn Resolver> = match &config.dns_over_https {
            Some(endpoint) => {
                info!("[dns] using DNS-over-HTTPS at {}", endpoint);
                Arc::new(DohResolver::new(endpoint.clone()))
            }
            None => Arc::new(SystemDnsResolver),
        };
        let dns = Arc::new(DnsCache::new(resolver, config.dns_expire()));

        let balancer = if config.is_client() {
            let prober = Arc::new(TcpProber::new(Arc::clone(&dns), config.dial_timeout()));
            Some(Arc::new(Balancer::new(config.endpoints().to_vec(), prober)?))
        } else {
            None
        };

        let dialer = Arc::new(TcpDialer::new(config.dial_timeout()));
        Ok(Self::with_parts(config, dns, balancer, TrafficStats::new(), dialer))
    }

    /// Assembles a context from prepared parts. `config` must already be
    /// validated.
    pub fn with_parts(
        config: Config,
        dns: Arc<DnsCache>,
        balancer: Option<Arc<Balancer>>,
        stats: Arc<TrafficStats>,
        dialer: Arc<dyn Dialer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: Arc::new(config),
            dns,
            balancer,
            stats,
            dialer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_context_has_balancer() {
        let mut config = Config::new("127.0.0.1", 1080, "secret");
        config.servers = Some(vec!["127.0.0.1:8388".into(), "127.0.0.1:8389".into()]);
        let ctx = Context::new(config).unwrap();
        assert!(ctx.config.is_client());
        assert_eq!(ctx.balancer.as_ref().map(|b| b.len()), Some(2));
    }

    #[tokio::test]
    async fn test_server_context_rejects_invalid_config() {
        let config = Config::new("127.0.0.1", 1080, "");
        assert!(Context::new(config).is_err());

        let ctx = Context::new(Config::new("127.0.0.1", 1080, "secret")).unwrap();
        assert!(ctx.balancer.is_none());
    }
}
