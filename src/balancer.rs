//! Latency-based choice among the configured remote servers.
//!
//! Probing runs on its own timer; [`Balancer::get_fastest`] only reads the
//! last recorded results.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info};

use crate::address::Endpoint;
use crate::config::ConfigError;
use crate::dns::DnsCache;

/// Measures the round trip to one endpoint. `None` means unreachable.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint) -> Option<Duration>;
}

/// Times a plain TCP connect. The host is resolved through the shared cache
/// before the clock starts.
pub struct TcpProber {
    dns: Arc<DnsCache>,
    timeout: Duration,
}

impl TcpProber {
    pub fn new(dns: Arc<DnsCache>, timeout: Duration) -> Self {
        Self { dns, timeout }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, endpoint: &Endpoint) -> Option<Duration> {
        let ip = match self.dns.get(&endpoint.host).await {
            Ok(ip) => ip,
            Err(e) => {
                debug!("[balancer] probe {} failed: {}", endpoint, e);
                return None;
            }
        };
        let started = Instant::now();
        let connect = TcpStream::connect(SocketAddr::new(ip, endpoint.port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_stream)) => Some(started.elapsed()),
            Ok(Err(e)) => {
                debug!("[balancer] probe {} failed: {}", endpoint, e);
                None
            }
            Err(_) => {
                debug!("[balancer] probe {} timed out", endpoint);
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
struct EndpointState {
    endpoint: Endpoint,
    latency: Option<Duration>,
}

pub struct Balancer {
    /// Kept in configuration order; ties resolve to the earlier entry.
    states: RwLock<Vec<EndpointState>>,
    prober: Arc<dyn Prober>,
    last_used: Mutex<Option<Endpoint>>,
}

impl Balancer {
    pub fn new(endpoints: Vec<Endpoint>, prober: Arc<dyn Prober>) -> Result<Self, ConfigError> {
        if endpoints.is_empty() {
            return Err(ConfigError::EmptyServers);
        }
        let states = endpoints
            .into_iter()
            .map(|endpoint| EndpointState {
                endpoint,
                latency: None,
            })
            .collect();
        Ok(Self {
            states: RwLock::new(states),
            prober,
            last_used: Mutex::new(None),
        })
    }

    pub fn len(&self) -> usize {
        self.states.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lowest measured latency among reachable endpoints, earliest
    /// configured on ties. Falls back to the first endpoint when nothing
    /// is known to be reachable.
    pub fn get_fastest(&self) -> Endpoint {
        let states = self.states.read().unwrap_or_else(|e| e.into_inner());
        states
            .iter()
            .filter_map(|s| s.latency.map(|latency| (latency, &s.endpoint)))
            .min_by_key(|(latency, _)| *latency)
            .map(|(_, endpoint)| endpoint)
            .unwrap_or(&states[0].endpoint)
            .clone()
    }

    /// [`Balancer::get_fastest`] for a new connection; logs when the choice
    /// differs from the previous one.
    pub fn select(&self) -> Endpoint {
        let endpoint = self.get_fastest();
        let mut last = self.last_used.lock().unwrap_or_else(|e| e.into_inner());
        if last.as_ref() != Some(&endpoint) {
            info!("[balancer] use: {}", endpoint);
            *last = Some(endpoint.clone());
        }
        endpoint
    }

    /// Probes every endpoint concurrently and records the results. A failed
    /// probe marks the endpoint unreachable until a later probe succeeds.
    pub async fn probe_all(&self) {
        let endpoints: Vec<Endpoint> = {
            let states = self.states.read().unwrap_or_else(|e| e.into_inner());
            states.iter().map(|s| s.endpoint.clone()).collect()
        };

        let mut probes = JoinSet::new();
        for (index, endpoint) in endpoints.into_iter().enumerate() {
            let prober = Arc::clone(&self.prober);
            probes.spawn(async move { (index, prober.probe(&endpoint).await) });
        }

        let mut results = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => debug!("[balancer] probe task failed: {}", e),
            }
        }

        let mut states = self.states.write().unwrap_or_else(|e| e.into_inner());
        for (index, latency) in results {
            if let Some(state) = states.get_mut(index) {
                match latency {
                    Some(rtt) => debug!("[balancer] {} rtt {:?}", state.endpoint, rtt),
                    None => debug!("[balancer] {} unreachable", state.endpoint),
                }
                state.latency = latency;
            }
        }
    }

    /// Starts the periodic probe loop. A single endpoint needs no probing.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        if self.len() < 2 {
            return None;
        }
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.probe_all().await;
            }
        }))
    }
}
