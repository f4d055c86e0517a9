//! Hostname → address cache shared by every connection.
//!
//! Concurrent lookups of the same name share one in-flight resolution and
//! all receive its outcome, success or failure. Failures are handed out
//! once and then forgotten.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::dns_resolver::Resolver;

/// Entries beyond this trigger a sweep of expired names on insert.
const SWEEP_THRESHOLD: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    #[error("resolution failed: {0}")]
    ResolutionFailed(String),
    #[error("no address records for {0}")]
    NoRecords(String),
    #[error("empty hostname")]
    EmptyHostname,
}

type Outcome = Result<(IpAddr, Instant), DnsError>;

#[derive(Default)]
struct Slot {
    cell: OnceCell<Outcome>,
}

impl Slot {
    /// In-flight slots are never expired; failed ones always are.
    fn is_expired(&self, now: Instant) -> bool {
        match self.cell.get() {
            Some(Ok((_, expires))) => *expires <= now,
            Some(Err(_)) => true,
            None => false,
        }
    }
}

pub struct DnsCache {
    resolver: Arc<dyn Resolver>,
    expire: Duration,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl DnsCache {
    pub fn new(resolver: Arc<dyn Resolver>, expire: Duration) -> Self {
        Self {
            resolver,
            expire,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached address for `hostname`, resolving on miss or
    /// expiry. IP literals are returned as-is.
    pub async fn get(&self, hostname: &str) -> Result<IpAddr, DnsError> {
        if hostname.is_empty() {
            return Err(DnsError::EmptyHostname);
        }
        if let Ok(ip) = hostname.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Ok(ip);
        }

        let slot = self.slot_for(hostname);
        let outcome = slot
            .cell
            .get_or_init(|| self.resolve(hostname))
            .await
            .clone();

        match outcome {
            Ok((ip, _)) => {
                trace!("[dns] {} -> {}", hostname, ip);
                Ok(ip)
            }
            Err(e) => {
                let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
                if slots.get(hostname).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                    slots.remove(hostname);
                }
                Err(e)
            }
        }
    }

    async fn resolve(&self, hostname: &str) -> Outcome {
        debug!("[dns] resolving {}", hostname);
        let ips = self.resolver.resolve(hostname).await.map_err(|e| {
            warn!("[dns] resolving {} failed: {}", hostname, e);
            e
        })?;
        let ip = ips
            .first()
            .copied()
            .ok_or_else(|| DnsError::NoRecords(hostname.to_string()))?;
        Ok((ip, Instant::now() + self.expire))
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot_for(&self, hostname: &str) -> Arc<Slot> {
        let now = Instant::now();
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get(hostname) {
            if !slot.is_expired(now) {
                return Arc::clone(slot);
            }
        }

        if slots.len() >= SWEEP_THRESHOLD {
            slots.retain(|_, slot| !slot.is_expired(now));
        }
        let slot = Arc::new(Slot::default());
        slots.insert(hostname.to_string(), Arc::clone(&slot));
        slot
    }
}
