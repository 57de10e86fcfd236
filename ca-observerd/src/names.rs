use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use anyhow::{Context, Result};
use shared::bounded_cache::BoundedCache;
use crate::store::db::ObserverDb;

/// Reverse name lookup. Implementations may block.
pub trait Resolver: Send + Sync {
    fn resolve(&self, ip: IpAddr) -> Result<String>;
}

/// Resolver backed by the system's reverse DNS
pub struct DnsResolver;

impl Resolver for DnsResolver {
    fn resolve(&self, ip: IpAddr) -> Result<String> {
        dns_lookup::lookup_addr(&ip)
            .with_context(|| format!("Reverse lookup of {} failed", ip))
    }
}

/// Host names for observed addresses.
///
/// Ingestion asks for names with `host_for`, which never blocks on DNS: an
/// unknown address is used as its own host name and flagged for the next
/// `resolve_if_needed` sweep.
pub struct NameService {
    names: Mutex<BoundedCache<IpAddr, String>>,
    need_resolve: AtomicBool,
    resolver: Box<dyn Resolver>,
}

impl NameService {
    pub fn new(resolver: Box<dyn Resolver>, max_count: usize, max_age: Duration) -> Self {
        Self {
            names: Mutex::new(BoundedCache::new(max_count, max_age)),
            need_resolve: AtomicBool::new(false),
            resolver,
        }
    }

    fn names(&self) -> MutexGuard<'_, BoundedCache<IpAddr, String>> {
        self.names.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Known name for `ip`, or the literal address if none is known yet
    pub fn host_for(&self, ip: IpAddr) -> String {
        if let Some(name) = self.names().get(&ip) {
            return name;
        }
        if !self.need_resolve.swap(true, Ordering::SeqCst) {
            tracing::debug!(%ip, "Need to resolve");
        }
        ip.to_string()
    }

    pub fn needs_resolution(&self) -> bool {
        self.need_resolve.load(Ordering::SeqCst)
    }

    /// Resolve every stored address that still carries a placeholder host and
    /// rewrite it in place. Does nothing unless an unknown address was seen
    /// since the last sweep. Returns the number of addresses resolved.
    pub fn resolve_if_needed(&self, db: &mut ObserverDb) -> Result<usize> {
        if !self.need_resolve.swap(false, Ordering::SeqCst) {
            return Ok(0);
        }

        let result = self.resolve_missing(db);
        if result.is_err() {
            // try again next cycle
            self.need_resolve.store(true, Ordering::SeqCst);
        }
        result
    }

    fn resolve_missing(&self, db: &mut ObserverDb) -> Result<usize> {
        let mut known = HashMap::new();
        let mut missing = BTreeSet::new();
        for (ip, host) in db.known_sources()? {
            if host == ip.to_string() {
                missing.insert(ip);
            } else {
                known.insert(ip, host);
            }
        }

        if !missing.is_empty() {
            tracing::debug!(count = missing.len(), "Resolving addresses");
        }

        let mut resolved = 0;
        for ip in missing {
            // a row can be written with the placeholder while a sweep caches the name
            let cached = known.get(&ip).cloned().or_else(|| self.names().pop(&ip));
            let name = match cached {
                Some(name) => name,
                None => match self.resolver.resolve(ip) {
                    Ok(name) => name,
                    Err(e) => {
                        tracing::debug!("{:#}", e);
                        continue;
                    }
                },
            };
            db.set_host(ip, &name)?;
            known.insert(ip, name);
            resolved += 1;
        }

        let mut names = self.names();
        for (ip, name) in known {
            names.set(ip, name);
        }
        tracing::debug!(resolved, cached = names.len(), "Name sweep done");

        Ok(resolved)
    }
}
