//! Turns batches of beacons and searches into persistent records and
//! lifecycle events.
//!
//! Every method takes the worker's own database connection; the tracker
//! itself only holds counters and the name service, so one instance is
//! shared by all store workers.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use shared::types::{
    ClientSearchRecord, DeadSearch, DeadSearchSource, Event, EventDesc, EventKind,
    ServerRecord, ServerSnapshot, Source,
};
use crate::ca::{BeaconEvent, SearchDatagram};
use crate::config::{CaConfig, SearchExpiry};
use crate::names::NameService;
use crate::store::db::ObserverDb;

/// Searches this recent are never classified as finished
const SEARCH_QUIET_SECS: i64 = 5;

/// Minimum session length counted by the abandoned-search aggregate
const DEAD_SEARCH_MIN_AGE_SECS: i64 = 60;

#[derive(Debug, Clone)]
pub struct ExpirySettings {
    pub beacon_expire: Duration,
    pub search_expire: Duration,
    pub search_expiry: SearchExpiry,
}

impl From<&CaConfig> for ExpirySettings {
    fn from(ca: &CaConfig) -> Self {
        Self {
            beacon_expire: Duration::seconds(ca.beacon_expire_secs as i64),
            search_expire: Duration::seconds(ca.search_expire_secs as i64),
            search_expiry: ca.search_expiry,
        }
    }
}

pub struct Tracker {
    settings: ExpirySettings,
    names: NameService,
    started: DateTime<Utc>,
    num_beacons: AtomicU64,
    num_searches: AtomicU64,
}

impl Tracker {
    pub fn new(settings: ExpirySettings, names: NameService) -> Self {
        Self {
            settings,
            names,
            started: Utc::now(),
            num_beacons: AtomicU64::new(0),
            num_searches: AtomicU64::new(0),
        }
    }

    fn source_for(&self, ip: IpAddr, port: u16) -> Source {
        Source { ip, host: self.names.host_for(ip), port }
    }

    /// Record a batch of beacons in arrival order. Returns the number of
    /// events logged.
    pub fn handle_beacons(&self, db: &mut ObserverDb, batch: &[BeaconEvent]) -> Result<usize> {
        self.num_beacons.fetch_add(batch.len() as u64, Ordering::Relaxed);

        let mut logged = 0;
        for beacon in batch {
            let source = self.source_for(IpAddr::V4(*beacon.server.ip()), beacon.server.port());
            let prev = db.upsert_server(&source, beacon.seq, beacon.ver, beacon.time)?;

            if let Some(event) = beacon_event(prev.as_ref(), &source, beacon) {
                tracing::debug!(server = %beacon.server, desc = %event.desc, seq = beacon.seq, "Beacon event");
                db.insert_event(&event)?;
                logged += 1;
            }
        }
        Ok(logged)
    }

    /// Record every search entry of a batch
    pub fn handle_searches(&self, db: &mut ObserverDb, batch: &[SearchDatagram]) -> Result<()> {
        for datagram in batch {
            self.num_searches
                .fetch_add(datagram.searches.len() as u64, Ordering::Relaxed);

            let source = self.source_for(datagram.source.ip(), datagram.source.port());
            for search in &datagram.searches {
                db.upsert_search(
                    &source,
                    &search.pv,
                    search.cid,
                    search.minor_version,
                    datagram.time,
                )?;
            }
        }
        Ok(())
    }

    /// Remove servers whose beacons stopped, logging `Disappears` for each
    pub fn clean_beacons(&self, db: &mut ObserverDb, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.settings.beacon_expire;
        let removed = db.retire_servers(cutoff, |record| Event {
            kind: EventKind::Beacon,
            desc: EventDesc::Disappears,
            time: now,
            source: record.source.clone(),
            prev: Some(record.snapshot()),
            next: None,
            pv: None,
        })?;

        if removed > 0 {
            tracing::debug!(count = removed, "Cleaned beacons");
        }
        Ok(removed)
    }

    /// Retire searches according to the configured expiry strategy
    pub fn clean_searches(&self, db: &mut ObserverDb, now: DateTime<Utc>) -> Result<usize> {
        let expire = self.settings.search_expire;
        let removed = match self.settings.search_expiry {
            SearchExpiry::Flat => db.delete_searches_until(now - expire)?,
            SearchExpiry::Tiered => {
                let cutoff = now - Duration::seconds(SEARCH_QUIET_SECS);
                db.retire_searches(cutoff, |record| {
                    classify_search(record, now, expire).map(|desc| Event {
                        kind: EventKind::Search,
                        desc,
                        time: now,
                        source: record.source.clone(),
                        prev: None,
                        next: None,
                        pv: Some(record.pv.clone()),
                    })
                })?
            }
        };

        if removed > 0 {
            tracing::debug!(count = removed, "Cleaned searches");
        }
        Ok(removed)
    }

    /// Expiry sweeps, name resolution and stats. A failing step is logged
    /// and the remaining steps still run.
    pub fn periodic(&self, db: &mut ObserverDb, now: DateTime<Utc>) {
        if let Err(e) = self.clean_beacons(db, now) {
            tracing::error!("Error cleaning beacons: {:#}", e);
        }
        if let Err(e) = self.clean_searches(db, now) {
            tracing::error!("Error cleaning searches: {:#}", e);
        }
        if let Err(e) = self.names.resolve_if_needed(db) {
            tracing::error!("Error resolving names: {:#}", e);
        }
        if let Err(e) = self.update_stats(db, now) {
            tracing::error!("Error updating stats: {:#}", e);
        }
    }

    /// Recompute the abandoned-search table from scratch
    pub fn aggregate(&self, db: &mut ObserverDb) -> Result<usize> {
        let searches = db.all_searches()?;
        let aggregates = reduce_dead_searches(searches.iter().filter_map(map_dead_search));
        db.replace_dead_searches(&aggregates)?;
        tracing::debug!(pvs = aggregates.len(), "Aggregated dead searches");
        Ok(aggregates.len())
    }

    pub fn update_stats(&self, db: &mut ObserverDb, now: DateTime<Utc>) -> Result<()> {
        db.write_daemon_doc(
            "stats",
            &json!({
                "timeStart": self.started,
                "timeNow": now,
                "numBeacons": self.num_beacons.load(Ordering::Relaxed),
                "numSearches": self.num_searches.load(Ordering::Relaxed),
                "numServers": db.count_servers()?,
                "numClientSearches": db.count_searches()?,
            }),
        )
    }

    /// Publish the effective expiry settings for readers of the store
    pub fn write_config(&self, db: &mut ObserverDb) -> Result<()> {
        db.write_daemon_doc(
            "config",
            &json!({
                "expireBeacon": self.settings.beacon_expire.num_seconds(),
                "expireSearch": self.settings.search_expire.num_seconds(),
                "searchExpiry": match self.settings.search_expiry {
                    SearchExpiry::Flat => "flat",
                    SearchExpiry::Tiered => "tiered",
                },
            }),
        )
    }
}

/// Event for a beacon given the server record as it was before the beacon.
/// A sequence number one past the previous one is the normal case and
/// yields nothing.
pub fn beacon_event(prev: Option<&ServerRecord>, source: &Source, beacon: &BeaconEvent) -> Option<Event> {
    let next = ServerSnapshot {
        seq: beacon.seq,
        ver: beacon.ver,
        seen_last: beacon.time,
    };
    let (desc, prev) = match prev {
        None => (EventDesc::Appears, None),
        Some(p) if beacon.seq != p.seq.wrapping_add(1) => (EventDesc::Glitch, Some(p.snapshot())),
        Some(_) => return None,
    };
    Some(Event {
        kind: EventKind::Beacon,
        desc,
        time: beacon.time,
        source: source.clone(),
        prev,
        next: Some(next),
        pv: None,
    })
}

/// Decide whether a client has stopped searching, and why.
///
/// - `Single`: one attempt only, quiet for 2x `expire`
/// - `Success`: quiet for more than 3x the gap between its last two
///   attempts, i.e. the backoff sequence ended early
/// - `GaveUp`: quiet for 4x `expire`
pub fn classify_search(record: &ClientSearchRecord, now: DateTime<Utc>, expire: Duration) -> Option<EventDesc> {
    let quiet = now - record.last_seen;
    let hist = &record.history;

    if hist.len() == 1 {
        if quiet >= expire * 2 {
            return Some(EventDesc::Single);
        }
    } else if hist.len() >= 2 && quiet >= Duration::seconds(SEARCH_QUIET_SECS) {
        let last = hist[hist.len() - 1].time;
        let gap = last - hist[hist.len() - 2].time;
        if now - last > gap * 3 {
            return Some(EventDesc::Success);
        }
    }

    if quiet >= expire * 4 {
        return Some(EventDesc::GaveUp);
    }
    None
}

/// Map step: a partial aggregate for sessions that lasted at least a minute
pub fn map_dead_search(record: &ClientSearchRecord) -> Option<DeadSearch> {
    let age = (record.last_seen - record.first_seen).num_seconds();
    if age < DEAD_SEARCH_MIN_AGE_SECS {
        return None;
    }
    Some(DeadSearch {
        pv: record.pv.clone(),
        count: 1,
        sources: vec![DeadSearchSource {
            source: record.source.clone(),
            age_secs: age,
        }],
    })
}

/// Reduce step: merge partials sharing a PV name
pub fn reduce_dead_searches(partials: impl IntoIterator<Item = DeadSearch>) -> Vec<DeadSearch> {
    let mut by_pv: BTreeMap<String, DeadSearch> = BTreeMap::new();
    for partial in partials {
        match by_pv.get_mut(&partial.pv) {
            Some(acc) => {
                acc.count += partial.count;
                acc.sources.extend(partial.sources);
            }
            None => {
                by_pv.insert(partial.pv.clone(), partial);
            }
        }
    }
    by_pv.into_values().collect()
}
