use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use serde::de::DeserializeOwned;
use shared::protocol::{SEARCH_HISTORY_MAX, SERVER_HISTORY_MAX};
use shared::types::{
    BeaconHistory, ClientSearchRecord, DeadSearch, Event, SearchHistory, ServerRecord, Source,
};

const SERVER_COLUMNS: &str = "ip, port, host, seq, ver, first_seen, last_seen, hist";
const SEARCH_COLUMNS: &str = "ip, port, host, pv, cid, ver, first_seen, last_seen, hist";
const EVENT_COLUMNS: &str = "kind, description, time, ip, port, host, pv, prev, next";

/// SQLite backing store for servers, searches, events and aggregates.
///
/// Each worker thread opens its own `ObserverDb`. Operations that read and
/// then write run inside an IMMEDIATE transaction so concurrent workers
/// never interleave between the read and the write.
pub struct ObserverDb {
    conn: Connection,
    events_max: u64,
}

impl ObserverDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>, events_max: u64, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.busy_timeout(busy_timeout)
            .context("Failed to set busy timeout")?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS servers (
                ip          TEXT NOT NULL,
                port        INTEGER NOT NULL,
                host        TEXT NOT NULL,
                seq         INTEGER NOT NULL,
                ver         INTEGER NOT NULL,
                first_seen  TEXT NOT NULL,
                last_seen   TEXT NOT NULL,
                dead        INTEGER NOT NULL DEFAULT 0,
                hist        TEXT NOT NULL,
                PRIMARY KEY (ip, port)
            );

            CREATE INDEX IF NOT EXISTS idx_servers_host ON servers(host);
            CREATE INDEX IF NOT EXISTS idx_servers_last_seen ON servers(last_seen);

            CREATE TABLE IF NOT EXISTS searches (
                ip          TEXT NOT NULL,
                port        INTEGER NOT NULL,
                host        TEXT NOT NULL,
                pv          TEXT NOT NULL,
                cid         INTEGER NOT NULL,
                ver         INTEGER NOT NULL,
                first_seen  TEXT NOT NULL,
                last_seen   TEXT NOT NULL,
                dead        INTEGER NOT NULL DEFAULT 0,
                result      TEXT,
                hist        TEXT NOT NULL,
                PRIMARY KEY (ip, port, pv)
            );

            CREATE INDEX IF NOT EXISTS idx_searches_host ON searches(host);
            CREATE INDEX IF NOT EXISTS idx_searches_pv ON searches(pv);
            CREATE INDEX IF NOT EXISTS idx_searches_last_seen ON searches(last_seen);

            CREATE TABLE IF NOT EXISTS events (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                kind        TEXT NOT NULL,
                description TEXT NOT NULL,
                time        TEXT NOT NULL,
                ip          TEXT NOT NULL,
                port        INTEGER NOT NULL,
                host        TEXT NOT NULL,
                pv          TEXT,
                prev        TEXT,
                next        TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_events_host ON events(host, port);
            CREATE INDEX IF NOT EXISTS idx_events_time ON events(time);
            CREATE INDEX IF NOT EXISTS idx_events_kind ON events(kind);

            CREATE TABLE IF NOT EXISTS dead_searches (
                pv          TEXT PRIMARY KEY,
                count       INTEGER NOT NULL,
                sources     TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS daemon (
                kind        TEXT PRIMARY KEY,
                doc         TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn, events_max })
    }

    /// Record a beacon. Returns the server record as it was before this
    /// beacon, read in the same transaction as the write.
    pub fn upsert_server(
        &mut self,
        source: &Source,
        seq: u32,
        ver: u16,
        time: DateTime<Utc>,
    ) -> Result<Option<ServerRecord>> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let prev = tx
            .query_row(
                &format!("SELECT {SERVER_COLUMNS} FROM servers WHERE ip = ?1 AND port = ?2"),
                params![source.ip.to_string(), source.port],
                row_to_server,
            )
            .optional()
            .context("Failed to query existing server")?;

        let mut hist = prev.as_ref().map(|p| p.history.clone()).unwrap_or_default();
        push_capped(&mut hist, BeaconHistory { seq, time }, SERVER_HISTORY_MAX);
        let hist_json = serde_json::to_string(&hist)
            .context("Failed to serialize beacon history")?;

        tx.execute(
            r#"
            INSERT INTO servers (ip, port, host, seq, ver, first_seen, last_seen, dead, hist)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 0, ?7)
            ON CONFLICT(ip, port) DO UPDATE SET
                seq = excluded.seq,
                ver = excluded.ver,
                last_seen = excluded.last_seen,
                dead = 0,
                hist = excluded.hist
            "#,
            params![
                source.ip.to_string(),
                source.port,
                &source.host,
                seq,
                ver,
                ts(&time),
                hist_json,
            ],
        )
        .context("Failed to upsert server")?;

        tx.commit().context("Failed to commit server upsert")?;
        Ok(prev)
    }

    /// Record one search attempt
    pub fn upsert_search(
        &mut self,
        source: &Source,
        pv: &str,
        cid: u32,
        ver: u16,
        time: DateTime<Utc>,
    ) -> Result<()> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let hist_json: Option<String> = tx
            .query_row(
                "SELECT hist FROM searches WHERE ip = ?1 AND port = ?2 AND pv = ?3",
                params![source.ip.to_string(), source.port, pv],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query existing search")?;

        let mut hist: Vec<SearchHistory> = match hist_json {
            Some(json) => serde_json::from_str(&json)
                .context("Failed to parse search history")?,
            None => Vec::new(),
        };
        push_capped(&mut hist, SearchHistory { cid, time }, SEARCH_HISTORY_MAX);
        let hist_json = serde_json::to_string(&hist)
            .context("Failed to serialize search history")?;

        tx.execute(
            r#"
            INSERT INTO searches (ip, port, host, pv, cid, ver, first_seen, last_seen, dead, hist)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 0, ?8)
            ON CONFLICT(ip, port, pv) DO UPDATE SET
                cid = excluded.cid,
                ver = excluded.ver,
                last_seen = excluded.last_seen,
                dead = 0,
                hist = excluded.hist
            "#,
            params![
                source.ip.to_string(),
                source.port,
                &source.host,
                pv,
                cid,
                ver,
                ts(&time),
                hist_json,
            ],
        )
        .context("Failed to upsert search")?;

        tx.commit().context("Failed to commit search upsert")?;
        Ok(())
    }

    /// Append to the event log, discarding the oldest entries beyond capacity
    pub fn insert_event(&mut self, event: &Event) -> Result<()> {
        let tx = self.conn.transaction()?;
        insert_event(&tx, event, self.events_max)?;
        tx.commit().context("Failed to commit event")?;
        Ok(())
    }

    /// Mark servers not seen since `cutoff` as dead, log one event per dead
    /// server and delete them. Returns the number removed.
    pub fn retire_servers(
        &mut self,
        cutoff: DateTime<Utc>,
        make_event: impl Fn(&ServerRecord) -> Event,
    ) -> Result<usize> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "UPDATE servers SET dead = 1 WHERE last_seen < ?1",
            params![ts(&cutoff)],
        )
        .context("Failed to mark expired servers")?;

        let dead = {
            let mut stmt = tx.prepare(&format!("SELECT {SERVER_COLUMNS} FROM servers WHERE dead = 1"))?;
            let rows = stmt
                .query_map([], row_to_server)
                .context("Failed to query dead servers")?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to collect dead servers")?;
            rows
        };

        for record in &dead {
            insert_event(&tx, &make_event(record), self.events_max)?;
        }

        tx.execute("DELETE FROM servers WHERE dead = 1", [])
            .context("Failed to delete dead servers")?;

        tx.commit().context("Failed to commit server expiry")?;
        Ok(dead.len())
    }

    /// Delete searches last seen at or before `cutoff`. No events are logged.
    pub fn delete_searches_until(&mut self, cutoff: DateTime<Utc>) -> Result<usize> {
        let count = self.conn.execute(
            "DELETE FROM searches WHERE last_seen <= ?1",
            params![ts(&cutoff)],
        )
        .context("Failed to delete expired searches")?;
        Ok(count)
    }

    /// Offer every search not seen since `cutoff` to `classify`. Records for
    /// which it returns an event are marked dead with that result, the events
    /// logged, and the records deleted, all in one transaction.
    pub fn retire_searches(
        &mut self,
        cutoff: DateTime<Utc>,
        classify: impl Fn(&ClientSearchRecord) -> Option<Event>,
    ) -> Result<usize> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidates = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {SEARCH_COLUMNS} FROM searches WHERE dead = 0 AND last_seen < ?1"
            ))?;
            let rows = stmt
                .query_map(params![ts(&cutoff)], row_to_search)
                .context("Failed to query search candidates")?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to collect search candidates")?;
            rows
        };

        let mut retired = 0;
        for record in &candidates {
            let Some(event) = classify(record) else {
                continue;
            };
            tx.execute(
                "UPDATE searches SET dead = 1, result = ?4 WHERE ip = ?1 AND port = ?2 AND pv = ?3",
                params![record.source.ip.to_string(), record.source.port, &record.pv, event.desc.as_str()],
            )
            .context("Failed to mark search dead")?;
            insert_event(&tx, &event, self.events_max)?;
            retired += 1;
        }

        tx.execute("DELETE FROM searches WHERE dead = 1", [])
            .context("Failed to delete dead searches")?;

        tx.commit().context("Failed to commit search expiry")?;
        Ok(retired)
    }

    /// Replace the abandoned-search aggregate table wholesale
    pub fn replace_dead_searches(&mut self, aggregates: &[DeadSearch]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM dead_searches", [])
            .context("Failed to clear dead searches")?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO dead_searches (pv, count, sources) VALUES (?1, ?2, ?3)",
            )?;
            for agg in aggregates {
                let sources = serde_json::to_string(&agg.sources)
                    .context("Failed to serialize dead search sources")?;
                stmt.execute(params![&agg.pv, agg.count, sources])
                    .context("Failed to insert dead search")?;
            }
        }
        tx.commit().context("Failed to commit dead searches")?;
        Ok(())
    }

    pub fn dead_searches(&self) -> Result<Vec<DeadSearch>> {
        let mut stmt = self
            .conn
            .prepare("SELECT pv, count, sources FROM dead_searches ORDER BY pv")
            .context("Failed to prepare query")?;

        let rows = stmt
            .query_map([], |row| {
                Ok(DeadSearch {
                    pv: row.get(0)?,
                    count: row.get(1)?,
                    sources: json_at(row, 2)?,
                })
            })
            .context("Failed to query dead searches")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect dead searches")?;

        Ok(rows)
    }

    /// Distinct (address, host) pairs across servers, searches and events
    pub fn known_sources(&self) -> Result<Vec<(IpAddr, String)>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT ip, host FROM servers
                 UNION SELECT ip, host FROM searches
                 UNION SELECT ip, host FROM events",
            )
            .context("Failed to prepare query")?;

        let rows = stmt
            .query_map([], |row| Ok((ip_at(row, 0)?, row.get(1)?)))
            .context("Failed to query sources")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect sources")?;

        Ok(rows)
    }

    /// Replace the placeholder host of `ip` with `host` everywhere
    pub fn set_host(&mut self, ip: IpAddr, host: &str) -> Result<usize> {
        let addr = ip.to_string();
        let tx = self.conn.transaction()?;
        let mut count = 0;
        for table in ["servers", "searches", "events"] {
            count += tx
                .execute(
                    &format!("UPDATE {table} SET host = ?2 WHERE ip = ?1 AND host = ?1"),
                    params![&addr, host],
                )
                .with_context(|| format!("Failed to update hosts in {}", table))?;
        }
        tx.commit().context("Failed to commit host update")?;
        Ok(count)
    }

    pub fn get_server(&self, ip: IpAddr, port: u16) -> Result<Option<ServerRecord>> {
        let result = self
            .conn
            .query_row(
                &format!("SELECT {SERVER_COLUMNS} FROM servers WHERE ip = ?1 AND port = ?2"),
                params![ip.to_string(), port],
                row_to_server,
            )
            .optional()
            .context("Failed to query server")?;

        Ok(result)
    }

    pub fn get_search(&self, ip: IpAddr, port: u16, pv: &str) -> Result<Option<ClientSearchRecord>> {
        let result = self
            .conn
            .query_row(
                &format!("SELECT {SEARCH_COLUMNS} FROM searches WHERE ip = ?1 AND port = ?2 AND pv = ?3"),
                params![ip.to_string(), port, pv],
                row_to_search,
            )
            .optional()
            .context("Failed to query search")?;

        Ok(result)
    }

    pub fn all_searches(&self) -> Result<Vec<ClientSearchRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {SEARCH_COLUMNS} FROM searches"))
            .context("Failed to prepare query")?;

        let rows = stmt
            .query_map([], row_to_search)
            .context("Failed to query searches")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect searches")?;

        Ok(rows)
    }

    /// Events in insertion order
    pub fn events(&self) -> Result<Vec<Event>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY id"))
            .context("Failed to prepare query")?;

        let rows = stmt
            .query_map([], row_to_event)
            .context("Failed to query events")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect events")?;

        Ok(rows)
    }

    pub fn count_servers(&self) -> Result<u64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM servers", [], |row| row.get(0))
            .context("Failed to count servers")
    }

    pub fn count_searches(&self) -> Result<u64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM searches", [], |row| row.get(0))
            .context("Failed to count searches")
    }

    /// Store a daemon document (`config`, `stats`)
    pub fn write_daemon_doc(&self, kind: &str, doc: &serde_json::Value) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO daemon (kind, doc) VALUES (?1, ?2)
                 ON CONFLICT(kind) DO UPDATE SET doc = excluded.doc",
                params![kind, doc.to_string()],
            )
            .with_context(|| format!("Failed to write daemon {} document", kind))?;
        Ok(())
    }

    pub fn read_daemon_doc(&self, kind: &str) -> Result<Option<serde_json::Value>> {
        let doc: Option<String> = self
            .conn
            .query_row("SELECT doc FROM daemon WHERE kind = ?1", params![kind], |row| row.get(0))
            .optional()
            .context("Failed to read daemon document")?;

        doc.map(|d| serde_json::from_str(&d).context("Failed to parse daemon document"))
            .transpose()
    }
}

/// Fixed-width timestamps so lexical order in SQL matches time order
fn ts(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Append `item`, dropping the oldest entries beyond `max`
fn push_capped<T>(hist: &mut Vec<T>, item: T, max: usize) {
    hist.push(item);
    if hist.len() > max {
        let excess = hist.len() - max;
        hist.drain(..excess);
    }
}

fn insert_event(conn: &Connection, event: &Event, events_max: u64) -> Result<()> {
    let prev = event.prev.as_ref().map(serde_json::to_string).transpose()?;
    let next = event.next.as_ref().map(serde_json::to_string).transpose()?;

    conn.execute(
        &format!("INSERT INTO events ({EVENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
        params![
            event.kind.as_str(),
            event.desc.as_str(),
            ts(&event.time),
            event.source.ip.to_string(),
            event.source.port,
            &event.source.host,
            &event.pv,
            prev,
            next,
        ],
    )
    .context("Failed to insert event")?;

    let newest = conn.last_insert_rowid();
    conn.execute(
        "DELETE FROM events WHERE id <= ?1",
        params![newest - events_max as i64],
    )
    .context("Failed to trim event log")?;

    Ok(())
}

fn bad_column(idx: usize, err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
}

fn ip_at(row: &Row, idx: usize) -> Result<IpAddr, rusqlite::Error> {
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| bad_column(idx, e))
}

fn time_at(row: &Row, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| bad_column(idx, e))
}

fn json_at<T: DeserializeOwned>(row: &Row, idx: usize) -> Result<T, rusqlite::Error> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| bad_column(idx, e))
}

fn opt_json_at<T: DeserializeOwned>(row: &Row, idx: usize) -> Result<Option<T>, rusqlite::Error> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| serde_json::from_str(&t).map_err(|e| bad_column(idx, e)))
        .transpose()
}

fn row_to_server(row: &Row) -> Result<ServerRecord, rusqlite::Error> {
    Ok(ServerRecord {
        source: Source {
            ip: ip_at(row, 0)?,
            port: row.get(1)?,
            host: row.get(2)?,
        },
        seq: row.get(3)?,
        ver: row.get(4)?,
        first_seen: time_at(row, 5)?,
        last_seen: time_at(row, 6)?,
        history: json_at(row, 7)?,
    })
}

fn row_to_search(row: &Row) -> Result<ClientSearchRecord, rusqlite::Error> {
    Ok(ClientSearchRecord {
        source: Source {
            ip: ip_at(row, 0)?,
            port: row.get(1)?,
            host: row.get(2)?,
        },
        pv: row.get(3)?,
        cid: row.get(4)?,
        ver: row.get(5)?,
        first_seen: time_at(row, 6)?,
        last_seen: time_at(row, 7)?,
        history: json_at(row, 8)?,
    })
}

fn row_to_event(row: &Row) -> Result<Event, rusqlite::Error> {
    let kind: String = row.get(0)?;
    let desc: String = row.get(1)?;
    Ok(Event {
        kind: kind.parse().map_err(|e: String| bad_column(0, e))?,
        desc: desc.parse().map_err(|e: String| bad_column(1, e))?,
        time: time_at(row, 2)?,
        source: Source {
            ip: ip_at(row, 3)?,
            port: row.get(4)?,
            host: row.get(5)?,
        },
        pv: row.get(6)?,
        prev: opt_json_at(row, 7)?,
        next: opt_json_at(row, 8)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use shared::types::{DeadSearchSource, EventDesc, EventKind};

    fn open() -> ObserverDb {
        ObserverDb::open(":memory:", 1000, Duration::from_millis(100)).unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn source() -> Source {
        Source::unresolved("10.0.0.5".parse().unwrap(), 5064)
    }

    fn event(desc: EventDesc, secs: i64) -> Event {
        Event {
            kind: EventKind::Beacon,
            desc,
            time: at(secs),
            source: source(),
            prev: None,
            next: None,
            pv: None,
        }
    }

    #[test]
    fn test_upsert_server_returns_previous() {
        let mut db = open();
        let src = source();

        let prev = db.upsert_server(&src, 7, 13, at(0)).unwrap();
        assert!(prev.is_none(), "First beacon has no previous record");

        let prev = db.upsert_server(&src, 8, 13, at(15)).unwrap().unwrap();
        assert_eq!(prev.seq, 7);
        assert_eq!(prev.last_seen, at(0));

        let now = db.get_server(src.ip, src.port).unwrap().unwrap();
        assert_eq!(now.seq, 8);
        assert_eq!(now.first_seen, at(0));
        assert_eq!(now.last_seen, at(15));
        assert_eq!(now.history.len(), 2);
    }

    #[test]
    fn test_server_host_set_on_insert_only() {
        let mut db = open();
        let mut src = source();
        db.upsert_server(&src, 1, 13, at(0)).unwrap();
        src.host = "ioc.example".to_string();
        db.upsert_server(&src, 2, 13, at(1)).unwrap();

        let record = db.get_server(src.ip, src.port).unwrap().unwrap();
        assert_eq!(record.source.host, "10.0.0.5");
    }

    #[test]
    fn test_server_history_is_capped() {
        let mut db = open();
        let src = source();
        for seq in 0..(SERVER_HISTORY_MAX as u32 + 10) {
            db.upsert_server(&src, seq, 13, at(seq as i64)).unwrap();
        }

        let record = db.get_server(src.ip, src.port).unwrap().unwrap();
        assert_eq!(record.history.len(), SERVER_HISTORY_MAX);
        assert_eq!(record.history[0].seq, 10);
        assert_eq!(record.history.last().unwrap().seq, SERVER_HISTORY_MAX as u32 + 9);
    }

    #[test]
    fn test_search_history_is_capped() {
        let mut db = open();
        let src = source();
        for i in 0..30u32 {
            db.upsert_search(&src, "pv:a", i, 11, at(i as i64)).unwrap();
        }

        let record = db.get_search(src.ip, src.port, "pv:a").unwrap().unwrap();
        assert_eq!(record.history.len(), SEARCH_HISTORY_MAX);
        assert_eq!(record.history[0].cid, 10);
        assert_eq!(record.cid, 29);
        assert_eq!(record.first_seen, at(0));
        assert_eq!(db.count_searches().unwrap(), 1);
    }

    #[test]
    fn test_event_log_is_a_ring() {
        let mut db = ObserverDb::open(":memory:", 3, Duration::from_millis(100)).unwrap();
        for i in 0..5 {
            db.insert_event(&event(EventDesc::Appears, i)).unwrap();
        }

        let events = db.events().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].time, at(2));
        assert_eq!(events[2].time, at(4));
    }

    #[test]
    fn test_event_round_trips_snapshots() {
        let mut db = open();
        let mut ev = event(EventDesc::Glitch, 3);
        ev.prev = Some(shared::types::ServerSnapshot { seq: 2, ver: 13, seen_last: at(1) });
        db.insert_event(&ev).unwrap();

        assert_eq!(db.events().unwrap(), vec![ev]);
    }

    #[test]
    fn test_retire_servers() {
        let mut db = open();
        let old = source();
        let fresh = Source::unresolved("10.0.0.6".parse().unwrap(), 5064);
        db.upsert_server(&old, 1, 13, at(0)).unwrap();
        db.upsert_server(&fresh, 1, 13, at(100)).unwrap();

        let removed = db
            .retire_servers(at(50), |r| {
                let mut e = event(EventDesc::Disappears, 120);
                e.source = r.source.clone();
                e.prev = Some(r.snapshot());
                e
            })
            .unwrap();
        assert_eq!(removed, 1);
        assert!(db.get_server(old.ip, old.port).unwrap().is_none());
        assert!(db.get_server(fresh.ip, fresh.port).unwrap().is_some());

        let events = db.events().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, old);
        assert_eq!(events[0].prev.as_ref().unwrap().seq, 1);
    }

    #[test]
    fn test_delete_searches_until() {
        let mut db = open();
        let src = source();
        db.upsert_search(&src, "pv:old", 1, 11, at(0)).unwrap();
        db.upsert_search(&src, "pv:edge", 1, 11, at(50)).unwrap();
        db.upsert_search(&src, "pv:new", 2, 11, at(100)).unwrap();

        assert_eq!(db.delete_searches_until(at(50)).unwrap(), 2);
        assert!(db.get_search(src.ip, src.port, "pv:edge").unwrap().is_none());
        assert!(db.get_search(src.ip, src.port, "pv:old").unwrap().is_none());
        assert!(db.get_search(src.ip, src.port, "pv:new").unwrap().is_some());
        assert!(db.events().unwrap().is_empty());
    }

    #[test]
    fn test_set_host_updates_placeholders() {
        let mut db = open();
        let src = source();
        db.upsert_server(&src, 1, 13, at(0)).unwrap();
        db.upsert_search(&src, "pv:a", 1, 11, at(0)).unwrap();
        db.insert_event(&event(EventDesc::Appears, 0)).unwrap();

        let unresolved: Vec<_> = db.known_sources().unwrap();
        assert_eq!(unresolved, vec![(src.ip, "10.0.0.5".to_string())]);

        assert_eq!(db.set_host(src.ip, "ioc.example").unwrap(), 3);
        assert_eq!(db.get_server(src.ip, src.port).unwrap().unwrap().source.host, "ioc.example");
        assert_eq!(db.events().unwrap()[0].source.host, "ioc.example");
        assert_eq!(db.known_sources().unwrap(), vec![(src.ip, "ioc.example".to_string())]);
    }

    #[test]
    fn test_replace_dead_searches() {
        let mut db = open();
        let agg = DeadSearch {
            pv: "pv:x".to_string(),
            count: 1,
            sources: vec![DeadSearchSource { source: source(), age_secs: 90 }],
        };
        db.replace_dead_searches(&[agg.clone()]).unwrap();
        db.replace_dead_searches(&[agg.clone()]).unwrap();
        assert_eq!(db.dead_searches().unwrap(), vec![agg]);

        db.replace_dead_searches(&[]).unwrap();
        assert!(db.dead_searches().unwrap().is_empty());
    }

    #[test]
    fn test_daemon_docs() {
        let db = open();
        assert!(db.read_daemon_doc("stats").unwrap().is_none());
        db.write_daemon_doc("stats", &serde_json::json!({"numBeacons": 1})).unwrap();
        db.write_daemon_doc("stats", &serde_json::json!({"numBeacons": 2})).unwrap();
        assert_eq!(
            db.read_daemon_doc("stats").unwrap(),
            Some(serde_json::json!({"numBeacons": 2}))
        );
    }
}
