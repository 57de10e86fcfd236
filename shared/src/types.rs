use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Where a beacon or search came from.
/// `host` holds the literal address until reverse resolution succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub ip: IpAddr,
    pub host: String,
    pub port: u16,
}

impl Source {
    /// A source whose host name is not yet known
    pub fn unresolved(ip: IpAddr, port: u16) -> Self {
        Self { ip, host: ip.to_string(), port }
    }
}

/// One entry of a server's beacon history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconHistory {
    pub seq: u32,
    pub time: DateTime<Utc>,
}

/// One entry of a client's search history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHistory {
    pub cid: u32,
    pub time: DateTime<Utc>,
}

/// A server observed through its beacons, one per (ip, port).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub source: Source,

    /// Last beacon sequence number
    pub seq: u32,

    /// Protocol minor version announced in the last beacon
    pub ver: u16,

    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,

    /// Most recent beacons, oldest first
    pub history: Vec<BeaconHistory>,
}

impl ServerRecord {
    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            seq: self.seq,
            ver: self.ver,
            seen_last: self.last_seen,
        }
    }
}

/// The part of a server record attached to beacon events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSnapshot {
    pub seq: u32,
    pub ver: u16,
    pub seen_last: DateTime<Utc>,
}

/// A client searching for a PV name, one per (ip, port, pv).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSearchRecord {
    pub source: Source,
    pub pv: String,
    pub cid: u32,

    /// Client minor protocol version
    pub ver: u16,

    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,

    /// Most recent attempts, oldest first
    pub history: Vec<SearchHistory>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Beacon,
    Search,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventDesc {
    /// First beacon from a new server
    Appears,
    /// Beacon sequence did not continue from the previous one
    Glitch,
    /// Server stopped sending beacons
    Disappears,
    /// Client searched for a long time without success
    GaveUp,
    /// Client searched once and never again
    Single,
    /// Client stopped searching after a backoff sequence
    Success,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Beacon => "beacon",
            EventKind::Search => "search",
        }
    }
}

impl EventDesc {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventDesc::Appears => "Appears",
            EventDesc::Glitch => "Glitch",
            EventDesc::Disappears => "Disappears",
            EventDesc::GaveUp => "GaveUp",
            EventDesc::Single => "Single",
            EventDesc::Success => "Success",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for EventDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "beacon" => Ok(EventKind::Beacon),
            "search" => Ok(EventKind::Search),
            other => Err(format!("unknown event kind: {}", other)),
        }
    }
}

impl FromStr for EventDesc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Appears" => Ok(EventDesc::Appears),
            "Glitch" => Ok(EventDesc::Glitch),
            "Disappears" => Ok(EventDesc::Disappears),
            "GaveUp" => Ok(EventDesc::GaveUp),
            "Single" => Ok(EventDesc::Single),
            "Success" => Ok(EventDesc::Success),
            other => Err(format!("unknown event description: {}", other)),
        }
    }
}

/// An entry of the append-only event log. Never updated once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub desc: EventDesc,
    pub time: DateTime<Utc>,
    pub source: Source,

    /// Server state before the event (Glitch, Disappears)
    pub prev: Option<ServerSnapshot>,

    /// Server state after the event (Appears, Glitch)
    pub next: Option<ServerSnapshot>,

    /// PV name, search events only
    pub pv: Option<String>,
}

/// A client session that kept searching for at least a minute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadSearchSource {
    pub source: Source,
    pub age_secs: i64,
}

/// Abandoned searches for one PV name, recomputed on every aggregation pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadSearch {
    pub pv: String,
    pub count: u64,
    pub sources: Vec<DeadSearchSource>,
}
