//! Channel Access receivers.
//!
//! Each receiver owns one UDP socket, turns datagrams into protocol units and
//! hands them to a [`batch::BatchHandler`] in debounced, bounded batches.

pub mod batch;
pub mod beacon;
pub mod receiver;
pub mod search;
pub mod socket;

use std::net::{SocketAddr, SocketAddrV4};
use chrono::{DateTime, Utc};

/// One beacon relayed by the repeater
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconEvent {
    /// Address the server announced, not the repeater's
    pub server: SocketAddrV4,
    pub seq: u32,
    pub ver: u16,
    pub time: DateTime<Utc>,
}

/// One search request within a datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchEntry {
    pub pv: String,
    pub cid: u32,
    pub minor_version: u16,
}

/// All searches carried by one client datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchDatagram {
    pub source: SocketAddr,
    pub version: Option<u16>,
    pub priority: Option<u16>,
    pub searches: Vec<SearchEntry>,
    pub time: DateTime<Utc>,
}
