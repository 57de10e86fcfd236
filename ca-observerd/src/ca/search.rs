use std::net::SocketAddr;
use chrono::{DateTime, Utc};
use shared::protocol::{CMD_SEARCH, CMD_VERSION};
use shared::wire::{self, SEARCH_FRAMING};
use super::receiver::Protocol;
use super::{SearchDatagram, SearchEntry};

/// Client search datagrams: an optional version message followed by one
/// search message per PV name.
#[derive(Default)]
pub struct SearchProtocol;

impl Protocol for SearchProtocol {
    type Unit = SearchDatagram;

    fn on_datagram(&mut self, data: &[u8], src: SocketAddr, now: DateTime<Utc>) -> Vec<SearchDatagram> {
        let messages = wire::decode(data, &SEARCH_FRAMING, src);
        tracing::trace!(%src, count = messages.len(), "CA search datagram");

        let mut version = None;
        let mut priority = None;
        let mut searches = Vec::new();
        for msg in &messages {
            match msg.command {
                CMD_VERSION => {
                    if version.is_some() {
                        tracing::warn!(%src, "Search message with more than one version");
                        continue;
                    }
                    priority = Some(msg.data_type);
                    version = Some(msg.count);
                }
                CMD_SEARCH => searches.push(SearchEntry {
                    pv: pv_name(&msg.body),
                    cid: msg.param1,
                    minor_version: msg.count,
                }),
                _ => {}
            }
        }

        if searches.is_empty() {
            tracing::debug!(%src, "Search datagram without searches");
            return Vec::new();
        }

        vec![SearchDatagram {
            source: src,
            version,
            priority,
            searches,
            time: now,
        }]
    }
}

/// PV names are NUL padded to a multiple of 8 bytes
fn pv_name(body: &[u8]) -> String {
    String::from_utf8_lossy(body).trim_matches('\0').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::wire::{Param2, RawMessage};

    fn src() -> SocketAddr {
        "10.0.0.9:41000".parse().unwrap()
    }

    fn version(prio: u16, ver: u16) -> RawMessage {
        RawMessage::header(CMD_VERSION, prio, ver, 0, Param2::Value(0))
    }

    fn search(name: &str, cid: u32) -> RawMessage {
        let mut body = name.as_bytes().to_vec();
        body.resize(name.len().div_ceil(8) * 8, 0);
        RawMessage::new(CMD_SEARCH, 5, 11, cid, Param2::Value(cid), body).unwrap()
    }

    #[test]
    fn test_one_unit_per_datagram() {
        let now = Utc::now();
        let data = wire::encode(&[version(1, 13), search("pv:one", 1), search("pv:twelve:char", 2)]);

        let units = SearchProtocol.on_datagram(&data, src(), now);
        assert_eq!(
            units,
            vec![SearchDatagram {
                source: src(),
                version: Some(13),
                priority: Some(1),
                searches: vec![
                    SearchEntry { pv: "pv:one".to_string(), cid: 1, minor_version: 11 },
                    SearchEntry { pv: "pv:twelve:char".to_string(), cid: 2, minor_version: 11 },
                ],
                time: now,
            }]
        );
    }

    #[test]
    fn test_first_version_wins() {
        let data = wire::encode(&[version(1, 13), version(2, 9), search("pv:a", 1)]);
        let units = SearchProtocol.on_datagram(&data, src(), Utc::now());
        assert_eq!(units[0].version, Some(13));
        assert_eq!(units[0].priority, Some(1));
    }

    #[test]
    fn test_without_searches_is_dropped() {
        let data = wire::encode(&[version(0, 13)]);
        assert!(SearchProtocol.on_datagram(&data, src(), Utc::now()).is_empty());
    }

    #[test]
    fn test_searches_without_version() {
        let data = wire::encode(&[search("pv:a", 7)]);
        let units = SearchProtocol.on_datagram(&data, src(), Utc::now());
        assert_eq!(units[0].version, None);
        assert_eq!(units[0].searches[0].cid, 7);
    }

    #[test]
    fn test_pv_name_trims_padding() {
        assert_eq!(pv_name(b"pv:x\0\0\0\0"), "pv:x");
        assert_eq!(pv_name(b"exactly8"), "exactly8");
    }
}
