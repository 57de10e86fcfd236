//! Beacon reception through the local CA repeater.
//!
//! Servers broadcast beacons to the repeater port, which only one process
//! per host can own. We register with the repeater (command 24) and, once it
//! confirms (command 17), receive the beacons it forwards (command 13). The
//! announcing server's address travels in the header's trailing field.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::net::UdpSocket;
use shared::protocol::{CMD_BEACON, CMD_REPEATER_CONFIRM, CMD_REPEATER_REGISTER};
use shared::wire::{self, Param2, RawMessage, BEACON_FRAMING};
use super::receiver::Protocol;
use super::BeaconEvent;

pub struct BeaconProtocol {
    repeater: SocketAddr,
    retry: Option<Duration>,
    /// Repeater that confirmed our registration
    bound: Option<SocketAddr>,
}

impl BeaconProtocol {
    pub fn new(repeater: SocketAddr, retry: Option<Duration>) -> Self {
        Self { repeater, retry, bound: None }
    }

    pub fn is_registered(&self) -> bool {
        self.bound.is_some()
    }

    /// Resend the registration without waiting for the socket
    fn register(&self, socket: &UdpSocket) {
        let datagram = registration(local_ipv4(socket));
        match socket.try_send_to(&datagram, self.repeater) {
            Ok(_) => tracing::debug!(repeater = %self.repeater, "Sent repeater registration"),
            Err(e) => tracing::warn!(repeater = %self.repeater, error = %e, "Failed to send repeater registration"),
        }
    }
}

fn local_ipv4(socket: &UdpSocket) -> Ipv4Addr {
    match socket.local_addr() {
        Ok(SocketAddr::V4(v4)) => *v4.ip(),
        _ => Ipv4Addr::LOCALHOST,
    }
}

/// Registration request announcing our local address
pub fn registration(local: Ipv4Addr) -> Bytes {
    wire::encode(&[RawMessage::header(CMD_REPEATER_REGISTER, 0, 0, 0, Param2::Address(local))])
}

impl Protocol for BeaconProtocol {
    type Unit = BeaconEvent;

    fn start<'a>(&'a mut self, socket: &'a UdpSocket) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let datagram = registration(local_ipv4(socket));
            match socket.send_to(&datagram, self.repeater).await {
                Ok(_) => {
                    tracing::debug!(repeater = %self.repeater, "Sent repeater registration");
                    Ok(())
                }
                // housekeeping will try again
                Err(e) if self.retry.is_some() => {
                    tracing::warn!(repeater = %self.repeater, error = %e, "Failed to send repeater registration");
                    Ok(())
                }
                Err(e) => Err(e).with_context(|| {
                    format!("Failed to register with repeater at {}", self.repeater)
                }),
            }
        })
    }

    fn on_datagram(&mut self, data: &[u8], src: SocketAddr, now: DateTime<Utc>) -> Vec<BeaconEvent> {
        let messages = wire::decode(data, &BEACON_FRAMING, src);
        tracing::trace!(%src, count = messages.len(), "CA beacon datagram");

        match self.bound {
            None => {
                if messages.iter().any(|m| m.command == CMD_REPEATER_CONFIRM) {
                    self.bound = Some(src);
                    tracing::info!("Registered with repeater at {}", src);
                }
                Vec::new()
            }
            Some(repeater) if repeater != src => {
                tracing::debug!(%src, %repeater, "Ignoring datagram not from the repeater");
                Vec::new()
            }
            Some(_) => messages
                .iter()
                .filter(|m| m.command == CMD_BEACON)
                .map(|m| BeaconEvent {
                    server: SocketAddrV4::new(m.param2.as_addr(), m.count),
                    seq: m.param1,
                    ver: m.data_type,
                    time: now,
                })
                .collect(),
        }
    }

    fn housekeeping_interval(&self) -> Option<Duration> {
        self.retry
    }

    fn housekeeping(&mut self, socket: &UdpSocket) {
        if !self.is_registered() {
            tracing::debug!("No confirmation from repeater yet");
            self.register(socket);
        }
    }
}
