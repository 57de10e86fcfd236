//! Plays a canned beacon and search script at an observer.
//!
//! Usage: `ca-gentest <addr>`. Beacons go to `<addr>:5065` and skip sequence
//! number 3, searches go to `<addr>:5064`.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::thread;
use std::time::Duration;
use anyhow::{Context, Result};
use bytes::Bytes;
use shared::protocol::{
    CMD_BEACON, CMD_SEARCH, CMD_VERSION, DEFAULT_REPEATER_PORT, DEFAULT_SEARCH_PORT,
};
use shared::wire::{self, Param2, RawMessage};

enum Step {
    Send(Bytes),
    Wait(Duration),
}

/// Minor protocol version announced by the script
const VERSION: u16 = 11;

/// Default client search cid base
const FIRST_CID: u32 = 115;

fn search(pvs: &[&str], first_cid: u32) -> Result<Step> {
    let mut messages = vec![RawMessage::header(CMD_VERSION, 0, VERSION, 0, Param2::Value(0))];
    for (cid, pv) in (first_cid..).zip(pvs) {
        let mut body = pv.as_bytes().to_vec();
        body.resize(pv.len().div_ceil(8) * 8, 0);
        messages.push(RawMessage::new(CMD_SEARCH, 5, VERSION, cid, Param2::Value(cid), body)?);
    }
    Ok(Step::Send(wire::encode(&messages)))
}

fn beacon(seq: u32) -> Step {
    Step::Send(wire::encode(&[RawMessage::header(
        CMD_BEACON,
        VERSION,
        0,
        seq,
        Param2::Value(0x7f00_0042),
    )]))
}

fn wait(secs: f64) -> Step {
    Step::Wait(Duration::from_secs_f64(secs))
}

fn beacon_script() -> Vec<Step> {
    [0, 1, 2, 4, 5]
        .into_iter()
        .flat_map(|seq| [beacon(seq), wait(2.0)])
        .collect()
}

fn search_script() -> Result<Vec<Step>> {
    let numbered: Vec<String> = (0..10).map(|i| format!("pv:{}", i)).collect();
    let numbered: Vec<&str> = numbered.iter().map(String::as_str).collect();
    Ok(vec![
        search(&numbered, FIRST_CID)?,
        wait(0.1),
        search(&numbered, FIRST_CID)?,
        wait(0.1),
        search(&["pv:special"], 42)?,
        wait(0.5),
        search(&["pv:special", "pv:single"], 42)?,
        wait(2.0),
        search(&["pv:special"], 42)?,
    ])
}

fn play(dest: SocketAddr, script: Vec<Step>) -> Result<()> {
    let local = SocketAddr::new(dest.ip(), 0);
    let socket = UdpSocket::bind(local).with_context(|| format!("Failed to bind {}", local))?;

    for step in script {
        match step {
            Step::Send(datagram) => {
                tracing::info!(%dest, len = datagram.len(), "send");
                socket
                    .send_to(&datagram, dest)
                    .with_context(|| format!("Failed to send to {}", dest))?;
            }
            Step::Wait(delay) => {
                tracing::debug!(?delay, "wait");
                thread::sleep(delay);
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ca_gentest=info"))
        )
        .init();

    let addr: IpAddr = std::env::args()
        .nth(1)
        .context("usage: ca-gentest <addr>")?
        .parse()
        .context("Invalid address")?;

    let search_steps = search_script()?;
    tracing::info!("Starting");
    let beacons = thread::spawn(move || play(SocketAddr::new(addr, DEFAULT_REPEATER_PORT), beacon_script()));
    let searches = thread::spawn(move || play(SocketAddr::new(addr, DEFAULT_SEARCH_PORT), search_steps));

    for (name, handle) in [("beacon", beacons), ("search", searches)] {
        match handle.join() {
            Ok(result) => result.with_context(|| format!("{} script failed", name))?,
            Err(_) => anyhow::bail!("{} script panicked", name),
        }
    }

    tracing::info!("Done");
    Ok(())
}
