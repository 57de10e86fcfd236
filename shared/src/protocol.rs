/// Version handshake sent ahead of searches in a client datagram
pub const CMD_VERSION: u16 = 0;
/// Client search request for one PV name
pub const CMD_SEARCH: u16 = 6;
/// Server beacon, as forwarded by the repeater
pub const CMD_BEACON: u16 = 13;
/// Repeater confirms a registration
pub const CMD_REPEATER_CONFIRM: u16 = 17;
/// Registration request sent to the repeater (never received)
pub const CMD_REPEATER_REGISTER: u16 = 24;

/// Default ports used by the protocol
pub const DEFAULT_SEARCH_PORT: u16 = 5064;
pub const DEFAULT_REPEATER_PORT: u16 = 5065;

/// Native server beacon period in seconds. Beacon expiry must exceed this.
pub const NATIVE_BEACON_PERIOD_SECS: u64 = 15;
/// Native client maximum search period in seconds. Search expiry must exceed this.
pub const NATIVE_SEARCH_PERIOD_SECS: u64 = 300;

/// History entries kept per server record
pub const SERVER_HISTORY_MAX: usize = 240;
/// History entries kept per client search record
pub const SEARCH_HISTORY_MAX: usize = 20;
