//! Well-known section ids.
//!
//! Ids are split into a vendor byte (most significant) and a record byte.
//! Vendor `0x00` is reserved; `0x0000` is the index terminator and can never
//! be allocated. Application-specific sections live under `0xFE`.

/// Index terminator. Not a section.
pub const RESERVED_END_OF_INDEX: u16 = index::END_OF_INDEX;
/// Sensor data record repository.
pub const WISC_SDR_REPOSITORY: u16 = 0x0101;
/// Time-series database client configuration.
pub const WISC_INFLUXDB_CONFIG: u16 = 0x0102;
/// Credentials for network services.
pub const WISC_NETWORK_AUTH: u16 = 0x0103;
/// FRU data area.
pub const WISC_FRU_DATA: u16 = 0x0104;
/// Free for application configuration.
pub const APPLICATION_CONFIG: u16 = 0xFE00;

const KNOWN: &[(u16, &str)] = &[
    (RESERVED_END_OF_INDEX, "RESERVED_END_OF_INDEX"),
    (WISC_SDR_REPOSITORY, "WISC_SDR_REPOSITORY"),
    (WISC_INFLUXDB_CONFIG, "WISC_INFLUXDB_CONFIG"),
    (WISC_NETWORK_AUTH, "WISC_NETWORK_AUTH"),
    (WISC_FRU_DATA, "WISC_FRU_DATA"),
    (APPLICATION_CONFIG, "APPLICATION_CONFIG"),
];

/// Every registered `(id, name)` pair, in id order.
pub fn known() -> impl Iterator<Item = (u16, &'static str)> {
    KNOWN.iter().copied()
}

/// Name registered for `id`.
#[must_use]
pub fn name_of(id: u16) -> Option<&'static str> {
    KNOWN.iter().find(|(k, _)| *k == id).map(|(_, name)| *name)
}

/// Id registered under `name`.
#[must_use]
pub fn id_of(name: &str) -> Option<u16> {
    KNOWN.iter().find(|(_, n)| *n == name).map(|(id, _)| *id)
}

/// Vendor byte of `id`.
#[must_use]
pub fn vendor(id: u16) -> u8 {
    id.to_be_bytes()[0]
}

/// Record byte of `id`.
#[must_use]
pub fn record(id: u16) -> u8 {
    id.to_be_bytes()[1]
}
