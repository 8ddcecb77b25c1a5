//! Error types for the default-key target

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for anything the target surfaces to its owner.
#[derive(Error, Debug)]
pub enum Error {
    /// Construction failed
    #[error("construction failed: {0}")]
    Config(#[from] ConfigError),

    /// A single request was rejected
    #[error("request rejected: {0}")]
    Map(#[from] MapError),

    /// Key registration or eviction failed
    #[error("key lifecycle error: {0}")]
    Key(#[from] KeyError),

    /// The backing device failed a dispatched request
    #[error("backing device error: {0}")]
    Io(#[from] IoError),

    /// Inventory file could not be read or parsed
    #[error("inventory error: {0}")]
    Inventory(String),
}

// =============================================================================
// Construction Errors
// =============================================================================

/// Setup failures. Each message names the constraint that was violated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Fewer positional arguments than the target requires
    #[error("not enough arguments: need <cipher> <key> <iv_offset> <dev_path> <start>, got {got}")]
    NotEnoughArguments { got: usize },

    /// Table line is not `<begin> <len> <target> <args...>`
    #[error("malformed table line: {0}")]
    MalformedTable(String),

    /// Cipher name is not one of the supported ciphers
    #[error("unknown cipher '{0}': expected aes-xts-plain64 or xchacha12,aes-adiantum-plain64")]
    InvalidCipher(String),

    /// Decoded key length does not fit the cipher or key type
    #[error("invalid key size for {cipher}: expected {expected} bytes, got {got}")]
    InvalidKeyLength {
        cipher: String,
        expected: String,
        got: usize,
    },

    /// Key string is not valid hex
    #[error("malformed key string: key must be an even-length hex string")]
    MalformedKeyHex,

    /// iv_offset is not an unsigned integer
    #[error("invalid iv_offset sector '{0}'")]
    InvalidIvOffset(String),

    /// start offset is not an unsigned integer
    #[error("invalid start sector '{0}'")]
    InvalidStartOffset(String),

    /// Optional argument count disagrees with the trailing tokens
    #[error("invalid feature arguments: {0}")]
    InvalidFeatureArguments(String),

    /// Unknown optional argument
    #[error("unrecognized optional argument '{0}'")]
    UnrecognizedOption(String),

    /// sector_size out of range or not a power of two
    #[error("sector_size must be a power of two between 512 and 4096, got {0}")]
    InvalidSectorSize(u64),

    /// sector_size != 512 given without iv_large_sectors
    #[error("iv_large_sectors must be specified when sector_size is {0}")]
    MissingIvLargeSectors(u32),

    /// Mapped length is not a whole number of crypto sectors
    #[error("device length {length} is not a multiple of sector_size {sector_size}")]
    UnalignedDeviceLength { length: u64, sector_size: u32 },

    /// Mapped length of zero sectors
    #[error("mapped length must be greater than zero")]
    EmptyMapping,

    /// iv_offset + length does not fit in 64 bits
    #[error("iv_offset {iv_offset} + length {length} overflows the dun space")]
    IvOffsetOverflow { iv_offset: u64, length: u64 },

    /// Backing device path did not resolve
    #[error("device lookup failed for '{0}'")]
    DeviceLookupFailed(String),

    /// Mapped area does not fit inside the backing device
    #[error("device area {start}+{length} exceeds capacity {capacity} of '{device}'")]
    DeviceAreaOutOfRange {
        device: String,
        start: u64,
        length: u64,
        capacity: u64,
    },

    /// Zoned backing device but the mapping is not zone aligned
    #[error("start {start} and length {length} must be multiples of the zone size {zone_sectors}")]
    ZoneMisaligned {
        start: u64,
        length: u64,
        zone_sectors: u64,
    },

    /// The cipher engine refused the key on this device
    #[error("error starting to use inline encryption: {0}")]
    EngineRejected(#[source] EngineError),
}

// =============================================================================
// Per-Request Errors
// =============================================================================

/// Per-request failures. Fatal to that request only; never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MapError {
    /// Request does not start on a crypto-sector boundary
    #[error("request at sector {position} is not aligned to {alignment} sectors (raw dun {raw_dun})")]
    MisalignedRequest {
        position: u64,
        alignment: u64,
        raw_dun: u64,
    },

    /// Derived DUN is larger than the mapping can produce
    #[error("dun {dun} exceeds max_dun {max_dun}")]
    DunOverflow { dun: u64, max_dun: u64 },

    /// Request already carries an encryption context
    #[error("request already carries an encryption context")]
    CryptoContextAlreadyPresent,

    /// Request lies outside the mapped region
    #[error("request {position}+{sectors} is outside the mapped region {begin}+{length}")]
    OutOfRange {
        position: u64,
        sectors: u64,
        begin: u64,
        length: u64,
    },

    /// Operation is not enabled on this mapping
    #[error("operation {0} is not supported by this mapping")]
    UnsupportedOperation(String),

    /// Zoned write that does not start at the zone write pointer
    #[error("write at sector {position} in zone {zone} does not match write pointer {write_pointer}")]
    ZoneWriteOutOfOrder {
        zone: u64,
        position: u64,
        write_pointer: u64,
    },

    /// Zoned write that runs past the end of its zone
    #[error("zone {zone} has {remaining} sectors left, request needs {sectors}")]
    ZoneFull {
        zone: u64,
        remaining: u64,
        sectors: u64,
    },

    /// Another write to the zone is still in flight; retry after it completes
    #[error("zone {zone} has a write in flight")]
    ZoneBusy { zone: u64 },

    /// Write payload that is not a whole number of sectors
    #[error("payload of {bytes} bytes is not a multiple of the 512-byte sector")]
    PartialSector { bytes: usize },
}

// =============================================================================
// Key Lifecycle Errors
// =============================================================================

/// Errors from registering or evicting the key with the cipher engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// Engine refused to register the key
    #[error("engine rejected key: {0}")]
    EngineRejected(#[source] EngineError),

    /// Key is already (or was already) registered by this lifecycle
    #[error("key {0} was already activated")]
    AlreadyActivated(u64),

    /// Engine failed to evict the key (teardown still completes)
    #[error("key eviction failed: {0}")]
    EvictionFailed(#[source] EngineError),
}

/// Errors reported by a cipher engine implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine cannot serve this crypto profile on the device
    #[error("unsupported on {device}: {reason}")]
    Unsupported { device: String, reason: String },

    /// The key is not registered
    #[error("key {key_id} is not registered on {device}")]
    NotRegistered { device: String, key_id: u64 },

    /// No keyslot left
    #[error("no free keyslot on {0}")]
    NoKeyslot(String),

    /// Generic engine failure
    #[error("engine failure: {0}")]
    Failed(String),
}

/// Errors reported by the backing device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// Request extends past the device capacity
    #[error("request {position}+{sectors} exceeds capacity {capacity}")]
    OutOfRange {
        position: u64,
        sectors: u64,
        capacity: u64,
    },

    /// Payload size does not match the sector count
    #[error("payload of {bytes} bytes does not match {sectors} sectors")]
    PayloadMismatch { bytes: usize, sectors: u64 },

    /// Device-side failure
    #[error("device failure: {0}")]
    Device(String),
}
