//! Key material for the inline-encryption target.
//!
//! A [`KeyMaterial`] is built once during construction, shared read-only
//! through an `Arc` by every request context, and wiped when the last
//! reference is dropped.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::ConfigError;

// =============================================================================
// Constants
// =============================================================================

/// Largest raw (standard) key any supported cipher uses.
pub const MAX_RAW_KEY_SIZE: usize = 64;

/// Largest hardware-wrapped key blob accepted.
pub const MAX_WRAPPED_KEY_SIZE: usize = 128;

static NEXT_KEY_ID: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Cipher Mode
// =============================================================================

/// Cipher the engine applies to mapped data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherMode {
    /// AES-256 in XTS mode, 64-byte key
    #[serde(rename = "aes-xts-plain64")]
    Aes256Xts,
    /// Adiantum (XChaCha12 + AES), 32-byte key
    #[serde(rename = "xchacha12,aes-adiantum-plain64")]
    Adiantum,
}

impl CipherMode {
    /// Every supported mode.
    pub const ALL: [CipherMode; 2] = [CipherMode::Aes256Xts, CipherMode::Adiantum];

    /// Look a mode up by its table name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.name() == name)
    }

    /// Name used in table lines and status output.
    pub fn name(&self) -> &'static str {
        match self {
            CipherMode::Aes256Xts => "aes-xts-plain64",
            CipherMode::Adiantum => "xchacha12,aes-adiantum-plain64",
        }
    }

    /// Raw key size in bytes.
    pub fn key_size(&self) -> usize {
        match self {
            CipherMode::Aes256Xts => 64,
            CipherMode::Adiantum => 32,
        }
    }
}

impl fmt::Display for CipherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Classification of the key bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// Raw key usable directly by the cipher
    #[default]
    Standard,
    /// Opaque blob only the inline-encryption hardware can unwrap
    HardwareWrapped,
}

impl KeyType {
    pub fn is_wrapped(&self) -> bool {
        matches!(self, KeyType::HardwareWrapped)
    }
}

/// Process-unique, non-secret identifier for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct KeyId(pub u64);

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Key Material
// =============================================================================

/// Immutable key bytes plus the mode and classification they belong to.
///
/// Not `Clone`: share it through `Arc`. The bytes are overwritten with zeros
/// on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    #[zeroize(skip)]
    id: KeyId,
    raw: Vec<u8>,
    #[zeroize(skip)]
    mode: CipherMode,
    #[zeroize(skip)]
    key_type: KeyType,
}

impl KeyMaterial {
    /// Build key material from raw bytes.
    ///
    /// Standard keys must match the mode's key size exactly. Wrapped keys
    /// are opaque and only bounded by [`MAX_WRAPPED_KEY_SIZE`].
    pub fn new(mode: CipherMode, key_bytes: &[u8], key_type: KeyType) -> Result<Self, ConfigError> {
        let valid = match key_type {
            KeyType::Standard => key_bytes.len() == mode.key_size(),
            KeyType::HardwareWrapped => {
                !key_bytes.is_empty() && key_bytes.len() <= MAX_WRAPPED_KEY_SIZE
            }
        };
        if !valid {
            return Err(ConfigError::InvalidKeyLength {
                cipher: mode.name().to_string(),
                expected: match key_type {
                    KeyType::Standard => mode.key_size().to_string(),
                    KeyType::HardwareWrapped => format!("1..={}", MAX_WRAPPED_KEY_SIZE),
                },
                got: key_bytes.len(),
            });
        }

        Ok(Self {
            id: KeyId(NEXT_KEY_ID.fetch_add(1, Ordering::Relaxed)),
            raw: key_bytes.to_vec(),
            mode,
            key_type,
        })
    }

    /// Decode a hex key string and build key material from it.
    ///
    /// The decoded buffer is wiped before returning, on success or failure.
    pub fn from_hex(mode: CipherMode, key_hex: &str, key_type: KeyType) -> Result<Self, ConfigError> {
        if key_hex.len() % 2 != 0 || key_hex.len() > 2 * MAX_WRAPPED_KEY_SIZE {
            return Err(ConfigError::InvalidKeyLength {
                cipher: mode.name().to_string(),
                expected: match key_type {
                    KeyType::Standard => mode.key_size().to_string(),
                    KeyType::HardwareWrapped => format!("1..={}", MAX_WRAPPED_KEY_SIZE),
                },
                got: key_hex.len() / 2,
            });
        }

        let decoded = Zeroizing::new(hex::decode(key_hex).map_err(|_| ConfigError::MalformedKeyHex)?);
        Self::new(mode, &decoded, key_type)
    }

    pub fn id(&self) -> KeyId {
        self.id
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Raw bytes, for cipher engines only.
    pub fn expose_bytes(&self) -> &[u8] {
        &self.raw
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("key_type", &self.key_type)
            .field("len", &self.raw.len())
            .field("raw", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_cipher_mode_lookup() {
        assert_eq!(
            CipherMode::from_name("aes-xts-plain64"),
            Some(CipherMode::Aes256Xts)
        );
        assert_eq!(
            CipherMode::from_name("xchacha12,aes-adiantum-plain64"),
            Some(CipherMode::Adiantum)
        );
        assert_eq!(CipherMode::from_name("aes-cbc-essiv:sha256"), None);
        assert_eq!(CipherMode::Adiantum.to_string(), "xchacha12,aes-adiantum-plain64");
    }

    #[test]
    fn test_key_sizes_per_mode() {
        assert!(KeyMaterial::new(CipherMode::Aes256Xts, &[7u8; 64], KeyType::Standard).is_ok());
        assert!(KeyMaterial::new(CipherMode::Adiantum, &[7u8; 32], KeyType::Standard).is_ok());

        assert_matches!(
            KeyMaterial::new(CipherMode::Aes256Xts, &[7u8; 32], KeyType::Standard),
            Err(ConfigError::InvalidKeyLength { got: 32, .. })
        );
        assert_matches!(
            KeyMaterial::new(CipherMode::Adiantum, &[7u8; 64], KeyType::Standard),
            Err(ConfigError::InvalidKeyLength { got: 64, .. })
        );
    }

    #[test]
    fn test_wrapped_key_is_opaque() {
        let key = KeyMaterial::new(CipherMode::Aes256Xts, &[1u8; 100], KeyType::HardwareWrapped)
            .unwrap();
        assert_eq!(key.len(), 100);
        assert!(key.key_type().is_wrapped());

        assert!(
            KeyMaterial::new(CipherMode::Aes256Xts, &[1u8; 129], KeyType::HardwareWrapped).is_err()
        );
        assert!(KeyMaterial::new(CipherMode::Aes256Xts, &[], KeyType::HardwareWrapped).is_err());
    }

    #[test]
    fn test_from_hex() {
        let hex_key = "ab".repeat(32);
        let key = KeyMaterial::from_hex(CipherMode::Adiantum, &hex_key, KeyType::Standard).unwrap();
        assert_eq!(key.expose_bytes(), &[0xabu8; 32][..]);

        assert_matches!(
            KeyMaterial::from_hex(CipherMode::Adiantum, "abc", KeyType::Standard),
            Err(ConfigError::InvalidKeyLength { .. })
        );
        assert_matches!(
            KeyMaterial::from_hex(CipherMode::Adiantum, &"zz".repeat(32), KeyType::Standard),
            Err(ConfigError::MalformedKeyHex)
        );
        assert_matches!(
            KeyMaterial::from_hex(CipherMode::Adiantum, &"00".repeat(200), KeyType::Standard),
            Err(ConfigError::InvalidKeyLength { .. })
        );
    }

    #[test]
    fn test_ids_are_unique() {
        let a = KeyMaterial::new(CipherMode::Adiantum, &[0u8; 32], KeyType::Standard).unwrap();
        let b = KeyMaterial::new(CipherMode::Adiantum, &[0u8; 32], KeyType::Standard).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_zeroize_clears_bytes() {
        let mut key = KeyMaterial::new(CipherMode::Adiantum, &[0x5au8; 32], KeyType::Standard).unwrap();
        key.zeroize();
        assert!(key.is_empty());
        assert_eq!(key.mode(), CipherMode::Adiantum);
    }

    #[test]
    fn test_debug_redacts_bytes() {
        let key = KeyMaterial::new(CipherMode::Adiantum, &[0x5au8; 32], KeyType::Standard).unwrap();
        let rendered = format!("{:?}", key);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("[90"));
    }
}
