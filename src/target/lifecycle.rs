//! Key registration with the cipher engine
//!
//! A [`KeyLifecycle`] registers its key at most once and evicts it at most
//! once. Eviction also runs after a failed registration, because the
//! engine may have kept part of it.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::domain::{BlockDevice, CipherEngine, CryptoProfile};
use crate::error::KeyError;
use crate::key::KeyMaterial;

/// Where the key stands with the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// Never registered
    Inactive,
    /// Registration was attempted and failed; the engine may hold leftovers
    Failed,
    /// Registered and usable
    Active,
    /// Eviction has run
    Evicted,
}

impl KeyState {
    /// Whether eviction still has to run.
    pub fn needs_eviction(&self) -> bool {
        matches!(self, KeyState::Active | KeyState::Failed)
    }
}

/// Owns the engine registration of one mapping's key.
pub struct KeyLifecycle {
    engine: Arc<dyn CipherEngine>,
    state: KeyState,
}

impl KeyLifecycle {
    pub fn new(engine: Arc<dyn CipherEngine>) -> Self {
        Self {
            engine,
            state: KeyState::Inactive,
        }
    }

    pub fn state(&self) -> KeyState {
        self.state
    }

    /// Register `key` with the engine for `device`.
    #[instrument(skip_all, fields(device = %device.name(), key_id = %key.id()))]
    pub async fn activate(
        &mut self,
        device: &dyn BlockDevice,
        key: &KeyMaterial,
        profile: &CryptoProfile,
    ) -> Result<(), KeyError> {
        if self.state != KeyState::Inactive {
            return Err(KeyError::AlreadyActivated(key.id().0));
        }

        match self.engine.register_key(device, key, profile).await {
            Ok(()) => {
                self.state = KeyState::Active;
                debug!(
                    mode = %profile.mode,
                    data_unit_size = profile.data_unit_size,
                    dun_bytes = profile.dun_bytes,
                    "key registered"
                );
                Ok(())
            }
            Err(e) => {
                self.state = KeyState::Failed;
                warn!("engine rejected key: {}", e);
                Err(KeyError::EngineRejected(e))
            }
        }
    }

    /// Unregister `key`. Runs at most once; later calls are no-ops.
    ///
    /// The lifecycle counts as evicted even if the engine reports a failure.
    #[instrument(skip_all, fields(device = %device.name(), key_id = %key.id()))]
    pub async fn evict(&mut self, device: &dyn BlockDevice, key: &KeyMaterial) -> Result<(), KeyError> {
        if !self.state.needs_eviction() {
            return Ok(());
        }

        let result = self.engine.evict_key(device, key).await;
        self.state = KeyState::Evicted;

        match result {
            Ok(()) => {
                info!("key evicted");
                Ok(())
            }
            Err(e) => {
                warn!("key eviction failed: {}", e);
                Err(KeyError::EvictionFailed(e))
            }
        }
    }
}

impl Drop for KeyLifecycle {
    fn drop(&mut self) {
        if self.state == KeyState::Active {
            warn!("mapping dropped without teardown; key is still registered with the engine");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::key::{CipherMode, KeyType};
    use crate::mock::{EngineCapabilities, MockBlockDevice, MockCipherEngine};
    use assert_matches::assert_matches;

    fn profile(key: &KeyMaterial) -> CryptoProfile {
        CryptoProfile {
            mode: key.mode(),
            key_type: key.key_type(),
            data_unit_size: 512,
            dun_bytes: 8,
        }
    }

    fn key() -> KeyMaterial {
        KeyMaterial::new(CipherMode::Adiantum, &[9u8; 32], KeyType::Standard).unwrap()
    }

    #[tokio::test]
    async fn test_activate_then_evict() {
        let engine = Arc::new(MockCipherEngine::new());
        let device = MockBlockDevice::new("sda", 1024);
        let key = key();

        let mut lifecycle = KeyLifecycle::new(engine.clone());
        lifecycle.activate(&device, &key, &profile(&key)).await.unwrap();
        assert_eq!(lifecycle.state(), KeyState::Active);
        assert!(engine.is_registered("sda", key.id()));

        lifecycle.evict(&device, &key).await.unwrap();
        assert_eq!(lifecycle.state(), KeyState::Evicted);
        assert!(!engine.is_registered("sda", key.id()));

        // Second eviction is a no-op
        lifecycle.evict(&device, &key).await.unwrap();
        assert_eq!(engine.evict_calls(), 1);
    }

    #[tokio::test]
    async fn test_activate_twice_rejected() {
        let engine = Arc::new(MockCipherEngine::new());
        let device = MockBlockDevice::new("sda", 1024);
        let key = key();

        let mut lifecycle = KeyLifecycle::new(engine.clone());
        lifecycle.activate(&device, &key, &profile(&key)).await.unwrap();
        assert_matches!(
            lifecycle.activate(&device, &key, &profile(&key)).await,
            Err(KeyError::AlreadyActivated(_))
        );
        assert_eq!(engine.register_calls(), 1);
        lifecycle.evict(&device, &key).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_activation_still_evicts() {
        let engine = Arc::new(MockCipherEngine::new());
        engine.fail_next_register();
        let device = MockBlockDevice::new("sda", 1024);
        let key = key();

        let mut lifecycle = KeyLifecycle::new(engine.clone());
        assert_matches!(
            lifecycle.activate(&device, &key, &profile(&key)).await,
            Err(KeyError::EngineRejected(EngineError::Failed(_)))
        );
        assert_eq!(lifecycle.state(), KeyState::Failed);

        lifecycle.evict(&device, &key).await.unwrap();
        assert_eq!(engine.evict_calls(), 1);
        assert_eq!(engine.registered_count(), 0);
    }

    #[tokio::test]
    async fn test_unsupported_mode() {
        let engine = Arc::new(MockCipherEngine::with_capabilities(EngineCapabilities {
            modes: vec![CipherMode::Aes256Xts],
            ..Default::default()
        }));
        let device = MockBlockDevice::new("sda", 1024);
        let key = key();

        let mut lifecycle = KeyLifecycle::new(engine);
        assert_matches!(
            lifecycle.activate(&device, &key, &profile(&key)).await,
            Err(KeyError::EngineRejected(EngineError::Unsupported { .. }))
        );
    }

    #[tokio::test]
    async fn test_eviction_failure_reported() {
        let engine = Arc::new(MockCipherEngine::new());
        let device = MockBlockDevice::new("sda", 1024);
        let key = key();

        let mut lifecycle = KeyLifecycle::new(engine.clone());
        lifecycle.activate(&device, &key, &profile(&key)).await.unwrap();
        engine.fail_next_evict();
        assert_matches!(
            lifecycle.evict(&device, &key).await,
            Err(KeyError::EvictionFailed(_))
        );
        assert_eq!(lifecycle.state(), KeyState::Evicted);
    }
}
