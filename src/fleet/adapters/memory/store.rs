//! In-memory registry store.

use crate::fleet::ports::{
    RegistrySnapshot, RegistryStore, RegistryStoreError, RegistryStoreResult,
};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};

/// Thread-safe in-memory snapshot store.
///
/// Clones share state, so a test can keep one handle and give another to
/// the registry to simulate a restart.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRegistryStore {
    state: Arc<RwLock<InMemoryStoreState>>,
}

#[derive(Debug, Default)]
struct InMemoryStoreState {
    snapshot: Option<RegistrySnapshot>,
    fail_saves: bool,
    saves: usize,
}

impl InMemoryRegistryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-seeded with `snapshot`.
    #[must_use]
    pub fn with_snapshot(snapshot: RegistrySnapshot) -> Self {
        Self {
            state: Arc::new(RwLock::new(InMemoryStoreState {
                snapshot: Some(snapshot),
                ..InMemoryStoreState::default()
            })),
        }
    }

    /// Makes every subsequent save fail until reset.
    ///
    /// # Errors
    ///
    /// Returns a storage error when lock acquisition fails.
    pub fn set_fail_saves(&self, fail: bool) -> RegistryStoreResult<()> {
        let mut state = self
            .state
            .write()
            .map_err(|err| RegistryStoreError::io(std::io::Error::other(err.to_string())))?;
        state.fail_saves = fail;
        Ok(())
    }

    /// Returns the currently stored snapshot.
    ///
    /// # Errors
    ///
    /// Returns a storage error when lock acquisition fails.
    pub fn snapshot(&self) -> RegistryStoreResult<Option<RegistrySnapshot>> {
        let state = self
            .state
            .read()
            .map_err(|err| RegistryStoreError::io(std::io::Error::other(err.to_string())))?;
        Ok(state.snapshot.clone())
    }

    /// Returns how many saves succeeded.
    ///
    /// # Errors
    ///
    /// Returns a storage error when lock acquisition fails.
    pub fn save_count(&self) -> RegistryStoreResult<usize> {
        let state = self
            .state
            .read()
            .map_err(|err| RegistryStoreError::io(std::io::Error::other(err.to_string())))?;
        Ok(state.saves)
    }
}

#[async_trait]
impl RegistryStore for InMemoryRegistryStore {
    async fn load(&self) -> RegistryStoreResult<Option<RegistrySnapshot>> {
        self.snapshot()
    }

    async fn save(&self, snapshot: &RegistrySnapshot) -> RegistryStoreResult<()> {
        let mut state = self
            .state
            .write()
            .map_err(|err| RegistryStoreError::io(std::io::Error::other(err.to_string())))?;
        if state.fail_saves {
            return Err(RegistryStoreError::io(std::io::Error::other(
                "simulated storage failure",
            )));
        }

        state.snapshot = Some(snapshot.clone());
        state.saves += 1;
        Ok(())
    }
}
