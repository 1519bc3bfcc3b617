//! Storage quota collaborator.

use std::collections::HashMap;
use std::sync::Mutex;

use skyvault_transfer::TransferError;

/// Per-principal storage allowance, consulted before an upload writes.
pub trait Quota: Send + Sync {
    /// Reserves `bytes` for `principal` or fails with
    /// [`TransferError::QuotaExceeded`].
    fn reserve(&self, principal: &str, bytes: u64) -> Result<(), TransferError>;

    /// Returns a reservation that produced no new stored bytes.
    fn release(&self, principal: &str, bytes: u64);
}

/// Quota that never refuses.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

impl Quota for Unlimited {
    fn reserve(&self, _principal: &str, _bytes: u64) -> Result<(), TransferError> {
        Ok(())
    }

    fn release(&self, _principal: &str, _bytes: u64) {}
}

/// The same byte limit for every principal.
pub struct FixedQuota {
    limit: u64,
    used: Mutex<HashMap<String, u64>>,
}

impl FixedQuota {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: Mutex::new(HashMap::new()),
        }
    }

    /// Seeds the usage of a principal, e.g. from the file tree at startup.
    pub fn with_usage(self, principal: &str, bytes: u64) -> Self {
        self.used
            .lock()
            .unwrap()
            .insert(principal.to_string(), bytes);
        self
    }

    pub fn used(&self, principal: &str) -> u64 {
        self.used
            .lock()
            .unwrap()
            .get(principal)
            .copied()
            .unwrap_or(0)
    }

    pub fn available(&self, principal: &str) -> u64 {
        self.limit.saturating_sub(self.used(principal))
    }
}

impl Quota for FixedQuota {
    fn reserve(&self, principal: &str, bytes: u64) -> Result<(), TransferError> {
        let mut used = self.used.lock().unwrap();
        let current = used.entry(principal.to_string()).or_insert(0);
        let available = self.limit.saturating_sub(*current);
        if bytes > available {
            return Err(TransferError::QuotaExceeded {
                principal: principal.to_string(),
                requested: bytes,
                available,
            });
        }
        *current += bytes;
        Ok(())
    }

    fn release(&self, principal: &str, bytes: u64) {
        let mut used = self.used.lock().unwrap();
        if let Some(current) = used.get_mut(principal) {
            *current = current.saturating_sub(bytes);
        }
    }
}
