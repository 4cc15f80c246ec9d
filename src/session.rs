//! Session-scoped flags
//!
//! Flags signal "bulk transform in progress" to whatever per-request
//! transform logic shares the process. The transform itself is selected
//! explicitly through [`crate::storage::TransformMode`]; these flags are
//! only an observable side channel.

use parking_lot::Mutex;
use std::collections::HashSet;

/// Set while a decrypt-all batch rewrites a file
pub const DECRYPT_ALL_FLAG: &str = "decryptAllCmd";

/// Set for the whole encrypt-all batch
pub const ENCRYPT_ALL_FLAG: &str = "encryptAllCmd";

/// Session flag capability
pub trait SessionFlags: Send + Sync {
    fn set(&self, name: &str);

    fn remove(&self, name: &str);

    fn is_set(&self, name: &str) -> bool;
}

/// Process-local flag set
#[derive(Debug, Default)]
pub struct MemorySession {
    flags: Mutex<HashSet<String>>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionFlags for MemorySession {
    fn set(&self, name: &str) {
        self.flags.lock().insert(name.to_string());
    }

    fn remove(&self, name: &str) {
        self.flags.lock().remove(name);
    }

    fn is_set(&self, name: &str) -> bool {
        self.flags.lock().contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_remove() {
        let session = MemorySession::new();
        assert!(!session.is_set(DECRYPT_ALL_FLAG));

        session.set(DECRYPT_ALL_FLAG);
        session.set(DECRYPT_ALL_FLAG);
        assert!(session.is_set(DECRYPT_ALL_FLAG));
        assert!(!session.is_set(ENCRYPT_ALL_FLAG));

        session.remove(DECRYPT_ALL_FLAG);
        assert!(!session.is_set(DECRYPT_ALL_FLAG));
    }
}
