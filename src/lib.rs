//! masterkey-migrate - Bulk re-encryption of user storage under a master key
//!
//! This library walks every file of every user, decrypts it in place,
//! switches the encryption configuration to master-key mode and encrypts
//! every file again. Irreversible configuration changes are gated on a
//! decrypt phase without a single failure.

pub mod appconfig;
pub mod config;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod progress;
pub mod reencrypt;
pub mod rewrite;
pub mod session;
pub mod storage;
pub mod users;
pub mod walker;

pub use config::Config;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::reencrypt::{Reencryptor, RunReport, RunState};
    pub use crate::storage::Storage;
    pub use crate::users::UserEnumerator;
}
