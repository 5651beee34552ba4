//! Wallet registry: creates wallets and links addresses to them.
//!
//! The registry is the only writer of the membership column families. An
//! address import takes the store's write lock, so it lands strictly between
//! two block commits and affects every block connected after it. There is
//! no historical backfill.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use tally_core::error::{TallyError, ValidationError};
use tally_core::store::WalletStore;
use tally_core::types::{Address, WalletId};

/// Wallet membership management.
pub struct WalletRegistry<S: WalletStore> {
    store: Arc<RwLock<S>>,
}

impl<S: WalletStore> Clone for WalletRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: WalletStore> WalletRegistry<S> {
    pub fn new(store: Arc<RwLock<S>>) -> Self {
        Self { store }
    }

    /// Create an empty wallet.
    pub fn create_wallet(&self, wallet_id: &str) -> Result<WalletId, TallyError> {
        let wallet = WalletId::new(wallet_id)?;
        let created_at = chrono::Utc::now().timestamp().max(0) as u64;
        self.store.write().create_wallet(&wallet, created_at)?;
        info!(wallet = %wallet, "created wallet");
        Ok(wallet)
    }

    /// Start tracking `address` for a wallet. Re-importing an address the
    /// wallet already tracks is a no-op.
    pub fn import_address(&self, wallet_id: &str, address: &str) -> Result<(), TallyError> {
        let wallet = WalletId::new(wallet_id)?;
        let address = Address::new(address)?;
        let added = self.store.write().import_address(&wallet, &address)?;
        if added {
            info!(wallet = %wallet, address = %address, "imported address");
        }
        Ok(())
    }

    /// Addresses tracked for a wallet.
    pub fn addresses(&self, wallet_id: &str) -> Result<Vec<Address>, TallyError> {
        let wallet = WalletId::new(wallet_id)?;
        let store = self.store.read();
        if !store.wallet_exists(&wallet)? {
            return Err(ValidationError::UnknownWallet(wallet.to_string()).into());
        }
        store.wallet_addresses(&wallet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::store::MemoryWalletStore;

    fn registry() -> WalletRegistry<MemoryWalletStore> {
        WalletRegistry::new(Arc::new(RwLock::new(MemoryWalletStore::new())))
    }

    #[test]
    fn create_and_import() {
        let reg = registry();
        reg.create_wallet("w1").unwrap();
        reg.import_address("w1", "mzBc4XEFSdzCDcTxAgf6EZXgsZWpztRhef").unwrap();
        reg.import_address("w1", "mzBc4XEFSdzCDcTxAgf6EZXgsZWpztRhef").unwrap();
        assert_eq!(reg.addresses("w1").unwrap().len(), 1);
    }

    #[test]
    fn duplicate_wallet_fails() {
        let reg = registry();
        reg.create_wallet("w1").unwrap();
        let err = reg.create_wallet("w1").unwrap_err();
        assert!(matches!(err, TallyError::Validation(ValidationError::AlreadyExists(_))));
    }

    #[test]
    fn malformed_input_is_rejected_before_lookup() {
        let reg = registry();
        assert!(matches!(
            reg.create_wallet("bad id").unwrap_err(),
            TallyError::Validation(ValidationError::MalformedWalletId(_))
        ));
        reg.create_wallet("w1").unwrap();
        assert!(matches!(
            reg.import_address("w1", "not/an/address").unwrap_err(),
            TallyError::Validation(ValidationError::MalformedAddress(_))
        ));
    }

    #[test]
    fn import_into_unknown_wallet_fails() {
        let reg = registry();
        let err = reg.import_address("ghost", "addr1").unwrap_err();
        assert!(matches!(err, TallyError::Validation(ValidationError::UnknownWallet(_))));
        assert!(reg.addresses("ghost").is_err());
    }
}
