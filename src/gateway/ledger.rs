use super::{AccountRecord, DRAIN_ACCOUNT_ID, SOURCE_ACCOUNT_ID, SqliteStore, TransferRecord};
use crate::{GatewayError, Result};

/// Double-entry account API over the store. This is the only path by which
/// money moves: every operation is a transfer producing a paired debit and
/// credit inside one store transaction.
#[derive(Clone, Debug)]
pub struct Ledger {
    store: SqliteStore,
}

impl Ledger {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Provisions the global source and global drain singletons if absent.
    /// Safe to call from every instance at startup.
    pub async fn bootstrap(&self) -> Result<()> {
        self.store.ensure_system_accounts().await?;
        Ok(())
    }

    pub async fn ensure_user_account(&self, user_id: &str) -> Result<AccountRecord> {
        Ok(self.store.ensure_user_account(user_id).await?)
    }

    pub async fn account(&self, id: &str) -> Result<Option<AccountRecord>> {
        Ok(self.store.account(id).await?)
    }

    pub async fn user_account(&self, user_id: &str) -> Result<AccountRecord> {
        self.store
            .user_account(user_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound {
                what: format!("account for user {user_id}"),
            })
    }

    pub async fn transfer(
        &self,
        from_account: &str,
        to_account: &str,
        amount: i64,
        description: &str,
    ) -> Result<TransferRecord> {
        let transfer = self
            .store
            .transfer(from_account, to_account, amount, description)
            .await?;
        tracing::debug!(
            from = %transfer.from_account,
            to = %transfer.to_account,
            amount = transfer.amount,
            transfer_id = transfer.id,
            "ledger transfer applied"
        );
        Ok(transfer)
    }

    /// Money entering the ledger from outside (external payment settlement).
    /// The global source runs negative by that amount, keeping the ledger sum
    /// at zero.
    pub async fn deposit_into_account(
        &self,
        account_id: &str,
        amount: i64,
        description: &str,
    ) -> Result<TransferRecord> {
        self.transfer(SOURCE_ACCOUNT_ID, account_id, amount, description)
            .await
    }

    /// Money leaving the ledger (consumption write-off, payout).
    pub async fn withdraw_from_account(
        &self,
        account_id: &str,
        amount: i64,
        description: &str,
    ) -> Result<TransferRecord> {
        self.transfer(account_id, DRAIN_ACCOUNT_ID, amount, description)
            .await
    }
}
