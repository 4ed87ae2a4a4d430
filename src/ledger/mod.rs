//! Money-moving operations: disbursements, collections, cheques.
//!
//! The backend has no transactional endpoint for a disbursement; the
//! client drives a multi-step saga (transaction row, disbursement row,
//! balance deduction) over independent REST calls. A step failure
//! triggers compensation — the already-created transaction is voided —
//! so a half-committed ledger is never left behind silently. Only when
//! the compensating void itself fails does the error admit the books
//! may be inconsistent.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::json;
use tracing::{error, info, warn};

use crate::api::{ApiError, BackendApi, BalanceAdjustment, BalanceOperation};
use crate::bus::{BroadcastBus, FundEvent, FundEventKind};
use crate::cache::{QueryCache, QueryKey};
use crate::model::{
    generate_receipt_no, Cheque, ChequeDraft, Disbursement, DisbursementDraft, EntityFamily,
    FundAccount, Receipt, ReceiptDraft, Transaction,
};
use crate::validate::{
    ensure_positive_amount, ensure_sufficient_funds, ensure_unique_cheque_number,
    require_non_empty, ValidationError,
};

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors from ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Cache(#[from] crate::cache::CacheError),

    /// The saga failed mid-flight and the compensating void also
    /// failed: a transaction row exists without its balance effect.
    #[error(
        "Transaction {transaction_id} created but balance update failed, \
         and the compensating void did not go through: {source}. \
         The ledger needs manual reconciliation."
    )]
    PartialCommit {
        transaction_id: String,
        source: ApiError,
    },
}

/// Result of a completed disbursement saga.
#[derive(Debug)]
pub struct DisbursementOutcome {
    pub transaction: Transaction,
    pub disbursement: Disbursement,
    pub fund_account: FundAccount,
}

/// Draft for a money-in collection.
#[derive(Debug, Clone)]
pub struct CollectionDraft {
    pub payer_name: String,
    pub amount: Decimal,
    pub fund_account_id: Option<String>,
    pub description: Option<String>,
}

/// Result of a completed collection.
#[derive(Debug)]
pub struct CollectionOutcome {
    pub transaction: Transaction,
    pub receipt: Receipt,
}

/// Disbursement, collection and cheque operations.
pub struct Ledger {
    api: Arc<dyn BackendApi>,
    cache: Arc<QueryCache>,
    bus: Arc<BroadcastBus>,
}

impl Ledger {
    pub fn new(api: Arc<dyn BackendApi>, cache: Arc<QueryCache>, bus: Arc<BroadcastBus>) -> Self {
        Self { api, cache, bus }
    }

    /// Run the disbursement saga.
    ///
    /// Steps: transaction row, disbursement row, balance deduction
    /// (dedicated balance service, falling back to a direct field
    /// write). Any failure after the transaction row exists voids it;
    /// see [`LedgerError::PartialCommit`] for the one case that cannot
    /// be cleaned up.
    pub async fn disburse(&self, draft: DisbursementDraft) -> Result<DisbursementOutcome> {
        require_non_empty("Recipient", &draft.recipient)?;
        ensure_positive_amount(draft.amount)?;

        let account = self.fund_account(&draft.fund_account_id).await?;
        ensure_sufficient_funds(&account, draft.amount)?;

        let transaction = self
            .api
            .create_transaction(&json!({
                "type": "Disbursement",
                "amount": draft.amount,
                "recipient": draft.recipient,
                "fund_account_id": draft.fund_account_id,
            }))
            .await?;

        let disbursement = match self
            .api
            .create_disbursement(&json!({
                "transaction_id": transaction.id,
                "fund_account_id": draft.fund_account_id,
                "amount": draft.amount,
                "recipient": draft.recipient,
            }))
            .await
        {
            Ok(disbursement) => disbursement,
            Err(e) => {
                warn!(
                    transaction_id = %transaction.id,
                    error = %e,
                    "Disbursement row failed, voiding transaction"
                );
                self.compensate(&transaction.id).await?;
                return Err(e.into());
            }
        };

        let fund_account = match self
            .deduct_balance(&draft.fund_account_id, &account, draft.amount)
            .await
        {
            Ok(account) => account,
            Err(e) => {
                warn!(
                    transaction_id = %transaction.id,
                    error = %e,
                    "Balance update failed on both paths, voiding transaction"
                );
                self.compensate(&transaction.id).await?;
                return Err(e.into());
            }
        };

        for family in [
            EntityFamily::Transactions,
            EntityFamily::Disbursements,
            EntityFamily::FundAccounts,
        ] {
            self.cache.invalidate_family(family).await;
        }

        self.bus.broadcast(FundEvent {
            account_id: draft.fund_account_id.clone(),
            kind: FundEventKind::Disbursement,
            amount: draft.amount,
            source: "disbursement-form".to_string(),
            balance: Some(fund_account.current_balance),
            timestamp: 0,
        });

        info!(
            transaction_id = %transaction.id,
            fund_account_id = %draft.fund_account_id,
            amount = %draft.amount,
            "Disbursement committed"
        );

        Ok(DisbursementOutcome {
            transaction,
            disbursement,
            fund_account,
        })
    }

    /// Record a money-in collection: transaction row, receipt, and an
    /// optional fund credit.
    pub async fn collect(&self, draft: CollectionDraft) -> Result<CollectionOutcome> {
        require_non_empty("Payer name", &draft.payer_name)?;
        ensure_positive_amount(draft.amount)?;

        let transaction = self
            .api
            .create_transaction(&json!({
                "type": "Collection",
                "amount": draft.amount,
                "recipient": draft.payer_name,
                "fund_account_id": draft.fund_account_id,
            }))
            .await?;

        let receipt = match self
            .api
            .create_receipt(&ReceiptDraft {
                transaction_id: transaction.id.clone(),
                receipt_no: generate_receipt_no(chrono::Utc::now()),
                payer_name: draft.payer_name.clone(),
                amount: draft.amount,
                description: draft.description.clone(),
            })
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(
                    transaction_id = %transaction.id,
                    error = %e,
                    "Receipt creation failed, voiding collection transaction"
                );
                self.compensate(&transaction.id).await?;
                return Err(e.into());
            }
        };

        if let Some(fund_account_id) = &draft.fund_account_id {
            // A failed credit does not undo the collection; the money
            // was received either way. Reconciliation picks it up.
            if let Err(e) = self
                .api
                .adjust_fund_balance(
                    fund_account_id,
                    &BalanceAdjustment {
                        amount: draft.amount,
                        operation: BalanceOperation::Credit,
                        source: "collection".to_string(),
                    },
                )
                .await
            {
                warn!(
                    fund_account_id = %fund_account_id,
                    error = %e,
                    "Fund credit failed after collection"
                );
            }

            self.bus.broadcast(FundEvent {
                account_id: fund_account_id.clone(),
                kind: FundEventKind::Collection,
                amount: draft.amount,
                source: "collection-form".to_string(),
                balance: None,
                timestamp: 0,
            });
        }

        for family in [
            EntityFamily::Transactions,
            EntityFamily::Receipts,
            EntityFamily::FundAccounts,
        ] {
            self.cache.invalidate_family(family).await;
        }

        info!(
            transaction_id = %transaction.id,
            receipt_no = %receipt.receipt_no,
            "Collection recorded"
        );

        Ok(CollectionOutcome {
            transaction,
            receipt,
        })
    }

    /// Issue a cheque. Numbers are unique case-insensitively against
    /// the known cheque list.
    pub async fn issue_cheque(&self, draft: ChequeDraft) -> Result<Cheque> {
        require_non_empty("Cheque number", &draft.cheque_number)?;
        require_non_empty("Payee name", &draft.payee_name)?;
        ensure_positive_amount(draft.amount)?;

        let api = self.api.clone();
        let existing = self
            .cache
            .query(QueryKey::root(EntityFamily::Cheques), || async move {
                api.list_cheques().await
            })
            .await?;
        let numbers = existing
            .iter()
            .filter_map(|c| c.get("cheque_number").and_then(|n| n.as_str()));
        ensure_unique_cheque_number(&draft.cheque_number, numbers)?;

        let cheque = self.api.create_cheque(&draft).await?;
        self.cache.invalidate_family(EntityFamily::Cheques).await;

        info!(cheque_number = %cheque.cheque_number, "Cheque issued");
        Ok(cheque)
    }

    /// Flip a cheque between issued and cleared. Reversible by design:
    /// a mis-click is undone by clicking again.
    pub async fn toggle_cheque_status(&self, cheque: &Cheque) -> Result<Cheque> {
        let next = cheque.status.toggled();
        let updated = self
            .api
            .update_cheque(&cheque.id, &json!({ "status": next }))
            .await?;
        self.cache.invalidate_family(EntityFamily::Cheques).await;
        Ok(updated)
    }

    /// Flip the reconciled flag on a cheque.
    pub async fn toggle_reconciled(&self, cheque: &Cheque) -> Result<Cheque> {
        let updated = self
            .api
            .update_cheque(&cheque.id, &json!({ "reconciled": !cheque.reconciled }))
            .await?;
        self.cache.invalidate_family(EntityFamily::Cheques).await;
        Ok(updated)
    }

    /// Deduct through the balance service, falling back to a direct
    /// field write when the service is unavailable.
    async fn deduct_balance(
        &self,
        fund_account_id: &str,
        before: &FundAccount,
        amount: Decimal,
    ) -> std::result::Result<FundAccount, ApiError> {
        match self
            .api
            .adjust_fund_balance(
                fund_account_id,
                &BalanceAdjustment {
                    amount,
                    operation: BalanceOperation::Deduct,
                    source: "disbursement".to_string(),
                },
            )
            .await
        {
            Ok(account) => Ok(account),
            Err(e) => {
                warn!(
                    fund_account_id = %fund_account_id,
                    error = %e,
                    "Balance service failed, falling back to direct write"
                );
                self.api
                    .update_fund_account(
                        fund_account_id,
                        &json!({ "current_balance": before.current_balance - amount }),
                    )
                    .await
            }
        }
    }

    /// Void the transaction created earlier in a failed saga. A failed
    /// void escalates to [`LedgerError::PartialCommit`].
    async fn compensate(&self, transaction_id: &str) -> Result<()> {
        match self.api.void_transaction(transaction_id).await {
            Ok(()) => {
                info!(transaction_id = %transaction_id, "Compensating void applied");
                self.cache
                    .invalidate_family(EntityFamily::Transactions)
                    .await;
                Ok(())
            }
            Err(e) => {
                error!(
                    transaction_id = %transaction_id,
                    error = %e,
                    "Compensating void failed, ledger needs manual reconciliation"
                );
                Err(LedgerError::PartialCommit {
                    transaction_id: transaction_id.to_string(),
                    source: e,
                })
            }
        }
    }

    /// Resolve a fund account, preferring the cached copy.
    async fn fund_account(&self, id: &str) -> Result<FundAccount> {
        let cached = self
            .cache
            .lookup(
                EntityFamily::FundAccounts,
                &serde_json::Value::String(id.to_string()),
            )
            .await;
        if let Some(value) = cached {
            if let Ok(account) = serde_json::from_value::<FundAccount>(value) {
                return Ok(account);
            }
        }
        Ok(self.api.fetch_fund_account(id).await?)
    }
}
