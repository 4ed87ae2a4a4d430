//! In-memory mock backend for testing.
//!
//! Holds seeded collections, records every call, and lets tests script
//! failures and review responses.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::model::{
    Cheque, ChequeDraft, Disbursement, FundAccount, OverrideDraft, OverrideRequest,
    OverrideStatus, Receipt, ReceiptDraft, ReviewResponse, Transaction,
};

use super::{
    ApiError, BackendApi, BalanceAdjustment, BalanceOperation, Result, ReviewDecision,
    ReviewSubmission,
};

#[derive(Default)]
struct MockState {
    calls: Vec<String>,
    transactions: Vec<Transaction>,
    override_requests: Vec<OverrideRequest>,
    cheques: Vec<Cheque>,
    receipts: Vec<Receipt>,
    disbursements: Vec<Disbursement>,
    fund_accounts: Vec<FundAccount>,
    recipient_accounts: Vec<Value>,
    review_responses: VecDeque<ReviewResponse>,
    voided: Vec<String>,
    fail_balance_service: bool,
    fail_direct_balance_write: bool,
    fail_void: bool,
    fail_fetch_transaction: bool,
    fail_create_disbursement: bool,
    fail_create_receipt: bool,
    next_id: u64,
}

impl MockState {
    fn record(&mut self, call: &str) {
        self.calls.push(call.to_string());
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

/// Scriptable in-memory backend.
#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn seed_transaction(&self, txn: Transaction) {
        self.lock().transactions.push(txn);
    }

    pub fn seed_fund_account(&self, account: FundAccount) {
        self.lock().fund_accounts.push(account);
    }

    pub fn seed_cheque(&self, cheque: Cheque) {
        self.lock().cheques.push(cheque);
    }

    pub fn seed_override_request(&self, request: OverrideRequest) {
        self.lock().override_requests.push(request);
    }

    /// Queue the response returned by the next review call.
    pub fn push_review_response(&self, response: ReviewResponse) {
        self.lock().review_responses.push_back(response);
    }

    pub fn fail_balance_service(&self, fail: bool) {
        self.lock().fail_balance_service = fail;
    }

    pub fn fail_direct_balance_write(&self, fail: bool) {
        self.lock().fail_direct_balance_write = fail;
    }

    pub fn fail_void(&self, fail: bool) {
        self.lock().fail_void = fail;
    }

    pub fn fail_fetch_transaction(&self, fail: bool) {
        self.lock().fail_fetch_transaction = fail;
    }

    pub fn fail_create_disbursement(&self, fail: bool) {
        self.lock().fail_create_disbursement = fail;
    }

    pub fn fail_create_receipt(&self, fail: bool) {
        self.lock().fail_create_receipt = fail;
    }

    /// Every call made so far, by method name.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Receipts created through this backend.
    pub fn receipts_created(&self) -> Vec<Receipt> {
        self.lock().receipts.clone()
    }

    /// Transactions voided through the compensation path.
    pub fn voided_transactions(&self) -> Vec<String> {
        self.lock().voided.clone()
    }

    /// Transactions currently on the books.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.lock().transactions.clone()
    }

    pub fn fund_account(&self, id: &str) -> Option<FundAccount> {
        self.lock().fund_accounts.iter().find(|a| a.id == id).cloned()
    }
}

fn unavailable(what: &str) -> ApiError {
    ApiError::Status {
        status: 503,
        message: format!("{what} unavailable"),
    }
}

fn not_found(what: &str, id: &str) -> ApiError {
    ApiError::Status {
        status: 404,
        message: format!("{what} {id} not found"),
    }
}

fn to_values<T: serde::Serialize>(items: &[T]) -> Result<Vec<Value>> {
    items
        .iter()
        .map(|item| serde_json::to_value(item).map_err(|e| ApiError::Decode(e.to_string())))
        .collect()
}

#[async_trait]
impl BackendApi for MockBackend {
    async fn list_transactions(&self) -> Result<Vec<Value>> {
        let mut state = self.lock();
        state.record("list_transactions");
        let transactions = state.transactions.clone();
        drop(state);
        to_values(&transactions)
    }

    async fn fetch_transaction(&self, id: &str) -> Result<Transaction> {
        let mut state = self.lock();
        state.record("fetch_transaction");
        if state.fail_fetch_transaction {
            return Err(ApiError::Transport("connection refused".to_string()));
        }
        state
            .transactions
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| not_found("transaction", id))
    }

    async fn create_transaction(&self, body: &Value) -> Result<Transaction> {
        let mut state = self.lock();
        state.record("create_transaction");
        let id = state.next_id("txn");
        let mut with_id = body.clone();
        if let Value::Object(map) = &mut with_id {
            map.insert("id".to_string(), Value::String(id));
        }
        let txn: Transaction =
            serde_json::from_value(with_id).map_err(|e| ApiError::Decode(e.to_string()))?;
        state.transactions.push(txn.clone());
        Ok(txn)
    }

    async fn void_transaction(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.record("void_transaction");
        if state.fail_void {
            return Err(unavailable("void"));
        }
        state.transactions.retain(|t| t.id != id);
        state.voided.push(id.to_string());
        Ok(())
    }

    async fn create_override_request(&self, draft: &OverrideDraft) -> Result<OverrideRequest> {
        let mut state = self.lock();
        state.record("create_override_request");
        let id = state.next_id("ovr");
        let request = OverrideRequest {
            id,
            transaction_id: draft.transaction_id.clone(),
            reason: draft.reason.clone(),
            changes: if draft.changes.is_empty() {
                crate::model::Changes::Empty
            } else {
                crate::model::Changes::Fields(draft.changes.clone())
            },
            status: OverrideStatus::Pending,
            requested_by: None,
            reviewed_by: None,
            review_notes: None,
            created_at: Some(chrono::Utc::now()),
            reviewed_at: None,
            transaction: None,
        };
        state.override_requests.push(request.clone());
        Ok(request)
    }

    async fn list_override_requests(&self) -> Result<Vec<Value>> {
        let mut state = self.lock();
        state.record("list_override_requests");
        let requests = state.override_requests.clone();
        drop(state);
        to_values(&requests)
    }

    async fn my_override_requests(&self) -> Result<Vec<Value>> {
        let mut state = self.lock();
        state.record("my_override_requests");
        let requests = state.override_requests.clone();
        drop(state);
        to_values(&requests)
    }

    async fn review_override_request(
        &self,
        id: &str,
        review: &ReviewSubmission,
    ) -> Result<ReviewResponse> {
        let mut state = self.lock();
        state.record("review_override_request");
        let status = match review.status {
            ReviewDecision::Approved => OverrideStatus::Approved,
            ReviewDecision::Rejected => OverrideStatus::Rejected,
        };
        let mut echoed = None;
        if let Some(request) = state.override_requests.iter_mut().find(|r| r.id == id) {
            request.status = status;
            request.review_notes = Some(review.review_notes.clone());
            request.reviewed_at = Some(chrono::Utc::now());
            echoed = Some(request.clone());
        }
        // Like the real backend, the reply embeds the applied changes.
        let changes = echoed
            .as_ref()
            .map(|r| r.changes.clone())
            .unwrap_or_default();
        Ok(state.review_responses.pop_front().unwrap_or(ReviewResponse {
            changes,
            request: echoed,
            ..ReviewResponse::default()
        }))
    }

    async fn list_disbursements(&self) -> Result<Vec<Value>> {
        let mut state = self.lock();
        state.record("list_disbursements");
        let disbursements = state.disbursements.clone();
        drop(state);
        to_values(&disbursements)
    }

    async fn create_disbursement(&self, body: &Value) -> Result<Disbursement> {
        let mut state = self.lock();
        state.record("create_disbursement");
        if state.fail_create_disbursement {
            return Err(unavailable("disbursements"));
        }
        let id = state.next_id("dsb");
        let mut with_id = body.clone();
        if let Value::Object(map) = &mut with_id {
            map.insert("id".to_string(), Value::String(id));
        }
        let disbursement: Disbursement =
            serde_json::from_value(with_id).map_err(|e| ApiError::Decode(e.to_string()))?;
        state.disbursements.push(disbursement.clone());
        Ok(disbursement)
    }

    async fn list_cheques(&self) -> Result<Vec<Value>> {
        let mut state = self.lock();
        state.record("list_cheques");
        let cheques = state.cheques.clone();
        drop(state);
        to_values(&cheques)
    }

    async fn create_cheque(&self, draft: &ChequeDraft) -> Result<Cheque> {
        let mut state = self.lock();
        state.record("create_cheque");
        let id = state.next_id("chq");
        let cheque = Cheque {
            id,
            cheque_number: draft.cheque_number.clone(),
            bank_name: draft.bank_name.clone(),
            account_number: draft.account_number.clone(),
            payee_name: draft.payee_name.clone(),
            amount: draft.amount,
            issue_date: draft.issue_date,
            status: crate::model::ChequeStatus::Issued,
            reconciled: false,
        };
        state.cheques.push(cheque.clone());
        Ok(cheque)
    }

    async fn update_cheque(&self, id: &str, patch: &Value) -> Result<Cheque> {
        let mut state = self.lock();
        state.record("update_cheque");
        let cheque = state
            .cheques
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| not_found("cheque", id))?;
        if let Some(status) = patch.get("status") {
            cheque.status = serde_json::from_value(status.clone())
                .map_err(|e| ApiError::Decode(e.to_string()))?;
        }
        if let Some(reconciled) = patch.get("reconciled").and_then(Value::as_bool) {
            cheque.reconciled = reconciled;
        }
        Ok(cheque.clone())
    }

    async fn list_receipts(&self) -> Result<Vec<Value>> {
        let mut state = self.lock();
        state.record("list_receipts");
        let receipts = state.receipts.clone();
        drop(state);
        to_values(&receipts)
    }

    async fn create_receipt(&self, draft: &ReceiptDraft) -> Result<Receipt> {
        let mut state = self.lock();
        state.record("create_receipt");
        if state.fail_create_receipt {
            return Err(unavailable("receipts"));
        }
        let id = state.next_id("rcp");
        let receipt = Receipt {
            id: Some(id),
            transaction_id: draft.transaction_id.clone(),
            receipt_no: draft.receipt_no.clone(),
            payer_name: draft.payer_name.clone(),
            amount: draft.amount,
            description: draft.description.clone(),
        };
        state.receipts.push(receipt.clone());
        Ok(receipt)
    }

    async fn delete_receipt(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        state.record("delete_receipt");
        state.receipts.retain(|r| r.id.as_deref() != Some(id));
        Ok(())
    }

    async fn list_fund_accounts(&self) -> Result<Vec<Value>> {
        let mut state = self.lock();
        state.record("list_fund_accounts");
        let accounts = state.fund_accounts.clone();
        drop(state);
        to_values(&accounts)
    }

    async fn fetch_fund_account(&self, id: &str) -> Result<FundAccount> {
        let mut state = self.lock();
        state.record("fetch_fund_account");
        state
            .fund_accounts
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| not_found("fund account", id))
    }

    async fn update_fund_account(&self, id: &str, patch: &Value) -> Result<FundAccount> {
        let mut state = self.lock();
        state.record("update_fund_account");
        if state.fail_direct_balance_write {
            return Err(unavailable("fund account update"));
        }
        let account = state
            .fund_accounts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| not_found("fund account", id))?;
        if let Some(balance) = patch.get("current_balance") {
            account.current_balance = serde_json::from_value(balance.clone())
                .map_err(|e| ApiError::Decode(e.to_string()))?;
        }
        Ok(account.clone())
    }

    async fn adjust_fund_balance(
        &self,
        id: &str,
        adjustment: &BalanceAdjustment,
    ) -> Result<FundAccount> {
        let mut state = self.lock();
        state.record("adjust_fund_balance");
        if state.fail_balance_service {
            return Err(unavailable("balance service"));
        }
        let account = state
            .fund_accounts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| not_found("fund account", id))?;
        match adjustment.operation {
            BalanceOperation::Deduct => account.current_balance -= adjustment.amount,
            BalanceOperation::Credit => account.current_balance += adjustment.amount,
        }
        Ok(account.clone())
    }

    async fn list_recipient_accounts_active(&self) -> Result<Vec<Value>> {
        let mut state = self.lock();
        state.record("list_recipient_accounts");
        Ok(state.recipient_accounts.clone())
    }
}
