//! HTTP implementation of [`BackendApi`] over reqwest.

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use async_trait::async_trait;

use crate::config::ApiConfig;
use crate::model::{
    Cheque, ChequeDraft, Disbursement, FundAccount, OverrideDraft, OverrideRequest, Receipt,
    ReceiptDraft, ReviewResponse, Transaction,
};

use super::{
    as_collection, flatten_field_errors, ApiError, BackendApi, BalanceAdjustment, Result,
    ReviewSubmission,
};

/// Backend client over HTTP.
pub struct HttpBackend {
    client: Client,
    base_url: String,
    token: String,
    query_retries: usize,
}

impl HttpBackend {
    /// Build a client from configuration.
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            query_retries: config.query_retries,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .bearer_auth(&self.token)
    }

    /// Backoff for query retries.
    fn query_backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(self.query_retries)
            .with_jitter()
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<Value> {
        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()));
        }

        if status == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            let message = serde_json::from_str::<Value>(&text)
                .map(|body| flatten_field_errors(&body))
                .unwrap_or(text);
            warn!(message = %message, "Server rejected request");
            return Err(ApiError::Validation(message));
        }

        Err(ApiError::Status {
            status: status.as_u16(),
            message: text.chars().take(200).collect(),
        })
    }

    /// GET with bounded transparent retry on transport errors.
    async fn get_json(&self, path: &str) -> Result<Value> {
        let attempt = || async { self.execute(self.request(Method::GET, path)).await };
        attempt
            .retry(self.query_backoff())
            .when(ApiError::is_retryable)
            .notify(|err, delay| {
                debug!(error = %err, delay = ?delay, "Retrying query");
            })
            .await
    }

    /// Mutation: single attempt, never retried.
    async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<Value> {
        self.execute(self.request(method, path).json(body)).await
    }

    async fn get_collection(&self, path: &str) -> Result<Vec<Value>> {
        as_collection(self.get_json(path).await?)
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn list_transactions(&self) -> Result<Vec<Value>> {
        self.get_collection("transactions").await
    }

    async fn fetch_transaction(&self, id: &str) -> Result<Transaction> {
        decode(self.get_json(&format!("transactions/{id}")).await?)
    }

    async fn create_transaction(&self, body: &Value) -> Result<Transaction> {
        decode(self.send_json(Method::POST, "transactions", body).await?)
    }

    async fn void_transaction(&self, id: &str) -> Result<()> {
        self.execute(self.request(Method::DELETE, &format!("transactions/{id}")))
            .await?;
        Ok(())
    }

    async fn create_override_request(&self, draft: &OverrideDraft) -> Result<OverrideRequest> {
        decode(
            self.send_json(Method::POST, "transactions/override", draft)
                .await?,
        )
    }

    async fn list_override_requests(&self) -> Result<Vec<Value>> {
        self.get_collection("override_requests").await
    }

    async fn my_override_requests(&self) -> Result<Vec<Value>> {
        self.get_collection("override_requests/my_requests").await
    }

    async fn review_override_request(
        &self,
        id: &str,
        review: &ReviewSubmission,
    ) -> Result<ReviewResponse> {
        decode(
            self.send_json(
                Method::PUT,
                &format!("override_requests/{id}/review"),
                review,
            )
            .await?,
        )
    }

    async fn list_disbursements(&self) -> Result<Vec<Value>> {
        self.get_collection("disbursements").await
    }

    async fn create_disbursement(&self, body: &Value) -> Result<Disbursement> {
        decode(self.send_json(Method::POST, "disbursements", body).await?)
    }

    async fn list_cheques(&self) -> Result<Vec<Value>> {
        self.get_collection("cheques").await
    }

    async fn create_cheque(&self, draft: &ChequeDraft) -> Result<Cheque> {
        decode(self.send_json(Method::POST, "cheques", draft).await?)
    }

    async fn update_cheque(&self, id: &str, patch: &Value) -> Result<Cheque> {
        decode(
            self.send_json(Method::PUT, &format!("cheques/{id}"), patch)
                .await?,
        )
    }

    async fn list_receipts(&self) -> Result<Vec<Value>> {
        self.get_collection("receipts").await
    }

    async fn create_receipt(&self, draft: &ReceiptDraft) -> Result<Receipt> {
        decode(self.send_json(Method::POST, "receipts", draft).await?)
    }

    async fn delete_receipt(&self, id: &str) -> Result<()> {
        self.execute(self.request(Method::DELETE, &format!("receipts/{id}")))
            .await?;
        Ok(())
    }

    async fn list_fund_accounts(&self) -> Result<Vec<Value>> {
        self.get_collection("fund-accounts").await
    }

    async fn fetch_fund_account(&self, id: &str) -> Result<FundAccount> {
        decode(self.get_json(&format!("fund-accounts/{id}")).await?)
    }

    async fn update_fund_account(&self, id: &str, patch: &Value) -> Result<FundAccount> {
        decode(
            self.send_json(Method::PUT, &format!("fund-accounts/{id}"), patch)
                .await?,
        )
    }

    async fn adjust_fund_balance(
        &self,
        id: &str,
        adjustment: &BalanceAdjustment,
    ) -> Result<FundAccount> {
        decode(
            self.send_json(
                Method::PUT,
                &format!("fund-accounts/{id}/balance"),
                adjustment,
            )
            .await?,
        )
    }

    async fn list_recipient_accounts_active(&self) -> Result<Vec<Value>> {
        self.get_collection("recipient-accounts?status=active").await
    }
}
