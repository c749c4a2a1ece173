// HTTP adapter for the payments gateway.
//
// A thin `reqwest`-based client matching the original's `PlategaClient`:
// static header credentials, a create/status pair of endpoints, and
// best-effort JSON parsing of error bodies (raw text surfaces under `_raw`
// when the response isn't valid JSON).

use crate::error::{BrokerError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

pub struct PaymentsClient {
    http: reqwest::Client,
    base_url: String,
    merchant_id: String,
    secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateResult {
    #[serde(rename = "transactionId")]
    pub transaction_id: String,
    pub redirect: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusResult {
    pub status: String,
    #[serde(rename = "paymentDetails")]
    pub payment_details: Option<PaymentDetails>,
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    #[serde(rename = "paymentMethod")]
    payment_method: &'a str,
    #[serde(rename = "paymentDetails")]
    payment_details: PaymentDetails,
    description: &'a str,
    #[serde(rename = "return")]
    return_url: &'a str,
    #[serde(rename = "failedUrl")]
    failed_url: &'a str,
    payload: &'a str,
}

impl PaymentsClient {
    pub fn new(cfg: &crate::config::PaymentsConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            merchant_id: cfg.merchant_id.clone(),
            secret: cfg.secret.clone(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        amount: i64,
        currency: &str,
        description: &str,
        return_url: &str,
        failed_url: &str,
        payload: &str,
    ) -> Result<CreateResult> {
        let body = CreateRequest {
            payment_method: "card",
            payment_details: PaymentDetails { amount, currency: currency.to_string() },
            description,
            return_url,
            failed_url,
            payload,
        };

        let response = self
            .http
            .post(format!("{}/transaction/process", self.base_url))
            .header("X-MerchantId", &self.merchant_id)
            .header("X-Secret", &self.secret)
            .json(&body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        Self::parse_or_error(response).await
    }

    pub async fn status(&self, transaction_id: &str) -> Result<StatusResult> {
        let response = self
            .http
            .get(format!("{}/transaction/{transaction_id}", self.base_url))
            .header("X-MerchantId", &self.merchant_id)
            .header("X-Secret", &self.secret)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        Self::parse_or_error(response).await
    }

    async fn parse_or_error<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let text = response.text().await?;

        if status.as_u16() >= 400 {
            let body: Value = serde_json::from_str(&text).unwrap_or_else(|_| json!({ "_raw": text }));
            return Err(BrokerError::TransientRemote(format!(
                "payments provider returned {status}: {body}"
            )));
        }

        serde_json::from_str(&text).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_serializes_with_provider_field_names() {
        let body = CreateRequest {
            payment_method: "card",
            payment_details: PaymentDetails { amount: 299, currency: "RUB".into() },
            description: "1 month subscription",
            return_url: "https://example.com/ok",
            failed_url: "https://example.com/fail",
            payload: "tg:42",
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["paymentMethod"], "card");
        assert_eq!(value["paymentDetails"]["amount"], 299);
        assert_eq!(value["return"], "https://example.com/ok");
        assert_eq!(value["failedUrl"], "https://example.com/fail");
    }

    #[test]
    fn status_result_parses_provider_camel_case_fields() {
        let raw = r#"{"status":"success","paymentDetails":{"amount":299,"currency":"RUB"},"payload":"tg:42"}"#;
        let parsed: StatusResult = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.status, "success");
        assert_eq!(parsed.payment_details.unwrap().amount, 299);
    }
}
