//! YooKassa REST adapter (`/v3/payments`).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, error};

use crate::app::ports::{
    CreatePaymentRequest, CreatedPayment, GatewayPaymentStatus, PaymentGatewayPort, VerifiedPayment,
};
use crate::config::PaymentsConfig;
use crate::error::{CifraError, Result};

#[derive(Debug, Deserialize)]
struct AmountBody {
    value: String,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct ConfirmationBody {
    confirmation_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentBody {
    id: String,
    status: GatewayPaymentStatus,
    amount: AmountBody,
    confirmation: Option<ConfirmationBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    description: Option<String>,
    code: Option<String>,
}

fn gateway_error(message: impl Into<String>) -> CifraError {
    CifraError::Gateway {
        message: message.into(),
    }
}

/// `"1999.00"` -> `1999`. Amounts with a non-zero fractional part are rejected since the
/// ledger only holds whole currency units.
pub fn parse_amount(value: &str) -> Result<i64> {
    let (whole, fraction) = value.split_once('.').unwrap_or((value, ""));
    if !fraction.chars().all(|c| c == '0') {
        return Err(gateway_error(format!("fractional payment amount {value} is not supported")));
    }
    whole
        .parse::<i64>()
        .map_err(|_| gateway_error(format!("malformed payment amount {value:?}")))
}

pub fn format_amount(amount: i64) -> String {
    format!("{amount}.00")
}

pub struct YooKassaGateway {
    client: reqwest::Client,
    api_base: String,
    shop_id: String,
    secret_key: String,
}

impl YooKassaGateway {
    pub fn new(config: &PaymentsConfig) -> Result<Self> {
        let shop_id = config
            .shop_id
            .clone()
            .ok_or_else(|| CifraError::Config("YOOKASSA_SHOP_ID is not set".to_string()))?;
        let secret_key = config
            .secret_key
            .clone()
            .ok_or_else(|| CifraError::Config("YOOKASSA_SECRET_KEY is not set".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            shop_id,
            secret_key,
        })
    }

    async fn read_payment(&self, response: reqwest::Response) -> Result<(PaymentBody, serde_json::Value)> {
        let status = response.status();
        let raw: serde_json::Value = response.json().await?;
        if !status.is_success() {
            let body: ErrorBody = serde_json::from_value(raw.clone()).unwrap_or(ErrorBody {
                description: None,
                code: None,
            });
            error!(status = %status, code = ?body.code, "YooKassa request rejected");
            return Err(gateway_error(format!(
                "YooKassa returned {}: {}",
                status,
                body.description.unwrap_or_else(|| "no description".to_string())
            )));
        }
        let payment: PaymentBody = serde_json::from_value(raw.clone())?;
        Ok((payment, raw))
    }
}

#[async_trait]
impl PaymentGatewayPort for YooKassaGateway {
    async fn create_payment(&self, request: &CreatePaymentRequest) -> Result<CreatedPayment> {
        let body = json!({
            "amount": { "value": format_amount(request.amount), "currency": request.currency },
            "capture": true,
            "confirmation": { "type": "redirect", "return_url": request.return_url },
            "description": request.description,
            "metadata": {
                "productId": request.product_id.to_string(),
                "sellerId": request.seller_id.to_string(),
                "customerEmail": request.buyer_email,
                "promoCode": request.promo_code,
            },
        });

        let response = self
            .client
            .post(format!("{}/payments", self.api_base))
            .basic_auth(&self.shop_id, Some(&self.secret_key))
            .header("Idempotence-Key", &request.idempotence_key)
            .json(&body)
            .send()
            .await?;
        let (payment, raw) = self.read_payment(response).await?;

        let confirmation_url = payment
            .confirmation
            .and_then(|c| c.confirmation_url)
            .ok_or_else(|| gateway_error(format!("payment {} has no confirmation url", payment.id)))?;
        debug!(payment_id = %payment.id, "YooKassa payment created");
        Ok(CreatedPayment {
            id: payment.id,
            confirmation_url,
            raw,
        })
    }

    async fn get_payment(&self, payment_id: &str) -> Result<VerifiedPayment> {
        let response = self
            .client
            .get(format!("{}/payments/{}", self.api_base, payment_id))
            .basic_auth(&self.shop_id, Some(&self.secret_key))
            .send()
            .await?;
        let (payment, raw) = self.read_payment(response).await?;
        if payment.id != payment_id {
            return Err(gateway_error(format!(
                "asked for payment {payment_id}, gateway answered with {}",
                payment.id
            )));
        }
        Ok(VerifiedPayment {
            amount: parse_amount(&payment.amount.value)?,
            currency: payment.amount.currency,
            id: payment.id,
            status: payment.status,
            raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_parsing() {
        assert_eq!(parse_amount("1999.00").unwrap(), 1999);
        assert_eq!(parse_amount("99").unwrap(), 99);
        assert_eq!(parse_amount("250.0").unwrap(), 250);
        assert!(parse_amount("1999.50").is_err());
        assert!(parse_amount("abc").is_err());
        assert_eq!(format_amount(1999), "1999.00");
    }

    #[test]
    fn test_payment_body_decoding() {
        let raw = json!({
            "id": "2d9f6e4a-000f-5000-9000-1b0c5d3f3c0e",
            "status": "waiting_for_capture",
            "paid": false,
            "amount": { "value": "1999.00", "currency": "RUB" },
            "confirmation": { "type": "redirect", "confirmation_url": "https://yoomoney.ru/checkout?orderId=1" },
            "metadata": {}
        });
        let body: PaymentBody = serde_json::from_value(raw).unwrap();
        assert_eq!(body.status, GatewayPaymentStatus::WaitingForCapture);
        assert_eq!(body.amount.currency, "RUB");
        assert!(body.confirmation.unwrap().confirmation_url.is_some());

        let odd: PaymentBody = serde_json::from_value(json!({
            "id": "p1",
            "status": "refunded_somehow",
            "amount": { "value": "10.00", "currency": "RUB" }
        }))
        .unwrap();
        assert_eq!(odd.status, GatewayPaymentStatus::Unknown);
    }

    #[test]
    fn test_requires_credentials() {
        assert!(YooKassaGateway::new(&PaymentsConfig::default()).is_err());
        let config = PaymentsConfig {
            shop_id: Some("100500".to_string()),
            secret_key: Some("test_key".to_string()),
            ..PaymentsConfig::default()
        };
        assert!(YooKassaGateway::new(&config).is_ok());
    }
}
