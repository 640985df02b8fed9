use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use crate::app::ports::MailerPort;
use crate::config::EmailConfig;
use crate::error::{CifraError, Result};

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: Option<String>,
}

/// Transactional mail through the Resend HTTP API.
pub struct ResendMailer {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    from: String,
}

impl ResendMailer {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| CifraError::Config("RESEND_API_KEY is not set".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
            from: format!("{} <{}>", config.sender_name, config.sender_email),
        })
    }

    pub fn from_address(&self) -> &str {
        &self.from
    }
}

#[async_trait]
impl MailerPort for ResendMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/emails", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&json!({
                "from": self.from,
                "to": [to],
                "subject": subject,
                "html": html,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Resend rejected message: {}", body);
            return Err(CifraError::Email {
                message: format!("Resend returned {status}: {body}"),
            });
        }
        let sent: SendResponse = response.json().await?;
        debug!(email_id = ?sent.id, "Email accepted by Resend");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_address() {
        assert!(ResendMailer::new(&EmailConfig::default()).is_err());
        let mailer = ResendMailer::new(&EmailConfig {
            api_key: Some("re_test".to_string()),
            ..EmailConfig::default()
        })
        .unwrap();
        assert_eq!(mailer.from_address(), "Cifra <onboarding@resend.dev>");
    }
}
