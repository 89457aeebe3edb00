use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

use super::error::NotificationError;

#[async_trait]
pub trait SmsProvider: Send + Sync {
    async fn send_sms(&self, phone_number: &str, text: &str) -> Result<(), NotificationError>;
}

#[derive(Clone, Default)]
pub struct SmsGatewayConfig {
    pub url: String,
    pub api_key: String,
    pub sender: String,
}

impl std::fmt::Debug for SmsGatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmsGatewayConfig")
            .field("url", &self.url)
            .field("sender", &self.sender)
            .finish_non_exhaustive()
    }
}

/// Sends SMS through an HTTP gateway that accepts `{to, text, sender}` JSON.
pub struct HttpSmsProvider {
    config: SmsGatewayConfig,
    client: Client,
}

#[derive(Debug, Serialize)]
struct GatewayRequest<'a> {
    to: &'a str,
    text: &'a str,
    sender: &'a str,
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    #[serde(default)]
    id: Option<String>,
}

impl HttpSmsProvider {
    pub fn new(config: SmsGatewayConfig) -> Result<Self, NotificationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotificationError::Sms(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }
}

/// Keep digits and a leading `+`.
pub fn normalize_phone(phone: &str) -> String {
    phone
        .chars()
        .enumerate()
        .filter(|(i, c)| c.is_ascii_digit() || (*i == 0 && *c == '+'))
        .map(|(_, c)| c)
        .collect()
}

#[async_trait]
impl SmsProvider for HttpSmsProvider {
    async fn send_sms(&self, phone_number: &str, text: &str) -> Result<(), NotificationError> {
        let to = normalize_phone(phone_number);
        if to.is_empty() {
            return Err(NotificationError::Sms("Phone number is empty".to_string()));
        }

        let response = self
            .client
            .post(&self.config.url)
            .bearer_auth(&self.config.api_key)
            .json(&GatewayRequest {
                to: &to,
                text,
                sender: &self.config.sender,
            })
            .send()
            .await
            .map_err(|e| NotificationError::Sms(format!("Failed to reach SMS gateway: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::Sms(format!(
                "SMS gateway returned {}: {}",
                status, body
            )));
        }

        let body: GatewayResponse = response.json().await.unwrap_or(GatewayResponse { id: None });
        tracing::info!(to = %to, message_id = ?body.id, "SMS sent");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentSms {
    pub phone_number: String,
    pub text: String,
}

/// Records messages instead of sending them.
#[derive(Default)]
pub struct MockSmsProvider {
    sent: Mutex<Vec<SentSms>>,
}

impl MockSmsProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentSms> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SmsProvider for MockSmsProvider {
    async fn send_sms(&self, phone_number: &str, text: &str) -> Result<(), NotificationError> {
        self.sent
            .lock()
            .map_err(|e| NotificationError::Sms(format!("Mock SMS mutex poisoned: {}", e)))?
            .push(SentSms {
                phone_number: phone_number.to_string(),
                text: text.to_string(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("+61 450-123-456"), "+61450123456");
        assert_eq!(normalize_phone("0450+123"), "0450123");
    }

    #[tokio::test]
    async fn test_mock_records_messages() {
        let sms = MockSmsProvider::new();
        sms.send_sms("+61450123456", "hello").await.unwrap();
        assert_eq!(
            sms.sent(),
            vec![SentSms {
                phone_number: "+61450123456".to_string(),
                text: "hello".to_string()
            }]
        );
    }
}
