// Notification sink
//
// Email: Resend HTTP API. The settlement core treats notification
// delivery as fire-and-forget: a failed send is logged, never blocks
// settlement, and is deduplicated across ticks by the escrow flags.

pub mod templates;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AppError, AppResult};

/// Notification sink trait - side-effect only, no return value consumed
/// by the settlement core
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> AppResult<()>;
}

/// Resend email client
pub struct EmailNotifier {
    api_key: String,
    from_email: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ResendEmailRequest {
    to: String,
    from: String,
    subject: String,
    html: String,
}

#[derive(Debug, Deserialize)]
struct ResendEmailResponse {
    id: String,
}

impl EmailNotifier {
    pub fn new(api_key: String, from_email: String) -> Self {
        Self {
            api_key,
            from_email,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> AppResult<()> {
        let request = ResendEmailRequest {
            to: recipient.to_string(),
            from: self.from_email.clone(),
            subject: subject.to_string(),
            html: body.to_string(),
        };

        let response = self
            .client
            .post("https://api.resend.com/emails")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::ExternalError(format!(
                "Resend API error: {}",
                error_text
            )));
        }

        let result: ResendEmailResponse = response.json().await?;
        info!("Email sent to {}: {}", recipient, result.id);
        Ok(())
    }
}
