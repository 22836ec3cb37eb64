use crate::config::toml_config::{CampaignConfig, TransportConfig};
use crate::config::TransportKind;
use crate::domain::model::OutgoingMessage;
use crate::domain::ports::{DispatchError, Mailer};
use crate::utils::error::{Result, SendoutError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use uuid::Uuid;

type DispatchResult = std::result::Result<(), DispatchError>;

/// Logs each message instead of delivering it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &OutgoingMessage) -> DispatchResult {
        tracing::info!(
            sendout = %message.sendout_sid,
            to = %message.to,
            subject = %message.subject,
            "📧 message dispatched (log transport)"
        );
        Ok(())
    }
}

/// Writes every message as a JSON file, one directory per sendout.
#[derive(Debug, Clone)]
pub struct FileMailer {
    base_path: PathBuf,
}

impl FileMailer {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

#[async_trait]
impl Mailer for FileMailer {
    async fn send(&self, message: &OutgoingMessage) -> DispatchResult {
        let dir = self.base_path.join(&message.sendout_sid);
        let path = dir.join(format!(
            "{}-{}.json",
            message.contact_id,
            Uuid::new_v4().simple()
        ));

        let body = serde_json::to_vec_pretty(message)
            .map_err(|e| DispatchError::Rejected(format!("unserializable message: {}", e)))?;

        // A disk problem hits every recipient alike.
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DispatchError::Unavailable(e.to_string()))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| DispatchError::Unavailable(e.to_string()))?;

        tracing::debug!("💾 Saved message to: {}", path.display());
        Ok(())
    }
}

/// Posts each message as JSON to a mail API.
#[derive(Debug, Clone)]
pub struct HttpMailer {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpMailer {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }

    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| SendoutError::MissingConfigError {
                field: "transport.endpoint".to_string(),
            })?;
        Self::new(
            endpoint,
            config.api_key.clone(),
            Duration::from_secs(config.timeout_seconds),
        )
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, message: &OutgoingMessage) -> DispatchResult {
        let mut request = self.client.post(&self.endpoint).json(message);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        tracing::debug!("Making API request to: {}", self.endpoint);
        let response = request
            .send()
            .await
            .map_err(|e| DispatchError::Unavailable(e.to_string()))?;

        let status = response.status();
        tracing::debug!("API response status: {}", status);
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let reason = if body.is_empty() {
            status.to_string()
        } else {
            format!("{}: {}", status, body)
        };

        // Throttling is a transport-wide condition, not a bad recipient.
        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            Err(DispatchError::Rejected(reason))
        } else {
            Err(DispatchError::Unavailable(reason))
        }
    }
}

/// The transport selected by configuration.
#[derive(Debug, Clone)]
pub enum ConfiguredMailer {
    Log(LogMailer),
    File(FileMailer),
    Http(HttpMailer),
}

impl ConfiguredMailer {
    pub fn from_config(config: &CampaignConfig) -> Result<Self> {
        let mailer = match config.effective_transport() {
            TransportKind::Log => ConfiguredMailer::Log(LogMailer),
            TransportKind::File => {
                ConfiguredMailer::File(FileMailer::new(&config.transport.output_path))
            }
            TransportKind::Http => ConfiguredMailer::Http(HttpMailer::from_config(&config.transport)?),
        };
        Ok(mailer)
    }
}

#[async_trait]
impl Mailer for ConfiguredMailer {
    async fn send(&self, message: &OutgoingMessage) -> DispatchResult {
        match self {
            ConfiguredMailer::Log(mailer) => mailer.send(message).await,
            ConfiguredMailer::File(mailer) => mailer.send(message).await,
            ConfiguredMailer::Http(mailer) => mailer.send(message).await,
        }
    }
}

/// Keeps messages in memory. Addresses can be made to bounce and the whole
/// transport can be switched off, which is what embedders need for dry runs.
#[derive(Debug, Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<OutgoingMessage>>,
    rejected: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(&self, email: impl Into<String>) {
        self.rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(email.into().to_lowercase());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, message: &OutgoingMessage) -> DispatchResult {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DispatchError::Unavailable("transport offline".to_string()));
        }
        let bounced = self
            .rejected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&message.to.to_lowercase());
        if bounced {
            return Err(DispatchError::Rejected(format!("{} rejected", message.to)));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }
}
