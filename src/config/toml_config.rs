use crate::config::units::{MemoryLimit, Seconds};
use crate::utils::error::{Result, SendoutError};
use crate::utils::validation::{self, Validate};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignConfig {
    /// Pro edition: automated/recurring sendouts and segments.
    pub pro: bool,
    /// Save messages to local files instead of sending them.
    pub test_mode: bool,
    pub batch: BatchConfig,
    pub pending_contacts: PendingContactsConfig,
    pub senders: SendersConfig,
    pub transport: TransportConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub memory_threshold: f64,
    pub time_threshold: f64,
    pub memory_limit: MemoryLimit,
    /// Seconds; 0 for unlimited.
    pub time_limit: Seconds,
    pub max_retry_attempts: u32,
    pub batch_job_delay: Seconds,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            memory_threshold: 0.8,
            time_threshold: 0.8,
            memory_limit: MemoryLimit::default(),
            time_limit: Seconds(300),
            max_retry_attempts: 10,
            batch_job_delay: Seconds(10),
        }
    }
}

impl BatchConfig {
    pub fn time_limit(&self) -> Option<Duration> {
        (!self.time_limit.is_zero()).then(|| self.time_limit.as_duration())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PendingContactsConfig {
    pub max_pending_contacts: usize,
    /// 0 disables purging.
    pub purge_pending_contacts_duration: Seconds,
}

impl Default for PendingContactsConfig {
    fn default() -> Self {
        Self {
            max_pending_contacts: 5,
            purge_pending_contacts_duration: Seconds(0),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SendersConfig {
    /// Allowed `[name, email]` pairs. Empty allows any sender.
    pub from_names_emails: Vec<(String, String)>,
}

impl SendersConfig {
    pub fn allows(&self, name: &str, email: &str) -> bool {
        self.from_names_emails.is_empty()
            || self
                .from_names_emails
                .iter()
                .any(|(n, e)| n == name && e.eq_ignore_ascii_case(email))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Log,
    File,
    Http,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub output_path: String,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Log,
            output_path: "./storage/mail".to_string(),
            endpoint: None,
            api_key: None,
            timeout_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
    pub level: Option<String>,
}

impl CampaignConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(SendoutError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed_content = Self::substitute_env_vars(content)?;

        toml::from_str(&processed_content).map_err(|e| SendoutError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// 替換環境變數 (例如 ${MAILER_API_KEY})
    fn substitute_env_vars(content: &str) -> Result<String> {
        use regex::Regex;
        let re = Regex::new(r"\$\{([^}]+)\}").map_err(|e| SendoutError::ConfigValidationError {
            field: "environment".to_string(),
            message: e.to_string(),
        })?;

        let result = re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
        });

        Ok(result.to_string())
    }

    /// Test mode always writes to files, whatever transport is configured.
    pub fn effective_transport(&self) -> TransportKind {
        if self.test_mode {
            TransportKind::File
        } else {
            self.transport.kind
        }
    }

    /// 驗證配置的合理性
    pub fn validate_config(&self) -> Result<()> {
        let batch = &self.batch;
        validation::validate_positive_number("batch.max_batch_size", batch.max_batch_size, 1)?;
        validation::validate_range("batch.memory_threshold", batch.memory_threshold, 0.01, 1.0)?;
        validation::validate_range("batch.time_threshold", batch.time_threshold, 0.01, 1.0)?;
        validation::validate_positive_number(
            "pending_contacts.max_pending_contacts",
            self.pending_contacts.max_pending_contacts,
            1,
        )?;

        for (name, email) in &self.senders.from_names_emails {
            validation::validate_required_string("senders.from_names_emails", name)?;
            validation::validate_email("senders.from_names_emails", email)?;
        }

        match self.effective_transport() {
            TransportKind::Log => {}
            TransportKind::File => {
                validation::validate_path("transport.output_path", &self.transport.output_path)?;
            }
            TransportKind::Http => {
                let endpoint =
                    validation::validate_required_field("transport.endpoint", &self.transport.endpoint)?;
                validation::validate_url("transport.endpoint", endpoint)?;
            }
        }

        Ok(())
    }
}

impl Validate for CampaignConfig {
    fn validate(&self) -> Result<()> {
        self.validate_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_when_empty() {
        let config = CampaignConfig::from_toml_str("").unwrap();

        assert_eq!(config.batch.max_batch_size, 1000);
        assert_eq!(config.batch.memory_threshold, 0.8);
        assert_eq!(config.batch.memory_limit.bytes(), Some(1024 * 1024 * 1024));
        assert_eq!(config.batch.time_limit(), Some(Duration::from_secs(300)));
        assert_eq!(config.batch.max_retry_attempts, 10);
        assert_eq!(config.batch.batch_job_delay, Seconds(10));
        assert_eq!(config.pending_contacts.max_pending_contacts, 5);
        assert!(config.pending_contacts.purge_pending_contacts_duration.is_zero());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml_content = r#"
pro = true

[batch]
max_batch_size = 250
memory_threshold = 0.5
time_threshold = 0.9
memory_limit = "512M"
time_limit = 0
max_retry_attempts = 3
batch_job_delay = "1m"

[pending_contacts]
max_pending_contacts = 2
purge_pending_contacts_duration = "7d"

[senders]
from_names_emails = [["Zorro", "legend@zorro.com"], ["Don Diego", "dondiego@zorro.com"]]

[transport]
kind = "http"
endpoint = "https://mail.example.com/send"
"#;

        let config = CampaignConfig::from_toml_str(toml_content).unwrap();

        assert!(config.pro);
        assert_eq!(config.batch.max_batch_size, 250);
        assert_eq!(config.batch.memory_limit.bytes(), Some(512 * 1024 * 1024));
        assert_eq!(config.batch.time_limit(), None);
        assert_eq!(config.batch.batch_job_delay, Seconds(60));
        assert_eq!(config.pending_contacts.purge_pending_contacts_duration, Seconds(604_800));
        assert!(config.senders.allows("Zorro", "LEGEND@zorro.com"));
        assert!(!config.senders.allows("Zorro", "other@zorro.com"));
        assert_eq!(config.effective_transport(), TransportKind::Http);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("TEST_MAILER_ENDPOINT", "https://test.mailer.com/send");

        let toml_content = r#"
[transport]
kind = "http"
endpoint = "${TEST_MAILER_ENDPOINT}"
"#;

        let config = CampaignConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(
            config.transport.endpoint.as_deref(),
            Some("https://test.mailer.com/send")
        );

        std::env::remove_var("TEST_MAILER_ENDPOINT");
    }

    #[test]
    fn test_config_validation() {
        let bad_threshold = CampaignConfig::from_toml_str("[batch]\nmemory_threshold = 1.5").unwrap();
        assert!(bad_threshold.validate().is_err());

        let missing_endpoint = CampaignConfig::from_toml_str("[transport]\nkind = \"http\"").unwrap();
        assert!(missing_endpoint.validate().is_err());

        let bad_sender =
            CampaignConfig::from_toml_str("[senders]\nfrom_names_emails = [[\"Zorro\", \"zorro\"]]")
                .unwrap();
        assert!(bad_sender.validate().is_err());
    }

    #[test]
    fn test_test_mode_forces_file_transport() {
        let config = CampaignConfig::from_toml_str("test_mode = true\n[transport]\nkind = \"http\"").unwrap();
        assert_eq!(config.effective_transport(), TransportKind::File);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"[batch]\nmax_batch_size = 10\n")
            .unwrap();

        let config = CampaignConfig::from_file(temp_file.path()).unwrap();
        assert_eq!(config.batch.max_batch_size, 10);
    }
}
