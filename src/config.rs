//! Runtime configuration for the `gateway-cr` binary.
//!
//! Every option can be given as a flag or through the environment.

use crate::services::automation::{AutomationConfig, DEFAULT_QUEUE_SIZE};
use crate::services::webhook::WebhookConfig;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "gateway-cr",
    version,
    about = "Change request approval and execution service for shared gateway configuration"
)]
pub struct Config {
    /// SQLite database file
    #[arg(long, env = "GATEWAY_CR_DATABASE_PATH", default_value = "gateway-cr.db")]
    pub database_path: PathBuf,

    #[arg(long, env = "SERVER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "SERVER_PORT", default_value_t = 8080)]
    pub port: u16,

    /// CI/CD endpoint notified when a change request enters execution
    #[arg(long, env = "WEBHOOK_URL", default_value = "")]
    pub webhook_url: String,

    #[arg(long, env = "WEBHOOK_TIMEOUT_SECS", default_value_t = 10)]
    pub webhook_timeout_secs: u64,

    #[arg(long, env = "AUTOMATION_QUEUE_SIZE", default_value_t = DEFAULT_QUEUE_SIZE)]
    pub automation_queue_size: usize,

    /// Username granted Super Manager at startup, created if missing
    #[arg(long, env = "GATEWAY_CR_BOOTSTRAP_ADMIN")]
    pub bootstrap_admin: Option<String>,

    #[arg(
        long,
        env = "GATEWAY_CR_BOOTSTRAP_ADMIN_EMAIL",
        requires = "bootstrap_admin"
    )]
    pub bootstrap_admin_email: Option<String>,
}

impl Config {
    /// Socket address to bind, from `host` and `port`.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    /// Username and email of the Super Manager to seed, if any.
    pub fn bootstrap(&self) -> Option<(String, String)> {
        let username = self.bootstrap_admin.clone()?;
        let email = self
            .bootstrap_admin_email
            .clone()
            .unwrap_or_else(|| format!("{}@localhost", username));
        Some((username, email))
    }

    pub fn automation(&self) -> AutomationConfig {
        AutomationConfig {
            webhook: WebhookConfig {
                url: self.webhook_url.clone(),
                timeout_secs: self.webhook_timeout_secs,
            },
            queue_size: self.automation_queue_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["gateway-cr"]).unwrap();
        assert_eq!(config.database_path, PathBuf::from("gateway-cr.db"));
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind_addr().unwrap().to_string(), "0.0.0.0:8080");

        let automation = config.automation();
        assert!(!automation.webhook.is_enabled());
        assert_eq!(automation.webhook.timeout_secs, 10);
        assert_eq!(automation.queue_size, DEFAULT_QUEUE_SIZE);
        assert!(config.bootstrap().is_none());
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = Config::try_parse_from([
            "gateway-cr",
            "--host",
            "127.0.0.1",
            "--port",
            "9090",
            "--webhook-url",
            "http://ci.internal/hooks/cr",
            "--webhook-timeout-secs",
            "3",
            "--bootstrap-admin",
            "root",
        ])
        .unwrap();

        assert_eq!(config.bind_addr().unwrap().to_string(), "127.0.0.1:9090");
        assert_eq!(
            config.bootstrap(),
            Some(("root".to_string(), "root@localhost".to_string()))
        );

        let webhook = config.automation().webhook;
        assert!(webhook.is_enabled());
        assert_eq!(webhook.timeout_secs, 3);
    }

    #[test]
    fn test_bootstrap_email_needs_admin() {
        let config = Config::try_parse_from([
            "gateway-cr",
            "--bootstrap-admin",
            "root",
            "--bootstrap-admin-email",
            "ops@example.com",
        ])
        .unwrap();
        assert_eq!(
            config.bootstrap(),
            Some(("root".to_string(), "ops@example.com".to_string()))
        );

        assert!(
            Config::try_parse_from(["gateway-cr", "--bootstrap-admin-email", "ops@example.com"])
                .is_err()
        );
    }
}
