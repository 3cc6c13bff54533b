//! Configuration for Fieldtrace
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use uuid::Uuid;

/// Fieldtrace - provenance reconciliation gateway for produce tracking
#[derive(Parser, Debug, Clone)]
#[command(name = "fieldtrace")]
#[command(about = "Provenance gateway fronting ledger, content store, records and telemetry")]
pub struct Args {
    /// Unique node identifier for this gateway instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Lifecycle ledger node WebSocket URL
    #[arg(long, env = "LEDGER_URL", default_value = "ws://localhost:4450")]
    pub ledger_url: String,

    /// Content store backend base URL (e.g. "http://localhost:8091")
    /// When unset in dev mode, an in-memory store is used instead.
    #[arg(long, env = "STORAGE_URL")]
    pub storage_url: Option<String>,

    /// Public gateway base URL used to build media locators
    /// (e.g. "https://trace.example.com")
    #[arg(long, env = "GATEWAY_URL", default_value = "http://localhost:8080")]
    pub gateway_url: String,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "fieldtrace")]
    pub mongodb_db: String,

    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,

    /// Telemetry subject prefix; pings arrive on "{prefix}.{tag}"
    #[arg(long, env = "TELEMETRY_SUBJECT_PREFIX", default_value = "rfid.pings")]
    pub telemetry_subject_prefix: String,

    /// Freshness classifier command, space-separated
    /// (e.g. "python3 /opt/fieldtrace/detect_freshness.py").
    /// Reads image bytes on stdin, writes one JSON object to stdout.
    #[arg(long, env = "CLASSIFIER_CMD")]
    pub classifier_cmd: Option<String>,

    /// Freshness classifier timeout in milliseconds
    #[arg(long, env = "CLASSIFIER_TIMEOUT_MS", default_value = "3000")]
    pub classifier_timeout_ms: u64,

    /// Enable development mode (in-memory fallbacks for missing collaborators)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Request timeout for ledger and content store calls, in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "30000")]
    pub request_timeout_ms: u64,
}

/// NATS connection configuration
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,
}

impl Args {
    /// Split the classifier command into program + args
    pub fn classifier_command(&self) -> Option<Vec<String>> {
        let cmd = self.classifier_cmd.as_deref()?.trim();
        if cmd.is_empty() {
            return None;
        }
        Some(cmd.split_whitespace().map(|s| s.to_string()).collect())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode && self.storage_url.is_none() {
            return Err("STORAGE_URL is required in production mode".to_string());
        }

        if self.request_timeout_ms == 0 {
            return Err("REQUEST_TIMEOUT_MS must be greater than zero".to_string());
        }

        if self.classifier_timeout_ms == 0 {
            return Err("CLASSIFIER_TIMEOUT_MS must be greater than zero".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args::parse_from(["fieldtrace", "--dev-mode"])
    }

    #[test]
    fn test_classifier_command_split() {
        let mut args = base_args();
        args.classifier_cmd = Some("python3 detect_freshness.py".into());
        assert_eq!(
            args.classifier_command(),
            Some(vec!["python3".to_string(), "detect_freshness.py".to_string()])
        );
    }

    #[test]
    fn test_classifier_command_empty() {
        let mut args = base_args();
        args.classifier_cmd = Some("   ".into());
        assert_eq!(args.classifier_command(), None);
    }

    #[test]
    fn test_validate_requires_storage_in_production() {
        let mut args = base_args();
        args.dev_mode = false;
        args.storage_url = None;
        assert!(args.validate().is_err());

        args.storage_url = Some("http://localhost:8091".into());
        assert!(args.validate().is_ok());
    }
}
