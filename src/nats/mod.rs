//! NATS client wrapper
//!
//! Connection management for the telemetry transport. Reconnection after the
//! initial successful connect is handled by the async-nats client itself and
//! is transparent to subscribers.

use async_nats::{Client, ConnectOptions};
use std::time::Duration;
use tracing::info;

use crate::config::NatsArgs;
use crate::types::TraceError;

/// Default ping interval for keep-alive
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);

/// NATS client wrapper
#[derive(Clone)]
pub struct NatsClient {
    /// Underlying NATS client
    client: Client,
    /// Client name for logging
    name: String,
}

impl NatsClient {
    /// Create a new NATS client
    pub async fn new(args: &NatsArgs, name: &str) -> Result<Self, TraceError> {
        info!("Connecting to NATS at {}", args.nats_url);

        // Fail fast if NATS isn't available at startup; reconnection still
        // works after the initial successful connection
        let mut options = ConnectOptions::new()
            .name(name)
            .ping_interval(DEFAULT_PING_INTERVAL)
            .connection_timeout(Duration::from_secs(5));

        if let (Some(user), Some(pass)) = (&args.nats_user, &args.nats_password) {
            options = options.user_and_password(user.clone(), pass.clone());
        }

        let client = options
            .connect(&args.nats_url)
            .await
            .map_err(|e| TraceError::Internal(format!("NATS connect failed: {}", e)))?;

        info!("Connected to NATS at {}", args.nats_url);

        Ok(Self {
            client,
            name: name.to_string(),
        })
    }

    /// Subscribe to a subject (supports wildcards)
    pub async fn subscribe(&self, subject: &str) -> Result<async_nats::Subscriber, TraceError> {
        self.client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| TraceError::Internal(format!("NATS subscribe failed: {}", e)))
    }

    /// Get the client name
    pub fn name(&self) -> &str {
        &self.name
    }
}
