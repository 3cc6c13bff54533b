//! Freshness classifier wrapper
//!
//! Invokes an external image classifier as a subprocess: image bytes on
//! stdin, one JSON object on stdout. The classifier is untrusted for
//! availability, and freshness is advisory: every failure mode (missing
//! binary, timeout, crash, garbage output) degrades to a fixed default
//! instead of blocking the write path.
//!
//! Classifier health is checked once at startup via `probe()`; a missing
//! binary flips the service into degraded mode with a single warning, and no
//! per-request re-probing happens after that.

use serde::Deserialize;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Freshness assessment for one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreshnessReport {
    /// 0-100
    pub score: u8,
    pub is_fresh: bool,
    pub label: String,
}

impl Default for FreshnessReport {
    fn default() -> Self {
        Self {
            score: 100,
            is_fresh: true,
            label: "Unknown".to_string(),
        }
    }
}

/// Raw classifier stdout shape
#[derive(Deserialize)]
struct ClassifierOutput {
    confidence: Option<f64>,
    is_fresh: Option<bool>,
    predicted_label: Option<String>,
}

/// Classifier invocation wrapper
pub struct FreshnessInference {
    /// Program + arguments, resolved once from configuration
    command: Option<Vec<String>>,
    timeout: Duration,
    degraded: AtomicBool,
}

impl FreshnessInference {
    /// Create a wrapper for the configured classifier command.
    ///
    /// `None` means no classifier is configured; the wrapper starts degraded
    /// and every assessment returns the default.
    pub fn new(command: Option<Vec<String>>, timeout: Duration) -> Self {
        let command = command.filter(|c| !c.is_empty());
        Self {
            degraded: AtomicBool::new(command.is_none()),
            command,
            timeout,
        }
    }

    /// Whether the wrapper is serving defaults without invoking the classifier
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Startup health check. Spawns the classifier once to confirm the binary
    /// exists; a spawn failure logs one degraded-mode warning and disables
    /// per-request invocation.
    pub async fn probe(&self) {
        let Some(command) = &self.command else {
            warn!("No freshness classifier configured; assessments will use the default result");
            return;
        };

        let spawned = Command::new(&command[0])
            .args(&command[1..])
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(mut child) => {
                // Exit status doesn't matter for the probe; only spawnability
                let _ = tokio::time::timeout(self.timeout, child.wait()).await;
                debug!(command = ?command, "freshness classifier probe succeeded");
            }
            Err(e) => {
                self.degraded.store(true, Ordering::Relaxed);
                warn!(
                    command = ?command,
                    "Freshness classifier unavailable, degrading to default results: {}", e
                );
            }
        }
    }

    /// Assess one image. Never fails: any classifier problem yields the
    /// default report.
    pub async fn assess(&self, image: &[u8]) -> FreshnessReport {
        if self.is_degraded() {
            return FreshnessReport::default();
        }
        let Some(command) = &self.command else {
            return FreshnessReport::default();
        };

        match self.run_classifier(command, image).await {
            Some(report) => report,
            None => FreshnessReport::default(),
        }
    }

    async fn run_classifier(&self, command: &[String], image: &[u8]) -> Option<FreshnessReport> {
        let mut child = Command::new(&command[0])
            .args(&command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| debug!("classifier spawn failed: {}", e))
            .ok()?;

        // A classifier that exits before reading all of stdin produces a
        // broken pipe here; that's its prerogative, keep going
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(image).await;
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                debug!("classifier wait failed: {}", e);
                return None;
            }
            Err(_) => {
                debug!("classifier timed out after {:?}", self.timeout);
                return None;
            }
        };

        if !output.status.success() {
            debug!("classifier exited with {}", output.status);
            return None;
        }

        let parsed: ClassifierOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| debug!("classifier output unparsable: {}", e))
            .ok()?;

        let default = FreshnessReport::default();
        Some(FreshnessReport {
            score: parsed
                .confidence
                .map(|c| c.round().clamp(0.0, 100.0) as u8)
                .unwrap_or(default.score),
            is_fresh: parsed.is_fresh.unwrap_or(default.is_fresh),
            label: parsed.predicted_label.unwrap_or(default.label),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> Option<Vec<String>> {
        Some(vec!["sh".to_string(), "-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_missing_binary_degrades_at_probe() {
        let inference = FreshnessInference::new(
            Some(vec!["definitely-not-a-real-classifier-binary".to_string()]),
            Duration::from_secs(1),
        );
        inference.probe().await;
        assert!(inference.is_degraded());
        assert_eq!(inference.assess(b"img").await, FreshnessReport::default());
    }

    #[tokio::test]
    async fn test_unconfigured_starts_degraded() {
        let inference = FreshnessInference::new(None, Duration::from_secs(1));
        assert!(inference.is_degraded());
        assert_eq!(inference.assess(b"img").await, FreshnessReport::default());
    }

    #[tokio::test]
    async fn test_parses_classifier_output() {
        let inference = FreshnessInference::new(
            shell(r#"cat > /dev/null; echo '{"confidence": 87.4, "is_fresh": false, "predicted_label": "rottenbanana"}'"#),
            Duration::from_secs(5),
        );
        let report = inference.assess(b"banana image").await;
        assert_eq!(report.score, 87);
        assert!(!report.is_fresh);
        assert_eq!(report.label, "rottenbanana");
    }

    #[tokio::test]
    async fn test_nonzero_exit_returns_default() {
        let inference =
            FreshnessInference::new(shell("cat > /dev/null; exit 3"), Duration::from_secs(5));
        assert_eq!(inference.assess(b"img").await, FreshnessReport::default());
    }

    #[tokio::test]
    async fn test_garbage_output_returns_default() {
        let inference = FreshnessInference::new(
            shell("cat > /dev/null; echo not-json-at-all"),
            Duration::from_secs(5),
        );
        assert_eq!(inference.assess(b"img").await, FreshnessReport::default());
    }

    #[tokio::test]
    async fn test_timeout_returns_default() {
        let inference =
            FreshnessInference::new(shell("sleep 5"), Duration::from_millis(100));
        assert_eq!(inference.assess(b"img").await, FreshnessReport::default());
    }

    #[tokio::test]
    async fn test_score_clamped_to_range() {
        let inference = FreshnessInference::new(
            shell(r#"cat > /dev/null; echo '{"confidence": 250.0}'"#),
            Duration::from_secs(5),
        );
        let report = inference.assess(b"img").await;
        assert_eq!(report.score, 100);
        // Unspecified fields fall back to the default
        assert!(report.is_fresh);
        assert_eq!(report.label, "Unknown");
    }
}
