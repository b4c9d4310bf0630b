//! Configuration gate: decides whether the service is set up at all.

use crate::error::SyncError;
use crate::remote::{ConfigStatus, RemoteService};
use std::time::Duration;
use tracing::{info, warn};

/// Result of a gate check. The check itself never fails: any error is
/// folded into "not configured" and kept alongside for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    pub status: ConfigStatus,
    pub error: Option<SyncError>,
}

pub async fn check_configured<R: RemoteService>(
    remote: &R,
    timeout: Duration,
) -> GateOutcome {
    let error = match tokio::time::timeout(timeout, remote.check_configured()).await {
        Ok(Ok(status)) => {
            info!(
                configured = status.configured,
                api_host = status.api_host.as_deref().unwrap_or("-"),
                "config_check"
            );
            return GateOutcome {
                status,
                error: None,
            };
        }
        Ok(Err(SyncError::ConfigUnavailable(reason))) => SyncError::ConfigUnavailable(reason),
        Ok(Err(other)) => SyncError::ConfigUnavailable(other.to_string()),
        Err(_) => SyncError::ConfigUnavailable(format!(
            "config check timed out after {}ms",
            timeout.as_millis()
        )),
    };
    warn!("config_check_error: {error}");
    GateOutcome {
        status: ConfigStatus::not_configured(),
        error: Some(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRemote;

    #[tokio::test(start_paused = true)]
    async fn reachable_service_reports_its_status() {
        let fake = FakeRemote::new();
        fake.with(|state| state.api_host = Some("crew.example.com".to_string()));
        let outcome = check_configured(&fake, Duration::from_secs(1)).await;
        assert!(outcome.status.configured);
        assert_eq!(outcome.status.api_host.as_deref(), Some("crew.example.com"));
        assert!(outcome.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_fold_into_not_configured() {
        let fake = FakeRemote::new();
        fake.with(|state| {
            state.config_error = Some(SyncError::Transport("connection refused".to_string()))
        });
        let outcome = check_configured(&fake, Duration::from_secs(1)).await;
        assert!(!outcome.status.configured);
        assert!(matches!(outcome.error, Some(SyncError::ConfigUnavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_check_times_out_softly() {
        let fake = FakeRemote::new();
        fake.with(|state| state.config_delay = Duration::from_secs(30));
        let outcome = check_configured(&fake, Duration::from_secs(2)).await;
        assert_eq!(outcome.status, ConfigStatus::not_configured());
        assert!(matches!(outcome.error, Some(SyncError::ConfigUnavailable(_))));
    }
}
