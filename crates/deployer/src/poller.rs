use std::time::Duration;

use common::config::Config;
use derive_more::{Display, Error, From};
use futures_util::future::join_all;
use indicatif::{MultiProgress, ProgressBar};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::transport::{Transport, TransportError, PACKAGES_ENDPOINT};

/// Package status reported once the deployment is complete.
pub(crate) const STARTED: &str = "STARTED";

/// Query parameters of the package status request.
const STATUS_QUERY: [(&str, &str); 1] = [("version", "2")];

/// Reasons a single status check did not produce a usable status.
#[derive(Debug, Display, From, Error)]
enum StatusCheckError {
    /// HTTP transport error.
    Transport(TransportError),

    /// Server responded with a non-successful status code.
    #[display(fmt = "unexpected status code {}", _0)]
    Status(#[error(ignore)] StatusCode),

    /// Response body is not valid JSON.
    Json(serde_json::Error),

    /// Response body is valid JSON, but not an object.
    #[display(fmt = "response body is not an object")]
    NotAnObject,
}

/// Retry budget of a status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PollPolicy {
    /// Maximum count of status requests per package.
    pub max_attempts: u32,

    /// Delay between two consecutive status requests.
    pub delay: Duration,
}

impl PollPolicy {
    /// Create a policy from the provided configuration.
    pub(crate) fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.success_check_timeout,
            delay: config.success_check_delay(),
        }
    }
}

/// Terminal state of a polled package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollState {
    /// Package reported the `STARTED` status.
    Started,

    /// Attempts were exhausted before the package started.
    TimedOut,
}

/// Result of polling a single package.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PollOutcome {
    /// Package name.
    pub name: String,

    /// Terminal state.
    pub state: PollState,

    /// Last status reported by the server, if any was reported at all.
    pub last_status: Option<String>,

    /// Count of status requests sent.
    pub attempts: u32,

    /// Full status payload of a started package.
    pub payload: Option<Value>,
}

impl PollOutcome {
    /// Check if the package reached the `STARTED` status.
    pub(crate) fn is_started(&self) -> bool {
        self.state == PollState::Started
    }

    /// Single-line evidence record of this outcome.
    pub(crate) fn evidence(&self) -> String {
        match (&self.state, &self.payload) {
            (PollState::Started, Some(payload)) => format!("{}: {}", self.name, payload),
            (PollState::Started, None) => format!("{}: {}", self.name, STARTED),
            (PollState::TimedOut, _) => format!(
                "{}: timed out after {} attempts, last status: {}",
                self.name,
                self.attempts,
                self.last_status.as_deref().unwrap_or("unknown")
            ),
        }
    }
}

/// Poll package status until it's `STARTED` or `policy` attempts are exhausted.
///
/// Failed requests and malformed responses count as "not started yet" and never
/// interrupt polling. At least one request is always sent.
#[instrument(skip(transport, policy, progress))]
pub(crate) async fn poll(
    transport: &dyn Transport,
    name: &str,
    policy: PollPolicy,
    progress: &ProgressBar,
) -> PollOutcome {
    let max_attempts = policy.max_attempts.max(1);
    let mut last_status = None;

    for attempt in 1..=max_attempts {
        progress.set_message(format!("{name}: checking status ({attempt}/{max_attempts})"));

        match check_status(transport, name).await {
            Ok(payload) => {
                let status = payload.get("status").and_then(Value::as_str);

                if status == Some(STARTED) {
                    info!(attempt, "package started");

                    return PollOutcome {
                        name: name.to_owned(),
                        state: PollState::Started,
                        last_status: Some(String::from(STARTED)),
                        attempts: attempt,
                        payload: Some(payload),
                    };
                }

                debug!(attempt, ?status, "package not started yet");

                if let Some(status) = status {
                    last_status = Some(status.to_owned());
                }
            }
            Err(error) => debug!(attempt, %error, "package status unavailable"),
        }

        if attempt < max_attempts {
            tokio::time::sleep(policy.delay).await;
        }
    }

    warn!(attempts = max_attempts, ?last_status, "package did not start in time");

    PollOutcome {
        name: name.to_owned(),
        state: PollState::TimedOut,
        last_status,
        attempts: max_attempts,
        payload: None,
    }
}

/// Request package status once.
async fn check_status(transport: &dyn Transport, name: &str) -> Result<Value, StatusCheckError> {
    let response = transport
        .get_json(
            &[PACKAGES_ENDPOINT[0], PACKAGES_ENDPOINT[1], name],
            &STATUS_QUERY,
        )
        .await?;

    if !response.status.is_success() {
        return Err(StatusCheckError::Status(response.status));
    }

    match serde_json::from_str::<Value>(&response.body)? {
        payload @ Value::Object(_) => Ok(payload),
        _ => Err(StatusCheckError::NotAnObject),
    }
}

/// Poll all packages concurrently and wait for every one of them to finish.
///
/// Packages are polled independently, so a timed out package never stops the others.
/// Outcomes are returned in the order of `names`.
pub(crate) async fn poll_all(
    transport: &dyn Transport,
    names: &[String],
    policy: PollPolicy,
    progress: &MultiProgress,
) -> Vec<PollOutcome> {
    join_all(names.iter().map(|name| {
        let bar = progress.add(ProgressBar::new_spinner());

        async move {
            let outcome = poll(transport, name, policy, &bar).await;

            bar.finish_with_message(match outcome.state {
                PollState::Started => format!("{name}: started"),
                PollState::TimedOut => format!("{name}: timed out"),
            });

            outcome
        }
    }))
    .await
}
