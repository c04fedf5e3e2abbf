//! Retry, backoff and host fallback for establishing the browser link.

use crate::backend::BackendError;
use crate::config::Config;
use log::{debug, info, warn};
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// What a failed connection attempt means for the remaining attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    /// Give up on this host and move to the next one immediately.
    HostSkip,
    /// Back off and retry the same host.
    Transient,
    /// Abort the whole procedure.
    Fatal,
}

pub trait ClassifyFailure {
    fn classify(&self) -> ConnectFailure;
}

fn classify_io(err: &io::Error) -> ConnectFailure {
    use io::ErrorKind::*;
    match err.kind() {
        PermissionDenied | ConnectionRefused => ConnectFailure::HostSkip,
        TimedOut | ConnectionReset | ConnectionAborted | NotConnected | AddrNotAvailable
        | BrokenPipe | Interrupted | WouldBlock => ConnectFailure::Transient,
        _ => classify_message(&err.to_string()),
    }
}

// Resolver and routing failures surface without a dedicated ErrorKind.
fn classify_message(message: &str) -> ConnectFailure {
    let message = message.to_lowercase();
    let transient = [
        "dns error",
        "failed to lookup address",
        "name or service not known",
        "temporary failure in name resolution",
        "unreachable",
    ];
    if transient.iter().any(|needle| message.contains(needle)) {
        ConnectFailure::Transient
    } else {
        ConnectFailure::Fatal
    }
}

fn find_io_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a io::Error> {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            return Some(io_err);
        }
        current = err.source();
    }
    None
}

impl ClassifyFailure for io::Error {
    fn classify(&self) -> ConnectFailure {
        classify_io(self)
    }
}

impl ClassifyFailure for BackendError {
    fn classify(&self) -> ConnectFailure {
        match self {
            BackendError::Timeout(_) => ConnectFailure::Transient,
            BackendError::Io(err) => classify_io(err),
            BackendError::Http(err) if err.is_timeout() => ConnectFailure::Transient,
            BackendError::Http(err) => match find_io_error(err) {
                Some(io_err) => classify_io(io_err),
                None => classify_message(&format!("{:?}", err)),
            },
            BackendError::WebSocket(err) => match find_io_error(err) {
                Some(io_err) => classify_io(io_err),
                None => ConnectFailure::Fatal,
            },
            _ => ConnectFailure::Fatal,
        }
    }
}

/// One failed attempt, as listed in [`ConnectError`].
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    pub host: String,
    pub port: u16,
    pub attempt: u32,
    pub message: String,
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} (attempt {}): {}",
            self.host, self.port, self.attempt, self.message
        )
    }
}

/// Every host and attempt failed without a fatal error.
#[derive(Debug, Clone, Error)]
#[error("{}", summarize(.attempts))]
pub struct ConnectError {
    /// The primary host that was asked for.
    pub host: String,
    pub port: u16,
    pub attempts: Vec<AttemptFailure>,
    /// The browser may simply not be up yet; trying again later can succeed.
    pub retryable: bool,
}

fn summarize(attempts: &[AttemptFailure]) -> String {
    attempts
        .iter()
        .enumerate()
        .map(|(i, attempt)| format!("{}. {}", i + 1, attempt))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub host: String,
    pub fallback_hosts: Vec<String>,
    pub port: u16,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.host.clone(),
            fallback_hosts: config.fallback_hosts.clone(),
            port: config.port,
            retries: config.retries,
            retry_delay: config.retry_delay(),
        }
    }

    /// Primary host followed by fallbacks, as configured.
    pub fn hosts(&self) -> Vec<String> {
        std::iter::once(&self.host)
            .chain(self.fallback_hosts.iter())
            .cloned()
            .collect()
    }

    /// Upper bound on connection attempts.
    pub fn max_attempts(&self) -> usize {
        self.hosts().len() * (self.retries as usize + 1)
    }
}

/// Run `connect` against every host of `policy` until one succeeds.
///
/// Failures are classified through [`ClassifyFailure`]: host-skip errors move
/// on to the next host, transient errors sleep and retry with a doubling delay
/// and fatal errors are returned as-is. When all hosts are exhausted the
/// collected attempts are returned as a [`ConnectError`].
pub async fn connect_with_retry<T, E, F, Fut>(policy: &RetryPolicy, mut connect: F) -> Result<T, E>
where
    F: FnMut(String, u16) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ClassifyFailure + fmt::Display + From<ConnectError>,
{
    let mut failures = Vec::new();

    for host in policy.hosts() {
        let mut delay = policy.retry_delay;

        for attempt in 1..=policy.retries + 1 {
            debug!("Connecting to {}:{} (attempt {})", host, policy.port, attempt);
            let err = match connect(host.clone(), policy.port).await {
                Ok(connection) => {
                    if attempt > 1 || host != policy.host {
                        info!(
                            "Connected to {}:{} after {} failed attempt(s)",
                            host,
                            policy.port,
                            failures.len()
                        );
                    }
                    return Ok(connection);
                }
                Err(err) => err,
            };

            let failure = err.classify();
            failures.push(AttemptFailure {
                host: host.clone(),
                port: policy.port,
                attempt,
                message: err.to_string(),
            });

            match failure {
                ConnectFailure::Fatal => {
                    warn!("Connection to {}:{} failed fatally: {}", host, policy.port, err);
                    return Err(err);
                }
                ConnectFailure::HostSkip => {
                    warn!("Skipping {}:{}: {}", host, policy.port, err);
                    break;
                }
                ConnectFailure::Transient => {
                    if attempt > policy.retries {
                        warn!("Giving up on {}:{}: {}", host, policy.port, err);
                        break;
                    }
                    warn!(
                        "Connection to {}:{} failed ({}), retrying in {}ms",
                        host,
                        policy.port,
                        err,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
            }
        }
    }

    Err(E::from(ConnectError {
        host: policy.host.clone(),
        port: policy.port,
        attempts: failures,
        retryable: true,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn policy(fallbacks: &[&str], retries: u32) -> RetryPolicy {
        RetryPolicy {
            host: "primary".to_string(),
            fallback_hosts: fallbacks.iter().map(|h| h.to_string()).collect(),
            port: 9222,
            retries,
            retry_delay: Duration::from_millis(100),
        }
    }

    fn io_err(kind: io::ErrorKind) -> BackendError {
        BackendError::Io(io::Error::new(kind, format!("{:?}", kind)))
    }

    /// Scripted connector: each host maps to the error it keeps returning,
    /// `None` meaning the host accepts the connection.
    struct Script {
        outcomes: HashMap<&'static str, Option<io::ErrorKind>>,
        calls: Arc<Mutex<Vec<(String, Instant)>>>,
    }

    impl Script {
        fn new(outcomes: &[(&'static str, Option<io::ErrorKind>)]) -> Self {
            Self {
                outcomes: outcomes.iter().cloned().collect(),
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        async fn run(&self, policy: &RetryPolicy) -> Result<String, BackendError> {
            connect_with_retry(policy, |host, _port| {
                self.calls.lock().unwrap().push((host.clone(), Instant::now()));
                let outcome = self.outcomes.get(host.as_str()).cloned().flatten();
                async move {
                    match outcome {
                        None => Ok(host),
                        Some(kind) => Err(io_err(kind)),
                    }
                }
            })
            .await
        }

        fn hosts(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(h, _)| h.clone()).collect()
        }

        fn gaps(&self) -> Vec<Duration> {
            let calls = self.calls.lock().unwrap();
            calls.windows(2).map(|w| w[1].1 - w[0].1).collect()
        }
    }

    #[test]
    fn classifies_common_io_failures() {
        assert_eq!(
            io_err(io::ErrorKind::ConnectionRefused).classify(),
            ConnectFailure::HostSkip
        );
        assert_eq!(
            io_err(io::ErrorKind::PermissionDenied).classify(),
            ConnectFailure::HostSkip
        );
        assert_eq!(io_err(io::ErrorKind::TimedOut).classify(), ConnectFailure::Transient);
        assert_eq!(
            io_err(io::ErrorKind::ConnectionReset).classify(),
            ConnectFailure::Transient
        );
        assert_eq!(
            BackendError::Io(io::Error::new(
                io::ErrorKind::Other,
                "failed to lookup address information: Name or service not known"
            ))
            .classify(),
            ConnectFailure::Transient
        );
        assert_eq!(BackendError::Timeout(100).classify(), ConnectFailure::Transient);
        assert_eq!(io_err(io::ErrorKind::InvalidData).classify(), ConnectFailure::Fatal);
        assert_eq!(
            BackendError::Protocol("bad".to_string()).classify(),
            ConnectFailure::Fatal
        );
    }

    #[test]
    fn hosts_keep_configured_order_and_repeats() {
        let policy = policy(&["localhost", "primary", "::1", "localhost"], 2);
        assert_eq!(
            policy.hosts(),
            vec!["primary", "localhost", "primary", "::1", "localhost"]
        );
        assert_eq!(policy.max_attempts(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_host_is_tried_again() {
        let script = Script::new(&[
            ("primary", Some(io::ErrorKind::ConnectionRefused)),
            ("backup", None),
        ]);
        let connected = script.run(&policy(&["primary", "backup"], 1)).await.unwrap();

        assert_eq!(connected, "backup");
        assert_eq!(script.hosts(), vec!["primary", "primary", "backup"]);
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_returns_without_retrying() {
        let script = Script::new(&[("primary", None)]);
        let connected = script.run(&policy(&["backup"], 3)).await.unwrap();
        assert_eq!(connected, "primary");
        assert_eq!(script.hosts(), vec!["primary"]);
    }

    #[tokio::test(start_paused = true)]
    async fn host_skip_moves_to_next_host_immediately() {
        let script = Script::new(&[
            ("primary", Some(io::ErrorKind::ConnectionRefused)),
            ("backup", None),
        ]);
        let connected = script.run(&policy(&["backup"], 3)).await.unwrap();

        assert_eq!(connected, "backup");
        assert_eq!(script.hosts(), vec!["primary", "backup"]);
        assert_eq!(script.gaps(), vec![Duration::ZERO]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_back_off_with_doubling_delay() {
        let script = Script::new(&[
            ("primary", Some(io::ErrorKind::TimedOut)),
            ("backup", None),
        ]);
        let connected = script.run(&policy(&["backup"], 3)).await.unwrap();

        assert_eq!(connected, "backup");
        assert_eq!(
            script.hosts(),
            vec!["primary", "primary", "primary", "primary", "backup"]
        );
        assert_eq!(
            script.gaps(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::ZERO,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_aborts_without_trying_other_hosts() {
        let script = Script::new(&[
            ("primary", Some(io::ErrorKind::InvalidData)),
            ("backup", None),
        ]);
        let err = script.run(&policy(&["backup"], 3)).await.unwrap_err();

        assert!(matches!(err, BackendError::Io(ref e) if e.kind() == io::ErrorKind::InvalidData));
        assert_eq!(script.hosts(), vec!["primary"]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_every_attempt() {
        let script = Script::new(&[
            ("primary", Some(io::ErrorKind::TimedOut)),
            ("backup", Some(io::ErrorKind::ConnectionRefused)),
        ]);
        let err = script.run(&policy(&["backup"], 1)).await.unwrap_err();

        let err = match err {
            BackendError::Connect(err) => err,
            other => panic!("expected aggregated connect error, got {:?}", other),
        };
        assert_eq!(err.host, "primary");
        assert_eq!(err.port, 9222);
        assert!(err.retryable);
        assert_eq!(err.attempts.len(), 3);
        assert_eq!(
            err.to_string(),
            "1. primary:9222 (attempt 1): IO error: TimedOut\n\
             2. primary:9222 (attempt 2): IO error: TimedOut\n\
             3. backup:9222 (attempt 1): IO error: ConnectionRefused"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_means_single_attempt_per_host() {
        let script = Script::new(&[
            ("primary", Some(io::ErrorKind::TimedOut)),
            ("backup", Some(io::ErrorKind::TimedOut)),
        ]);
        let err = script.run(&policy(&["backup"], 0)).await.unwrap_err();

        assert!(matches!(err, BackendError::Connect(ref e) if e.attempts.len() == 2));
        assert_eq!(script.gaps(), vec![Duration::ZERO]);
    }
}
