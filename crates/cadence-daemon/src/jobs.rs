//! Turns `[[jobs]]` config entries into scheduler tasks.
//!
//! `command` jobs shell out through `sh -c`, optionally under the download
//! retry preset. `http` jobs GET a URL through the network retry preset
//! wrapped around the host's circuit breaker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cadence_core::{CadenceConfig, JobConfig, JobKind};
use cadence_resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, Classify, ErrorKind, RetryPolicy,
};
use cadence_scheduler::JobScheduler;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info};

const HTTP_TIMEOUT_SECS: u64 = 30;
/// Bytes of stderr kept in a command failure message.
const STDERR_TAIL: usize = 512;

/// One circuit breaker per remote host, created on first use.
pub struct BreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, host: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(host, self.config.clone())))
            .clone()
    }

    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|b| b.value().stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }
}

/// Builds tasks for configured jobs, sharing one HTTP client, one set of
/// retry policies and one breaker registry across all of them.
pub struct JobFactory {
    client: reqwest::Client,
    network: RetryPolicy,
    download: RetryPolicy,
    breakers: Arc<BreakerRegistry>,
}

impl JobFactory {
    pub fn from_config(config: &CadenceConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .context("building HTTP client")?;
        let breaker = config.breaker.to_breaker_config();
        breaker.validate()?;
        Ok(Self {
            client,
            network: RetryPolicy::new("network", config.retry.network.clone())?,
            download: RetryPolicy::new("download", config.retry.download.clone())?,
            breakers: Arc::new(BreakerRegistry::new(breaker)),
        })
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Register `job` on `scheduler`. Fails on a malformed schedule or URL.
    pub fn register(&self, scheduler: &mut JobScheduler, job: &JobConfig) -> anyhow::Result<()> {
        match &job.kind {
            JobKind::Command {
                command,
                retry,
                timeout_secs,
            } => {
                let command = Arc::new(command.clone());
                let policy = retry.then(|| self.download.clone());
                let timeout = Duration::from_secs(*timeout_secs);
                scheduler.add_job(job.name.clone(), &job.schedule, move || {
                    let command = Arc::clone(&command);
                    let policy = policy.clone();
                    async move { run_command(&command, timeout, policy.as_ref()).await }
                })?;
            }
            JobKind::Http { url } => {
                let parsed = reqwest::Url::parse(url)
                    .with_context(|| format!("job '{}': invalid url '{url}'", job.name))?;
                let host = parsed
                    .host_str()
                    .with_context(|| format!("job '{}': url '{url}' has no host", job.name))?;
                let breaker = self.breakers.get(host);
                let client = self.client.clone();
                let policy = self.network.clone();
                let url = Arc::new(url.clone());
                scheduler.add_job(job.name.clone(), &job.schedule, move || {
                    let client = client.clone();
                    let policy = policy.clone();
                    let breaker = Arc::clone(&breaker);
                    let url = Arc::clone(&url);
                    async move {
                        policy
                            .execute(|| breaker.execute(|| fetch(&client, &url)))
                            .await?;
                        Ok(())
                    }
                })?;
            }
        }
        info!(job = %job.name, schedule = %job.schedule, "job registered from config");
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn command")]
    Spawn(#[from] std::io::Error),

    #[error("command timed out after {secs}s")]
    TimedOut { secs: u64 },

    #[error("command exited with {}: {stderr}", exit_label(.code))]
    Exit { code: Option<i32>, stderr: String },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "signal".to_string(),
    }
}

impl Classify for CommandError {
    fn kind(&self) -> ErrorKind {
        match self {
            CommandError::Spawn(e) => Classify::kind(e),
            CommandError::TimedOut { .. } => ErrorKind::Timeout,
            // Download commands (curl, rsync, ...) report transfer failures
            // through their exit status.
            CommandError::Exit { .. } => ErrorKind::Io,
        }
    }
}

async fn run_command(
    command: &str,
    timeout: Duration,
    policy: Option<&RetryPolicy>,
) -> anyhow::Result<()> {
    match policy {
        Some(policy) => policy.execute(|| exec(command, timeout)).await?,
        None => exec(command, timeout).await?,
    }
    Ok(())
}

/// Run `command` under `sh -c`; the child is killed if `timeout` expires.
async fn exec(command: &str, timeout: Duration) -> Result<(), CommandError> {
    debug!("exec: {command}");
    let mut child = tokio::process::Command::new("sh");
    child
        .arg("-c")
        .arg(command)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, child.output())
        .await
        .map_err(|_| CommandError::TimedOut {
            secs: timeout.as_secs(),
        })??;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    let tail_start = stderr
        .char_indices()
        .rev()
        .nth(STDERR_TAIL.saturating_sub(1))
        .map_or(0, |(i, _)| i);
    Err(CommandError::Exit {
        code: output.status.code(),
        stderr: stderr[tail_start..].to_string(),
    })
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
}

impl Classify for HttpError {
    fn kind(&self) -> ErrorKind {
        match self {
            HttpError::Request { source, .. } if source.is_timeout() => ErrorKind::Timeout,
            HttpError::Request { source, .. } if source.is_connect() => ErrorKind::Connect,
            HttpError::Request { source, .. } if source.is_decode() => ErrorKind::Decode,
            HttpError::Request { source, .. } if source.is_body() => ErrorKind::Interrupted,
            HttpError::Request { .. } | HttpError::Status { .. } => ErrorKind::Transport,
        }
    }

    fn status(&self) -> Option<u16> {
        match self {
            HttpError::Request { source, .. } => source.status().map(|s| s.as_u16()),
            HttpError::Status { status, .. } => Some(*status),
        }
    }
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<(), HttpError> {
    let request_error = |source| HttpError::Request {
        url: url.to_string(),
        source,
    };
    let resp = client.get(url).send().await.map_err(request_error)?;
    let status = resp.status();
    if !status.is_success() {
        return Err(HttpError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let body = resp.bytes().await.map_err(request_error)?;
    debug!(%url, %status, bytes = body.len(), "fetched");
    Ok(())
}
