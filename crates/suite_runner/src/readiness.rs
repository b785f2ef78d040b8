//! Readiness waiter
//!
//! Polls TCP ports, files and HTTP(S) endpoints until every listed resource
//! is available or the deadline passes.
//!
//! Resource URIs:
//! - `tcp:host:port` (or `tcp:port` for localhost)
//! - `file:path`
//! - `http://...` / `https://...` (any 2xx response counts as available)

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

/// Delay between two polling attempts
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(250);

/// Deadline for a whole readiness wait
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound for a single probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lower bound for a single probe, so the final attempt still gets a chance
const MIN_PROBE_TIMEOUT: Duration = Duration::from_millis(50);

/// A resource that must be available before a process starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Tcp { host: String, port: u16 },
    File(PathBuf),
    Http(String),
}

impl FromStr for Resource {
    type Err = ReadinessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ReadinessError::InvalidResource(s.to_string());

        if let Some(rest) = s.strip_prefix("tcp:") {
            let (host, port) = match rest.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() => (host.to_string(), port),
                Some(_) => return Err(invalid()),
                None => ("localhost".to_string(), rest),
            };
            let port = port.parse::<u16>().map_err(|_| invalid())?;
            return Ok(Resource::Tcp { host, port });
        }

        if let Some(path) = s.strip_prefix("file:") {
            if path.is_empty() {
                return Err(invalid());
            }
            return Ok(Resource::File(PathBuf::from(path)));
        }

        if s.starts_with("http://") || s.starts_with("https://") {
            return Ok(Resource::Http(s.to_string()));
        }

        Err(invalid())
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Tcp { host, port } => write!(f, "tcp:{}:{}", host, port),
            Resource::File(path) => write!(f, "file:{}", path.display()),
            Resource::Http(url) => write!(f, "{}", url),
        }
    }
}

/// What to wait for, and how patiently
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessSpec {
    pub resources: Vec<Resource>,
    pub interval: Duration,
    pub timeout: Duration,
}

impl ReadinessSpec {
    /// Wait on `resources` with the default interval and timeout
    pub fn new(resources: Vec<Resource>) -> Self {
        Self {
            resources,
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Parse a list of resource URIs
    pub fn parse<S: AsRef<str>>(uris: &[S]) -> Result<Self, ReadinessError> {
        let resources = uris
            .iter()
            .map(|u| u.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(resources))
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Polls readiness specs. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ReadinessWaiter {
    client: reqwest::Client,
}

impl Default for ReadinessWaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessWaiter {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { client }
    }

    /// Wait until every resource of `spec` is available.
    ///
    /// `None` or an empty resource list succeeds immediately.
    pub async fn wait(&self, spec: Option<&ReadinessSpec>) -> Result<(), ReadinessError> {
        let Some(spec) = spec else {
            return Ok(());
        };
        if spec.resources.is_empty() {
            return Ok(());
        }

        let names: Vec<String> = spec.resources.iter().map(|r| r.to_string()).collect();
        log::debug!(
            "Waiting for {} (interval {:?}, timeout {:?})",
            names.join(", "),
            spec.interval,
            spec.timeout
        );

        let deadline = Instant::now() + spec.timeout;
        loop {
            let pending = self.unavailable(spec, deadline).await;
            if pending.is_empty() {
                log::debug!("Resources available: {}", names.join(", "));
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                let pending: Vec<String> = pending.iter().map(|r| r.to_string()).collect();
                log::debug!("Timed out waiting for: {}", pending.join(", "));
                return Err(ReadinessError::Timeout {
                    pending,
                    timeout: spec.timeout,
                });
            }

            tokio::time::sleep(spec.interval.min(deadline - now)).await;
        }
    }

    /// Probe every resource once, returning the ones not yet available
    async fn unavailable<'a>(&self, spec: &'a ReadinessSpec, deadline: Instant) -> Vec<&'a Resource> {
        let mut pending = Vec::new();
        for resource in &spec.resources {
            let budget = deadline
                .saturating_duration_since(Instant::now())
                .clamp(MIN_PROBE_TIMEOUT, PROBE_TIMEOUT);
            let available = tokio::time::timeout(budget, self.probe(resource))
                .await
                .unwrap_or(false);
            if !available {
                pending.push(resource);
            }
        }
        pending
    }

    async fn probe(&self, resource: &Resource) -> bool {
        match resource {
            Resource::Tcp { host, port } => {
                tokio::net::TcpStream::connect((host.as_str(), *port))
                    .await
                    .is_ok()
            }
            Resource::File(path) => tokio::fs::metadata(path).await.is_ok(),
            Resource::Http(url) => match self.client.get(url).send().await {
                Ok(response) => response.status().is_success(),
                Err(_) => false,
            },
        }
    }
}

/// Errors from the readiness waiter
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReadinessError {
    #[error("Timed out after {timeout:?} waiting for: {}", .pending.join(", "))]
    Timeout {
        pending: Vec<String>,
        timeout: Duration,
    },

    #[error("Invalid resource '{0}': expected tcp:host:port, file:path or http(s)://...")]
    InvalidResource(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resources() {
        assert_eq!(
            "tcp:localhost:3000".parse::<Resource>().unwrap(),
            Resource::Tcp {
                host: "localhost".to_string(),
                port: 3000
            }
        );
        assert_eq!(
            "tcp:8080".parse::<Resource>().unwrap(),
            Resource::Tcp {
                host: "localhost".to_string(),
                port: 8080
            }
        );
        assert_eq!(
            "file:/tmp/ready".parse::<Resource>().unwrap(),
            Resource::File(PathBuf::from("/tmp/ready"))
        );
        assert_eq!(
            "https://example.com/health".parse::<Resource>().unwrap(),
            Resource::Http("https://example.com/health".to_string())
        );
    }

    #[test]
    fn test_parse_invalid_resources() {
        assert!("tcp:host:notaport".parse::<Resource>().is_err());
        assert!("tcp::80".parse::<Resource>().is_err());
        assert!("file:".parse::<Resource>().is_err());
        assert!("ftp://example.com".parse::<Resource>().is_err());
        assert!(ReadinessSpec::parse(&["tcp:1", "bogus"]).is_err());
    }

    #[test]
    fn test_display_round_trips_tcp() {
        let resource: Resource = "tcp:db:5432".parse().unwrap();
        assert_eq!(resource.to_string(), "tcp:db:5432");
    }

    #[tokio::test]
    async fn test_no_spec_is_immediate() {
        let waiter = ReadinessWaiter::new();
        assert!(waiter.wait(None).await.is_ok());
        assert!(waiter.wait(Some(&ReadinessSpec::new(vec![]))).await.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_ready() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let spec = ReadinessSpec::parse(&[format!("tcp:127.0.0.1:{}", port)])
            .unwrap()
            .with_timeout(Duration::from_secs(5));
        let waiter = ReadinessWaiter::new();
        assert!(waiter.wait(Some(&spec)).await.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_timeout() {
        // Bind and release to get a port nobody listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let spec = ReadinessSpec::parse(&[format!("tcp:127.0.0.1:{}", port)])
            .unwrap()
            .with_interval(Duration::from_millis(50))
            .with_timeout(Duration::from_millis(300));
        let waiter = ReadinessWaiter::new();
        let started = std::time::Instant::now();
        let result = waiter.wait(Some(&spec)).await;

        match result {
            Err(ReadinessError::Timeout { pending, .. }) => {
                assert_eq!(pending, vec![format!("tcp:127.0.0.1:{}", port)]);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_file_appears_later() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ready");

        let spec = ReadinessSpec::new(vec![Resource::File(marker.clone())])
            .with_interval(Duration::from_millis(25))
            .with_timeout(Duration::from_secs(5));

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            tokio::fs::write(&marker, b"ok").await.unwrap();
        });

        let waiter = ReadinessWaiter::new();
        assert!(waiter.wait(Some(&spec)).await.is_ok());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_all_resources_required() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present");
        std::fs::write(&present, b"").unwrap();

        let spec = ReadinessSpec::new(vec![
            Resource::File(present),
            Resource::File(dir.path().join("missing")),
        ])
        .with_interval(Duration::from_millis(25))
        .with_timeout(Duration::from_millis(200));

        let waiter = ReadinessWaiter::new();
        let err = waiter.wait(Some(&spec)).await.unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
