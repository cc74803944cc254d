use std::fs::File;
use std::io::{self, Read};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::dataset::{TypedDataset, decode_dataset};
use crate::domain::{SourceDescriptor, SourceName, SourceSpec};
use crate::error::LayerError;

const CANCEL_POLL: Duration = Duration::from_millis(50);
const READ_CHUNK: usize = 64 * 1024;

/// Retrieves the raw bytes behind a descriptor. Implementations return
/// `LayerError::Cancelled` soon after `cancel` fires, including mid-request.
pub trait SourceClient: Send + Sync {
    fn fetch(
        &self,
        name: &SourceName,
        descriptor: &SourceDescriptor,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, LayerError>;
}

impl<T: SourceClient + ?Sized> SourceClient for &T {
    fn fetch(
        &self,
        name: &SourceName,
        descriptor: &SourceDescriptor,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, LayerError> {
        (**self).fetch(name, descriptor, cancel)
    }
}

#[derive(Clone)]
pub struct HttpSourceClient {
    client: Client,
}

impl HttpSourceClient {
    pub fn new() -> Result<Self, LayerError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("metro-layers/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| LayerError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| LayerError::Http(err.to_string()))?;
        Ok(Self { client })
    }

    // The request runs on its own thread so a cancel can abandon it while
    // `send` is still waiting on headers.
    fn get(
        &self,
        name: &SourceName,
        url: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, LayerError> {
        let (tx, rx) = mpsc::channel();
        let client = self.client.clone();
        let request_name = name.clone();
        let request_url = url.to_string();
        let request_cancel = cancel.clone();
        thread::spawn(move || {
            let result = download(&client, &request_name, &request_url, &request_cancel);
            let _ = tx.send(result);
        });

        loop {
            match rx.recv_timeout(CANCEL_POLL) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) if cancel.is_cancelled() => {
                    debug!(source = %name, url, "abandoning in-flight request");
                    return Err(LayerError::Cancelled(name.to_string()));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(unavailable(name, "request thread exited"));
                }
            }
        }
    }
}

fn download(
    client: &Client,
    name: &SourceName,
    url: &str,
    cancel: &CancelToken,
) -> Result<Vec<u8>, LayerError> {
    let response = client
        .get(url)
        .send()
        .map_err(|err| unavailable(name, err))?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "request failed".to_string());
        return Err(LayerError::SourceStatus {
            source_name: name.to_string(),
            status,
            message,
        });
    }
    read_all(name, response, cancel, url)
}

fn read_all(
    name: &SourceName,
    mut reader: impl Read,
    cancel: &CancelToken,
    origin: &str,
) -> Result<Vec<u8>, LayerError> {
    let mut body = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        if cancel.is_cancelled() {
            return Err(LayerError::Cancelled(name.to_string()));
        }
        match reader.read(&mut chunk) {
            Ok(0) => return Ok(body),
            Ok(read) => body.extend_from_slice(&chunk[..read]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(unavailable(name, format!("read {origin}: {err}"))),
        }
    }
}

impl SourceClient for HttpSourceClient {
    fn fetch(
        &self,
        name: &SourceName,
        descriptor: &SourceDescriptor,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, LayerError> {
        match descriptor {
            SourceDescriptor::Url(url) => self.get(name, url, cancel),
            SourceDescriptor::File(path) => {
                debug!(source = %name, %path, "reading source file");
                let file = File::open(path.as_std_path())
                    .map_err(|err| unavailable(name, format!("read {path}: {err}")))?;
                read_all(name, file, cancel, path.as_str())
            }
        }
    }
}

fn unavailable(name: &SourceName, err: impl ToString) -> LayerError {
    LayerError::SourceUnavailable {
        source_name: name.to_string(),
        message: err.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: usize,
    #[serde(with = "duration_ms", rename = "backoff_ms")]
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

pub struct SourceFetcher<'a, C: SourceClient> {
    client: &'a C,
    policy: RetryPolicy,
}

impl<'a, C: SourceClient> SourceFetcher<'a, C> {
    pub fn new(client: &'a C, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    pub fn fetch(&self, spec: &SourceSpec, cancel: &CancelToken) -> Result<TypedDataset, LayerError> {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Err(LayerError::Cancelled(spec.name.to_string()));
            }
            attempt += 1;
            info!(source = %spec.name, "getting {} data: attempt {attempt}/{attempts}", spec.kind);
            let start = Instant::now();
            let result = self
                .client
                .fetch(&spec.name, &spec.descriptor, cancel)
                .and_then(|bytes| decode_dataset(&spec.name, spec.kind, &bytes));
            match result {
                Ok(dataset) => {
                    info!(
                        source = %spec.name,
                        records = dataset.len(),
                        latency_ms = start.elapsed().as_millis() as u64,
                        "fetched source"
                    );
                    return Ok(dataset);
                }
                Err(err @ LayerError::Cancelled(_)) => return Err(err),
                Err(err) if attempt >= attempts => {
                    warn!(source = %spec.name, "giving up after {attempts} attempts: {err}");
                    return Err(err);
                }
                Err(err) => {
                    warn!(source = %spec.name, "attempt {attempt}/{attempts} failed: {err}");
                    if cancel.sleep(self.policy.backoff) {
                        return Err(LayerError::Cancelled(spec.name.to_string()));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::Mutex;

    use assert_matches::assert_matches;

    use super::*;

    struct FlakyClient {
        failures: usize,
        calls: Mutex<usize>,
        body: &'static [u8],
    }

    impl SourceClient for FlakyClient {
        fn fetch(
            &self,
            name: &SourceName,
            _descriptor: &SourceDescriptor,
            _cancel: &CancelToken,
        ) -> Result<Vec<u8>, LayerError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls <= self.failures {
                return Err(unavailable(name, format!("failure {calls}")));
            }
            Ok(self.body.to_vec())
        }
    }

    fn spec() -> SourceSpec {
        "stops=points:https://example.test/stops.json".parse().unwrap()
    }

    fn policy(attempts: usize) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn retries_until_success() {
        let client = FlakyClient {
            failures: 2,
            calls: Mutex::new(0),
            body: br#"{"stops":[]}"#,
        };
        let dataset = SourceFetcher::new(&client, policy(3))
            .fetch(&spec(), &CancelToken::new())
            .unwrap();
        assert!(dataset.is_empty());
        assert_eq!(*client.calls.lock().unwrap(), 3);
    }

    #[test]
    fn final_error_is_returned_unchanged() {
        let client = FlakyClient {
            failures: 5,
            calls: Mutex::new(0),
            body: b"",
        };
        let err = SourceFetcher::new(&client, policy(3))
            .fetch(&spec(), &CancelToken::new())
            .unwrap_err();
        assert_matches!(
            err,
            LayerError::SourceUnavailable { ref source_name, ref message }
                if source_name == "stops" && message == "failure 3"
        );
        assert_eq!(*client.calls.lock().unwrap(), 3);
    }

    #[test]
    fn decode_failure_consumes_an_attempt() {
        let client = FlakyClient {
            failures: 0,
            calls: Mutex::new(0),
            body: b"not json",
        };
        let err = SourceFetcher::new(&client, policy(2))
            .fetch(&spec(), &CancelToken::new())
            .unwrap_err();
        assert_matches!(err, LayerError::DecodeFailure { .. });
        assert_eq!(*client.calls.lock().unwrap(), 2);
    }

    #[test]
    fn cancelled_token_stops_before_first_attempt() {
        let client = FlakyClient {
            failures: 0,
            calls: Mutex::new(0),
            body: br#"{"stops":[]}"#,
        };
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = SourceFetcher::new(&client, policy(3))
            .fetch(&spec(), &cancel)
            .unwrap_err();
        assert_matches!(err, LayerError::Cancelled(_));
        assert_eq!(*client.calls.lock().unwrap(), 0);
    }

    #[test]
    fn reads_file_sources() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("stops.json");
        std::fs::write(&path, br#"{"stops":[]}"#).unwrap();
        let spec: SourceSpec = format!("stops=points:file:{}", path.display())
            .parse()
            .unwrap();
        let client = HttpSourceClient::new().unwrap();
        let dataset = SourceFetcher::new(&client, policy(1))
            .fetch(&spec, &CancelToken::new())
            .unwrap();
        assert!(dataset.is_empty());
    }

    #[test]
    fn cancelled_file_read_stops() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("stops.json");
        std::fs::write(&path, br#"{"stops":[]}"#).unwrap();
        let spec: SourceSpec = format!("stops=points:file:{}", path.display())
            .parse()
            .unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = HttpSourceClient::new()
            .unwrap()
            .fetch(&spec.name, &spec.descriptor, &cancel)
            .unwrap_err();
        assert_matches!(err, LayerError::Cancelled(ref name) if name == "stops");
    }

    #[test]
    fn cancel_abandons_stalled_request() {
        // Accepts the connection and never answers.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let held = listener.accept();
            thread::sleep(Duration::from_secs(3));
            drop(held);
        });

        let spec: SourceSpec = format!("stops=points:http://{addr}/stops").parse().unwrap();
        let client = HttpSourceClient::new().unwrap();
        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            canceller.cancel();
        });

        let started = Instant::now();
        let result = client.fetch(&spec.name, &spec.descriptor, &cancel);
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
        server.join().unwrap();
    }
}
