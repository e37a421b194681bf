use crate::limit::RateLimiter;
use crate::response::{ByteStream, BytesResponse, JsonResponse, TextResponse};
use crate::retry::{parse_retry_after, RetryPolicy};
use crate::telemetry::{Registry, TelemetryEvent, TelemetryHandler};
use crate::{Error, Result};
use futures::TryStreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::Method;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// Default User-Agent, identifying the system and version to upstream APIs.
const USER_AGENT: &str = concat!("medkg/", env!("CARGO_PKG_VERSION"));

/// Shared typed HTTP client. Cheap to clone; all clones share the underlying
/// connection pool, rate limiter, retry policy, and telemetry registry.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    retry: RetryPolicy,
    limiter: RateLimiter,
    telemetry: Registry,
    // W3C trace context of the calling process, forwarded when present.
    traceparent: Option<String>,
}

pub struct ClientBuilder {
    retry: RetryPolicy,
    connect_timeout: Duration,
    total_timeout: Duration,
    traceparent: Option<String>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            total_timeout: Duration::from_secs(60),
            traceparent: None,
        }
    }
}

impl ClientBuilder {
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = timeout;
        self
    }

    pub fn traceparent(mut self, traceparent: Option<String>) -> Self {
        self.traceparent = traceparent;
        self
    }

    pub fn build(self) -> Result<Client> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(self.connect_timeout)
            .timeout(self.total_timeout)
            .build()
            .map_err(|source| Error::Transport {
                url: String::new(),
                elapsed: Duration::ZERO,
                timed_out: false,
                source,
            })?;

        Ok(Client {
            inner: Arc::new(Inner {
                http,
                retry: self.retry,
                limiter: RateLimiter::default(),
                telemetry: Registry::default(),
                traceparent: self.traceparent,
            }),
        })
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    /// Install a token bucket for `host`. Requests to that host suspend when
    /// the bucket is empty.
    pub async fn set_rate_limit(&self, host: &str, tokens_per_second: f64, burst: u32) {
        self.inner
            .limiter
            .set_limit(host, tokens_per_second, burst)
            .await;
    }

    /// Register a telemetry handler. This is the sole registration path;
    /// handlers run inline and must be fast.
    pub fn subscribe_telemetry(&self, handler: Arc<dyn TelemetryHandler>) {
        self.inner.telemetry.subscribe(handler);
    }

    pub async fn get_json(
        &self,
        url: Url,
        query: &[(&str, String)],
        headers: &[(&'static str, String)],
    ) -> Result<JsonResponse> {
        let (response, started) = self
            .execute(Method::GET, url.clone(), query, headers, Some("application/json"), None)
            .await?;
        self.read_json(url, response, started).await
    }

    pub async fn post_json(
        &self,
        url: Url,
        body: &serde_json::Value,
        headers: &[(&'static str, String)],
    ) -> Result<JsonResponse> {
        let (response, started) = self
            .execute(
                Method::POST,
                url.clone(),
                &[],
                headers,
                Some("application/json"),
                Some(body.clone()),
            )
            .await?;
        self.read_json(url, response, started).await
    }

    pub async fn get_text(
        &self,
        url: Url,
        query: &[(&str, String)],
        headers: &[(&'static str, String)],
    ) -> Result<TextResponse> {
        let (response, started) = self
            .execute(Method::GET, url.clone(), query, headers, None, None)
            .await?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let text = response.text().await.map_err(|source| Error::Transport {
            url: url.to_string(),
            elapsed: started.elapsed(),
            timed_out: source.is_timeout(),
            source,
        })?;

        self.inner.telemetry.emit(TelemetryEvent::RequestCompleted {
            url: url.to_string(),
            status,
            duration: started.elapsed(),
            bytes: text.len() as u64,
        });

        Ok(TextResponse {
            text,
            url: url.to_string(),
            status,
            headers,
        })
    }

    pub async fn get_bytes(
        &self,
        url: Url,
        query: &[(&str, String)],
        headers: &[(&'static str, String)],
    ) -> Result<BytesResponse> {
        let (response, started) = self
            .execute(Method::GET, url.clone(), query, headers, None, None)
            .await?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let content = response.bytes().await.map_err(|source| Error::Transport {
            url: url.to_string(),
            elapsed: started.elapsed(),
            timed_out: source.is_timeout(),
            source,
        })?;

        self.inner.telemetry.emit(TelemetryEvent::RequestCompleted {
            url: url.to_string(),
            status,
            duration: started.elapsed(),
            bytes: content.len() as u64,
        });

        Ok(BytesResponse {
            content,
            url: url.to_string(),
            status,
            headers,
        })
    }

    /// Stream the response body without buffering it. Completion telemetry is
    /// emitted at the response header, with the declared content length.
    pub async fn stream_bytes(
        &self,
        url: Url,
        query: &[(&str, String)],
        headers: &[(&'static str, String)],
    ) -> Result<ByteStream> {
        let (response, started) = self
            .execute(Method::GET, url.clone(), query, headers, None, None)
            .await?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();

        self.inner.telemetry.emit(TelemetryEvent::RequestCompleted {
            url: url.to_string(),
            status,
            duration: started.elapsed(),
            bytes: response.content_length().unwrap_or(0),
        });

        let stream_url = url.to_string();
        let stream = response
            .bytes_stream()
            .map_err(move |source| Error::Transport {
                url: stream_url.clone(),
                elapsed: Duration::ZERO,
                timed_out: source.is_timeout(),
                source,
            });

        Ok(ByteStream {
            stream: Box::pin(stream),
            url: url.to_string(),
            status,
            headers,
        })
    }

    async fn read_json(
        &self,
        url: Url,
        response: reqwest::Response,
        started: Instant,
    ) -> Result<JsonResponse> {
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|source| Error::Transport {
            url: url.to_string(),
            elapsed: started.elapsed(),
            timed_out: source.is_timeout(),
            source,
        })?;

        let data = match serde_json::from_slice(&body) {
            Ok(data) => data,
            Err(source) => {
                let err = Error::Decode {
                    url: url.to_string(),
                    elapsed: started.elapsed(),
                    source,
                };
                self.inner.telemetry.emit(TelemetryEvent::RequestFailed {
                    url: url.to_string(),
                    kind: err.kind(),
                    duration: started.elapsed(),
                });
                return Err(err);
            }
        };

        self.inner.telemetry.emit(TelemetryEvent::RequestCompleted {
            url: url.to_string(),
            status,
            duration: started.elapsed(),
            bytes: body.len() as u64,
        });

        Ok(JsonResponse {
            data,
            url: url.to_string(),
            status,
            headers,
        })
    }

    /// Send one logical request, retrying per policy. Returns the successful
    /// response and the Instant at which the winning attempt started.
    async fn execute(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, String)],
        extra_headers: &[(&'static str, String)],
        accept: Option<&'static str>,
        body: Option<serde_json::Value>,
    ) -> Result<(reqwest::Response, Instant)> {
        let host = url.host_str().unwrap_or_default().to_string();
        let mut attempt: u32 = 0;

        loop {
            let _waited = self.inner.limiter.acquire(&host).await;

            self.inner.telemetry.emit(TelemetryEvent::RequestStarted {
                url: url.to_string(),
                method: method_name(&method),
            });
            let started = Instant::now();

            let mut request = self.inner.http.request(method.clone(), url.clone());
            if !query.is_empty() {
                request = request.query(query);
            }
            request = request.headers(self.base_headers(accept, extra_headers));
            if let Some(body) = &body {
                request = request.json(body);
            }

            let outcome: Result<std::convert::Infallible> = match request.send().await {
                Err(source) => Err(Error::Transport {
                    url: url.to_string(),
                    elapsed: started.elapsed(),
                    timed_out: source.is_timeout(),
                    source,
                }),
                Ok(response) if response.status().is_success() => {
                    return Ok((response, started));
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let retry_after = response
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_retry_after);

                    Err(if status == 429 {
                        Error::RateLimited {
                            url: url.to_string(),
                            elapsed: started.elapsed(),
                            retry_after,
                        }
                    } else {
                        Error::HttpStatus {
                            url: url.to_string(),
                            status,
                            elapsed: started.elapsed(),
                            retryable: self.inner.retry.is_retryable_status(status),
                            retry_after,
                        }
                    })
                }
            };

            let err = outcome.unwrap_err();
            attempt += 1;

            let backoff = if err.retryable() {
                self.inner.retry.next_backoff(attempt, err.retry_after())
            } else {
                None
            };

            match backoff {
                Some(backoff) => {
                    tracing::debug!(url = %url, attempt, ?backoff, error = %err, "retrying request");
                    self.inner.telemetry.emit(TelemetryEvent::RequestRetried {
                        url: url.to_string(),
                        attempt,
                        reason: err.to_string(),
                        backoff,
                    });
                    tokio::time::sleep(backoff).await;
                }
                None => {
                    self.inner.telemetry.emit(TelemetryEvent::RequestFailed {
                        url: url.to_string(),
                        kind: err.kind(),
                        duration: err.elapsed(),
                    });
                    return Err(err);
                }
            }
        }
    }

    fn base_headers(
        &self,
        accept: Option<&'static str>,
        extra: &[(&'static str, String)],
    ) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(accept) = accept {
            headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static(accept));
        }
        if let Some(traceparent) = &self.inner.traceparent {
            if let Ok(value) = HeaderValue::from_str(traceparent) {
                headers.insert(HeaderName::from_static("traceparent"), value);
            }
        }
        for (name, value) in extra {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_lowercase(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        headers
    }
}

fn method_name(method: &Method) -> &'static str {
    match method.as_str() {
        "GET" => "GET",
        "POST" => "POST",
        "PUT" => "PUT",
        "DELETE" => "DELETE",
        _ => "OTHER",
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    /// Serve `responses` on a local listener, one per connection, then EOF.
    async fn fixture_server(responses: Vec<String>) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (addr, handle)
    }

    fn http_response(status: &str, headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n{headers}\r\n{body}",
            body.len()
        )
    }

    #[tokio::test]
    async fn get_json_decodes_and_wraps() {
        let (addr, _server) = fixture_server(vec![http_response(
            "200 OK",
            "Content-Type: application/json\r\nETag: \"v7\"\r\n",
            r#"{"ok":true}"#,
        )])
        .await;

        let client = Client::builder().build().unwrap();
        let url = Url::parse(&format!("http://{addr}/record")).unwrap();
        let response = client.get_json(url, &[], &[]).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.data["ok"], serde_json::json!(true));
        assert_eq!(response.version_stamp().as_deref(), Some("v7"));
    }

    #[tokio::test]
    async fn malformed_json_is_a_terminal_decode_error() {
        let (addr, _server) = fixture_server(vec![http_response(
            "200 OK",
            "Content-Type: application/json\r\n",
            "{not json",
        )])
        .await;

        let client = Client::builder().build().unwrap();
        let url = Url::parse(&format!("http://{addr}/bad")).unwrap();
        let err = client.get_json(url, &[], &[]).await.unwrap_err();

        assert_eq!(err.kind(), crate::ErrorKind::Decode);
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn transient_503_then_success_is_retried() {
        let (addr, _server) = fixture_server(vec![
            http_response("503 Service Unavailable", "", ""),
            http_response("503 Service Unavailable", "", ""),
            http_response("200 OK", "Content-Type: application/json\r\n", r#"{"n":1}"#),
        ])
        .await;

        let policy = RetryPolicy {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
            max_attempts: 5,
            ..Default::default()
        };
        let client = Client::builder().retry_policy(policy).build().unwrap();

        let retried = Arc::new(Mutex::new(Vec::new()));
        let seen = retried.clone();
        client.subscribe_telemetry(Arc::new(move |event: &TelemetryEvent| {
            if let TelemetryEvent::RequestRetried { attempt, .. } = event {
                seen.lock().unwrap().push(*attempt);
            }
        }));

        let url = Url::parse(&format!("http://{addr}/flaky")).unwrap();
        let response = client.get_json(url, &[], &[]).await.unwrap();

        assert_eq!(response.data["n"], serde_json::json!(1));
        assert_eq!(*retried.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn terminal_404_is_not_retried() {
        let (addr, _server) = fixture_server(vec![http_response("404 Not Found", "", "")]).await;

        let client = Client::builder().build().unwrap();
        let url = Url::parse(&format!("http://{addr}/missing")).unwrap();
        let err = client.get_json(url, &[], &[]).await.unwrap_err();

        assert_eq!(err.http_status(), Some(404));
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn rate_limited_429_carries_retry_after() {
        let (addr, _server) = fixture_server(vec![
            http_response("429 Too Many Requests", "Retry-After: 0\r\n", ""),
            http_response("200 OK", "Content-Type: application/json\r\n", "[]"),
        ])
        .await;

        let policy = RetryPolicy {
            initial: Duration::from_millis(1),
            ..Default::default()
        };
        let client = Client::builder().retry_policy(policy).build().unwrap();
        let url = Url::parse(&format!("http://{addr}/throttled")).unwrap();
        let response = client.get_json(url, &[], &[]).await.unwrap();

        assert_eq!(response.data, serde_json::json!([]));
    }
}
