use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::Stream;
use reqwest::{Client, StatusCode};
use serde::{Serialize, de::DeserializeOwned};

use crate::config::{HttpCfg, StreamCfg};
use crate::error::{CoreResult, EduError};

/// Per-request context: correlation id and the bearer token to present.
#[derive(Clone, Copy, Default)]
pub struct RequestCtx<'a> {
    pub request_id: Option<&'a str>,
    pub bearer: Option<&'a str>,
}

/// Represents a single Server-Sent-Event line (already split on `\n`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseLine {
    pub line: String,
}

/// A boxed stream of `SseLine` results.
pub type SseStream = Pin<Box<dyn Stream<Item = CoreResult<SseLine>> + Send>>;

/// Raw body chunks feeding a [`LineStream`].
pub type ByteStream = Pin<Box<dyn Stream<Item = CoreResult<Bytes>> + Send>>;

/// Outcome of opening an event stream.
pub enum SseResponse {
    /// 2xx: the body is being streamed line by line.
    Open(SseStream),
    /// Non-2xx: the body was read as text and no stream was started.
    Rejected { status: u16, body: String },
}

impl std::fmt::Debug for SseResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open(_) => f.write_str("SseResponse::Open(..)"),
            Self::Rejected { status, body } => f
                .debug_struct("SseResponse::Rejected")
                .field("status", status)
                .field("body", body)
                .finish(),
        }
    }
}

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
    request_timeout: Duration,
    stream_cfg: StreamCfg,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_config(&HttpCfg::default(), &StreamCfg::default())
    }

    /// The total request timeout is applied per call rather than on the
    /// client so long-lived event streams are bounded only by the idle timeout.
    pub fn from_config(http: &HttpCfg, stream: &StreamCfg) -> CoreResult<Self> {
        let mut builder =
            Client::builder().connect_timeout(Duration::from_millis(http.connect_timeout_ms));
        if let Some(n) = http.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| EduError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: "learnflow/0.1".to_string(),
            request_timeout: Duration::from_millis(http.request_timeout_ms),
            stream_cfg: stream.clone(),
        })
    }

    fn decorate(
        &self,
        mut req: reqwest::RequestBuilder,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> reqwest::RequestBuilder {
        req = req.header(http::header::USER_AGENT, &self.user_agent);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        if let Some(rid) = ctx.request_id {
            req = req.header("X-Request-Id", rid);
        }
        if let Some(token) = ctx.bearer {
            req = req.header(http::header::AUTHORIZATION, format!("Bearer {token}"));
        }
        req
    }

    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<R> {
        let req = self
            .inner
            .post(url)
            .json(body)
            .timeout(self.request_timeout);
        let req = self.decorate(req, headers, ctx);
        self.execute_json(url, req).await
    }

    pub async fn get_json<R: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<R> {
        let req = self.inner.get(url).timeout(self.request_timeout);
        let req = self.decorate(req, headers, ctx);
        self.execute_json(url, req).await
    }

    async fn execute_json<R: DeserializeOwned>(
        &self,
        url: &str,
        req: reqwest::RequestBuilder,
    ) -> CoreResult<R> {
        let start = Instant::now();
        let resp = req.send().await.map_err(|e| {
            tracing::warn!(url, error = %e, "request failed before a response arrived");
            EduError::Unavailable(e.to_string())
        })?;

        let status = resp.status();
        let headers = resp.headers().clone();
        tracing::debug!(
            url,
            status = status.as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            "response received"
        );

        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let ra = parse_retry_after(&headers);
            return Err(map_http_error(status, ra, &text));
        }

        resp.json::<R>()
            .await
            .map_err(|e| EduError::Decode(format!("json decode error: {e}")))
    }

    /// POST JSON and open an SSE (Server-Sent Events) line stream.
    /// A non-2xx status is reported as [`SseResponse::Rejected`] with the body text.
    pub async fn post_sse<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<SseResponse> {
        let req = self
            .inner
            .post(url)
            .json(body)
            .header(http::header::ACCEPT, "text/event-stream");
        let req = self.decorate(req, headers, ctx);

        // The idle bound also covers the wait for response headers.
        let idle = Duration::from_millis(self.stream_cfg.idle_timeout_ms);
        let resp = tokio::time::timeout(idle, req.send())
            .await
            .map_err(|_| {
                tracing::warn!(url, "no response headers before idle timeout");
                EduError::StreamIdle {
                    idle_ms: self.stream_cfg.idle_timeout_ms,
                }
            })?
            .map_err(|e| EduError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(url, status = status.as_u16(), "event stream rejected");
            return Ok(SseResponse::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        use futures_util::StreamExt;
        let byte_stream = resp
            .bytes_stream()
            .map(|r| r.map_err(|e| EduError::Stream(format!("read failed: {e}"))));
        Ok(SseResponse::Open(lines_from_bytes(
            Box::pin(byte_stream),
            &self.stream_cfg,
        )))
    }
}

/// Split a raw byte stream into newline-terminated lines.
pub fn lines_from_bytes(inner: ByteStream, cfg: &StreamCfg) -> SseStream {
    Box::pin(LineStream::new(
        inner,
        cfg.max_line_bytes,
        Duration::from_millis(cfg.idle_timeout_ms),
    ))
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    if let Some(v) = headers.get(http::header::RETRY_AFTER)
        && let Ok(s) = v.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Some(secs);
    }
    None
}

fn map_http_error(status: StatusCode, retry_after: Option<u64>, body: &str) -> EduError {
    match status {
        StatusCode::UNAUTHORIZED => EduError::Unauthorized(truncate(body, 300)),
        StatusCode::TOO_MANY_REQUESTS => EduError::RateLimited { retry_after },
        s if s.is_server_error() => EduError::Unavailable(format!("status {}", s.as_u16())),
        s => EduError::Http {
            status: s.as_u16(),
            message: truncate(body, 300),
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut t = s[..cut].to_string();
        t.push_str("...");
        t
    } else {
        s.to_string()
    }
}

/// Line splitter over a bytes stream; yields `SseLine`s separated by '\n'.
///
/// Bytes are buffered raw and decoded only once a full line is present, so a
/// UTF-8 sequence split across reads is never mangled. An unterminated tail at
/// end of body is discarded.
///
/// The idle timer is armed on the first `Pending` read, so building the stream
/// does not require a running Tokio runtime.
struct LineStream {
    inner: ByteStream,
    buf: Vec<u8>,
    max_line_bytes: usize,
    idle: Duration,
    idle_timer: Option<Pin<Box<tokio::time::Sleep>>>,
    finished: bool,
}

impl LineStream {
    fn new(inner: ByteStream, max_line_bytes: usize, idle: Duration) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            max_line_bytes,
            idle,
            idle_timer: None,
            finished: false,
        }
    }

    fn take_line(&mut self) -> Option<CoreResult<SseLine>> {
        let idx = self.buf.iter().position(|b| *b == b'\n')?;
        let mut raw: Vec<u8> = self.buf.drain(..=idx).collect();
        raw.pop();
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        if raw.len() > self.max_line_bytes {
            return Some(Err(self.line_too_long()));
        }
        Some(Ok(SseLine {
            line: String::from_utf8_lossy(&raw).into_owned(),
        }))
    }

    fn line_too_long(&self) -> EduError {
        EduError::Stream(format!("event line exceeds {} bytes", self.max_line_bytes))
    }

    fn fail(&mut self, err: EduError) -> Poll<Option<CoreResult<SseLine>>> {
        self.finished = true;
        self.buf.clear();
        Poll::Ready(Some(Err(err)))
    }
}

impl Stream for LineStream {
    type Item = CoreResult<SseLine>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if this.finished {
                return Poll::Ready(None);
            }
            match this.take_line() {
                Some(Ok(line)) => return Poll::Ready(Some(Ok(line))),
                Some(Err(e)) => return this.fail(e),
                None => {}
            }
            // The pending partial line may still gain a trailing "\r".
            if this.buf.len() > this.max_line_bytes + 1 {
                let err = this.line_too_long();
                return this.fail(err);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buf.extend_from_slice(&chunk);
                    if let Some(timer) = this.idle_timer.as_mut() {
                        timer.as_mut().reset(tokio::time::Instant::now() + this.idle);
                    }
                    continue;
                }
                Poll::Ready(Some(Err(e))) => return this.fail(e),
                Poll::Ready(None) => {
                    if !this.buf.is_empty() {
                        tracing::debug!(
                            bytes = this.buf.len(),
                            "discarding unterminated line at end of stream"
                        );
                    }
                    this.finished = true;
                    this.buf.clear();
                    return Poll::Ready(None);
                }
                Poll::Pending => {
                    let idle = this.idle;
                    let timer = this
                        .idle_timer
                        .get_or_insert_with(|| Box::pin(tokio::time::sleep(idle)));
                    if timer.as_mut().poll(cx).is_ready() {
                        let idle_ms = this.idle.as_millis() as u64;
                        return this.fail(EduError::StreamIdle { idle_ms });
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
