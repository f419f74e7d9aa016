use crate::request::HttpRequest;
use anyhow::{Context, anyhow};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..=299).contains(&self.status)
    }

    /// Body as text for error messages, cut to a readable length.
    pub fn body_snippet(&self) -> String {
        const MAX: usize = 512;
        let text = String::from_utf8_lossy(&self.body);
        match text.char_indices().nth(MAX) {
            Some((cut, _)) => format!("{}...", &text[..cut]),
            None => text.into_owned(),
        }
    }
}

fn header_map(req: &HttpRequest) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(req.headers.len());
    for (k, v) in &req.headers {
        let name = HeaderName::from_bytes(k.as_bytes())
            .with_context(|| format!("invalid header name: {k}"))?;
        let value =
            HeaderValue::from_str(v).with_context(|| format!("invalid header value for {k}"))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Sends `req` with one deadline covering connect, request and body.
///
/// Without it a dead endpoint would stall session startup indefinitely.
pub async fn execute(req: &HttpRequest, timeout: Duration) -> anyhow::Result<HttpResponse> {
    let client = reqwest::Client::builder()
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()
        .context("build http client")?;

    let method = match req.method.as_str() {
        "GET" => reqwest::Method::GET,
        other => return Err(anyhow!("unsupported method: {other}")),
    };

    let resp = client
        .request(method, &req.url)
        .headers(header_map(req)?)
        .send()
        .await
        .with_context(|| format!("{} request failed", req.method))?;
    let status = resp.status().as_u16();
    let body = resp
        .bytes()
        .await
        .context("failed reading response body")?
        .to_vec();

    log::debug!("{} {} -> {status}", req.method, redact_query(&req.url));
    Ok(HttpResponse { status, body })
}

// Signed urls and similar carry credentials in the query string.
fn redact_query(url: &str) -> &str {
    url.split_once('?').map(|(base, _)| base).unwrap_or(url)
}
