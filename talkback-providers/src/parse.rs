use anyhow::{Context, anyhow};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    signed_url: Option<String>,
}

pub fn parse_signed_url(body: &[u8]) -> anyhow::Result<String> {
    let resp: SignedUrlResponse =
        serde_json::from_slice(body).context("decode signed url JSON")?;
    resp.signed_url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| anyhow!("no signed_url in response"))
}
