use anyhow::{bail, Context, Result};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;

use fleet_common::Topology;

pub fn url(server_url: &str, path: &str) -> String {
    format!("{}{}", server_url.trim_end_matches('/'), path)
}

pub fn read_topology(path: &std::path::Path) -> Result<Topology> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// Turn an error response into an error carrying the server's message.
async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            let code = v["error"]["code"].as_str()?.to_string();
            let message = v["error"]["message"].as_str()?.to_string();
            Some(format!("{code}: {message}"))
        })
        .unwrap_or(body);
    bail!("{status}: {message}")
}

pub async fn get_json<T: DeserializeOwned>(client: &Client, url: &str) -> Result<T> {
    let resp = check(client.get(url).send().await?).await?;
    Ok(resp.json().await?)
}

pub async fn send_topology<T: DeserializeOwned>(
    builder: reqwest::RequestBuilder,
    topology: &Topology,
) -> Result<T> {
    let resp = check(builder.json(topology).send().await?).await?;
    Ok(resp.json().await?)
}
