//! Outbound calls to the external identity / chart / record service. One
//! shared client, short timeout, never invoked while a room lock is held.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteUser {
    pub id: i32,
    pub name: String,
    #[serde(default)]
    pub language: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteChart {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub id: i32,
    pub player: i32,
    pub score: i32,
    pub accuracy: f32,
    pub full_combo: bool,
}

pub struct RemoteClient {
    http: reqwest::Client,
    base: String,
}

impl RemoteClient {
    pub fn new(base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_owned(),
        })
    }

    /// Resolves a bearer token to the user it belongs to.
    pub async fn me(&self, token: &str) -> Result<RemoteUser> {
        let resp = self
            .http
            .get(format!("{}/me", self.base))
            .bearer_auth(token)
            .send()
            .await
            .context("identity service unreachable")?;
        if !resp.status().is_success() {
            bail!("identity service rejected the token ({})", resp.status());
        }
        resp.json().await.context("malformed identity response")
    }

    /// Resolves a chart's display name, degrading to `Chart{id}` on any
    /// failure. Chart names are cosmetic and must never block a room
    /// operation.
    pub async fn chart_name(&self, id: i32) -> String {
        match self.chart(id).await {
            Ok(chart) => chart.name,
            Err(err) => {
                tracing::warn!(chart_id = id, ?err, "chart lookup failed, using fallback");
                format!("Chart{id}")
            }
        }
    }

    async fn chart(&self, id: i32) -> Result<RemoteChart> {
        let resp = self
            .http
            .get(format!("{}/chart/{id}", self.base))
            .send()
            .await?;
        if !resp.status().is_success() {
            bail!("chart service returned {}", resp.status());
        }
        Ok(resp.json().await?)
    }

    /// Fetches a play record for authenticity checks on `Played`.
    pub async fn record(&self, id: i32) -> Result<RemoteRecord> {
        let resp = self
            .http
            .get(format!("{}/record/{id}", self.base))
            .send()
            .await
            .context("record service unreachable")?;
        if !resp.status().is_success() {
            bail!("record service returned {}", resp.status());
        }
        resp.json().await.context("malformed record response")
    }
}
