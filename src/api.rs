/// api.rs – Async client for the account REST API.
///
/// Responsibilities:
///  - Load the account list (optionally filtered by group) and the group tabs
///  - Fetch the latest snapshot batch for the polling transport
///  - Fetch a single account's current snapshot on demand
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tracing::{debug, info};

use crate::connector::PollSource;
use crate::models::{AccountSeed, GroupInfo};
use crate::normalizer::normalize_account_row;

// ---------------------------------------------------------------------------
// ApiClient
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ApiClient {
    pub base_url: String,
    http: Client,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout_secs: f64) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs_f64(timeout_secs))
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // ------------------------------------------------------------------
    // Seed data
    // ------------------------------------------------------------------

    /// `GET /accounts[?group=<name>]`. Rows without a usable key are skipped.
    pub async fn fetch_accounts(&self, group: Option<&str>) -> Result<Vec<AccountSeed>> {
        let mut req = self.http.get(self.url("/accounts"));
        if let Some(g) = group {
            req = req.query(&[("group", g)]);
        }
        let body = self.get_json(req, "GET /accounts").await?;
        let Value::Array(rows) = body else {
            bail!("GET /accounts returned a non-array body");
        };
        let seeds: Vec<AccountSeed> = rows.iter().filter_map(normalize_account_row).collect();
        if seeds.len() < rows.len() {
            debug!(
                "Skipped {} account row(s) without a login key",
                rows.len() - seeds.len()
            );
        }
        info!(
            "Loaded {} account(s) for group {}",
            seeds.len(),
            group.unwrap_or("All")
        );
        Ok(seeds)
    }

    /// `GET /groups`, ordered by `sort_index` then name.
    pub async fn fetch_groups(&self) -> Result<Vec<GroupInfo>> {
        let body = self
            .get_json(self.http.get(self.url("/groups")), "GET /groups")
            .await?;
        let mut groups: Vec<GroupInfo> =
            serde_json::from_value(body).context("parsing group list")?;
        groups.sort_by(|a, b| {
            a.sort_index
                .cmp(&b.sort_index)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(groups)
    }

    // ------------------------------------------------------------------
    // Live data
    // ------------------------------------------------------------------

    /// `GET /snapshots/latest` as raw rows; the normalizer validates them.
    pub async fn fetch_latest_snapshots(&self) -> Result<Vec<Value>> {
        let body = self
            .get_json(
                self.http.get(self.url("/snapshots/latest")),
                "GET /snapshots/latest",
            )
            .await?;
        match body {
            Value::Array(rows) => Ok(rows),
            _ => bail!("GET /snapshots/latest returned a non-array body"),
        }
    }

    /// `GET /accounts/{login_hint}/snapshot`.
    pub async fn fetch_account_snapshot(&self, login_hint: &str) -> Result<Value> {
        let path = format!("/accounts/{}/snapshot", login_hint.trim());
        let what = format!("GET {path}");
        self.get_json(self.http.get(self.url(&path)), &what).await
    }

    async fn get_json(&self, req: RequestBuilder, what: &str) -> Result<Value> {
        let resp = req
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .with_context(|| format!("{what}: request failed"))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("{what} failed ({status}): {text}");
        }
        resp.json::<Value>()
            .await
            .with_context(|| format!("{what}: parsing response body"))
    }
}

#[async_trait]
impl PollSource for ApiClient {
    async fn fetch_latest(&self) -> Result<Vec<Value>> {
        self.fetch_latest_snapshots().await
    }
}
