use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// What the page-fetch collaborator hands back for one URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageData {
    pub success: bool,
    #[serde(default)]
    pub html: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub screenshot: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// The headless-browser page fetch, kept behind a trait so the pipeline never
/// depends on the fetch mechanism itself.
#[async_trait]
pub trait BrowserFetcher: Send + Sync {
    async fn fetch(&self, url: &str, wait_time: u32, include_screenshot: bool)
    -> Result<PageData>;
}

#[derive(Serialize)]
struct FetchRequest<'a> {
    url: &'a str,
    wait_time: u32,
    include_screenshot: bool,
}

/// Fetches pages through a remote headless-browser service that renders the
/// page and returns html, extracted text and an optional screenshot.
pub struct HttpBrowserFetcher {
    endpoint: String,
    client: Client,
}

impl HttpBrowserFetcher {
    pub fn new(endpoint: String) -> Self {
        Self {
            endpoint,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl BrowserFetcher for HttpBrowserFetcher {
    async fn fetch(
        &self,
        url: &str,
        wait_time: u32,
        include_screenshot: bool,
    ) -> Result<PageData> {
        let req = FetchRequest {
            url,
            wait_time,
            include_screenshot,
        };
        let res = self
            .client
            .post(&self.endpoint)
            .json(&req)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(anyhow!(
                "Browser fetch service error {}: {}",
                res.status(),
                res.text().await.unwrap_or_default()
            ));
        }
        let page: PageData = res.json().await?;
        Ok(page)
    }
}
