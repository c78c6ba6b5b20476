//! JSON feed source: GETs a URL that returns an array of job listings.
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;

use super::{JobListing, JobSource};

const FEED_TIMEOUT: Duration = Duration::from_secs(30);

pub struct FeedSource {
    name: String,
    url: String,
    client: Client,
}

impl FeedSource {
    pub fn new(name: String, url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(FEED_TIMEOUT)
            .build()
            .context("Failed to build feed HTTP client")?;
        Ok(Self { name, url, client })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl JobSource for FeedSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, limit: usize) -> Result<Vec<JobListing>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", self.url))?
            .error_for_status()
            .with_context(|| format!("{} returned an error status", self.url))?;

        let mut listings: Vec<JobListing> = response
            .json()
            .await
            .with_context(|| format!("{} did not return a listing array", self.url))?;

        listings.truncate(limit);
        Ok(listings)
    }
}

/// Parses `name=url,name=url`. Bare URLs are named after themselves.
pub fn parse_feed_spec(spec: &str) -> Vec<(String, String)> {
    spec.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=').filter(|(name, _)| !name.contains("://")) {
            Some((name, url)) => (name.trim().to_string(), url.trim().to_string()),
            None => (entry.to_string(), entry.to_string()),
        })
        .collect()
}
