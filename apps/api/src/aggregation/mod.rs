//! Source aggregation: the run unit the scheduler drives in production.
//!
//! Flow per run: fetch every source concurrently → collect per-source
//! outcomes → dedupe by normalized URL → count listings not seen before.
//!
//! A failing source never fails the run; it is reported with `found = 0`
//! and its error message.

pub mod feed;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::scheduler::{RunReport, RunUnit, SourceOutcome};

/// A job posting as returned by a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobListing {
    pub title: String,
    pub company: String,
    pub url: String,
    #[serde(default)]
    pub location: Option<String>,
}

impl JobListing {
    /// Dedup key: lower-cased URL without trailing slashes.
    pub fn normalized_url(&self) -> String {
        self.url.trim().to_lowercase().trim_end_matches('/').to_string()
    }
}

/// Anything that can produce job listings.
#[async_trait]
pub trait JobSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, limit: usize) -> anyhow::Result<Vec<JobListing>>;
}

pub struct SourceAggregator {
    sources: Vec<Arc<dyn JobSource>>,
    limit_per_source: usize,
    /// Normalized URLs seen by earlier runs of this aggregator.
    seen: Mutex<HashSet<String>>,
}

impl SourceAggregator {
    pub fn new(sources: Vec<Arc<dyn JobSource>>, limit_per_source: usize) -> Self {
        Self {
            sources,
            limit_per_source,
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Fetches from all sources and reports counts plus the unique listings.
    pub async fn aggregate(&self) -> (RunReport, Vec<JobListing>) {
        let fetches = self
            .sources
            .iter()
            .map(|source| source.fetch(self.limit_per_source));
        let results = join_all(fetches).await;

        let mut all = Vec::new();
        let mut outcomes = Vec::with_capacity(self.sources.len());

        for (source, result) in self.sources.iter().zip(results) {
            match result {
                Ok(listings) => {
                    debug!("{} returned {} listings", source.name(), listings.len());
                    outcomes.push(SourceOutcome {
                        name: source.name().to_string(),
                        found: listings.len() as u64,
                        error: None,
                    });
                    all.extend(listings);
                }
                Err(e) => {
                    warn!("Error from {}: {e:#}", source.name());
                    outcomes.push(SourceOutcome {
                        name: source.name().to_string(),
                        found: 0,
                        error: Some(format!("{e:#}")),
                    });
                }
            }
        }

        let total_found = all.len() as u64;
        let unique = dedupe(all);
        let duplicates_removed = total_found - unique.len() as u64;

        let total_new = {
            let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
            unique
                .iter()
                .filter(|l| seen.insert(l.normalized_url()))
                .count() as u64
        };

        let report = RunReport {
            total_found,
            total_new,
            duplicates_removed,
            sources: outcomes,
        };
        (report, unique)
    }
}

#[async_trait]
impl RunUnit for SourceAggregator {
    async fn run(&self) -> anyhow::Result<RunReport> {
        let (report, _) = self.aggregate().await;
        Ok(report)
    }
}

/// Keeps the first listing for each normalized URL, preserving order.
fn dedupe(listings: Vec<JobListing>) -> Vec<JobListing> {
    let mut seen = HashSet::new();
    listings
        .into_iter()
        .filter(|l| seen.insert(l.normalized_url()))
        .collect()
}
