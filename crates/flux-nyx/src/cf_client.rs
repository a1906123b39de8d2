//! Third-party site (Codeforces) HTTP client: `GET` submission listings by
//! handle, with the `{status, result, comment}` response envelope from
//! §6's external interfaces.

use serde::{Deserialize, Serialize};
use tracing::warn;

use flux_store::normalize_verdict;

/// One status entry in a site listing response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CfSubStatus {
    pub id: i64,
    pub verdict: String,
    #[serde(rename = "timeConsumedMillis", default)]
    pub time_consumed_millis: i64,
    #[serde(rename = "memoryConsumedBytes", default)]
    pub memory_consumed_bytes: i64,
    #[serde(rename = "passedTestCount", default)]
    pub passed_test_count: i64,
}

impl CfSubStatus {
    /// Normalizes an empty verdict string to `"TESTING"`.
    pub fn normalized_verdict(&self) -> String {
        normalize_verdict(&self.verdict).to_string()
    }
}

#[derive(Debug, Deserialize)]
struct SiteEnvelope {
    status: String,
    #[serde(default)]
    result: Vec<CfSubStatus>,
    #[serde(default)]
    comment: Option<String>,
}

/// Wraps `reqwest::Client` with the one query shape the Bot Monitor needs.
#[derive(Clone)]
pub struct CfClient {
    http: reqwest::Client,
    query_url_template: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CfClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("site returned FAILED: {0}")]
    SiteFailed(String),
}

impl CfClient {
    pub fn new(query_url_template: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            query_url_template: query_url_template.into(),
        }
    }

    fn url_for(&self, handle: &str, from: u32, count: u32) -> String {
        self.query_url_template
            .replace("{handle}", handle)
            .replace("{from}", &from.to_string())
            .replace("{count}", &count.to_string())
    }

    /// `GET {handle, from, count}`; used both for the Bot Monitor's
    /// cold-start listing refresh and for `get_latest_submission`
    /// (`count=1`).
    pub async fn list_submissions(
        &self,
        handle: &str,
        from: u32,
        count: u32,
    ) -> Result<Vec<CfSubStatus>, CfClientError> {
        let url = self.url_for(handle, from, count);
        let envelope: SiteEnvelope = self.http.get(&url).send().await?.json().await?;

        if envelope.status != "OK" {
            let comment = envelope.comment.unwrap_or_default();
            warn!(handle, comment = %comment, "site reported FAILED status");
            return Err(CfClientError::SiteFailed(comment));
        }
        Ok(envelope.result)
    }

    /// Convenience wrapper for the Worker Adapter's "did our latest
    /// submission land yet" poll.
    pub async fn latest_submission(&self, handle: &str) -> Result<Option<CfSubStatus>, CfClientError> {
        Ok(self.list_submissions(handle, 1, 1).await?.into_iter().next())
    }
}

/// The worker wire protocol request, one JSON line per §6.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSubmitRequest {
    pub req_type: String,
    pub platform: String,
    pub solution: WorkerSolution,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSolution {
    pub cookies: std::collections::HashMap<String, String>,
    pub language: String,
    pub solution_file_path: String,
    pub bot_name: String,
    pub site_problem_code: String,
    pub submission_id: String,
}

/// The worker wire protocol response.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSubmitResponse {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub user_error: bool,
    #[serde(default)]
    pub cookies: std::collections::HashMap<String, String>,
}

/// The wire-protocol sentinel meaning "the bot became unusable".
pub const BOT_ERROR_SENTINEL: &str = "bot";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_template_substitutes_all_placeholders() {
        let client = CfClient::new("https://cf.example/status?handle={handle}&from={from}&count={count}");
        let url = client.url_for("tourist", 1, 50);
        assert_eq!(url, "https://cf.example/status?handle=tourist&from=1&count=50");
    }

    #[test]
    fn normalized_verdict_maps_empty_to_testing() {
        let status = CfSubStatus {
            id: 1,
            verdict: String::new(),
            time_consumed_millis: 0,
            memory_consumed_bytes: 0,
            passed_test_count: 0,
        };
        assert_eq!(status.normalized_verdict(), "TESTING");
    }
}
