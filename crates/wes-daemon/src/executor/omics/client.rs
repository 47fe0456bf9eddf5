// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Minimal HealthOmics and S3 REST client.
//!
//! Covers the calls the executor needs: StartRun, GetRun, ListRunTasks,
//! CancelRun and S3 GetObject. Every request is SigV4-signed.

use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::sigv4::{self, Credentials, SigningRequest};
use crate::executor::{ExecutorError, Result};

const OMICS_SERVICE: &str = "omics";
const S3_SERVICE: &str = "s3";
const TASK_PAGE_SIZE: u32 = 100;

/// Response of StartRun.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunResponse {
    pub id: String,
    #[serde(default)]
    pub arn: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Log location block of GetRun.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLocation {
    #[serde(default)]
    pub engine_log_stream: Option<String>,
    #[serde(default)]
    pub run_log_stream: Option<String>,
}

/// Response of GetRun, reduced to the fields the executor reads.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetail {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub output_uri: Option<String>,
    #[serde(default)]
    pub run_output_uri: Option<String>,
    #[serde(default)]
    pub log_location: Option<LogLocation>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop_time: Option<DateTime<Utc>>,
}

/// One item of ListRunTasks.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskPage {
    #[serde(default)]
    items: Vec<TaskSummary>,
    #[serde(default)]
    next_token: Option<String>,
}

/// HealthOmics REST client.
#[derive(Debug, Clone)]
pub struct OmicsClient {
    http: reqwest::Client,
    credentials: Credentials,
    region: String,
    endpoint: Url,
    s3_endpoint: Option<Url>,
}

impl OmicsClient {
    /// Create a client for `region`. `endpoint` and `s3_endpoint` override the
    /// public AWS endpoints; an S3 override switches to path-style addressing.
    pub fn new(
        credentials: Credentials,
        region: &str,
        endpoint: Option<&str>,
        s3_endpoint: Option<&str>,
    ) -> Result<Self> {
        let endpoint = match endpoint {
            Some(endpoint) => parse_endpoint(endpoint)?,
            None => parse_endpoint(&format!("https://workflows-omics.{}.amazonaws.com", region))?,
        };
        let s3_endpoint = s3_endpoint.map(parse_endpoint).transpose()?;

        Ok(Self {
            http: reqwest::Client::new(),
            credentials,
            region: region.to_string(),
            endpoint,
            s3_endpoint,
        })
    }

    /// Region requests are signed for.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Start a run. `body` is the StartRun request document.
    pub async fn start_run(&self, body: &Value) -> Result<StartRunResponse> {
        let url = self.omics_url(&["run"])?;
        let payload = serde_json::to_vec(body)?;
        self.send_json(Method::POST, url, payload).await
    }

    /// Fetch a run.
    pub async fn get_run(&self, omics_run_id: &str) -> Result<RunDetail> {
        let url = self.omics_url(&["run", omics_run_id])?;
        self.send_json(Method::GET, url, Vec::new()).await
    }

    /// List every task of a run, following pagination tokens.
    pub async fn list_run_tasks(&self, omics_run_id: &str) -> Result<Vec<TaskSummary>> {
        let mut tasks = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let mut url = self.omics_url(&["run", omics_run_id, "task"])?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("maxResults", &TASK_PAGE_SIZE.to_string());
                if let Some(token) = &token {
                    query.append_pair("startingToken", token);
                }
            }

            let page: TaskPage = self.send_json(Method::GET, url, Vec::new()).await?;
            tasks.extend(page.items);
            match page.next_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => break,
            }
        }

        Ok(tasks)
    }

    /// Cancel a run.
    pub async fn cancel_run(&self, omics_run_id: &str) -> Result<()> {
        let url = self.omics_url(&["run", omics_run_id, "cancel"])?;
        let response = self
            .send(Method::POST, url, Vec::new(), OMICS_SERVICE, &[])
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ExecutorError::from_status(status, body))
    }

    /// Download an S3 object. A missing object is `Ok(None)`.
    pub async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let url = self.s3_url(bucket, key)?;
        let empty_hash = sigv4::sha256_hex(b"");
        let response = self
            .send(
                Method::GET,
                url,
                Vec::new(),
                S3_SERVICE,
                &[("x-amz-content-sha256", empty_hash.as_str())],
            )
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutorError::from_status(status, body));
        }
        Ok(Some(response.bytes().await?.to_vec()))
    }

    fn omics_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ExecutorError::Config(format!("Invalid Omics endpoint: {}", self.endpoint))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn s3_url(&self, bucket: &str, key: &str) -> Result<Url> {
        let (mut url, mut segments) = match &self.s3_endpoint {
            Some(endpoint) => (endpoint.clone(), vec![bucket]),
            None => (
                parse_endpoint(&format!("https://{}.s3.{}.amazonaws.com", bucket, self.region))?,
                Vec::new(),
            ),
        };
        segments.extend(key.split('/'));
        url.path_segments_mut()
            .map_err(|_| ExecutorError::Config("S3 endpoint cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Vec<u8>,
    ) -> Result<T> {
        let response = self
            .send(
                method,
                url,
                body,
                OMICS_SERVICE,
                &[("content-type", "application/json")],
            )
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ExecutorError::from_status(status, text));
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Vec<u8>,
        service: &str,
        headers: &[(&str, &str)],
    ) -> Result<reqwest::Response> {
        let signed = sigv4::sign(
            &SigningRequest {
                method: method.as_str(),
                url: &url,
                headers,
                body: &body,
            },
            &self.credentials,
            &self.region,
            service,
            Utc::now(),
        )?;

        debug!(method = %method, url = %url, "Sending AWS request");

        let mut request = self.http.request(method, url);
        for (name, value) in headers.iter().copied() {
            request = request.header(name, value);
        }
        for (name, value) in signed {
            request = request.header(name, value);
        }
        request.body(body).send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                ExecutorError::Transient(e.to_string())
            } else {
                ExecutorError::Http(e)
            }
        })
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Url> {
    Url::parse(endpoint)
        .map_err(|e| ExecutorError::Config(format!("Invalid endpoint {}: {}", endpoint, e)))
}
