//! HTTP detection service backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::models::JobId;

use super::{
    DetectError, DetectRequest, DetectResult, DetectionService, JobStatus, RawDetection,
};

pub struct HttpDetectionService {
    client: Client,
    base_url: Url,
    api_token: Option<String>,
}

#[derive(Deserialize)]
struct SubmitResponse {
    job_id: JobId,
}

#[derive(Deserialize)]
struct ResultsResponse {
    detections: Vec<RawDetection>,
    next_cursor: Option<String>,
}

impl HttpDetectionService {
    pub fn new(
        base_url: &str,
        api_token: Option<String>,
        timeout: Duration,
    ) -> DetectResult<Self> {
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized)
            .map_err(|e| DetectError::Connection(format!("invalid detect URL: {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DetectError::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            api_token,
        })
    }

    fn request(&self, method: Method, path: &str) -> DetectResult<RequestBuilder> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| DetectError::Connection(format!("invalid path {path}: {e}")))?;
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }
        Ok(builder)
    }

    async fn send(&self, builder: RequestBuilder, job_ref: &str) -> DetectResult<Response> {
        let resp = builder
            .send()
            .await
            .map_err(|e| DetectError::Connection(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        match status {
            StatusCode::NOT_FOUND => Err(DetectError::JobNotFound(job_ref.to_string())),
            StatusCode::UNPROCESSABLE_ENTITY | StatusCode::BAD_REQUEST => {
                let message = resp.text().await.unwrap_or_default();
                Err(DetectError::InvalidRequest(message))
            }
            _ => {
                let message = resp.text().await.unwrap_or_default();
                Err(DetectError::Api {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }

    async fn parse<T: serde::de::DeserializeOwned>(&self, resp: Response) -> DetectResult<T> {
        resp.json::<T>()
            .await
            .map_err(|e| DetectError::Parse(e.to_string()))
    }
}

#[async_trait]
impl DetectionService for HttpDetectionService {
    async fn submit(&self, request: DetectRequest) -> DetectResult<JobId> {
        debug!(
            diagrams = request.items.len(),
            "submitting detection job"
        );
        let req = self.request(Method::POST, "api/v1/jobs")?.json(&request);
        let resp = self.send(req, "submit").await?;
        let body: SubmitResponse = self.parse(resp).await?;
        Ok(body.job_id)
    }

    async fn job_status(&self, job_id: &JobId) -> DetectResult<JobStatus> {
        let req = self.request(Method::GET, &format!("api/v1/jobs/{}", job_id.as_str()))?;
        let resp = self.send(req, job_id.as_str()).await?;
        self.parse(resp).await
    }

    async fn job_results(&self, job_id: &JobId) -> DetectResult<Vec<RawDetection>> {
        let path = format!("api/v1/jobs/{}/results", job_id.as_str());
        let mut detections = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut req = self.request(Method::GET, &path)?;
            if let Some(ref cursor) = cursor {
                req = req.query(&[("cursor", cursor.as_str())]);
            }
            let resp = self.send(req, job_id.as_str()).await?;
            let body: ResultsResponse = self.parse(resp).await?;
            detections.extend(body.detections);
            match body.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(detections)
    }

    async fn cancel(&self, job_id: &JobId) -> DetectResult<()> {
        let req = self.request(
            Method::DELETE,
            &format!("api/v1/jobs/{}", job_id.as_str()),
        )?;
        match self.send(req, job_id.as_str()).await {
            Ok(_) | Err(DetectError::JobNotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn ping(&self) -> DetectResult<()> {
        let req = self.request(Method::GET, "api/v1/ping")?;
        self.send(req, "ping").await?;
        Ok(())
    }
}
