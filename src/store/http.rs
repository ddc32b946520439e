//! HTTP store backend.
//!
//! Talks to the graph store's REST surface. Paths are versioned under
//! `/api/v1/`; record references travel as query parameters because
//! diagram refs contain slashes. Conditional writes answer 409 when
//! the version check fails, which maps to [`StoreError::Conflict`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::models::{
    AnnotationEdge, AnnotationState, CandidateAsset, DiagramNode, ScopeKey,
};

use super::{
    BatchCommit, DiagramFilter, EdgeFilter, GraphStore, KvTable, Page, StateFilter, StoreError,
    StoreResult,
};

pub struct HttpStore {
    client: Client,
    base_url: Url,
    api_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListEnvelope<T> {
    items: Vec<T>,
    #[serde(default)]
    next_cursor: Option<String>,
}

impl<T> From<ListEnvelope<T>> for Page<T> {
    fn from(env: ListEnvelope<T>) -> Self {
        Page {
            items: env.items,
            next_cursor: env.next_cursor,
        }
    }
}

#[derive(Serialize)]
struct StateWriteBody<'a> {
    state: &'a AnnotationState,
    expected_version: Option<u64>,
}

#[derive(Serialize)]
struct CommitItemBody<'a> {
    state: &'a AnnotationState,
    expected_version: u64,
    edges: &'a [AnnotationEdge],
    label_swap: Option<&'a super::LabelSwap>,
}

#[derive(Serialize)]
struct BatchBody<'a> {
    items: Vec<CommitItemBody<'a>>,
}

#[derive(Deserialize)]
struct BatchResponse {
    states: Vec<AnnotationState>,
}

#[derive(Serialize)]
struct KvPutBody<'a> {
    table: &'a str,
    key: &'a str,
    value: &'a str,
}

#[derive(Deserialize)]
struct KvValueEnvelope {
    value: String,
}

#[derive(Deserialize)]
struct DeletedResponse {
    deleted: u64,
}

fn edge_filter_params(filter: &EdgeFilter) -> Vec<(&'static str, String)> {
    let mut params: Vec<(&'static str, String)> = Vec::new();
    if let Some(pipeline) = &filter.pipeline {
        params.push(("pipeline", pipeline.clone()));
    }
    if let Some(diagram) = &filter.diagram_ref {
        params.push(("diagram", diagram.clone()));
    }
    if let Some(status) = filter.status {
        params.push(("status", status.as_str().to_string()));
    }
    if let Some(target) = &filter.target {
        params.push(("target", target.to_string()));
    }
    if let Some(tag) = filter.without_tag {
        params.push(("without_tag", tag.as_str().to_string()));
    }
    params
}

impl HttpStore {
    pub fn new(
        base_url: &str,
        api_token: Option<String>,
        timeout: Duration,
    ) -> StoreResult<Self> {
        // A trailing slash keeps Url::join from eating the last path
        // segment of a base like "http://host/store".
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalized)
            .map_err(|e| StoreError::Connection(format!("invalid store URL: {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            api_token,
        })
    }

    fn request(&self, method: Method, path: &str) -> StoreResult<RequestBuilder> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| StoreError::Connection(format!("invalid path {path}: {e}")))?;
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }
        Ok(builder)
    }

    async fn send(&self, builder: RequestBuilder, reference: &str) -> StoreResult<Response> {
        let resp = builder
            .send()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        self.check(resp, reference, None).await
    }

    /// Map error statuses onto the store error taxonomy. A known
    /// expected version turns 409 into a conflict the caller can
    /// recognize as "lost the race".
    async fn check(
        &self,
        resp: Response,
        reference: &str,
        expected_version: Option<u64>,
    ) -> StoreResult<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        match status {
            StatusCode::NOT_FOUND => Err(StoreError::NotFound {
                reference: reference.to_string(),
            }),
            StatusCode::CONFLICT => Err(StoreError::Conflict {
                reference: reference.to_string(),
                expected: expected_version.unwrap_or(0),
            }),
            _ => {
                let message = resp.text().await.unwrap_or_default();
                Err(StoreError::Api {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }

    async fn parse<T: serde::de::DeserializeOwned>(&self, resp: Response) -> StoreResult<T> {
        resp.json::<T>()
            .await
            .map_err(|e| StoreError::Parse(e.to_string()))
    }
}

#[async_trait]
impl GraphStore for HttpStore {
    async fn ping(&self) -> StoreResult<()> {
        let req = self.request(Method::GET, "api/v1/ping")?;
        self.send(req, "ping").await?;
        Ok(())
    }

    async fn get_diagram(&self, diagram_ref: &str) -> StoreResult<DiagramNode> {
        let req = self
            .request(Method::GET, "api/v1/diagram")?
            .query(&[("ref", diagram_ref)]);
        let resp = self.send(req, diagram_ref).await?;
        self.parse(resp).await
    }

    async fn list_diagrams(
        &self,
        filter: &DiagramFilter,
        cursor: Option<&str>,
    ) -> StoreResult<Page<DiagramNode>> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(site) = &filter.site {
            params.push(("site", site.clone()));
        }
        if let Some(label) = &filter.label {
            params.push(("label", label.clone()));
        }
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        let req = self.request(Method::GET, "api/v1/diagrams")?.query(&params);
        let resp = self.send(req, "diagrams").await?;
        let env: ListEnvelope<DiagramNode> = self.parse(resp).await?;
        Ok(env.into())
    }

    async fn get_state(
        &self,
        diagram_ref: &str,
        pipeline: &str,
    ) -> StoreResult<Option<AnnotationState>> {
        let req = self
            .request(Method::GET, "api/v1/state")?
            .query(&[("diagram", diagram_ref), ("pipeline", pipeline)]);
        let reference = format!("{diagram_ref}@{pipeline}");
        match self.send(req, &reference).await {
            Ok(resp) => Ok(Some(self.parse(resp).await?)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn list_states(
        &self,
        filter: &StateFilter,
        cursor: Option<&str>,
    ) -> StoreResult<Page<AnnotationState>> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(pipeline) = &filter.pipeline {
            params.push(("pipeline", pipeline.clone()));
        }
        if !filter.statuses.is_empty() {
            let statuses: Vec<&str> = filter.statuses.iter().map(|s| s.as_str()).collect();
            params.push(("status", statuses.join(",")));
        }
        if let Some(diagram) = &filter.diagram_ref {
            params.push(("diagram", diagram.clone()));
        }
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        let req = self.request(Method::GET, "api/v1/states")?.query(&params);
        let resp = self.send(req, "states").await?;
        let env: ListEnvelope<AnnotationState> = self.parse(resp).await?;
        Ok(env.into())
    }

    async fn put_state(
        &self,
        state: &AnnotationState,
        expected_version: Option<u64>,
    ) -> StoreResult<AnnotationState> {
        let reference = format!("{}@{}", state.diagram_ref, state.pipeline);
        debug!(reference = %reference, status = state.status.as_str(), "writing state");
        let body = StateWriteBody {
            state,
            expected_version,
        };
        let req = self.request(Method::PUT, "api/v1/state")?.json(&body);
        let resp = req
            .send()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let resp = self.check(resp, &reference, expected_version).await?;
        self.parse(resp).await
    }

    async fn commit_batch(&self, commit: BatchCommit) -> StoreResult<Vec<AnnotationState>> {
        let reference = commit
            .items
            .first()
            .map(|item| format!("{}@{}", item.state.diagram_ref, item.state.pipeline))
            .unwrap_or_else(|| "batch".to_string());
        let expected = commit.items.first().map(|item| item.expected_version);
        debug!(
            reference = %reference,
            states = commit.items.len(),
            edges = commit.items.iter().map(|i| i.edges.len()).sum::<usize>(),
            "committing conditional batch"
        );
        let body = BatchBody {
            items: commit
                .items
                .iter()
                .map(|item| CommitItemBody {
                    state: &item.state,
                    expected_version: item.expected_version,
                    edges: &item.edges,
                    label_swap: item.label_swap.as_ref(),
                })
                .collect(),
        };
        let req = self.request(Method::POST, "api/v1/batch")?.json(&body);
        let resp = req
            .send()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let resp = self.check(resp, &reference, expected).await?;
        let parsed: BatchResponse = self.parse(resp).await?;
        Ok(parsed.states)
    }

    async fn list_edges(
        &self,
        filter: &EdgeFilter,
        cursor: Option<&str>,
    ) -> StoreResult<Page<AnnotationEdge>> {
        let mut params = edge_filter_params(filter);
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        let req = self.request(Method::GET, "api/v1/edges")?.query(&params);
        let resp = self.send(req, "edges").await?;
        let env: ListEnvelope<AnnotationEdge> = self.parse(resp).await?;
        Ok(env.into())
    }

    async fn update_edge(&self, edge: &AnnotationEdge) -> StoreResult<AnnotationEdge> {
        let req = self.request(Method::PUT, "api/v1/edge")?.json(edge);
        let resp = self.send(req, &edge.external_id).await?;
        self.parse(resp).await
    }

    async fn delete_edges(&self, filter: &EdgeFilter) -> StoreResult<u64> {
        let params = edge_filter_params(filter);
        let req = self.request(Method::DELETE, "api/v1/edges")?.query(&params);
        let resp = self.send(req, "edges").await?;
        let body: DeletedResponse = self.parse(resp).await?;
        Ok(body.deleted)
    }

    async fn list_assets(
        &self,
        scope: &ScopeKey,
        cursor: Option<&str>,
    ) -> StoreResult<Page<CandidateAsset>> {
        let mut params: Vec<(&str, String)> = vec![("site", scope.site.clone())];
        if let Some(unit) = &scope.unit {
            params.push(("unit", unit.clone()));
        }
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        let req = self.request(Method::GET, "api/v1/assets")?.query(&params);
        let resp = self.send(req, &scope.token()).await?;
        let env: ListEnvelope<CandidateAsset> = self.parse(resp).await?;
        Ok(env.into())
    }

    async fn find_assets_by_alias(
        &self,
        scope: &ScopeKey,
        alias: &str,
    ) -> StoreResult<Vec<CandidateAsset>> {
        let mut params: Vec<(&str, String)> = vec![
            ("site", scope.site.clone()),
            ("alias", alias.to_string()),
        ];
        if let Some(unit) = &scope.unit {
            params.push(("unit", unit.clone()));
        }
        let req = self
            .request(Method::GET, "api/v1/assets/lookup")?
            .query(&params);
        let resp = self.send(req, alias).await?;
        self.parse(resp).await
    }
}

#[async_trait]
impl KvTable for HttpStore {
    async fn get(&self, table: &str, key: &str) -> StoreResult<Option<String>> {
        let req = self
            .request(Method::GET, "api/v1/kv")?
            .query(&[("table", table), ("key", key)]);
        match self.send(req, key).await {
            Ok(resp) => {
                let env: KvValueEnvelope = self.parse(resp).await?;
                Ok(Some(env.value))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn put(&self, table: &str, key: &str, value: &str) -> StoreResult<()> {
        let body = KvPutBody { table, key, value };
        let req = self.request(Method::PUT, "api/v1/kv")?.json(&body);
        self.send(req, key).await?;
        Ok(())
    }

    async fn delete(&self, table: &str, key: &str) -> StoreResult<()> {
        let req = self
            .request(Method::DELETE, "api/v1/kv")?
            .query(&[("table", table), ("key", key)]);
        match self.send(req, key).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn scan(
        &self,
        table: &str,
        prefix: &str,
        cursor: Option<&str>,
    ) -> StoreResult<Page<(String, String)>> {
        #[derive(Deserialize)]
        struct KvRow {
            key: String,
            value: String,
        }
        let mut params: Vec<(&str, String)> = vec![
            ("table", table.to_string()),
            ("prefix", prefix.to_string()),
        ];
        if let Some(cursor) = cursor {
            params.push(("cursor", cursor.to_string()));
        }
        let req = self.request(Method::GET, "api/v1/kv/scan")?.query(&params);
        let resp = self.send(req, table).await?;
        let env: ListEnvelope<KvRow> = self.parse(resp).await?;
        Ok(Page {
            items: env.items.into_iter().map(|r| (r.key, r.value)).collect(),
            next_cursor: env.next_cursor,
        })
    }
}
