//! Elasticsearch REST client.

use async_trait::async_trait;
use processor_core::{Error, Result};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::backend::{CopyMode, SearchBackend};
use crate::config::SearchConfig;
use crate::index::{index_pattern, parse_index_time, IndexMeta, SearchIndex};

/// Longest error body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

/// Elasticsearch client over the REST API, rotating across configured nodes.
pub struct ElasticsearchClient {
    http: reqwest::Client,
    nodes: Vec<Url>,
    next_node: AtomicUsize,
    username: Option<String>,
    password: Option<String>,
    reindex_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct CatIndex {
    index: String,
    #[serde(rename = "docs.count")]
    docs_count: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct ReindexResponse {
    #[serde(default)]
    created: u64,
    #[serde(default)]
    updated: u64,
    #[serde(default)]
    failures: Vec<Value>,
}

impl ElasticsearchClient {
    /// Creates a new client.
    pub fn new(config: &SearchConfig) -> Result<Self> {
        if config.nodes.is_empty() {
            return Err(Error::config("no Elasticsearch nodes configured"));
        }

        let nodes = config
            .nodes
            .iter()
            .map(|node| {
                Url::parse(node.trim())
                    .map_err(|e| Error::config(format!("invalid Elasticsearch node {}: {}", node, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {}", e)))?;

        info!(
            nodes = ?config.nodes,
            timeout_secs = config.timeout_secs,
            "Created Elasticsearch client"
        );

        Ok(Self {
            http,
            nodes,
            next_node: AtomicUsize::new(0),
            username: config.username.clone(),
            password: config.password.clone(),
            reindex_timeout: config.reindex_timeout(),
        })
    }

    /// Builds a URL on the next node; every segment is percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let i = self.next_node.fetch_add(1, Ordering::Relaxed) % self.nodes.len();
        let mut url = self.nodes[i].clone();
        url.path_segments_mut()
            .map_err(|_| Error::config(format!("node URL {} cannot be a base", self.nodes[i])))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_ref()),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| Error::search(format!("request failed: {}", e)))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let mut body = response.text().await.unwrap_or_default();
        body.truncate(MAX_ERROR_BODY);
        Err(Error::search_status(status, body))
    }

    async fn json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
        response
            .json()
            .await
            .map_err(|e| Error::search(format!("invalid response body: {}", e)))
    }

    async fn index_meta(&self, alias: &str) -> Result<HashMap<String, Value>> {
        let url = self.endpoint(&[&index_pattern(alias), "_mapping"])?;
        let mappings: HashMap<String, Value> =
            Self::json(self.send(self.request(Method::GET, url)).await?).await?;
        Ok(mappings)
    }

    async fn doc_counts(&self, alias: &str) -> Result<HashMap<String, u64>> {
        let mut url = self.endpoint(&["_cat", "indices", &index_pattern(alias)])?;
        url.query_pairs_mut()
            .append_pair("format", "json")
            .append_pair("h", "index,docs.count");
        let rows: Vec<CatIndex> = Self::json(self.send(self.request(Method::GET, url)).await?).await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let count = row.docs_count.and_then(|c| c.parse().ok()).unwrap_or(0);
                (row.index, count)
            })
            .collect())
    }
}

#[async_trait]
impl SearchBackend for ElasticsearchClient {
    async fn list_indices(&self, alias: &str) -> Result<Vec<SearchIndex>> {
        let mappings = self.index_meta(alias).await?;
        let counts = self.doc_counts(alias).await?;

        let mut indices = Vec::with_capacity(mappings.len());
        for (name, mapping) in mappings {
            let Some(created_at) = parse_index_time(alias, &name) else {
                continue;
            };

            // An index without readable state never passed verification.
            let meta = mapping
                .pointer("/mappings/_meta")
                .cloned()
                .and_then(|m| serde_json::from_value::<IndexMeta>(m).ok())
                .unwrap_or_else(|| IndexMeta::building(created_at));

            indices.push(SearchIndex {
                document_count: counts.get(&name).copied().unwrap_or(0),
                alias: alias.to_string(),
                name,
                meta,
            });
        }

        indices.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(indices)
    }

    async fn alias_targets(&self, alias: &str) -> Result<Vec<String>> {
        let url = self.endpoint(&["_alias", alias])?;
        match self.send(self.request(Method::GET, url)).await {
            Ok(response) => {
                let targets: HashMap<String, Value> = Self::json(response).await?;
                let mut targets: Vec<String> = targets.into_keys().collect();
                targets.sort();
                Ok(targets)
            }
            Err(Error::SearchStatus { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn create_index(&self, name: &str, meta: &IndexMeta) -> Result<()> {
        let url = self.endpoint(&[name])?;
        let body = json!({ "mappings": { "_meta": meta } });
        self.send(self.request(Method::PUT, url).json(&body)).await?;
        debug!(index = name, "Created index");
        Ok(())
    }

    async fn update_meta(&self, name: &str, meta: &IndexMeta) -> Result<()> {
        let url = self.endpoint(&[name, "_mapping"])?;
        let body = json!({ "_meta": meta });
        self.send(self.request(Method::PUT, url).json(&body)).await?;
        debug!(index = name, status = %meta.status, "Updated index state");
        Ok(())
    }

    async fn copy_documents(&self, source: &str, dest: &str, mode: CopyMode) -> Result<u64> {
        let mut url = self.endpoint(&["_reindex"])?;
        url.query_pairs_mut()
            .append_pair("refresh", "true")
            .append_pair("wait_for_completion", "true");

        let body = match mode {
            CopyMode::Overwrite => json!({
                "source": { "index": source },
                "dest": { "index": dest },
            }),
            CopyMode::CreateOnly => json!({
                "conflicts": "proceed",
                "source": { "index": source },
                "dest": { "index": dest, "op_type": "create" },
            }),
        };

        let request = self
            .request(Method::POST, url)
            .timeout(self.reindex_timeout)
            .json(&body);
        let result: ReindexResponse = Self::json(self.send(request).await?).await?;

        if !result.failures.is_empty() {
            warn!(
                source = source,
                dest = dest,
                failures = result.failures.len(),
                "Reindex reported failures"
            );
            return Err(Error::search(format!(
                "reindex {} -> {} had {} failures",
                source,
                dest,
                result.failures.len()
            )));
        }

        Ok(result.created + result.updated)
    }

    async fn count(&self, index: &str) -> Result<u64> {
        let refresh = self.endpoint(&[index, "_refresh"])?;
        self.send(self.request(Method::POST, refresh)).await?;

        let url = self.endpoint(&[index, "_count"])?;
        let result: CountResponse = Self::json(self.send(self.request(Method::GET, url)).await?).await?;
        Ok(result.count)
    }

    async fn swap_alias(&self, alias: &str, remove: &[String], add: &str) -> Result<()> {
        let mut actions: Vec<Value> = remove
            .iter()
            .filter(|index| index.as_str() != add)
            .map(|index| json!({ "remove": { "index": index, "alias": alias, "must_exist": false } }))
            .collect();
        actions.push(json!({ "add": { "index": add, "alias": alias } }));

        let url = self.endpoint(&["_aliases"])?;
        self.send(self.request(Method::POST, url).json(&json!({ "actions": actions })))
            .await?;
        Ok(())
    }

    async fn delete_index(&self, name: &str) -> Result<()> {
        let url = self.endpoint(&[name])?;
        match self.send(self.request(Method::DELETE, url)).await {
            Ok(_) => Ok(()),
            Err(Error::SearchStatus { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn index_document(&self, alias: &str, id: &str, document: &Value) -> Result<()> {
        let url = self.endpoint(&[alias, "_doc", id])?;
        self.send(self.request(Method::PUT, url).json(document)).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let url = self.endpoint(&[])?;
        self.send(self.request(Method::GET, url)).await?;
        Ok(())
    }
}
