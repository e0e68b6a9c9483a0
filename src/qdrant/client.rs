//! HTTP client implementing the vector store contract on top of Qdrant.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde_json::{Value, json};
use tokio::sync::OnceCell;
use uuid::Uuid;

use super::filters::document_filter;
use super::types::{QdrantError, ScrollResponse};
use crate::pipeline::DocumentId;
use crate::stores::{StoreError, VectorPoint, VectorStore};

/// Payload fields indexed for filtering.
const PAYLOAD_INDEXES: [(&str, &str); 4] = [
    ("document_id", "keyword"),
    ("doc_type", "keyword"),
    ("top_section", "keyword"),
    ("indexed_at", "datetime"),
];

/// Qdrant collection holding chunk vectors.
pub struct QdrantVectorStore {
    pub(crate) client: Client,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    pub(crate) collection: String,
    pub(crate) ready: OnceCell<()>,
}

impl QdrantVectorStore {
    /// Construct a client for `collection` at `url`.
    pub fn new(
        url: &str,
        collection: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, QdrantError> {
        let client = Client::builder().user_agent("sitedocs/0.1").build()?;
        let base_url = normalize_base_url(url).map_err(QdrantError::InvalidUrl)?;
        let collection = collection.into();
        tracing::debug!(
            url = %base_url,
            collection = %collection,
            has_api_key = %api_key.as_deref().is_some_and(|value| !value.is_empty()),
            "Initialized Qdrant HTTP client"
        );

        Ok(Self {
            client,
            base_url,
            api_key,
            collection,
            ready: OnceCell::new(),
        })
    }

    /// Create the collection only when it is missing from Qdrant.
    pub async fn create_collection_if_not_exists(
        &self,
        vector_size: u64,
    ) -> Result<(), QdrantError> {
        if self.collection_exists().await? {
            return Ok(());
        }

        tracing::debug!(collection = %self.collection, vector_size, "Creating collection");
        let body = json!({
            "vectors": {
                "size": vector_size,
                "distance": "Cosine"
            }
        });

        let response = self
            .request(Method::PUT, &format!("collections/{}", self.collection))
            .json(&body)
            .send()
            .await?;

        self.ensure_success(response, || {
            tracing::debug!(collection = %self.collection, "Collection ensured/created");
        })
        .await
    }

    /// Ensure payload indexes used by document filters exist.
    pub async fn ensure_payload_indexes(&self) -> Result<(), QdrantError> {
        for (field, schema) in PAYLOAD_INDEXES {
            let body = json!({
                "field_name": field,
                "field_schema": schema,
            });

            let response = self
                .request(Method::PUT, &format!("collections/{}/index", self.collection))
                .json(&body)
                .send()
                .await?;

            if response.status().is_success() {
                tracing::debug!(collection = %self.collection, field, schema, "Payload index ensured");
            } else if response.status() == StatusCode::CONFLICT {
                tracing::debug!(collection = %self.collection, field, schema, "Payload index already exists");
            } else {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let error = QdrantError::UnexpectedStatus { status, body };
                tracing::warn!(collection = %self.collection, field, schema, error = %error, "Failed to ensure payload index");
            }
        }

        Ok(())
    }

    async fn collection_exists(&self) -> Result<bool, QdrantError> {
        let response = self
            .request(Method::GET, &format!("collections/{}", self.collection))
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                let error = QdrantError::UnexpectedStatus { status, body };
                tracing::error!(collection = %self.collection, error = %error, "Collection existence check failed");
                Err(error)
            }
        }
    }

    async fn scroll_ids(&self, filter: Value) -> Result<Vec<String>, QdrantError> {
        let mut offset: Option<Value> = None;
        let mut ids = Vec::new();

        loop {
            let mut body = json!({
                "with_payload": false,
                "with_vector": false,
                "limit": 512,
                "filter": filter.clone(),
            });
            if let (Some(next), Some(object)) = (offset.take(), body.as_object_mut()) {
                object.insert("offset".into(), next);
            }

            let response = self
                .request(
                    Method::POST,
                    &format!("collections/{}/points/scroll", self.collection),
                )
                .json(&body)
                .send()
                .await?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let error = QdrantError::UnexpectedStatus { status, body };
                tracing::error!(collection = %self.collection, error = %error, "Failed to scroll point ids");
                return Err(error);
            }

            let ScrollResponse { result } = response.json().await?;
            ids.extend(result.points.into_iter().filter_map(|point| point.id).map(stringify_point_id));

            match result.next_page_offset {
                Some(Value::Null) | None => break,
                Some(next) => offset = Some(next),
            }
        }

        Ok(ids)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format_endpoint(&self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            req = req.header("api-key", api_key);
        }
        req
    }

    async fn ensure_success<F>(
        &self,
        response: reqwest::Response,
        on_success: F,
    ) -> Result<(), QdrantError>
    where
        F: FnOnce(),
    {
        if response.status().is_success() {
            on_success();
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = QdrantError::UnexpectedStatus { status, body };
            tracing::error!(error = %error, "Qdrant request failed");
            Err(error)
        }
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    fn name(&self) -> &'static str {
        "qdrant"
    }

    async fn ensure_ready(&self, dimension: usize) -> Result<(), StoreError> {
        self.ready
            .get_or_try_init(|| async {
                self.create_collection_if_not_exists(dimension as u64).await?;
                self.ensure_payload_indexes().await
            })
            .await?;
        Ok(())
    }

    async fn upsert(&self, points: Vec<VectorPoint>) -> Result<(), StoreError> {
        if points.is_empty() {
            return Ok(());
        }

        let serialized: Vec<Value> = points
            .into_iter()
            .map(|point| {
                let mut payload = point.payload;
                payload.insert(
                    "document_id".into(),
                    Value::String(point.document_id.to_string()),
                );
                json!({
                    "id": point.id.to_string(),
                    "vector": point.vector,
                    "payload": payload,
                })
            })
            .collect();

        let point_count = serialized.len();
        let response = self
            .request(
                Method::PUT,
                &format!("collections/{}/points", self.collection),
            )
            .query(&[("wait", true)])
            .json(&json!({ "points": serialized }))
            .send()
            .await
            .map_err(QdrantError::from)?;

        self.ensure_success(response, || {
            tracing::debug!(collection = %self.collection, points = point_count, "Points indexed");
        })
        .await?;
        Ok(())
    }

    async fn delete_document(&self, document_id: DocumentId) -> Result<(), StoreError> {
        let response = self
            .request(
                Method::POST,
                &format!("collections/{}/points/delete", self.collection),
            )
            .query(&[("wait", true)])
            .json(&json!({ "filter": document_filter(document_id) }))
            .send()
            .await
            .map_err(QdrantError::from)?;

        self.ensure_success(response, || {
            tracing::debug!(collection = %self.collection, %document_id, "Document points deleted");
        })
        .await?;
        Ok(())
    }

    async fn chunk_ids(&self, document_id: DocumentId) -> Result<Vec<Uuid>, StoreError> {
        let raw = self.scroll_ids(document_filter(document_id)).await?;
        let mut ids: Vec<Uuid> = raw
            .iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

fn stringify_point_id(id: Value) -> String {
    match id {
        Value::String(text) => text,
        Value::Number(number) => number.to_string(),
        Value::Object(map) => map
            .get("uuid")
            .map(|value| match value {
                Value::String(uuid) => uuid.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| Value::Object(map).to_string()),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
