//! REST object store
//!
//! [`ObjectStore`] over the object service's REST surface:
//!
//! | op          | request                                                        |
//! |-------------|----------------------------------------------------------------|
//! | search      | `POST rest/model/search`                                       |
//! | create      | `POST rest/model`                                              |
//! | patch       | `PATCH rest/model`                                             |
//! | delete      | `DELETE rest/model/{type}/{id}`                                |
//! | member      | `GET rest/authorization/{type}/{id}/member/{type}/{id}/{add}`  |
//! | make path   | `GET rest/path/make/{type}/data/{path}`                        |
//! | clear cache | `GET rest/cache/clear/{type}`                                  |

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::debug;

use object_page_core::{
    Entity, EntityRef, MemberEdge, ObjectStore, Query, SearchResults, StoreError, StoreOp,
};

use crate::config::ClientConfig;
use crate::error::{transport, ClientError};

/// Paths that start with `/` or contain `.` travel base64-encoded.
pub fn encode_path(path: &str) -> String {
    if path.starts_with('/') || path.contains('.') {
        format!("B64-{}", STANDARD.encode(path)).replace('=', "%3D")
    } else {
        path.to_string()
    }
}

pub struct HttpObjectStore {
    http: Client,
    config: ClientConfig,
}

impl HttpObjectStore {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> Result<Self, ClientError> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send with auth, map non-2xx to rejections and decode the JSON body.
    /// An empty body decodes as `null`.
    async fn send(&self, op: StoreOp, type_tag: &str, request: RequestBuilder) -> Result<Value, StoreError> {
        let request = match &self.config.bearer_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| transport(op, e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(format!("{op} {type_tag}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Rejected {
                op,
                type_tag: type_tag.to_string(),
                message: format!("{status}: {}", body.chars().take(200).collect::<String>()),
            });
        }

        let body = response.text().await.map_err(|e| transport(op, e))?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| StoreError::Decode(format!("{op} {type_tag}: {e}")))
    }

    /// Boolean acknowledgement endpoints; `false` is a rejection.
    fn acknowledged(op: StoreOp, type_tag: &str, value: Value) -> Result<(), StoreError> {
        match value {
            Value::Bool(false) => Err(StoreError::Rejected {
                op,
                type_tag: type_tag.to_string(),
                message: "service returned false".to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn entity(op: StoreOp, type_tag: &str, value: Value) -> Result<Entity, StoreError> {
        match value {
            Value::Object(_) => {
                let mut entity = Entity::from_value(value)
                    .map_err(|e| StoreError::Decode(format!("{op} {type_tag}: {e}")))?;
                if entity.type_tag().is_none() {
                    entity.set_type_tag(type_tag);
                }
                Ok(entity)
            }
            Value::Null => Err(StoreError::NotFound(format!("{op} {type_tag}"))),
            other => Err(StoreError::Decode(format!(
                "{op} {type_tag}: expected an object, got {other}"
            ))),
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn search(&self, query: &Query) -> Result<SearchResults, StoreError> {
        let url = self.config.rest_url("model/search");
        debug!(%url, type_tag = %query.type_tag, "search");
        let value = self
            .send(StoreOp::Search, &query.type_tag, self.http.post(url).json(query))
            .await?;
        if value.is_null() {
            return Ok(SearchResults::default());
        }
        serde_json::from_value(value)
            .map_err(|e| StoreError::Decode(format!("search {}: {e}", query.type_tag)))
    }

    async fn create(&self, type_tag: &str, entity: &Entity) -> Result<Entity, StoreError> {
        let url = self.config.rest_url("model");
        debug!(%url, type_tag, "create");
        let value = self
            .send(StoreOp::Create, type_tag, self.http.post(url).json(entity))
            .await?;
        Self::entity(StoreOp::Create, type_tag, value)
    }

    /// The service answers a patch with the patched record or a bare `true`;
    /// the latter echoes the payload back.
    async fn patch(&self, type_tag: &str, entity: &Entity) -> Result<Entity, StoreError> {
        let url = self.config.rest_url("model");
        debug!(%url, type_tag, "patch");
        let value = self
            .send(StoreOp::Patch, type_tag, self.http.patch(url).json(entity))
            .await?;
        match value {
            Value::Object(_) => Self::entity(StoreOp::Patch, type_tag, value),
            other => {
                Self::acknowledged(StoreOp::Patch, type_tag, other)?;
                Ok(entity.clone())
            }
        }
    }

    async fn member(&self, edge: &MemberEdge) -> Result<(), StoreError> {
        let url = self.config.rest_url(&format!(
            "authorization/{}/{}/member/{}/{}/{}",
            edge.owner.type_tag,
            edge.owner.id_segment(),
            edge.target.type_tag,
            edge.target.id_segment(),
            edge.add
        ));
        debug!(%url, relation = %edge.relation, "member");
        let value = self
            .send(StoreOp::Member, &edge.owner.type_tag, self.http.get(url))
            .await?;
        Self::acknowledged(StoreOp::Member, &edge.owner.type_tag, value)
    }

    async fn delete(&self, target: &EntityRef) -> Result<(), StoreError> {
        let url = self
            .config
            .rest_url(&format!("model/{}/{}", target.type_tag, target.id_segment()));
        debug!(%url, "delete");
        let value = self
            .send(StoreOp::Delete, &target.type_tag, self.http.delete(url))
            .await?;
        Self::acknowledged(StoreOp::Delete, &target.type_tag, value)
    }

    async fn find_or_make_path(
        &self,
        container_type: &str,
        path: &str,
    ) -> Result<Entity, StoreError> {
        let url = self.config.rest_url(&format!(
            "path/make/{container_type}/data/{}",
            encode_path(path)
        ));
        debug!(%url, "make path");
        let value = self
            .send(StoreOp::MakePath, container_type, self.http.get(url))
            .await?;
        Self::entity(StoreOp::MakePath, container_type, value)
    }

    async fn clear_cache(&self, type_tag: &str) -> Result<(), StoreError> {
        let url = self.config.rest_url(&format!("cache/clear/{type_tag}"));
        let value = self
            .send(StoreOp::ClearCache, type_tag, self.http.get(url))
            .await?;
        Self::acknowledged(StoreOp::ClearCache, type_tag, value)
    }
}
