//! Paperless-ngx REST client.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{map_status, map_transport_error, Document, DocumentSystem, Tag, UpstreamError};
use crate::config::PaperlessConfig;

const SERVICE: &str = "paperless";
const DOCUMENT_EXPAND: &str = "tags,correspondent,document_type,custom_fields";
const PAGE_SIZE: u32 = 100;
const FIELD_INDEX_KEY: &str = "custom_fields";

#[derive(Debug, Deserialize)]
struct ApiDocument {
    id: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tags: Vec<ApiTagRef>,
    #[serde(default)]
    custom_fields: Vec<ApiCustomFieldInstance>,
    #[serde(default)]
    correspondent: Option<ApiNamedRef>,
    #[serde(default)]
    document_type: Option<ApiNamedRef>,
    #[serde(default)]
    created: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ApiTagRef {
    Expanded(ApiTag),
    Id(i64),
}

#[derive(Debug, Deserialize)]
struct ApiTag {
    id: i64,
    name: String,
    #[serde(default)]
    slug: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ApiNamedRef {
    Expanded { name: String },
    Id(i64),
}

impl ApiNamedRef {
    fn label(&self) -> String {
        match self {
            ApiNamedRef::Expanded { name } => name.clone(),
            ApiNamedRef::Id(id) => id.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiCustomFieldInstance {
    field: ApiFieldRef,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ApiFieldRef {
    Expanded(ApiCustomField),
    Id(i64),
}

#[derive(Debug, Clone, Deserialize)]
struct ApiCustomField {
    id: i64,
    name: String,
    #[serde(default)]
    slug: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default)]
    next: Option<String>,
    results: Vec<T>,
}

/// Custom field definitions, addressable by id, lowercase name or slug.
#[derive(Debug, Default)]
struct FieldIndex {
    by_key: HashMap<String, ApiCustomField>,
    by_id: HashMap<i64, ApiCustomField>,
}

impl FieldIndex {
    fn build(fields: Vec<ApiCustomField>) -> Self {
        let mut index = FieldIndex::default();
        for field in fields {
            for key in field_keys(&field) {
                index.by_key.insert(key, field.clone());
            }
            index.by_id.insert(field.id, field);
        }
        index
    }

    fn resolve(&self, identifier: &str) -> Option<&ApiCustomField> {
        self.by_key.get(&identifier.trim().to_lowercase())
    }
}

fn field_keys(field: &ApiCustomField) -> Vec<String> {
    [Some(field.name.as_str()), field.slug.as_deref()]
        .into_iter()
        .flatten()
        .map(|key| key.trim().to_lowercase())
        .filter(|key| !key.is_empty())
        .chain(std::iter::once(field.id.to_string()))
        .collect()
}

fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        Value::Array(items) if items.is_empty() => None,
        Value::Object(map) if map.is_empty() => None,
        other => Some(other.to_string()),
    }
}

/// Converts the API shape into a [`Document`]. Field references that are
/// bare ids are named through `fields` when it is given.
fn into_document(api: ApiDocument, fields: Option<&FieldIndex>) -> Document {
    let tags = api
        .tags
        .into_iter()
        .map(|tag| match tag {
            ApiTagRef::Expanded(tag) => Tag {
                id: tag.id,
                slug: tag.slug.unwrap_or_else(|| tag.name.to_lowercase()),
                name: tag.name,
            },
            ApiTagRef::Id(id) => Tag {
                id,
                name: id.to_string(),
                slug: id.to_string(),
            },
        })
        .collect();

    let mut custom_fields = BTreeMap::new();
    for instance in api.custom_fields {
        let Some(value) = value_to_text(&instance.value) else {
            continue;
        };
        let definition = match instance.field {
            ApiFieldRef::Expanded(field) => Some(field),
            ApiFieldRef::Id(id) => fields.and_then(|index| index.by_id.get(&id).cloned()),
        };
        match definition {
            Some(field) => {
                for key in field_keys(&field) {
                    custom_fields.insert(key, value.clone());
                }
            }
            None => log::debug!(
                "Document {} has a custom field without a known definition",
                api.id
            ),
        }
    }

    Document {
        id: api.id,
        title: api.title,
        content: api.content,
        tags,
        custom_fields,
        correspondent: api.correspondent.as_ref().map(ApiNamedRef::label),
        document_type: api.document_type.as_ref().map(ApiNamedRef::label),
        created: api.created,
    }
}

/// Blocking client for the Paperless-ngx API.
pub struct PaperlessClient {
    http: Client,
    base_url: String,
    token: String,
    timeout: Duration,
    fields: Cache<&'static str, Arc<FieldIndex>>,
}

impl PaperlessClient {
    pub fn new(config: &PaperlessConfig) -> Result<Self, UpstreamError> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::Unavailable {
                service: SERVICE,
                message: format!("failed to build HTTP client: {e}"),
            })?;
        let fields = Cache::builder()
            .max_capacity(1)
            .time_to_live(Duration::from_secs(config.field_cache_ttl_secs))
            .build();

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
            timeout,
            fields,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .header("Authorization", format!("Token {}", self.token))
            .header("Accept", "application/json")
    }

    fn send(&self, builder: RequestBuilder, what: &str) -> Result<Response, UpstreamError> {
        let response = builder
            .send()
            .map_err(|e| map_transport_error(SERVICE, self.timeout, e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status.as_u16() == 404 {
            return Err(UpstreamError::NotFound {
                what: what.to_string(),
            });
        }
        let body = response.text().unwrap_or_default();
        Err(map_status(SERVICE, status.as_u16(), truncate_body(&body)))
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        what: &str,
    ) -> Result<T, UpstreamError> {
        log::debug!("Paperless GET {}", path);
        let response = self.send(self.request(Method::GET, path).query(query), what)?;
        response
            .json::<T>()
            .map_err(|e| map_transport_error(SERVICE, self.timeout, e))
    }

    fn patch_document(&self, document_id: i64, body: &Value) -> Result<(), UpstreamError> {
        let path = format!("/api/documents/{document_id}/");
        log::debug!("Paperless PATCH {}", path);
        self.send(
            self.request(Method::PATCH, &path).json(body),
            &format!("document {document_id}"),
        )?;
        Ok(())
    }

    fn list_custom_fields(&self) -> Result<Vec<ApiCustomField>, UpstreamError> {
        let mut results = Vec::new();
        let mut page = 1u32;
        loop {
            let data: Page<ApiCustomField> = self.get_json(
                "/api/custom_fields/",
                &[("page", page.to_string()), ("page_size", PAGE_SIZE.to_string())],
                "custom fields",
            )?;
            results.extend(data.results);
            if data.next.is_none() {
                break;
            }
            page += 1;
        }
        Ok(results)
    }

    fn field_index(&self, refresh: bool) -> Result<Arc<FieldIndex>, UpstreamError> {
        if !refresh {
            if let Some(index) = self.fields.get(&FIELD_INDEX_KEY) {
                return Ok(index);
            }
        }
        let index = Arc::new(FieldIndex::build(self.list_custom_fields()?));
        log::debug!("Cached {} custom field definitions", index.by_id.len());
        self.fields.insert(FIELD_INDEX_KEY, Arc::clone(&index));
        Ok(index)
    }
}

fn truncate_body(body: &str) -> String {
    body.chars().take(200).collect()
}

impl DocumentSystem for PaperlessClient {
    fn fetch(&self, document_id: i64) -> Result<Document, UpstreamError> {
        let api: ApiDocument = self.get_json(
            &format!("/api/documents/{document_id}/"),
            &[("expand", DOCUMENT_EXPAND.to_string())],
            &format!("document {document_id}"),
        )?;
        let needs_index = api
            .custom_fields
            .iter()
            .any(|instance| matches!(instance.field, ApiFieldRef::Id(_)));
        let index = if needs_index {
            Some(self.field_index(false)?)
        } else {
            None
        };
        Ok(into_document(api, index.as_deref()))
    }

    fn update_title(&self, document_id: i64, title: &str) -> Result<(), UpstreamError> {
        self.patch_document(document_id, &json!({ "title": title }))
    }

    fn set_custom_field(
        &self,
        document_id: i64,
        field: &str,
        value: &str,
    ) -> Result<(), UpstreamError> {
        let mut index = self.field_index(false)?;
        if index.resolve(field).is_none() {
            index = self.field_index(true)?;
        }
        let definition = index.resolve(field).ok_or_else(|| UpstreamError::NotFound {
            what: format!("custom field '{field}'"),
        })?;
        log::debug!(
            "Setting custom field {} (id={}) for document {}",
            field,
            definition.id,
            document_id
        );
        self.patch_document(
            document_id,
            &json!({ "custom_fields": [{ "field": definition.id, "value": value }] }),
        )
    }
}
