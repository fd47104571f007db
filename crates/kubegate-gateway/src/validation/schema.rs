//! Schema validator
//!
//! Checks mutating request bodies against the OpenAPI v3 schema the cluster
//! publishes for the target kind. Only field names are checked; value types
//! and required fields are left to the API server. A kind without a published
//! schema passes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use kube::core::GroupVersionKind;
use kube::Client;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{ValidationError, ValidationRequest, Validator};

/// Nesting depth past which bodies are not inspected further
const MAX_DEPTH: usize = 64;

/// `$ref` / `allOf` hops followed before a schema is treated as open
const MAX_REF_HOPS: usize = 16;

const GVK_EXTENSION: &str = "x-kubernetes-group-version-kind";
const PRESERVE_UNKNOWN: &str = "x-kubernetes-preserve-unknown-fields";
const COMPONENT_REF_PREFIX: &str = "#/components/schemas/";

// =============================================================================
// Schema source
// =============================================================================

/// A kind's root schema and the components its `$ref`s point into
#[derive(Clone, Debug)]
pub struct ResourceSchema {
    /// Schema of the kind's top-level object
    pub root: Value,
    /// `components.schemas` of the document the kind was found in
    pub components: Arc<Map<String, Value>>,
}

/// Where published schemas come from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// Schema for a kind, or `None` when unavailable
    async fn schema_for(&self, gvk: &GroupVersionKind) -> Option<ResourceSchema>;

    /// Drop cached documents
    fn invalidate(&self);
}

/// Schemas from the API server's `/openapi/v3` endpoints, cached per group/version
///
/// Cached entries carry the generation they were fetched under; an
/// invalidation bumps the generation, so fetches that were in flight at the
/// time answer their caller but are never served from the cache.
pub struct OpenApiSchemaSource {
    client: Client,
    generation: AtomicU64,
    index: RwLock<Option<(u64, Arc<BTreeMap<String, String>>)>>,
    documents: DashMap<String, (u64, Arc<Map<String, Value>>)>,
}

impl OpenApiSchemaSource {
    /// Create a source using the given (ungated) client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            generation: AtomicU64::new(0),
            index: RwLock::new(None),
            documents: DashMap::new(),
        }
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    async fn get_json(&self, url: &str) -> Result<Value, kube::Error> {
        let request = http::Request::get(url)
            .body(Vec::new())
            .map_err(kube::Error::HttpError)?;
        self.client.request::<Value>(request).await
    }

    /// Group/version path to document URL
    async fn index(&self) -> Result<Arc<BTreeMap<String, String>>, kube::Error> {
        let generation = self.generation();
        if let Some((cached, index)) = self.index.read().await.as_ref() {
            if *cached == generation {
                return Ok(index.clone());
            }
        }
        let raw = self.get_json("/openapi/v3").await?;
        let index = Arc::new(parse_index(&raw));
        let mut slot = self.index.write().await;
        if self.generation() == generation {
            *slot = Some((generation, index.clone()));
        }
        Ok(index)
    }

    async fn components(&self, key: &str) -> Result<Option<Arc<Map<String, Value>>>, kube::Error> {
        let generation = self.generation();
        if let Some(entry) = self.documents.get(key) {
            let (cached, doc) = entry.value();
            if *cached == generation {
                return Ok(Some(doc.clone()));
            }
        }
        let index = self.index().await?;
        let Some(url) = index.get(key) else {
            return Ok(None);
        };
        let raw = self.get_json(url).await?;
        let components = Arc::new(
            raw.pointer("/components/schemas")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        );
        if self.generation() == generation {
            self.documents
                .insert(key.to_string(), (generation, components.clone()));
        } else {
            debug!(group_version = %key, "schema cache invalidated during fetch");
        }
        Ok(Some(components))
    }
}

#[async_trait]
impl SchemaSource for OpenApiSchemaSource {
    async fn schema_for(&self, gvk: &GroupVersionKind) -> Option<ResourceSchema> {
        let key = document_key(gvk);
        match self.components(&key).await {
            Ok(Some(components)) => find_schema(&components, gvk).map(|root| ResourceSchema {
                root,
                components,
            }),
            Ok(None) => None,
            Err(e) => {
                debug!(group_version = %key, error = %e, "openapi schema unavailable");
                None
            }
        }
    }

    fn invalidate(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        // Entries are tagged; clearing only releases memory
        self.documents.clear();
        debug!(generation, "schema cache invalidated");
    }
}

fn document_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("api/{}", gvk.version)
    } else {
        format!("apis/{}/{}", gvk.group, gvk.version)
    }
}

fn parse_index(raw: &Value) -> BTreeMap<String, String> {
    raw.get("paths")
        .and_then(Value::as_object)
        .map(|paths| {
            paths
                .iter()
                .filter_map(|(path, entry)| {
                    let url = entry.get("serverRelativeURL")?.as_str()?;
                    Some((path.clone(), url.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Find the component tagged with the kind's group/version/kind
fn find_schema(components: &Map<String, Value>, gvk: &GroupVersionKind) -> Option<Value> {
    components
        .values()
        .find(|schema| {
            schema
                .get(GVK_EXTENSION)
                .and_then(Value::as_array)
                .is_some_and(|tags| {
                    tags.iter().any(|tag| {
                        tag.get("group").and_then(Value::as_str).unwrap_or("") == gvk.group
                            && tag.get("version").and_then(Value::as_str) == Some(gvk.version.as_str())
                            && tag.get("kind").and_then(Value::as_str) == Some(gvk.kind.as_str())
                    })
                })
        })
        .cloned()
}

// =============================================================================
// Field checking
// =============================================================================

struct FieldChecker<'a> {
    components: &'a Map<String, Value>,
}

impl<'a> FieldChecker<'a> {
    /// Follow `$ref` and single-element `allOf`; `None` means "accept anything"
    fn resolve(&self, schema: &'a Value) -> Option<&'a Value> {
        let mut current = schema;
        for _ in 0..MAX_REF_HOPS {
            if let Some(reference) = current.get("$ref").and_then(Value::as_str) {
                current = self
                    .components
                    .get(reference.strip_prefix(COMPONENT_REF_PREFIX)?)?;
                continue;
            }
            match current.get("allOf").and_then(Value::as_array) {
                Some(all) if all.len() == 1 => current = &all[0],
                _ => return Some(current),
            }
        }
        None
    }

    /// Dotted path of the first field the schema does not declare
    fn unknown_field(&self, value: &Value, schema: &'a Value, path: &str, depth: usize) -> Option<String> {
        if depth > MAX_DEPTH {
            return None;
        }
        let schema = self.resolve(schema)?;
        if schema.get(PRESERVE_UNKNOWN).and_then(Value::as_bool) == Some(true) {
            return None;
        }

        match value {
            Value::Object(map) => {
                let properties = schema.get("properties").and_then(Value::as_object);
                let additional = schema.get("additionalProperties");
                for (key, child) in map {
                    // Patch directives ($patch, $setElementOrder/..., $retainKeys)
                    if key.starts_with('$') {
                        continue;
                    }
                    let child_path = join(path, key);
                    let found = match (properties.and_then(|p| p.get(key)), additional) {
                        (Some(declared), _) => self.unknown_field(child, declared, &child_path, depth + 1),
                        (None, Some(extra)) if extra.is_object() => {
                            self.unknown_field(child, extra, &child_path, depth + 1)
                        }
                        (None, Some(Value::Bool(true))) => None,
                        (None, _) if properties.is_some() => Some(child_path),
                        _ => None,
                    };
                    if found.is_some() {
                        return found;
                    }
                }
                None
            }
            Value::Array(items) => {
                let item_schema = schema.get("items")?;
                items.iter().enumerate().find_map(|(i, item)| {
                    self.unknown_field(item, item_schema, &format!("{path}[{i}]"), depth + 1)
                })
            }
            _ => None,
        }
    }
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

// =============================================================================
// Validator
// =============================================================================

/// Rejects mutating bodies that do not decode or carry undeclared fields
pub struct SchemaValidator {
    schemas: Arc<dyn SchemaSource>,
}

impl SchemaValidator {
    /// Registry name
    pub const NAME: &'static str = "schema";

    /// Create a validator over a schema source
    pub fn new(schemas: Arc<dyn SchemaSource>) -> Self {
        Self { schemas }
    }
}

#[async_trait]
impl Validator for SchemaValidator {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn validate(&self, request: &ValidationRequest) -> Result<(), ValidationError> {
        if !request.is_mutating() || request.coordinate.subresource.is_some() {
            return Ok(());
        }
        let Some(body) = request.body.as_ref().filter(|b| !b.is_empty()) else {
            return Ok(());
        };
        let media_type = request
            .content_type
            .as_deref()
            .and_then(|ct| ct.split(';').next())
            .map(str::trim)
            .unwrap_or("application/json");
        if media_type.contains("protobuf") {
            return Ok(());
        }

        let kind = &request.gvk.kind;
        let value: Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            // YAML apply bodies are left to the server
            Err(_) if media_type.ends_with("yaml") => return Ok(()),
            Err(e) => {
                return Err(ValidationError::schema_invalid(format!(
                    "failed to decode {kind} body: {e}"
                )))
            }
        };

        if media_type == "application/json-patch+json" {
            return match value {
                Value::Array(_) => Ok(()),
                _ => Err(ValidationError::schema_invalid(
                    "json patch body must be an array of operations",
                )),
            };
        }

        let Some(object) = value.as_object() else {
            return Err(ValidationError::schema_invalid(format!(
                "{kind} body must be a JSON object"
            )));
        };
        if let Some(body_kind) = object.get("kind").and_then(Value::as_str) {
            if !body_kind.is_empty() && body_kind != kind {
                return Err(ValidationError::schema_invalid(format!(
                    "body kind {body_kind:?} does not match {kind}"
                )));
            }
        }
        if let Some(api_version) = object.get("apiVersion").and_then(Value::as_str) {
            let expected = request.api_version();
            if !api_version.is_empty() && api_version != expected {
                return Err(ValidationError::schema_invalid(format!(
                    "body apiVersion {api_version:?} does not match {expected}"
                )));
            }
        }

        let Some(schema) = self.schemas.schema_for(&request.gvk).await else {
            debug!(kind = %kind, "no published schema, skipping field check");
            return Ok(());
        };
        let checker = FieldChecker {
            components: &schema.components,
        };
        match checker.unknown_field(&value, &schema.root, "", 0) {
            Some(field) => {
                warn!(kind = %kind, field = %field, "request carries undeclared field");
                Err(ValidationError::invalid_field(&field, kind))
            }
            None => Ok(()),
        }
    }
}
