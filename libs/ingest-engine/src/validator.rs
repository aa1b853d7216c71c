//! Validation and transformation of raw messages.
//!
//! Each schema has one [`Validator`]. The [`ValidatorRegistry`] maps schema
//! ids to validators and is rebuilt as a whole on reload; partition workers
//! take a snapshot per message through [`RegistryHandle`].

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use ingest_api::{RawMessage, ValidatedRecord};

use crate::config::{FieldConfig, FieldType, IngestConfig, SchemaConfig};
use crate::error::EngineError;

/// Why a message was refused. Permanent: rejected messages are never retried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RejectionReason {
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("missing required field '{0}'")]
    MissingRequiredField(String),

    #[error("field '{field}' out of range: {detail}")]
    OutOfRangeValue { field: String, detail: String },

    #[error("unknown schema '{0}'")]
    UnknownSchema(String),
}

impl RejectionReason {
    /// Stable machine-readable name, used in dead-letter entries.
    pub fn kind(&self) -> &'static str {
        match self {
            RejectionReason::SchemaMismatch(_) => "schema_mismatch",
            RejectionReason::MissingRequiredField(_) => "missing_required_field",
            RejectionReason::OutOfRangeValue { .. } => "out_of_range_value",
            RejectionReason::UnknownSchema(_) => "unknown_schema",
        }
    }
}

/// Which fields of a record are mirrored into the cache, and for how long.
#[derive(Debug, Clone, PartialEq)]
pub struct CachePolicy {
    pub fields: Vec<String>,
    pub ttl: Duration,
}

/// Per-schema validation strategy.
///
/// Implementations must be pure: the same message always yields the same
/// result.
pub trait Validator: Send + Sync {
    fn schema_id(&self) -> &str;

    /// Store table that records of this schema are written to.
    fn table(&self) -> &str;

    fn cache_policy(&self) -> Option<&CachePolicy> {
        None
    }

    fn validate(&self, msg: &RawMessage) -> Result<ValidatedRecord, RejectionReason>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Immutable `schema_id → validator` map.
#[derive(Default)]
pub struct ValidatorRegistry {
    validators: HashMap<String, Arc<dyn Validator>>,
    default_schema: Option<String>,
}

impl std::fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&String> = self.validators.keys().collect();
        ids.sort();
        f.debug_struct("ValidatorRegistry")
            .field("schemas", &ids)
            .field("default_schema", &self.default_schema)
            .finish()
    }
}

impl ValidatorRegistry {
    pub fn new(default_schema: Option<String>) -> Self {
        Self {
            validators: HashMap::new(),
            default_schema,
        }
    }

    /// Build a registry with one [`SchemaValidator`] per configured schema.
    pub fn from_config(config: &IngestConfig) -> Result<Self, EngineError> {
        let mut registry = Self::new(config.default_schema.clone());
        for schema in &config.schemas {
            registry.register(Arc::new(SchemaValidator::new(schema.clone())))?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, validator: Arc<dyn Validator>) -> Result<(), EngineError> {
        let id = validator.schema_id().to_string();
        if self.validators.contains_key(&id) {
            return Err(EngineError::Config(format!("schema '{id}' registered twice")));
        }
        self.validators.insert(id, validator);
        Ok(())
    }

    pub fn get(&self, schema_id: &str) -> Option<&Arc<dyn Validator>> {
        self.validators.get(schema_id)
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Distinct destination tables.
    pub fn tables(&self) -> BTreeSet<String> {
        self.validators.values().map(|v| v.table().to_string()).collect()
    }

    /// Select the validator for a message by its `schema_id` metadata.
    pub fn resolve(&self, msg: &RawMessage) -> Result<Arc<dyn Validator>, RejectionReason> {
        let id = msg
            .schema_id
            .as_deref()
            .or(self.default_schema.as_deref())
            .ok_or_else(|| RejectionReason::UnknownSchema("<none>".into()))?;
        self.validators
            .get(id)
            .cloned()
            .ok_or_else(|| RejectionReason::UnknownSchema(id.to_string()))
    }
}

/// Swappable holder for the current registry snapshot.
#[derive(Debug)]
pub struct RegistryHandle {
    current: RwLock<Arc<ValidatorRegistry>>,
}

impl RegistryHandle {
    pub fn new(registry: ValidatorRegistry) -> Self {
        Self {
            current: RwLock::new(Arc::new(registry)),
        }
    }

    pub fn snapshot(&self) -> Arc<ValidatorRegistry> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn replace(&self, registry: ValidatorRegistry) {
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(registry);
    }
}

// ---------------------------------------------------------------------------
// Declarative JSON validator
// ---------------------------------------------------------------------------

/// Validator driven by a `[[schemas]]` config entry.
///
/// The payload must be a JSON object. The natural key and timestamp are read
/// from `key_field` / `ts_field`; declared fields are type- and range-checked
/// and copied into the record. Undeclared fields are dropped.
#[derive(Debug)]
pub struct SchemaValidator {
    config: SchemaConfig,
    cache: Option<CachePolicy>,
}

impl SchemaValidator {
    pub fn new(config: SchemaConfig) -> Self {
        let cache = (!config.cache_fields.is_empty()).then(|| CachePolicy {
            fields: config.cache_fields.clone(),
            ttl: Duration::from_secs(config.cache_ttl_seconds),
        });
        Self { config, cache }
    }

    fn natural_key(&self, obj: &serde_json::Map<String, serde_json::Value>) -> Result<String, RejectionReason> {
        let name = &self.config.key_field;
        match obj.get(name) {
            None | Some(serde_json::Value::Null) => Err(RejectionReason::MissingRequiredField(name.clone())),
            Some(serde_json::Value::String(s)) if s.is_empty() => {
                Err(RejectionReason::MissingRequiredField(name.clone()))
            }
            Some(serde_json::Value::String(s)) => Ok(s.clone()),
            Some(serde_json::Value::Number(n)) => Ok(n.to_string()),
            Some(_) => Err(RejectionReason::SchemaMismatch(format!(
                "key field '{name}' must be a string or number"
            ))),
        }
    }

    fn timestamp(&self, obj: &serde_json::Map<String, serde_json::Value>) -> Result<i64, RejectionReason> {
        let name = &self.config.ts_field;
        let value = match obj.get(name) {
            None | Some(serde_json::Value::Null) => {
                return Err(RejectionReason::MissingRequiredField(name.clone()));
            }
            Some(v) => v,
        };
        let ts = value.as_i64().ok_or_else(|| {
            RejectionReason::SchemaMismatch(format!("timestamp field '{name}' must be integer milliseconds"))
        })?;
        if ts < 0 {
            return Err(RejectionReason::OutOfRangeValue {
                field: name.clone(),
                detail: format!("{ts} is before the epoch"),
            });
        }
        Ok(ts)
    }
}

fn check_field(field: &FieldConfig, value: &serde_json::Value) -> Result<(), RejectionReason> {
    let type_ok = match field.field_type {
        FieldType::String => value.is_string(),
        FieldType::Integer => value.is_i64() || value.is_u64(),
        FieldType::Float => value.is_number(),
        FieldType::Bool => value.is_boolean(),
    };
    if !type_ok {
        return Err(RejectionReason::SchemaMismatch(format!(
            "field '{}' expected {:?}, got {value}",
            field.name, field.field_type
        )));
    }

    if let Some(n) = value.as_f64() {
        if let Some(min) = field.min {
            if n < min {
                return Err(RejectionReason::OutOfRangeValue {
                    field: field.name.clone(),
                    detail: format!("{n} < min {min}"),
                });
            }
        }
        if let Some(max) = field.max {
            if n > max {
                return Err(RejectionReason::OutOfRangeValue {
                    field: field.name.clone(),
                    detail: format!("{n} > max {max}"),
                });
            }
        }
    }
    Ok(())
}

impl Validator for SchemaValidator {
    fn schema_id(&self) -> &str {
        &self.config.id
    }

    fn table(&self) -> &str {
        &self.config.table
    }

    fn cache_policy(&self) -> Option<&CachePolicy> {
        self.cache.as_ref()
    }

    fn validate(&self, msg: &RawMessage) -> Result<ValidatedRecord, RejectionReason> {
        let value: serde_json::Value = serde_json::from_slice(&msg.payload)
            .map_err(|e| RejectionReason::SchemaMismatch(format!("payload is not JSON: {e}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| RejectionReason::SchemaMismatch("payload is not a JSON object".into()))?;

        let natural_key = self.natural_key(obj)?;
        let ts_ms = self.timestamp(obj)?;

        let mut fields = serde_json::Map::with_capacity(self.config.fields.len());
        for field in &self.config.fields {
            match obj.get(&field.name) {
                None | Some(serde_json::Value::Null) => {
                    if field.required {
                        return Err(RejectionReason::MissingRequiredField(field.name.clone()));
                    }
                }
                Some(value) => {
                    check_field(field, value)?;
                    fields.insert(field.name.clone(), value.clone());
                }
            }
        }

        Ok(ValidatedRecord {
            schema_id: self.config.id.clone(),
            natural_key,
            ts_ms,
            fields,
            source: msg.message_ref(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn quote_schema() -> SchemaConfig {
        SchemaConfig {
            id: "quote".into(),
            table: "quotes".into(),
            key_field: "symbol".into(),
            ts_field: "ts_ms".into(),
            fields: vec![
                FieldConfig {
                    name: "bid".into(),
                    field_type: FieldType::Float,
                    required: true,
                    min: Some(0.0),
                    max: None,
                },
                FieldConfig {
                    name: "venue".into(),
                    field_type: FieldType::String,
                    required: false,
                    min: None,
                    max: None,
                },
            ],
            cache_fields: vec!["bid".into()],
            cache_ttl_seconds: 60,
        }
    }

    fn message(schema: Option<&str>, payload: serde_json::Value) -> RawMessage {
        RawMessage {
            topic: "market-data".into(),
            partition: 0,
            offset: 7,
            delivery_attempt: 1,
            enqueue_time_ms: 0,
            schema_id: schema.map(str::to_string),
            payload: serde_json::to_vec(&payload).unwrap(),
        }
    }

    fn registry() -> ValidatorRegistry {
        let mut registry = ValidatorRegistry::new(None);
        registry.register(Arc::new(SchemaValidator::new(quote_schema()))).unwrap();
        registry
    }

    fn validate(payload: serde_json::Value) -> Result<ValidatedRecord, RejectionReason> {
        let registry = registry();
        let msg = message(Some("quote"), payload);
        registry.resolve(&msg)?.validate(&msg)
    }

    #[test]
    fn accepts_and_projects_declared_fields() {
        let record = validate(json!({
            "symbol": "AAPL", "ts_ms": 1_700_000_000_000i64, "bid": 189.5, "extra": true
        }))
        .unwrap();
        assert_eq!(record.natural_key, "AAPL");
        assert_eq!(record.ts_ms, 1_700_000_000_000);
        assert_eq!(record.fields.len(), 1);
        assert_eq!(record.fields["bid"], json!(189.5));
        assert_eq!(record.source.offset, 7);
    }

    #[test]
    fn each_rejection_reason() {
        assert!(matches!(
            validate(json!({"ts_ms": 1, "bid": 1.0})),
            Err(RejectionReason::MissingRequiredField(f)) if f == "symbol"
        ));
        assert!(matches!(
            validate(json!({"symbol": "A", "ts_ms": 1})),
            Err(RejectionReason::MissingRequiredField(f)) if f == "bid"
        ));
        assert!(matches!(
            validate(json!({"symbol": "A", "ts_ms": 1, "bid": "high"})),
            Err(RejectionReason::SchemaMismatch(_))
        ));
        assert!(matches!(
            validate(json!({"symbol": "A", "ts_ms": 1, "bid": -3.0})),
            Err(RejectionReason::OutOfRangeValue { field, .. }) if field == "bid"
        ));
        assert!(matches!(
            validate(json!([1, 2, 3])),
            Err(RejectionReason::SchemaMismatch(_))
        ));

        let registry = registry();
        let unknown = message(Some("trade"), json!({}));
        let err = registry.resolve(&unknown).err().unwrap();
        assert_eq!(err, RejectionReason::UnknownSchema("trade".into()));
        assert_eq!(err.kind(), "unknown_schema");
    }

    #[test]
    fn non_json_payload_is_a_schema_mismatch() {
        let registry = registry();
        let mut msg = message(Some("quote"), json!({}));
        msg.payload = b"not json".to_vec();
        let err = registry.resolve(&msg).unwrap().validate(&msg).unwrap_err();
        assert_eq!(err.kind(), "schema_mismatch");
    }

    #[test]
    fn default_schema_applies_without_metadata() {
        let mut registry = ValidatorRegistry::new(Some("quote".into()));
        registry.register(Arc::new(SchemaValidator::new(quote_schema()))).unwrap();
        let msg = message(None, json!({"symbol": "A", "ts_ms": 1, "bid": 1.0}));
        assert_eq!(registry.resolve(&msg).unwrap().schema_id(), "quote");

        let bare = ValidatorRegistry::new(None);
        assert!(bare.resolve(&msg).is_err());
    }

    #[test]
    fn handle_swaps_snapshots() {
        let handle = RegistryHandle::new(ValidatorRegistry::default());
        let before = handle.snapshot();
        handle.replace(registry());
        assert!(before.is_empty());
        assert_eq!(handle.snapshot().tables().into_iter().collect::<Vec<_>>(), vec!["quotes"]);
        assert_eq!(
            handle.snapshot().get("quote").unwrap().cache_policy().unwrap().ttl,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = registry();
        let err = registry
            .register(Arc::new(SchemaValidator::new(quote_schema())))
            .unwrap_err();
        assert!(err.to_string().contains("registered twice"));
    }
}
