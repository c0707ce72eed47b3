//! Bidirectional mapping between domain events and their serialized form,
//! with versioned migration chains for schema evolution.
//!
//! Each event type is registered by its fully qualified name and current
//! schema version, together with a `(serialize, deserialize)` codec pair.
//! Historical payloads reach the current codec through an ordered chain of
//! migrations:
//!
//! - a **format migration** transforms the encoded payload from version `n`
//!   to `n + 1` under the same type name;
//! - a **rename migration** renames the type while bumping the version, with
//!   an optional payload transform.
//!
//! Migration paths are composed once at build time, so decoding a historical
//! event costs one map lookup plus the precomposed transforms.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::backend::NewEvent;
use crate::Event;

type SerializeFn<E> = Box<dyn Fn(&E) -> Option<serde_json::Result<Value>> + Send + Sync>;
type DeserializeFn<E> = Box<dyn Fn(Value) -> serde_json::Result<E> + Send + Sync>;
type TransformFn =
    Arc<dyn Fn(Value) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> + Send + Sync>;

/// The error type for mapping operations.
#[derive(Debug, thiserror::Error)]
pub enum MapperError {
    /// No codec is registered for the runtime type of the event being
    /// serialized.
    #[error("no serializer registered for event type '{0}'")]
    MissingSerializer(String),

    /// No codec or migration path is registered for the recorded
    /// `(type_name, version)` pair. A version of 0 means the lookup did not
    /// carry a version (current-version decoding).
    #[error("no deserializer registered for event type '{type_name}' version {version}")]
    MissingDeserializer {
        /// The recorded type name.
        type_name: String,
        /// The recorded schema version.
        version: u16,
    },

    /// The payload could not be parsed or transformed. Carries the raw
    /// payload for forensics.
    #[error("unparseable payload for event type '{type_name}': {cause}")]
    UnparseablePayload {
        /// The recorded type name.
        type_name: String,
        /// The underlying parse or transform failure.
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
        /// The payload as it was recorded.
        raw: Value,
    },
}

/// Errors detected while freezing an [`EventMapperBuilder`].
#[derive(Debug, thiserror::Error)]
pub enum MapperBuildError {
    /// Two codecs were registered under the same type name.
    #[error("duplicate codec registered for event type '{0}'")]
    DuplicateCodec(String),

    /// Two migrations start from the same `(type_name, version)` pair.
    #[error("duplicate migration registered from event type '{type_name}' version {version}")]
    DuplicateMigration {
        /// The migration's source type name.
        type_name: String,
        /// The migration's source version.
        version: u16,
    },

    /// A migration chain does not end at a registered current codec.
    #[error(
        "migration chain from '{type_name}' version {version} ends at '{end_type}' \
         version {end_version}, which is not a registered current codec"
    )]
    BrokenChain {
        /// The chain's starting type name.
        type_name: String,
        /// The chain's starting version.
        version: u16,
        /// The type name the chain ends at.
        end_type: String,
        /// The version the chain ends at.
        end_version: u16,
    },
}

struct Codec<E> {
    version: u16,
    serialize: SerializeFn<E>,
    deserialize: DeserializeFn<E>,
}

struct MigrationStep {
    to_type: String,
    to_version: u16,
    transform: Option<TransformFn>,
}

struct MigrationPath {
    target_type: String,
    transforms: Vec<TransformFn>,
}

/// An immutable registry mapping domain events to and from their serialized
/// wire form `(payload, type_name, version)`.
///
/// Built once through [`EventMapperBuilder`] and frozen thereafter.
pub struct EventMapper<E: Event> {
    codecs: HashMap<String, Codec<E>>,
    paths: HashMap<(String, u16), MigrationPath>,
}

impl<E: Event> std::fmt::Debug for EventMapper<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMapper")
            .field("codecs", &self.codecs.keys().collect::<Vec<_>>())
            .field("paths", &self.paths.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<E: Event> EventMapper<E> {
    /// Returns `true` when a codec is registered under `type_name`.
    pub fn contains(&self, type_name: &str) -> bool {
        self.codecs.contains_key(type_name)
    }

    /// Serializes an event, always emitting the current
    /// `(type_name, version)` pair for its type.
    pub fn serialize(&self, event: &E) -> Result<NewEvent, MapperError> {
        let type_name = event.event_type();
        let codec = self
            .codecs
            .get(type_name)
            .ok_or_else(|| MapperError::MissingSerializer(type_name.to_string()))?;

        let payload = (codec.serialize)(event)
            .ok_or_else(|| MapperError::MissingSerializer(type_name.to_string()))?
            .map_err(|cause| MapperError::UnparseablePayload {
                type_name: type_name.to_string(),
                cause: Box::new(cause),
                raw: Value::Null,
            })?;

        Ok(NewEvent {
            payload,
            event_type: type_name.to_string(),
            event_version: codec.version,
        })
    }

    /// Deserializes a recorded payload, migrating it from the recorded
    /// `(type_name, version)` up to the current codec first.
    pub fn deserialize(
        &self,
        type_name: &str,
        version: u16,
        payload: Value,
    ) -> Result<E, MapperError> {
        if let Some(codec) = self.codecs.get(type_name) {
            if codec.version == version {
                return Self::decode(type_name, &codec.deserialize, payload);
            }
        }

        let Some(path) = self.paths.get(&(type_name.to_string(), version)) else {
            return Err(MapperError::MissingDeserializer {
                type_name: type_name.to_string(),
                version,
            });
        };

        let raw = payload.clone();
        let mut current = payload;
        for transform in &path.transforms {
            current = transform(current).map_err(|cause| MapperError::UnparseablePayload {
                type_name: type_name.to_string(),
                cause,
                raw: raw.clone(),
            })?;
        }

        // The build step verified every path lands on a registered codec.
        let codec = self.codecs.get(&path.target_type).ok_or_else(|| {
            MapperError::MissingDeserializer {
                type_name: path.target_type.clone(),
                version,
            }
        })?;
        Self::decode(&path.target_type, &codec.deserialize, current)
    }

    /// Deserializes a payload recorded at the type's current version.
    ///
    /// This is the lookup the feed consumer performs: remote feed events
    /// carry a type name but no schema version.
    pub fn deserialize_current(&self, type_name: &str, payload: Value) -> Result<E, MapperError> {
        let codec =
            self.codecs
                .get(type_name)
                .ok_or_else(|| MapperError::MissingDeserializer {
                    type_name: type_name.to_string(),
                    version: 0,
                })?;
        Self::decode(type_name, &codec.deserialize, payload)
    }

    fn decode(
        type_name: &str,
        deserialize: &DeserializeFn<E>,
        payload: Value,
    ) -> Result<E, MapperError> {
        let raw = payload.clone();
        deserialize(payload).map_err(|cause| MapperError::UnparseablePayload {
            type_name: type_name.to_string(),
            cause: Box::new(cause),
            raw,
        })
    }
}

/// One-shot builder for an [`EventMapper`].
pub struct EventMapperBuilder<E: Event> {
    codecs: HashMap<String, Codec<E>>,
    duplicate_codec: Option<String>,
    migrations: HashMap<(String, u16), MigrationStep>,
    duplicate_migration: Option<(String, u16)>,
}

impl<E: Event> Default for EventMapperBuilder<E> {
    fn default() -> Self {
        Self {
            codecs: HashMap::new(),
            duplicate_codec: None,
            migrations: HashMap::new(),
            duplicate_migration: None,
        }
    }
}

impl<E: Event> EventMapperBuilder<E> {
    /// Creates a new, empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the codec pair for one event type at its current version.
    ///
    /// `serialize` returns `None` when handed a value of a different event
    /// type; `deserialize` parses a payload of the current version.
    #[must_use]
    pub fn event(
        mut self,
        type_name: &str,
        current_version: u16,
        serialize: impl Fn(&E) -> Option<serde_json::Result<Value>> + Send + Sync + 'static,
        deserialize: impl Fn(Value) -> serde_json::Result<E> + Send + Sync + 'static,
    ) -> Self {
        let previous = self.codecs.insert(
            type_name.to_string(),
            Codec {
                version: current_version,
                serialize: Box::new(serialize),
                deserialize: Box::new(deserialize),
            },
        );
        if previous.is_some() {
            self.duplicate_codec.get_or_insert(type_name.to_string());
        }
        self
    }

    /// Registers a format migration transforming payloads of `type_name`
    /// from `from_version` to `from_version + 1`.
    #[must_use]
    pub fn migrate_format(
        self,
        type_name: &str,
        from_version: u16,
        transform: impl Fn(Value) -> Result<Value, Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.migration(
            type_name,
            from_version,
            MigrationStep {
                to_type: type_name.to_string(),
                to_version: from_version + 1,
                transform: Some(Arc::new(transform)),
            },
        )
    }

    /// Registers a rename migration: payloads recorded under `type_name` at
    /// `from_version` continue the chain under `new_type_name` at
    /// `from_version + 1`, unchanged in shape.
    #[must_use]
    pub fn migrate_rename(self, type_name: &str, from_version: u16, new_type_name: &str) -> Self {
        self.migration(
            type_name,
            from_version,
            MigrationStep {
                to_type: new_type_name.to_string(),
                to_version: from_version + 1,
                transform: None,
            },
        )
    }

    /// Registers a rename migration that also transforms the payload.
    #[must_use]
    pub fn migrate_rename_with(
        self,
        type_name: &str,
        from_version: u16,
        new_type_name: &str,
        transform: impl Fn(Value) -> Result<Value, Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.migration(
            type_name,
            from_version,
            MigrationStep {
                to_type: new_type_name.to_string(),
                to_version: from_version + 1,
                transform: Some(Arc::new(transform)),
            },
        )
    }

    fn migration(mut self, type_name: &str, from_version: u16, step: MigrationStep) -> Self {
        let key = (type_name.to_string(), from_version);
        if self.migrations.insert(key.clone(), step).is_some() {
            self.duplicate_migration.get_or_insert(key);
        }
        self
    }

    /// Freezes the registry, precomputing the composed migration path for
    /// every historical `(type_name, version)` pair and validating that each
    /// chain ends at a registered current codec.
    pub fn build(self) -> Result<EventMapper<E>, MapperBuildError> {
        if let Some(type_name) = self.duplicate_codec {
            return Err(MapperBuildError::DuplicateCodec(type_name));
        }
        if let Some((type_name, version)) = self.duplicate_migration {
            return Err(MapperBuildError::DuplicateMigration { type_name, version });
        }

        let mut paths = HashMap::new();
        for start in self.migrations.keys() {
            let mut current = start.clone();
            let mut transforms = Vec::new();

            // Chains always terminate: every step bumps the version.
            while let Some(step) = self.migrations.get(&current) {
                if let Some(transform) = &step.transform {
                    transforms.push(Arc::clone(transform));
                }
                current = (step.to_type.clone(), step.to_version);
            }

            let lands_on_codec = self
                .codecs
                .get(&current.0)
                .is_some_and(|codec| codec.version == current.1);
            if !lands_on_codec {
                return Err(MapperBuildError::BrokenChain {
                    type_name: start.0.clone(),
                    version: start.1,
                    end_type: current.0,
                    end_version: current.1,
                });
            }

            paths.insert(
                start.clone(),
                MigrationPath {
                    target_type: current.0,
                    transforms,
                },
            );
        }

        Ok(EventMapper {
            codecs: self.codecs,
            paths,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    enum TestEvent {
        Opened { balance: u64 },
        Renamed { name: String },
    }

    impl Event for TestEvent {
        fn event_type(&self) -> &'static str {
            match self {
                Self::Opened { .. } => "Opened",
                Self::Renamed { .. } => "Renamed",
            }
        }
    }

    fn base_builder() -> EventMapperBuilder<TestEvent> {
        EventMapperBuilder::new()
            .event(
                "Opened",
                2,
                |event| match event {
                    TestEvent::Opened { .. } => Some(serde_json::to_value(event)),
                    TestEvent::Renamed { .. } => None,
                },
                serde_json::from_value,
            )
            .event(
                "Renamed",
                3,
                |event| match event {
                    TestEvent::Renamed { .. } => Some(serde_json::to_value(event)),
                    TestEvent::Opened { .. } => None,
                },
                serde_json::from_value,
            )
    }

    #[test]
    fn serialize_emits_current_type_and_version() {
        let mapper = base_builder().build().unwrap();

        let wire = mapper
            .serialize(&TestEvent::Opened { balance: 7 })
            .unwrap();

        assert_eq!(wire.event_type, "Opened");
        assert_eq!(wire.event_version, 2);
        assert_eq!(wire.payload, json!({ "Opened": { "balance": 7 } }));
    }

    #[test]
    fn round_trip_at_current_version() {
        let mapper = base_builder().build().unwrap();
        let event = TestEvent::Renamed {
            name: "joe".to_string(),
        };

        let wire = mapper.serialize(&event).unwrap();
        let decoded = mapper
            .deserialize(&wire.event_type, wire.event_version, wire.payload)
            .unwrap();

        assert_eq!(decoded, event);
    }

    #[test]
    fn missing_serializer_for_unregistered_type() {
        let mapper = EventMapperBuilder::<TestEvent>::new()
            .event(
                "Renamed",
                3,
                |event| match event {
                    TestEvent::Renamed { .. } => Some(serde_json::to_value(event)),
                    TestEvent::Opened { .. } => None,
                },
                serde_json::from_value,
            )
            .build()
            .unwrap();

        let err = mapper
            .serialize(&TestEvent::Opened { balance: 1 })
            .unwrap_err();
        assert!(matches!(err, MapperError::MissingSerializer(name) if name == "Opened"));
    }

    #[test]
    fn missing_deserializer_for_unknown_version() {
        let mapper = base_builder().build().unwrap();

        let err = mapper
            .deserialize("Opened", 9, json!({}))
            .unwrap_err();
        assert!(matches!(
            err,
            MapperError::MissingDeserializer { type_name, version }
                if type_name == "Opened" && version == 9
        ));
    }

    #[test]
    fn malformed_payload_is_unparseable() {
        let mapper = base_builder().build().unwrap();

        let err = mapper
            .deserialize("Opened", 2, json!({ "unexpected": true }))
            .unwrap_err();
        assert!(matches!(
            err,
            MapperError::UnparseablePayload { type_name, raw, .. }
                if type_name == "Opened" && raw == json!({ "unexpected": true })
        ));
    }

    #[test]
    fn format_migration_chain_composes_oldest_first() {
        // v1 stored the balance as a string under "amount"; v2 renamed the
        // field and switched to a number.
        let mapper = base_builder()
            .migrate_format("Opened", 1, |payload| {
                let amount = payload
                    .get("Opened")
                    .and_then(|inner| inner.get("amount"))
                    .and_then(Value::as_str)
                    .ok_or("missing amount")?;
                let balance: u64 = amount.parse()?;
                Ok(json!({ "Opened": { "balance": balance } }))
            })
            .build()
            .unwrap();

        let decoded = mapper
            .deserialize("Opened", 1, json!({ "Opened": { "amount": "42" } }))
            .unwrap();
        assert_eq!(decoded, TestEvent::Opened { balance: 42 });
    }

    #[test]
    fn rename_migration_reaches_current_codec() {
        // "Labelled" v1 became "Renamed" v2, which gained a format
        // migration to v3.
        let mapper = base_builder()
            .migrate_rename_with("Labelled", 1, "Renamed", |payload| {
                let label = payload
                    .get("Labelled")
                    .and_then(|inner| inner.get("label"))
                    .cloned()
                    .ok_or("missing label")?;
                Ok(json!({ "Renamed": { "name": label } }))
            })
            .migrate_format("Renamed", 2, Ok)
            .build()
            .unwrap();

        let decoded = mapper
            .deserialize("Labelled", 1, json!({ "Labelled": { "label": "joe" } }))
            .unwrap();
        assert_eq!(
            decoded,
            TestEvent::Renamed {
                name: "joe".to_string()
            }
        );

        // The intermediate version decodes through its own path too.
        let decoded = mapper
            .deserialize("Renamed", 2, json!({ "Renamed": { "name": "ada" } }))
            .unwrap();
        assert_eq!(
            decoded,
            TestEvent::Renamed {
                name: "ada".to_string()
            }
        );
    }

    #[test]
    fn broken_chain_fails_at_build_time() {
        let err = base_builder()
            .migrate_format("Opened", 5, Ok)
            .build()
            .unwrap_err();
        assert!(matches!(err, MapperBuildError::BrokenChain { .. }));
    }

    #[test]
    fn failing_transform_surfaces_raw_payload() {
        let mapper = base_builder()
            .migrate_format("Opened", 1, |_| Err("transform refused".into()))
            .build()
            .unwrap();

        let err = mapper
            .deserialize("Opened", 1, json!({ "legacy": true }))
            .unwrap_err();
        assert!(matches!(
            err,
            MapperError::UnparseablePayload { raw, .. } if raw == json!({ "legacy": true })
        ));
    }
}
