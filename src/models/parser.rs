//! DTDL (v2/v3) parsing.
//!
//! Documents are JSON-LD interfaces, or arrays of interfaces, as served by a
//! device model repository. The parser flattens them into a [`ModelSet`]:
//! every interface, content, and complex schema becomes an [`Entity`] keyed
//! by its identifier. Identifiers that the documents reference but do not
//! define (`extends`, component schemas, schema references) are fetched from
//! the [`ModelSource`] until the set is closed, so a successful parse always
//! yields a self-contained symbol table.

use crate::models::dtmi::Dtmi;
use crate::models::entity::{Entity, EntityKind, ModelSet, Schema, SupplementalType};
use crate::models::repository::ModelSource;
use futures::future::join_all;
use itertools::Itertools;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

const SUPPORTED_CONTEXTS: [&str; 2] = ["dtmi:dtdl:context;2", "dtmi:dtdl:context;3"];

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("model document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("model document must be an object or an array of objects")]
    NotAnObject,
    #[error("{element} is missing required property {property}")]
    MissingProperty { element: String, property: &'static str },
    #[error("{element} has invalid value for {property}: {reason}")]
    InvalidProperty {
        element: String,
        property: &'static str,
        reason: String,
    },
    #[error("{element} has unsupported @type {value}")]
    UnsupportedType { element: String, value: String },
    #[error("{element} uses unsupported @context {value}")]
    UnsupportedContext { element: String, value: String },
    #[error("{element} is defined more than once")]
    Duplicate { element: String },
    #[error("referenced model {dtmi} could not be resolved: {reason}")]
    Unresolved { dtmi: String, reason: String },
}

pub struct ModelParser {
    source: Option<Arc<dyn ModelSource>>,
}

impl ModelParser {
    pub fn new(source: Arc<dyn ModelSource>) -> Self {
        ModelParser {
            source: Some(source),
        }
    }

    /// A parser that cannot fetch anything: every reference must be defined in
    /// the documents handed to [`ModelParser::parse`].
    pub fn offline() -> Self {
        ModelParser { source: None }
    }

    pub async fn parse(&self, documents: &[String]) -> Result<ModelSet, ParseError> {
        let mut set = ModelSet::default();
        for document in documents {
            ingest(&mut set, document, true)?;
        }

        let mut attempted: Vec<Dtmi> = Vec::new();
        loop {
            let missing = set.unresolved();
            if missing.is_empty() {
                break;
            }

            if let Some(dtmi) = missing.iter().find(|d| attempted.contains(*d)) {
                return Err(ParseError::Unresolved {
                    dtmi: dtmi.to_string(),
                    reason: "fetched document does not define it".to_string(),
                });
            }

            let Some(source) = &self.source else {
                return Err(ParseError::Unresolved {
                    dtmi: missing[0].to_string(),
                    reason: "no model source configured".to_string(),
                });
            };

            info!(
                "resolving {} referenced models: {}",
                missing.len(),
                missing.iter().join(", ")
            );
            let fetched = join_all(missing.iter().map(|dtmi| source.fetch(dtmi))).await;
            for (dtmi, result) in missing.iter().zip(fetched) {
                let document = result.map_err(|e| ParseError::Unresolved {
                    dtmi: dtmi.to_string(),
                    reason: e.to_string(),
                })?;
                ingest(&mut set, &document, false)?;
            }
            attempted.extend(missing);
        }

        debug!("parsed model set with {} entities", set.len());
        Ok(set)
    }
}

fn ingest(set: &mut ModelSet, document: &str, strict: bool) -> Result<(), ParseError> {
    let value: Value = serde_json::from_str(document)?;
    match value {
        Value::Object(obj) => {
            parse_top_level(set, &obj, strict)?;
        }
        Value::Array(items) => {
            for item in items {
                let Value::Object(obj) = item else {
                    return Err(ParseError::NotAnObject);
                };
                parse_top_level(set, &obj, strict)?;
            }
        }
        _ => return Err(ParseError::NotAnObject),
    }
    Ok(())
}

fn parse_top_level(
    set: &mut ModelSet,
    obj: &Map<String, Value>,
    strict: bool,
) -> Result<(), ParseError> {
    let id = element_id(obj, None, "", None)?;
    check_context(obj, &id)?;

    if set.contains(&id) {
        // resolved documents commonly repeat interfaces the set already holds
        if strict {
            return Err(ParseError::Duplicate {
                element: id.to_string(),
            });
        }
        debug!("skipping already defined interface {}", id);
        return Ok(());
    }

    parse_interface(set, obj, id, None)?;
    Ok(())
}

fn check_context(obj: &Map<String, Value>, id: &Dtmi) -> Result<(), ParseError> {
    let contexts: Vec<&str> = match obj.get("@context") {
        None => return Ok(()),
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(values)) => values.iter().filter_map(Value::as_str).collect(),
        Some(other) => {
            return Err(ParseError::UnsupportedContext {
                element: id.to_string(),
                value: other.to_string(),
            })
        }
    };

    let dtdl = contexts
        .iter()
        .find(|c| c.starts_with("dtmi:dtdl:context;"));
    match dtdl {
        Some(c) if SUPPORTED_CONTEXTS.contains(c) => Ok(()),
        Some(c) => Err(ParseError::UnsupportedContext {
            element: id.to_string(),
            value: c.to_string(),
        }),
        None => Err(ParseError::UnsupportedContext {
            element: id.to_string(),
            value: contexts.join(","),
        }),
    }
}

/// Reads `@id`, or derives one from the parent when the element is anonymous.
/// Top-level and nested interfaces must carry an explicit identifier.
fn element_id(
    obj: &Map<String, Value>,
    parent: Option<&Dtmi>,
    property: &str,
    name: Option<&str>,
) -> Result<Dtmi, ParseError> {
    match obj.get("@id") {
        Some(Value::String(raw)) => Dtmi::parse(raw).map_err(|e| ParseError::InvalidProperty {
            element: parent.map(|p| p.to_string()).unwrap_or_default(),
            property: "@id",
            reason: e.to_string(),
        }),
        Some(other) => Err(ParseError::InvalidProperty {
            element: parent.map(|p| p.to_string()).unwrap_or_default(),
            property: "@id",
            reason: format!("expected a string, got {}", other),
        }),
        None => match parent {
            Some(parent) => Ok(Dtmi::derived(parent, property, name)),
            None => Err(ParseError::MissingProperty {
                element: "interface".to_string(),
                property: "@id",
            }),
        },
    }
}

/// Splits `@type` into the declared kind and the remaining semantic types.
fn element_types(
    obj: &Map<String, Value>,
    id: &Dtmi,
) -> Result<(EntityKind, Vec<SupplementalType>), ParseError> {
    let types: Vec<&str> = match obj.get("@type") {
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(values)) => values.iter().filter_map(Value::as_str).collect(),
        _ => {
            return Err(ParseError::MissingProperty {
                element: id.to_string(),
                property: "@type",
            })
        }
    };

    let kind = types
        .iter()
        .find_map(|t| EntityKind::from_type(t))
        .ok_or_else(|| ParseError::UnsupportedType {
            element: id.to_string(),
            value: types.join(","),
        })?;
    let supplemental = types
        .iter()
        .filter(|t| EntityKind::from_type(t).is_none())
        .map(|t| SupplementalType::new(t))
        .collect();
    Ok((kind, supplemental))
}

/// `displayName` and `description` are either a string or a language map.
fn localized(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("en")
            .or_else(|| map.values().next())
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn required_name(obj: &Map<String, Value>, element: &str) -> Result<String, ParseError> {
    obj.get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ParseError::MissingProperty {
            element: element.to_string(),
            property: "name",
        })
}

fn apply_common(entity: &mut Entity, obj: &Map<String, Value>) {
    entity.display_name = localized(obj.get("displayName"));
    entity.description = localized(obj.get("description"));
    if entity.name.is_none() {
        entity.name = obj.get("name").and_then(Value::as_str).map(str::to_string);
    }
}

fn parse_interface(
    set: &mut ModelSet,
    obj: &Map<String, Value>,
    id: Dtmi,
    defined_in: Option<&Dtmi>,
) -> Result<Dtmi, ParseError> {
    let (kind, supplemental_types) = element_types(obj, &id)?;
    if kind != EntityKind::Interface {
        return Err(ParseError::UnsupportedType {
            element: id.to_string(),
            value: format!("{} (expected Interface)", kind),
        });
    }

    let mut interface = Entity::new(id.clone(), EntityKind::Interface);
    interface.supplemental_types = supplemental_types;
    interface.defined_in = defined_in.cloned();
    apply_common(&mut interface, obj);

    if let Some(schemas) = obj.get("schemas") {
        let Value::Array(schemas) = schemas else {
            return Err(ParseError::InvalidProperty {
                element: id.to_string(),
                property: "schemas",
                reason: "expected an array".to_string(),
            });
        };
        for schema in schemas {
            let Value::Object(schema) = schema else {
                return Err(ParseError::InvalidProperty {
                    element: id.to_string(),
                    property: "schemas",
                    reason: "expected an array of objects".to_string(),
                });
            };
            if !schema.contains_key("@id") {
                return Err(ParseError::MissingProperty {
                    element: format!("{} schemas", id),
                    property: "@id",
                });
            }
            parse_complex_schema(set, schema, &id, "schemas")?;
        }
    }

    if let Some(extends) = obj.get("extends") {
        let items = match extends {
            Value::Array(items) => items.iter().collect_vec(),
            single => vec![single],
        };
        for item in items {
            let parent = interface_reference(set, item, &id, "extends")?;
            interface.extends.push(parent);
        }
    }

    if let Some(contents) = obj.get("contents") {
        let Value::Array(contents) = contents else {
            return Err(ParseError::InvalidProperty {
                element: id.to_string(),
                property: "contents",
                reason: "expected an array".to_string(),
            });
        };
        for content in contents {
            let Value::Object(content) = content else {
                return Err(ParseError::InvalidProperty {
                    element: id.to_string(),
                    property: "contents",
                    reason: "expected an array of objects".to_string(),
                });
            };
            let content_id = parse_content(set, content, &id)?;
            interface.contents.push(content_id);
        }
    }

    set.insert(interface);
    Ok(id)
}

/// A reference to an interface: a DTMI to resolve, or an inline definition.
fn interface_reference(
    set: &mut ModelSet,
    value: &Value,
    parent: &Dtmi,
    property: &'static str,
) -> Result<Dtmi, ParseError> {
    match value {
        Value::String(raw) => {
            let dtmi = Dtmi::parse(raw).map_err(|e| ParseError::InvalidProperty {
                element: parent.to_string(),
                property,
                reason: e.to_string(),
            })?;
            set.references.insert(dtmi.clone());
            Ok(dtmi)
        }
        Value::Object(obj) => {
            let id = element_id(obj, None, property, None).map_err(|_| {
                ParseError::MissingProperty {
                    element: format!("{} {}", parent, property),
                    property: "@id",
                }
            })?;
            if set.contains(&id) {
                return Ok(id);
            }
            parse_interface(set, obj, id, Some(parent))
        }
        other => Err(ParseError::InvalidProperty {
            element: parent.to_string(),
            property,
            reason: format!("expected an identifier or an interface, got {}", other),
        }),
    }
}

fn parse_content(
    set: &mut ModelSet,
    obj: &Map<String, Value>,
    interface: &Dtmi,
) -> Result<Dtmi, ParseError> {
    let name = required_name(obj, &format!("{} contents", interface))?;
    let id = element_id(obj, Some(interface), "contents", Some(&name))?;
    let (kind, supplemental_types) = element_types(obj, &id)?;
    if !kind.is_content() {
        return Err(ParseError::UnsupportedType {
            element: id.to_string(),
            value: kind.to_string(),
        });
    }

    let mut content = Entity::new(id.clone(), kind);
    content.name = Some(name);
    content.supplemental_types = supplemental_types;
    content.defined_in = Some(interface.clone());
    apply_common(&mut content, obj);
    content.unit = obj.get("unit").and_then(Value::as_str).map(str::to_string);

    match kind {
        EntityKind::Telemetry | EntityKind::Property => {
            let schema = obj.get("schema").ok_or_else(|| ParseError::MissingProperty {
                element: id.to_string(),
                property: "schema",
            })?;
            content.schema = Some(parse_schema(set, schema, &id)?);
            content.writable = obj
                .get("writable")
                .and_then(Value::as_bool)
                .unwrap_or(false);
        }
        EntityKind::Component => {
            let schema = obj.get("schema").ok_or_else(|| ParseError::MissingProperty {
                element: id.to_string(),
                property: "schema",
            })?;
            let interface = interface_reference(set, schema, &id, "schema")?;
            content.schema = Some(Schema::Complex(interface));
        }
        EntityKind::Relationship => {
            // relationship targets are not resolved; they only constrain the graph
            content.target = obj
                .get("target")
                .and_then(Value::as_str)
                .and_then(|t| Dtmi::parse(t).ok());
            content.writable = obj
                .get("writable")
                .and_then(Value::as_bool)
                .unwrap_or(false);
        }
        _ => {}
    }

    set.insert(content);
    Ok(id)
}

fn parse_schema(set: &mut ModelSet, value: &Value, owner: &Dtmi) -> Result<Schema, ParseError> {
    match value {
        Value::String(raw) => {
            if let Some(primitive) = Schema::primitive(raw) {
                return Ok(primitive);
            }
            let dtmi = Dtmi::parse(raw).map_err(|_| ParseError::InvalidProperty {
                element: owner.to_string(),
                property: "schema",
                reason: format!("unknown schema {}", raw),
            })?;
            if dtmi.is_standard_schema() {
                return Ok(Schema::Standard(dtmi));
            }
            set.references.insert(dtmi.clone());
            Ok(Schema::Complex(dtmi))
        }
        Value::Object(obj) => {
            let id = parse_complex_schema(set, obj, owner, "schema")?;
            Ok(Schema::Complex(id))
        }
        other => Err(ParseError::InvalidProperty {
            element: owner.to_string(),
            property: "schema",
            reason: format!("expected a schema, got {}", other),
        }),
    }
}

fn parse_complex_schema(
    set: &mut ModelSet,
    obj: &Map<String, Value>,
    owner: &Dtmi,
    property: &str,
) -> Result<Dtmi, ParseError> {
    let id = element_id(obj, Some(owner), property, None)?;
    let (kind, supplemental_types) = element_types(obj, &id)?;
    if !kind.is_complex_schema() {
        return Err(ParseError::UnsupportedType {
            element: id.to_string(),
            value: kind.to_string(),
        });
    }

    let mut schema = Entity::new(id.clone(), kind);
    schema.supplemental_types = supplemental_types;
    schema.defined_in = Some(owner.clone());
    apply_common(&mut schema, obj);

    match kind {
        EntityKind::Object => {
            for field in array_of_objects(obj, "fields", &id)? {
                let name = required_name(field, &format!("{} fields", id))?;
                let field_id = element_id(field, Some(&id), "fields", Some(&name))?;
                let mut entity = Entity::new(field_id.clone(), EntityKind::Field);
                entity.name = Some(name);
                entity.defined_in = Some(id.clone());
                apply_common(&mut entity, field);
                let field_schema = field.get("schema").ok_or_else(|| {
                    ParseError::MissingProperty {
                        element: field_id.to_string(),
                        property: "schema",
                    }
                })?;
                entity.schema = Some(parse_schema(set, field_schema, &field_id)?);
                set.insert(entity);
                schema.fields.push(field_id);
            }
        }
        EntityKind::Enum => {
            let value_schema = obj
                .get("valueSchema")
                .and_then(Value::as_str)
                .and_then(Schema::primitive)
                .ok_or_else(|| ParseError::MissingProperty {
                    element: id.to_string(),
                    property: "valueSchema",
                })?;
            schema.schema = Some(value_schema);
            for value in array_of_objects(obj, "enumValues", &id)? {
                let name = required_name(value, &format!("{} enumValues", id))?;
                let value_id = element_id(value, Some(&id), "enumValues", Some(&name))?;
                let mut entity = Entity::new(value_id.clone(), EntityKind::EnumValue);
                entity.name = Some(name);
                entity.defined_in = Some(id.clone());
                apply_common(&mut entity, value);
                entity.enum_value = Some(value.get("enumValue").cloned().ok_or_else(|| {
                    ParseError::MissingProperty {
                        element: value_id.to_string(),
                        property: "enumValue",
                    }
                })?);
                set.insert(entity);
                schema.fields.push(value_id);
            }
        }
        EntityKind::Map => {
            for property in ["mapKey", "mapValue"] {
                let Some(Value::Object(part)) = obj.get(property) else {
                    return Err(ParseError::MissingProperty {
                        element: id.to_string(),
                        property,
                    });
                };
                let name = required_name(part, &format!("{} {}", id, property))?;
                let part_id = element_id(part, Some(&id), property, None)?;
                let mut entity = Entity::new(part_id.clone(), EntityKind::Field);
                entity.name = Some(name);
                entity.defined_in = Some(id.clone());
                apply_common(&mut entity, part);
                let part_schema = part.get("schema").ok_or_else(|| ParseError::MissingProperty {
                    element: part_id.to_string(),
                    property: "schema",
                })?;
                entity.schema = Some(parse_schema(set, part_schema, &part_id)?);
                set.insert(entity);
                schema.fields.push(part_id);
            }
        }
        EntityKind::Array => {
            let element = obj
                .get("elementSchema")
                .ok_or_else(|| ParseError::MissingProperty {
                    element: id.to_string(),
                    property: "elementSchema",
                })?;
            schema.schema = Some(parse_schema(set, element, &id)?);
        }
        _ => {}
    }

    set.insert(schema);
    Ok(id)
}

fn array_of_objects<'a>(
    obj: &'a Map<String, Value>,
    property: &'static str,
    id: &Dtmi,
) -> Result<Vec<&'a Map<String, Value>>, ParseError> {
    let Some(value) = obj.get(property) else {
        return Err(ParseError::MissingProperty {
            element: id.to_string(),
            property,
        });
    };
    let Value::Array(items) = value else {
        return Err(ParseError::InvalidProperty {
            element: id.to_string(),
            property,
            reason: "expected an array".to_string(),
        });
    };
    items
        .iter()
        .map(|item| match item {
            Value::Object(obj) => Ok(obj),
            _ => Err(ParseError::InvalidProperty {
                element: id.to_string(),
                property,
                reason: "expected an array of objects".to_string(),
            }),
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    const THERMOSTAT: &str = r#"{
        "@context": "dtmi:dtdl:context;2",
        "@id": "dtmi:com:example:Thermostat;1",
        "@type": "Interface",
        "displayName": "Thermostat",
        "contents": [
            {
                "@type": ["Telemetry", "Temperature"],
                "name": "temperature",
                "displayName": {"en": "Temperature"},
                "schema": "double",
                "unit": "degreeCelsius"
            },
            {
                "@type": ["Property", "Temperature"],
                "name": "targetTemperature",
                "schema": "double",
                "writable": true
            },
            {
                "@type": "Property",
                "name": "mode",
                "schema": {
                    "@type": "Enum",
                    "valueSchema": "string",
                    "enumValues": [
                        {"name": "heat", "enumValue": "heat"},
                        {"name": "cool", "enumValue": "cool"}
                    ]
                }
            },
            {
                "@type": "Command",
                "name": "getMaxMinReport"
            }
        ]
    }"#;

    const CONTROLLER: &str = r#"{
        "@context": "dtmi:dtdl:context;2",
        "@id": "dtmi:com:example:TemperatureController;1",
        "@type": "Interface",
        "extends": "dtmi:com:example:Base;1",
        "contents": [
            {"@type": "Component", "name": "thermostat1", "schema": "dtmi:com:example:Thermostat;1"},
            {"@type": "Telemetry", "name": "co2", "schema": "integer"}
        ]
    }"#;

    const BASE: &str = r#"[{
        "@context": "dtmi:dtdl:context;2",
        "@id": "dtmi:com:example:Base;1",
        "@type": "Interface",
        "schemas": [
            {
                "@id": "dtmi:com:example:Base:reading;1",
                "@type": "Object",
                "fields": [
                    {"name": "value", "schema": "double"},
                    {"name": "at", "schema": "dateTime"}
                ]
            }
        ],
        "contents": [
            {"@type": "Telemetry", "name": "reading", "schema": "dtmi:com:example:Base:reading;1"},
            {"@type": "Property", "name": "location", "schema": "dtmi:standard:schema:geospatial:point;2"}
        ]
    }]"#;

    fn id(s: &str) -> Dtmi {
        Dtmi::parse(s).unwrap()
    }

    fn store(models: &[(&str, &str)]) -> Arc<dyn ModelSource> {
        let map: HashMap<Dtmi, String> = models
            .iter()
            .map(|(k, v)| (id(k), v.to_string()))
            .collect();
        Arc::new(map)
    }

    #[tokio::test]
    async fn test_parse_single_interface() {
        let set = ModelParser::offline()
            .parse(&[THERMOSTAT.to_string()])
            .await
            .unwrap();

        let root = id("dtmi:com:example:Thermostat;1");
        let interface = set.interface(&root).unwrap();
        assert_eq!(interface.display_name.as_deref(), Some("Thermostat"));
        assert_eq!(interface.contents.len(), 4);

        let telemetry = set.telemetry_of(&root);
        assert_eq!(telemetry.len(), 1);
        assert_eq!(telemetry[0].name(), "temperature");
        assert_eq!(
            telemetry[0].id.as_str(),
            "dtmi:com:example:Thermostat:_contents:__temperature;1"
        );
        assert!(telemetry[0].has_supplemental_type("dtmi:standard:class:Temperature"));
        assert_eq!(telemetry[0].schema, Some(Schema::Double));
        assert_eq!(telemetry[0].unit.as_deref(), Some("degreeCelsius"));

        let enums: Vec<_> = set.of_kind(EntityKind::Enum).collect();
        assert_eq!(enums.len(), 1);
        assert_eq!(enums[0].fields.len(), 2);
        assert_eq!(set.of_kind(EntityKind::EnumValue).count(), 2);
        assert_eq!(set.of_kind(EntityKind::Command).count(), 1);
    }

    #[tokio::test]
    async fn test_resolves_components_and_extends() {
        let parser = ModelParser::new(store(&[
            ("dtmi:com:example:Thermostat;1", THERMOSTAT),
            ("dtmi:com:example:Base;1", BASE),
        ]));
        let set = parser.parse(&[CONTROLLER.to_string()]).await.unwrap();

        let root = id("dtmi:com:example:TemperatureController;1");
        let names: Vec<_> = set.telemetry_of(&root).iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["co2", "reading"]);

        let component = set.component_interface(&root, "thermostat1").unwrap();
        assert_eq!(component.id, id("dtmi:com:example:Thermostat;1"));
        assert!(set.component_interface(&root, "thermostat2").is_none());

        let reading = set.get(&id("dtmi:com:example:Base:reading;1")).unwrap();
        assert_eq!(reading.kind, EntityKind::Object);
        assert_eq!(reading.fields.len(), 2);
    }

    #[tokio::test]
    async fn test_unresolvable_reference_fails_parse() {
        let parser = ModelParser::new(store(&[("dtmi:com:example:Base;1", BASE)]));
        let err = parser.parse(&[CONTROLLER.to_string()]).await.unwrap_err();
        match err {
            ParseError::Unresolved { dtmi, .. } => {
                assert_eq!(dtmi, "dtmi:com:example:Thermostat;1")
            }
            other => panic!("unexpected error {:?}", other),
        }

        let err = ModelParser::offline()
            .parse(&[CONTROLLER.to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::Unresolved { .. }));
    }

    #[tokio::test]
    async fn test_fetched_document_must_define_reference() {
        let parser = ModelParser::new(store(&[
            ("dtmi:com:example:Thermostat;1", THERMOSTAT),
            ("dtmi:com:example:Base;1", THERMOSTAT),
        ]));
        let err = parser.parse(&[CONTROLLER.to_string()]).await.unwrap_err();
        assert!(
            matches!(err, ParseError::Unresolved { ref dtmi, .. } if dtmi == "dtmi:com:example:Base;1"),
            "got {:?}",
            err
        );
    }

    #[tokio::test]
    async fn test_extends_cycle_terminates() {
        let a = r#"{"@id": "dtmi:com:example:A;1", "@type": "Interface", "extends": "dtmi:com:example:B;1",
                    "contents": [{"@type": "Telemetry", "name": "a", "schema": "double"}]}"#;
        let b = r#"{"@id": "dtmi:com:example:B;1", "@type": "Interface", "extends": "dtmi:com:example:A;1",
                    "contents": [{"@type": "Telemetry", "name": "b", "schema": "double"}]}"#;
        let parser = ModelParser::new(store(&[("dtmi:com:example:B;1", b)]));
        let set = parser.parse(&[a.to_string()]).await.unwrap();
        assert_eq!(set.telemetry_of(&id("dtmi:com:example:A;1")).len(), 2);
    }

    #[tokio::test]
    async fn test_structural_errors() {
        let cases = [
            (r#"{"@type": "Interface"}"#, "missing @id"),
            (r#"{"@id": "dtmi:com:example:A;1"}"#, "missing @type"),
            (
                r#"{"@id": "dtmi:com:example:A;1", "@type": "Interface", "contents": [{"@type": "Telemetry", "schema": "double"}]}"#,
                "missing name",
            ),
            (
                r#"{"@id": "dtmi:com:example:A;1", "@type": "Interface", "contents": [{"@type": "Sensor", "name": "x"}]}"#,
                "unknown type",
            ),
            (
                r#"{"@id": "dtmi:com:example:A;1", "@type": "Interface", "contents": [{"@type": "Telemetry", "name": "x", "schema": "decimal"}]}"#,
                "unknown schema",
            ),
            (
                r#"{"@context": "dtmi:dtdl:context;1", "@id": "dtmi:com:example:A;1", "@type": "Interface"}"#,
                "unsupported context",
            ),
            (r#""just a string""#, "not an object"),
            (r#"{"@id": "#, "bad json"),
        ];
        for (doc, case) in cases {
            let result = ModelParser::offline().parse(&[doc.to_string()]).await;
            assert!(result.is_err(), "expected error for {}", case);
        }
    }

    #[tokio::test]
    async fn test_duplicate_root_definitions_rejected() {
        let result = ModelParser::offline()
            .parse(&[THERMOSTAT.to_string(), THERMOSTAT.to_string()])
            .await;
        assert!(matches!(result, Err(ParseError::Duplicate { .. })));
    }
}
