use crate::models::dtmi::Dtmi;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Interface,
    Telemetry,
    Property,
    Command,
    Relationship,
    Component,
    Object,
    Field,
    Enum,
    EnumValue,
    Map,
    Array,
}

impl EntityKind {
    /// Maps a DTDL `@type` value to the kind it declares, if it is one.
    pub fn from_type(value: &str) -> Option<Self> {
        match value {
            "Interface" => Some(EntityKind::Interface),
            "Telemetry" => Some(EntityKind::Telemetry),
            "Property" => Some(EntityKind::Property),
            "Command" => Some(EntityKind::Command),
            "Relationship" => Some(EntityKind::Relationship),
            "Component" => Some(EntityKind::Component),
            "Object" => Some(EntityKind::Object),
            "Enum" => Some(EntityKind::Enum),
            "Map" => Some(EntityKind::Map),
            "Array" => Some(EntityKind::Array),
            _ => None,
        }
    }

    pub fn is_content(&self) -> bool {
        matches!(
            self,
            EntityKind::Telemetry
                | EntityKind::Property
                | EntityKind::Command
                | EntityKind::Relationship
                | EntityKind::Component
        )
    }

    pub fn is_complex_schema(&self) -> bool {
        matches!(
            self,
            EntityKind::Object | EntityKind::Enum | EntityKind::Map | EntityKind::Array
        )
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Semantic annotation carried in a content's `@type` next to its kind,
/// e.g. `["Telemetry", "Temperature"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SupplementalType {
    id: String,
}

impl SupplementalType {
    pub const STANDARD_CLASS_PREFIX: &'static str = "dtmi:standard:class:";

    pub fn new(value: &str) -> Self {
        let id = if value.starts_with("dtmi:") {
            value.to_string()
        } else {
            format!("{}{};2", Self::STANDARD_CLASS_PREFIX, value)
        };
        SupplementalType { id }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// `dtmi:standard:class:Temperature;2` -> `dtmi:standard:class:Temperature`
    pub fn versionless(&self) -> &str {
        self.id.rsplit_once(';').map(|(id, _)| id).unwrap_or(&self.id)
    }

    /// Last identifier segment, e.g. `Temperature`.
    pub fn short_name(&self) -> &str {
        self.versionless()
            .rsplit(':')
            .next()
            .unwrap_or(self.versionless())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schema {
    Boolean,
    Date,
    DateTime,
    Double,
    Duration,
    Float,
    Integer,
    Long,
    String,
    Time,
    /// Built-in schemas from `dtmi:standard:schema:`, e.g. geospatial points.
    Standard(Dtmi),
    /// A complex schema entity (inline or referenced) in the model set.
    Complex(Dtmi),
}

impl Schema {
    pub fn primitive(name: &str) -> Option<Self> {
        match name {
            "boolean" => Some(Schema::Boolean),
            "date" => Some(Schema::Date),
            "dateTime" => Some(Schema::DateTime),
            "double" => Some(Schema::Double),
            "duration" => Some(Schema::Duration),
            "float" => Some(Schema::Float),
            "integer" => Some(Schema::Integer),
            "long" => Some(Schema::Long),
            "string" => Some(Schema::String),
            "time" => Some(Schema::Time),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub id: Dtmi,
    pub kind: EntityKind,
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub supplemental_types: Vec<SupplementalType>,
    pub schema: Option<Schema>,
    pub unit: Option<String>,
    pub writable: bool,
    /// Entity this one was declared in; `None` for top-level interfaces.
    pub defined_in: Option<Dtmi>,
    /// Interface contents.
    pub contents: Vec<Dtmi>,
    /// Interfaces this interface extends.
    pub extends: Vec<Dtmi>,
    /// Object fields, enum values, or map key and value.
    pub fields: Vec<Dtmi>,
    pub enum_value: Option<Value>,
    pub target: Option<Dtmi>,
}

impl Entity {
    pub fn new(id: Dtmi, kind: EntityKind) -> Self {
        Entity {
            id,
            kind,
            name: None,
            display_name: None,
            description: None,
            supplemental_types: Vec::new(),
            schema: None,
            unit: None,
            writable: false,
            defined_in: None,
            contents: Vec::new(),
            extends: Vec::new(),
            fields: Vec::new(),
            enum_value: None,
            target: None,
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    pub fn has_supplemental_type(&self, versionless: &str) -> bool {
        self.supplemental_types
            .iter()
            .any(|t| t.versionless() == versionless)
    }
}

/// Symbol table produced by the parser: every entity of every parsed and
/// resolved model, keyed by its identifier.
#[derive(Debug, Clone, Default)]
pub struct ModelSet {
    entities: BTreeMap<Dtmi, Entity>,
    pub(crate) references: BTreeSet<Dtmi>,
}

impl ModelSet {
    pub fn get(&self, id: &Dtmi) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &Dtmi) -> bool {
        self.entities.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn of_kind(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> {
        self.entities.values().filter(move |e| e.kind == kind)
    }

    pub fn interface(&self, id: &Dtmi) -> Option<&Entity> {
        self.get(id).filter(|e| e.kind == EntityKind::Interface)
    }

    pub(crate) fn insert(&mut self, entity: Entity) {
        self.entities.insert(entity.id.clone(), entity);
    }

    /// Referenced identifiers that are neither defined in the set nor built in.
    pub(crate) fn unresolved(&self) -> Vec<Dtmi> {
        self.references
            .iter()
            .filter(|d| !d.is_standard_schema() && !self.entities.contains_key(*d))
            .cloned()
            .collect()
    }

    /// Contents of an interface including the ones it inherits, in
    /// declaration order with the interface's own contents first.
    pub fn contents_of(&self, interface: &Dtmi) -> Vec<&Entity> {
        let mut visited = HashSet::new();
        let mut contents = Vec::new();
        self.collect_contents(interface, &mut visited, &mut contents);
        contents
    }

    fn collect_contents<'a>(
        &'a self,
        interface: &Dtmi,
        visited: &mut HashSet<Dtmi>,
        out: &mut Vec<&'a Entity>,
    ) {
        if !visited.insert(interface.clone()) {
            return;
        }
        let Some(entity) = self.interface(interface) else {
            return;
        };
        out.extend(entity.contents.iter().filter_map(|id| self.get(id)));
        for parent in &entity.extends {
            self.collect_contents(parent, visited, out);
        }
    }

    pub fn telemetry_of(&self, interface: &Dtmi) -> Vec<&Entity> {
        self.contents_of(interface)
            .into_iter()
            .filter(|e| e.kind == EntityKind::Telemetry)
            .collect()
    }

    /// Interface that the component named `name` of `interface` is typed as.
    pub fn component_interface(&self, interface: &Dtmi, name: &str) -> Option<&Entity> {
        self.contents_of(interface)
            .into_iter()
            .find(|e| e.kind == EntityKind::Component && e.name() == name)
            .and_then(|component| match &component.schema {
                Some(Schema::Complex(id)) => self.interface(id),
                _ => None,
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_supplemental_type_names() {
        let t = SupplementalType::new("Temperature");
        assert_eq!(t.id(), "dtmi:standard:class:Temperature;2");
        assert_eq!(t.versionless(), "dtmi:standard:class:Temperature");
        assert_eq!(t.short_name(), "Temperature");

        let t = SupplementalType::new("dtmi:iotcentral:class:Location;2");
        assert_eq!(t.versionless(), "dtmi:iotcentral:class:Location");
        assert_eq!(t.short_name(), "Location");
    }

    #[test]
    fn test_contents_follow_extends_without_looping() {
        let a = Dtmi::parse("dtmi:com:example:A;1").unwrap();
        let b = Dtmi::parse("dtmi:com:example:B;1").unwrap();
        let ta = Dtmi::derived(&a, "contents", Some("x"));
        let tb = Dtmi::derived(&b, "contents", Some("y"));

        let mut set = ModelSet::default();
        let mut ia = Entity::new(a.clone(), EntityKind::Interface);
        ia.contents = vec![ta.clone()];
        ia.extends = vec![b.clone()];
        let mut ib = Entity::new(b.clone(), EntityKind::Interface);
        ib.contents = vec![tb.clone()];
        ib.extends = vec![a.clone()];
        set.insert(ia);
        set.insert(ib);
        set.insert(Entity::new(ta, EntityKind::Telemetry));
        set.insert(Entity::new(tb, EntityKind::Telemetry));

        assert_eq!(set.telemetry_of(&a).len(), 2);
        assert_eq!(set.telemetry_of(&b).len(), 2);
    }
}
