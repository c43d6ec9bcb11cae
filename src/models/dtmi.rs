use fancy_regex::Regex;
use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

// https://github.com/Azure/digital-twin-model-identifier#validation-regular-expressions
static DTMI_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^dtmi:[A-Za-z](?:[A-Za-z0-9_]*[A-Za-z0-9])?(?::[A-Za-z](?:[A-Za-z0-9_]*[A-Za-z0-9])?)*;[1-9][0-9]{0,8}$",
    )
    .expect("Failed to create dtmi regex")
});

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid model identifier: {0:?}")]
pub struct InvalidDtmi(pub String);

pub fn is_valid_dtmi(value: &str) -> bool {
    DTMI_REGEX.is_match(value).unwrap_or(false)
}

/// A digital twin model identifier such as `dtmi:com:example:Thermostat;1`.
///
/// Identifiers built with [`Dtmi::parse`] satisfy the public grammar. Element
/// identifiers the parser derives for anonymous contents and inline schemas
/// (`dtmi:com:example:Thermostat:_contents:__temperature;1`) use reserved
/// `_` segments and only exist inside a [`super::ModelSet`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dtmi(String);

impl Dtmi {
    pub fn parse(value: &str) -> Result<Self, InvalidDtmi> {
        if is_valid_dtmi(value) {
            Ok(Dtmi(value.to_string()))
        } else {
            Err(InvalidDtmi(value.to_string()))
        }
    }

    /// Identifier of an element nested under `parent` through `property`.
    pub(crate) fn derived(parent: &Dtmi, property: &str, name: Option<&str>) -> Self {
        let name_segment = name.map(|n| format!(":__{}", n)).unwrap_or_default();
        Dtmi(format!(
            "{}:_{}{};{}",
            parent.versionless(),
            property,
            name_segment,
            parent.version()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn versionless(&self) -> &str {
        self.0.rsplit_once(';').map(|(id, _)| id).unwrap_or(&self.0)
    }

    pub fn version(&self) -> u32 {
        self.0
            .rsplit_once(';')
            .and_then(|(_, v)| v.parse().ok())
            .unwrap_or(1)
    }

    /// Repository-relative path of the model document, following the model
    /// repository convention:
    /// `dtmi:com:example:Thermostat;1` -> `/dtmi/com/example/thermostat-1.json`
    pub fn to_path(&self) -> String {
        format!(
            "/{}.json",
            self.0.to_lowercase().replace(':', "/").replace(';', "-")
        )
    }

    pub fn is_standard_schema(&self) -> bool {
        self.0.starts_with("dtmi:standard:schema:")
    }
}

/// Repository path for a raw identifier, or an error when it does not match
/// the identifier grammar. No path is ever produced for an invalid id.
pub fn dtmi_to_path(value: &str) -> Result<String, InvalidDtmi> {
    Dtmi::parse(value).map(|dtmi| dtmi.to_path())
}

impl FromStr for Dtmi {
    type Err = InvalidDtmi;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Dtmi::parse(s)
    }
}

impl fmt::Display for Dtmi {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Dtmi {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Dtmi {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Dtmi::parse(&raw).map_err(serde::de::Error::custom)
    }
}
