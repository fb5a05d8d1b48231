//! NGSIv2 entity model and the KPI shape every collector reports.
//!
//! # Design
//! An entity serializes flat: `id` and `type` next to one object per
//! attribute, each attribute carrying its own `type` and `value`. Attributes
//! are kept in a `BTreeMap` so serialized bodies are deterministic.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Entity type used for every KPI record.
pub const KPI_ENTITY_TYPE: &str = "KeyPerformanceIndicator";

/// Named attributes of an entity.
pub type Attributes = BTreeMap<String, Attribute>;

/// A single typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    #[serde(rename = "type")]
    pub attr_type: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Attribute {
    pub fn new(attr_type: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            attr_type: attr_type.into(),
            value: value.into(),
            metadata: Map::new(),
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::new("Text", value.into())
    }

    /// Free text; unlike `Text`, the broker accepts any character in it.
    pub fn text_unrestricted(value: impl Into<String>) -> Self {
        Self::new("TextUnrestricted", value.into())
    }

    pub fn number(value: impl Into<Value>) -> Self {
        Self::new("Number", value)
    }

    pub fn date_time(instant: DateTime<Utc>) -> Self {
        Self::new("DateTime", instant.to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

/// A uniquely identified, typed record with named attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(flatten)]
    pub attributes: Attributes,
}

impl Entity {
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, attribute: Attribute) -> Self {
        self.attributes.insert(name.into(), attribute);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.get(name)
    }
}

/// Builder for `KeyPerformanceIndicator` entities.
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use orion_core::Kpi;
///
/// let entity = Kpi::new("followers_count", 1250)
///     .description("Total number of followers")
///     .time_instant(Utc.with_ymd_and_hms(2021, 3, 1, 0, 0, 0).unwrap())
///     .source("twitter")
///     .product("acme")
///     .build();
/// assert_eq!(entity.entity_type, "KeyPerformanceIndicator");
/// assert_eq!(entity.attributes["TimeInstant"].value, "2021-03-01T00:00:00Z");
/// ```
#[derive(Debug, Clone)]
pub struct Kpi {
    entity: Entity,
}

impl Kpi {
    /// A KPI whose `name` defaults to its id.
    pub fn new(id: impl Into<String>, value: impl Into<Value>) -> Self {
        let id = id.into();
        let entity = Entity::new(id.clone(), KPI_ENTITY_TYPE)
            .with_attribute("name", Attribute::text(id))
            .with_attribute("kpiValue", Attribute::number(value));
        Self { entity }
    }

    pub fn name(self, name: impl Into<String>) -> Self {
        self.set("name", Attribute::text(name))
    }

    pub fn description(self, description: impl Into<String>) -> Self {
        self.set("description", Attribute::text(description))
    }

    pub fn time_instant(self, instant: DateTime<Utc>) -> Self {
        self.set("TimeInstant", Attribute::date_time(instant))
    }

    pub fn source(self, source: impl Into<String>) -> Self {
        self.set("source", Attribute::text(source))
    }

    pub fn product(self, product: impl Into<String>) -> Self {
        self.set("product", Attribute::text(product))
    }

    /// Granularity the value was aggregated at (e.g. a region level).
    pub fn aggregated_data(self, granularity: impl Into<String>) -> Self {
        self.set("aggregatedData", Attribute::text_unrestricted(granularity))
    }

    /// Override any attribute, e.g. to mark a field `TextUnrestricted`.
    pub fn set(mut self, name: &str, attribute: Attribute) -> Self {
        self.entity.attributes.insert(name.to_string(), attribute);
        self
    }

    pub fn build(self) -> Entity {
        self.entity
    }
}

impl From<Kpi> for Entity {
    fn from(kpi: Kpi) -> Self {
        kpi.build()
    }
}
