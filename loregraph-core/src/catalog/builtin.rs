//! Built-in entity types.
//!
//! The rich types produced by the character, ability, faction, location,
//! quest, item, bestiary and history skills get their own tables. Everything
//! else an extraction skill emits is a thin type stored in the generic table.

use super::{CatalogBuilder, RelationshipKindDef};
use crate::EntitySchema;
use serde::{Deserialize, Serialize};

/// A person or sentient being in the narrative.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, EntitySchema)]
#[entity(name = "character", table = "characters")]
#[serde(default)]
pub struct Character {
    /// Other names the character is known by.
    #[attr(merge = "union")]
    pub aliases: Vec<String>,
    /// Narrative role (protagonist, mentor, antagonist...).
    #[attr(merge = "last_write_wins")]
    pub role: Option<String>,
    /// Life story before the narrative begins.
    #[attr(min_length = 100, merge = "last_write_wins")]
    pub backstory: Option<String>,
    /// Defining personality traits.
    #[attr(merge = "union")]
    pub personality_traits: Vec<String>,
    /// Overall power rating.
    #[attr(range(min = 1, max = 10), merge = "max")]
    pub power_level: Option<i64>,
    #[attr(non_negative, merge = "max")]
    pub strength: Option<i64>,
    #[attr(non_negative, merge = "max")]
    pub agility: Option<i64>,
    #[attr(non_negative, merge = "max")]
    pub intelligence: Option<i64>,
    #[attr(non_negative, merge = "max")]
    pub age: Option<i64>,
    #[attr(one_of("active", "inactive", "deceased", "unknown"), merge = "last_write_wins")]
    pub status: Option<String>,
}

/// A power, skill or spell some entity can use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, EntitySchema)]
#[entity(name = "ability", table = "abilities")]
#[serde(default)]
pub struct Ability {
    #[attr(merge = "last_write_wins")]
    pub category: Option<String>,
    /// Strength of the ability.
    #[attr(range(min = 1, max = 10), merge = "max")]
    pub power_level: Option<i64>,
    #[attr(non_negative, merge = "max")]
    pub cost: Option<f64>,
    #[attr(merge = "union")]
    pub limitations: Vec<String>,
}

/// An organisation, house, guild or other group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, EntitySchema)]
#[entity(name = "faction", table = "factions")]
#[serde(default)]
pub struct Faction {
    #[attr(merge = "union")]
    pub aliases: Vec<String>,
    /// What the faction is trying to achieve.
    #[attr(merge = "union")]
    pub goals: Vec<String>,
    #[attr(merge = "last_write_wins")]
    pub ideology: Option<String>,
    #[attr(range(min = 1, max = 10), merge = "max")]
    pub influence: Option<i64>,
    #[attr(non_negative, merge = "max")]
    pub member_count: Option<i64>,
    #[attr(one_of("active", "inactive", "disbanded"), merge = "last_write_wins")]
    pub status: Option<String>,
}

/// A place: region, settlement, building or landmark.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, EntitySchema)]
#[entity(name = "location", table = "locations")]
#[serde(default)]
pub struct Location {
    #[attr(merge = "union")]
    pub aliases: Vec<String>,
    /// Kind of place (village, city, forest...).
    #[attr(merge = "last_write_wins")]
    pub location_type: Option<String>,
    #[attr(merge = "last_write_wins")]
    pub climate: Option<String>,
    #[attr(non_negative, merge = "max")]
    pub population: Option<i64>,
    #[attr(merge = "union")]
    pub notable_features: Vec<String>,
}

/// A mission, objective or story arc.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, EntitySchema)]
#[entity(name = "quest", table = "quests")]
#[serde(default)]
pub struct Quest {
    #[attr(merge = "union")]
    pub objectives: Vec<String>,
    #[attr(merge = "union")]
    pub rewards: Vec<String>,
    #[attr(range(min = 1, max = 10), merge = "max")]
    pub difficulty: Option<i64>,
    #[attr(one_of("active", "inactive", "completed", "failed"), merge = "last_write_wins")]
    pub status: Option<String>,
}

/// An object, artifact or piece of equipment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, EntitySchema)]
#[entity(name = "item", table = "items")]
#[serde(default)]
pub struct Item {
    #[attr(merge = "last_write_wins")]
    pub item_type: Option<String>,
    #[attr(one_of("common", "uncommon", "rare", "legendary", "unique"), merge = "last_write_wins")]
    pub rarity: Option<String>,
    #[attr(non_negative, merge = "max")]
    pub value: Option<f64>,
    #[attr(merge = "union")]
    pub properties: Vec<String>,
}

/// A creature or monster type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, EntitySchema)]
#[entity(name = "creature", table = "creatures")]
#[serde(default)]
pub struct Creature {
    #[attr(merge = "last_write_wins")]
    pub species: Option<String>,
    #[attr(range(min = 1, max = 10), merge = "max")]
    pub threat_level: Option<i64>,
    #[attr(merge = "union")]
    pub abilities: Vec<String>,
    #[attr(merge = "union")]
    pub weaknesses: Vec<String>,
}

/// A significant historical or narrative event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, EntitySchema)]
#[entity(name = "event", table = "events")]
#[serde(default)]
pub struct Event {
    #[attr(merge = "last_write_wins")]
    pub date: Option<String>,
    #[attr(merge = "union")]
    pub participants: Vec<String>,
    #[attr(merge = "union")]
    pub consequences: Vec<String>,
    #[attr(range(min = 1, max = 10), merge = "max")]
    pub significance: Option<i64>,
}

/// Entity kinds without bespoke attributes.
pub const THIN_TYPES: &[&str] = &[
    // economy
    "currency",
    "trade_route",
    "trade_good",
    "market",
    "resource",
    "industry",
    "guild",
    "tax",
    // politics
    "government",
    "law",
    "treaty",
    "political_office",
    "noble_house",
    "conflict",
    "war",
    "alliance",
    // religion and culture
    "deity",
    "religion",
    "ritual",
    "holiday",
    "tradition",
    "language",
    "custom",
    "myth",
    "legend",
    "prophecy",
    // magic and technology
    "spell",
    "magic_system",
    "artifact",
    "enchantment",
    "technology",
    "invention",
    // geography
    "region",
    "landmark",
    "building",
    "dungeon",
    "river",
    "mountain",
    "climate_zone",
    "plane",
    // society
    "organization",
    "species",
    "race",
    "culture",
    "social_class",
    "profession",
    "family",
    "dynasty",
    // narrative
    "theme",
    "motif",
    "plot_thread",
    "scene",
    "chapter",
    "secret",
    "rumor",
    "timeline_era",
    // flora, fauna and materials
    "plant",
    "animal",
    "material",
    "food",
    "disease",
    "vehicle",
    "weapon",
    "armor",
];

/// Relationship kinds between built-in types, as (name, source, target).
pub const BUILTIN_RELATIONSHIP_KINDS: &[(&str, &str, &str)] = &[
    ("character_relationship", "character", "character"),
    ("character_faction", "character", "faction"),
    ("character_location", "character", "location"),
    ("character_ability", "character", "ability"),
    ("character_item", "character", "item"),
    ("faction_territory", "faction", "location"),
    ("faction_relationship", "faction", "faction"),
    ("faction_leader", "faction", "character"),
    ("quest_location", "quest", "location"),
    ("quest_giver", "quest", "character"),
    ("quest_reward", "quest", "item"),
    ("ability_owner", "ability", "character"),
    ("item_owner", "item", "character"),
    ("item_location", "item", "location"),
    ("creature_habitat", "creature", "location"),
    ("event_location", "event", "location"),
    ("event_participant", "event", "character"),
    ("location_parent", "location", "location"),
];

pub(super) fn builder() -> CatalogBuilder {
    let mut builder = CatalogBuilder::default()
        .register::<Character>()
        .register::<Ability>()
        .register::<Faction>()
        .register::<Location>()
        .register::<Quest>()
        .register::<Item>()
        .register::<Creature>()
        .register::<Event>()
        .with_thin_types(THIN_TYPES.iter().copied());
    for (name, source, target) in BUILTIN_RELATIONSHIP_KINDS {
        builder = builder.with_relationship_kind(RelationshipKindDef::new(*name, *source, *target));
    }
    builder
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{AttrKind, Constraint, EntitySchema, MergePolicy};

    #[test]
    fn test_derived_character_schema() {
        let schema = Character::type_schema();
        assert_eq!(Character::ENTITY_TYPE, "character");
        assert_eq!(schema.table.as_deref(), Some("characters"));
        assert_eq!(
            schema.description.as_deref(),
            Some("A person or sentient being in the narrative.")
        );

        let power = schema.attribute("power_level").unwrap();
        assert_eq!(power.kind, AttrKind::Integer);
        assert!(!power.required);
        assert_eq!(
            power.constraints,
            vec![Constraint::Range { min: 1.0, max: 10.0 }]
        );
        assert_eq!(power.merge, Some(MergePolicy::Max));

        let traits = schema.attribute("personality_traits").unwrap();
        assert_eq!(traits.kind, AttrKind::List);
        assert_eq!(traits.merge, Some(MergePolicy::Union));

        let status = schema.attribute("status").unwrap();
        assert!(matches!(&status.constraints[0], Constraint::OneOf(v) if v.len() == 4));
    }

    #[test]
    fn test_number_kind_for_floats() {
        let schema = Item::type_schema();
        assert_eq!(schema.attribute("value").unwrap().kind, AttrKind::Number);
    }

    #[test]
    fn test_thin_types_are_unique() {
        let mut names: Vec<_> = THIN_TYPES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), THIN_TYPES.len());
    }
}
