//! Status-field codec and structured-output schema builder.
//!
//! Games declare an ordered list of status fields (e.g. "Health, Gold,
//! Location"). The AI backend exchanges those fields as a flat key→value
//! map, which carries no ordering. This module is the single place where
//! the two representations meet: the declared name order is threaded
//! through every conversion so a map round-trip can never reorder or
//! silently drop a declared field.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use fabula_domain::StatusField;

/// Parse a game's declared field list into ordered names.
///
/// Accepts newline- or comma-separated names; surrounding whitespace is
/// trimmed and empty segments skipped. Malformed or empty input yields an
/// empty list — callers treat that as "no fields", never as an error, so
/// a game definition written by an older schema version can't crash a
/// session.
pub fn field_names(definition: &str) -> Vec<String> {
    definition
        .split(['\n', ','])
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Build the ordered field list from the AI's map response.
///
/// For each declared name, in order: take the value from `map`, falling
/// back to `fallback` (typically the previous turn's snapshot), falling
/// back to the empty string. Backends occasionally omit a field despite
/// the schema contract; a declared field must still never disappear.
pub fn to_field_list(
    map: &HashMap<String, String>,
    names: &[String],
    fallback: &HashMap<String, String>,
) -> Vec<StatusField> {
    names
        .iter()
        .map(|name| {
            let value = map
                .get(name)
                .or_else(|| fallback.get(name))
                .cloned()
                .unwrap_or_default();
            StatusField::new(name.clone(), value)
        })
        .collect()
}

/// Flatten an ordered field list into the map view the AI backend reads.
pub fn to_map(fields: &[StatusField]) -> HashMap<String, String> {
    fields
        .iter()
        .map(|field| (field.name.clone(), field.value.clone()))
        .collect()
}

/// Build the structured-output schema for the resolve phase.
///
/// The `status` object lists exactly the declared field names as required
/// string properties with `additionalProperties: false`, so the backend
/// cannot invent, rename, or drop status keys — correctness is pushed
/// into the generation contract instead of post-hoc validation.
pub fn build_response_schema(definition: &str) -> Value {
    let names = field_names(definition);

    let mut status_properties = Map::new();
    for name in &names {
        status_properties.insert(name.clone(), json!({ "type": "string" }));
    }

    json!({
        "type": "object",
        "properties": {
            "plotOutline": {
                "type": "string",
                "description": "Short outline of what happens this turn"
            },
            "status": {
                "type": "object",
                "properties": status_properties,
                "required": names,
                "additionalProperties": false
            },
            "imagePrompt": {
                "type": "string",
                "description": "Prompt for an illustration of this turn"
            }
        },
        "required": ["plotOutline", "status", "imagePrompt"],
        "additionalProperties": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn field_names_splits_on_commas_and_newlines() {
        assert_eq!(
            field_names("Health, Gold\nLocation"),
            names(&["Health", "Gold", "Location"])
        );
    }

    #[test]
    fn field_names_degrades_to_empty_on_malformed_input() {
        assert!(field_names("").is_empty());
        assert!(field_names(" \n ,, \n").is_empty());
    }

    #[test]
    fn round_trip_preserves_order() {
        let fields = vec![
            StatusField::new("Health", "10"),
            StatusField::new("Gold", "42"),
            StatusField::new("Location", "Forest"),
        ];
        let order = names(&["Health", "Gold", "Location"]);

        let round_tripped = to_field_list(&to_map(&fields), &order, &HashMap::new());
        assert_eq!(round_tripped, fields);
    }

    #[test]
    fn missing_names_fill_from_fallback_and_present_names_stay() {
        let mut map = HashMap::new();
        map.insert("Health".to_string(), "8".to_string());
        let mut fallback = HashMap::new();
        fallback.insert("Health".to_string(), "10".to_string());
        fallback.insert("Gold".to_string(), "42".to_string());

        let fields = to_field_list(&map, &names(&["Health", "Gold", "Mood"]), &fallback);
        assert_eq!(
            fields,
            vec![
                StatusField::new("Health", "8"),
                StatusField::new("Gold", "42"),
                StatusField::new("Mood", ""),
            ]
        );
    }

    #[test]
    fn schema_requires_every_declared_field() {
        for definition in ["", "Health", "Health, Gold, Mood"] {
            let declared = field_names(definition);
            let schema = build_response_schema(definition);
            let status = &schema["properties"]["status"];

            assert_eq!(status["additionalProperties"], json!(false));
            let required: Vec<String> = status["required"]
                .as_array()
                .expect("required array")
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            assert_eq!(required, declared);
            for name in &declared {
                assert_eq!(status["properties"][name]["type"], json!("string"));
            }
        }
    }
}
