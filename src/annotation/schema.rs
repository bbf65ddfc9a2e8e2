//! Schema-grouped validation: collect prefixed tags into one record, merge
//! defaults, and validate against a typed schema.

use crate::annotation::{AnnotationItem, AnnotationKind};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Outcome of grouping one prefix over one file's items.
///
/// The per-file state machine is `SCAN → GROUPED → (VALID | INVALID |
/// ABSENT)`: no matching tags is `Absent`, a grouped record that
/// deserializes is `Valid`, anything else is `Invalid` with the grouped
/// record preserved so callers can salvage it.
#[derive(Debug)]
pub enum Grouped<T> {
    Valid { parsed: T, found: usize, anns: Vec<AnnotationItem> },
    Invalid { error: serde_json::Error, grouped: Value, found: usize, anns: Vec<AnnotationItem> },
    Absent,
}

impl<T> Grouped<T> {
    pub fn parsed(&self) -> Option<&T> {
        match self {
            Self::Valid { parsed, .. } => Some(parsed),
            _ => None,
        }
    }

    pub fn into_parsed(self) -> Option<T> {
        match self {
            Self::Valid { parsed, .. } => Some(parsed),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// Groups tag items sharing a key prefix into a typed record.
#[derive(Clone, Debug, Default)]
pub struct SchemaGrouper {
    prefix: String,
    defaults: Map<String, Value>,
}

impl SchemaGrouper {
    /// A grouper for keys starting with `prefix` (e.g. `spry.`, `route.`).
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into(), defaults: Map::new() }
    }

    /// Adds a default entry merged below the grouped keys.
    pub fn default_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.defaults.insert(key.into(), value);
        self
    }

    /// Selects `kind == tag` items whose key starts with the prefix, strips
    /// the prefix, merges over the defaults (later keys win), applies
    /// `before_parse`, and validates via serde into `T`.
    pub fn group<T, F>(&self, items: &[AnnotationItem], before_parse: F) -> Grouped<T>
    where
        T: DeserializeOwned,
        F: FnOnce(&mut Map<String, Value>, &[AnnotationItem]),
    {
        let anns: Vec<AnnotationItem> = items
            .iter()
            .filter(|item| {
                item.kind == AnnotationKind::Tag
                    && item.key.as_deref().is_some_and(|k| k.starts_with(&self.prefix))
            })
            .cloned()
            .collect();
        let found = anns.len();
        if found == 0 {
            return Grouped::Absent;
        }

        let mut grouped = self.defaults.clone();
        for item in &anns {
            let key = item.key.as_deref().unwrap()[self.prefix.len()..].to_string();
            let value = item.value.clone().unwrap_or(Value::Bool(true));
            grouped.insert(key, value);
        }
        before_parse(&mut grouped, &anns);

        match serde_json::from_value(Value::Object(grouped.clone())) {
            Ok(parsed) => Grouped::Valid { parsed, found, anns },
            Err(error) => Grouped::Invalid { error, grouped: Value::Object(grouped), found, anns },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{extract, ExtractOptions, ResourceAnn, ResourceNature, SourceLanguage};

    fn items(text: &str) -> Vec<AnnotationItem> {
        extract(text, SourceLanguage::Sql, &ExtractOptions::default()).items
    }

    #[test]
    fn absent_when_no_prefixed_tags() {
        let grouped: Grouped<ResourceAnn> = SchemaGrouper::new("spry.")
            .group(&items("-- @route.path /x.sql\n"), |_, _| {});
        assert!(grouped.is_absent());
    }

    #[test]
    fn groups_and_validates_a_resource() {
        let text = "-- @spry.nature sql\n-- @spry.sqlImpact ddl\n";
        let grouped: Grouped<ResourceAnn> = SchemaGrouper::new("spry.")
            .default_entry("nature", serde_json::json!("page"))
            .group(&items(text), |map, _| {
                map.insert("relFsPath".into(), serde_json::json!("src/seed.sql"));
                map.insert("webPath".into(), serde_json::json!("seed.sql"));
            });
        let Grouped::Valid { parsed, found, anns } = grouped else {
            panic!("expected valid group")
        };
        assert_eq!(found, 2);
        assert_eq!(anns.len(), 2);
        assert!(matches!(parsed.nature, ResourceNature::Sql(_)));
    }

    #[test]
    fn later_keys_win_over_defaults() {
        let grouped: Grouped<serde_json::Value> = SchemaGrouper::new("spry.")
            .default_entry("nature", serde_json::json!("page"))
            .group(&items("-- @spry.nature partial\n"), |_, _| {});
        let parsed = grouped.into_parsed().unwrap();
        assert_eq!(parsed["nature"], "partial");
    }

    #[test]
    fn invalid_keeps_grouped_record() {
        let text = "-- @spry.nature sql\n-- @spry.sqlImpact bogus\n";
        let grouped: Grouped<ResourceAnn> = SchemaGrouper::new("spry.")
            .group(&items(text), |map, _| {
                map.insert("relFsPath".into(), serde_json::json!("src/x.sql"));
                map.insert("webPath".into(), serde_json::json!("x.sql"));
            });
        let Grouped::Invalid { grouped, found, .. } = grouped else {
            panic!("expected invalid group")
        };
        assert_eq!(found, 2);
        assert_eq!(grouped["sqlImpact"], "bogus");
    }
}
