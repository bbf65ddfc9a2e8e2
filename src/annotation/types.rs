//! Typed resource and route annotations.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_true() -> bool {
    true
}

/// SQL impact classification of a `sql` resource.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlImpact {
    #[default]
    Dql,
    Dml,
    Ddl,
}

/// SQL impact classification of a generic `resource`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceImpact {
    #[default]
    Unknown,
    Json,
}

/// What a foundry's execution depends on.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FoundryDependency {
    #[default]
    None,
    DbAfterBuild,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlNature {
    #[serde(default)]
    pub sql_impact: SqlImpact,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceFileNature {
    #[serde(default)]
    pub sql_impact: ResourceImpact,
}

/// Scheduling flags of a `foundry` resource.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FoundryNature {
    #[serde(default)]
    pub run_before_ann_catalog: bool,
    #[serde(default)]
    pub run_after_ann_catalog: bool,
    #[serde(default)]
    pub depends_on: FoundryDependency,
    #[serde(default = "default_true")]
    pub is_cleanable: bool,
}

impl Default for FoundryNature {
    fn default() -> Self {
        Self {
            run_before_ann_catalog: false,
            run_after_ann_catalog: false,
            depends_on: FoundryDependency::None,
            is_cleanable: true,
        }
    }
}

/// The typed classification of a source file; `nature` is the discriminator.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "nature", rename_all = "camelCase")]
pub enum ResourceNature {
    Action,
    Api,
    Page,
    Partial,
    Sql(SqlNature),
    Resource(ResourceFileNature),
    Foundry(FoundryNature),
}

impl ResourceNature {
    /// The discriminator value, as it appears in annotations.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Action => "action",
            Self::Api => "api",
            Self::Page => "page",
            Self::Partial => "partial",
            Self::Sql(_) => "sql",
            Self::Resource(_) => "resource",
            Self::Foundry(_) => "foundry",
        }
    }

    /// Foundry scheduling flags, when this is a foundry.
    pub fn foundry(&self) -> Option<&FoundryNature> {
        match self {
            Self::Foundry(flags) => Some(flags),
            _ => None,
        }
    }

    pub fn is_foundry(&self) -> bool {
        matches!(self, Self::Foundry(_))
    }
}

/// A resource annotation attached to one source file.
///
/// `abs_fs_path` is canonical and intentionally omitted from serialized
/// artifacts so they diff cleanly across machines.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAnn {
    #[serde(flatten)]
    pub nature: ResourceNature,
    #[serde(default, skip_serializing)]
    pub abs_fs_path: PathBuf,
    pub rel_fs_path: String,
    pub web_path: String,
    #[serde(default)]
    pub is_system_generated: bool,
}

/// One child reference on a route.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteChild {
    pub path: String,
}

/// Navigation metadata attaching a logical path and display fields to a
/// resource. `path` is the primary key; the `path_*` fields default to
/// values derived from it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteAnn {
    pub path: String,
    pub caption: String,
    #[serde(default)]
    pub path_basename: String,
    #[serde(default)]
    pub path_basename_no_extn: String,
    #[serde(default)]
    pub path_dirname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_extn_terminal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_extns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sibling_order: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abbreviated_caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elaboration: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<RouteChild>>,
}

impl RouteAnn {
    /// Fills every empty `path_*` field with its value derived from `path`.
    pub fn apply_path_defaults(&mut self) {
        let basename = self.path.rsplit('/').next().unwrap_or_default().to_string();
        if self.path_basename.is_empty() {
            self.path_basename = basename.clone();
        }
        if self.path_basename_no_extn.is_empty() {
            self.path_basename_no_extn =
                basename.split('.').next().unwrap_or_default().to_string();
        }
        if self.path_dirname.is_empty() {
            self.path_dirname = match self.path.rfind('/') {
                Some(0) => "/".to_string(),
                Some(i) => self.path[..i].to_string(),
                None => String::new(),
            };
        }
        let extns: Vec<String> = basename.split('.').skip(1).map(str::to_string).collect();
        if self.path_extns.is_none() && !extns.is_empty() {
            self.path_extns = Some(extns.clone());
        }
        if self.path_extn_terminal.is_none() {
            self.path_extn_terminal = extns.last().cloned();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn nature_discriminator_round_trips() {
        let ann = ResourceAnn {
            nature: ResourceNature::Foundry(FoundryNature {
                run_after_ann_catalog: true,
                ..Default::default()
            }),
            abs_fs_path: PathBuf::from("/p/src/report.sql.py"),
            rel_fs_path: "src/report.sql.py".into(),
            web_path: "report.sql.py".into(),
            is_system_generated: false,
        };
        let json = serde_json::to_value(&ann).unwrap();
        assert_eq!(json["nature"], "foundry");
        assert_eq!(json["runAfterAnnCatalog"], true);
        assert_eq!(json["isCleanable"], true);
        // abs_fs_path is intentionally not persisted
        assert!(json.get("absFsPath").is_none());

        let back: ResourceAnn = serde_json::from_value(json).unwrap();
        assert_eq!(back.abs_fs_path, PathBuf::new());
        assert_eq!(back.nature, ann.nature);
        assert_eq!(back.web_path, ann.web_path);
    }

    #[test]
    fn sql_impact_variants() {
        let json = serde_json::json!({
            "nature": "sql",
            "sqlImpact": "ddl",
            "relFsPath": "src/seed.sql",
            "webPath": "seed.sql"
        });
        let ann: ResourceAnn = serde_json::from_value(json).unwrap();
        assert_eq!(ann.nature, ResourceNature::Sql(SqlNature { sql_impact: SqlImpact::Ddl }));
    }

    #[test]
    fn route_path_defaults() {
        let mut route = RouteAnn {
            path: "/console/info-schema/index.sql".into(),
            caption: "Info Schema".into(),
            path_basename: String::new(),
            path_basename_no_extn: String::new(),
            path_dirname: String::new(),
            path_extn_terminal: None,
            path_extns: None,
            sibling_order: None,
            url: None,
            title: None,
            abbreviated_caption: None,
            description: None,
            elaboration: None,
            children: None,
        };
        route.apply_path_defaults();
        assert_eq!(route.path_basename, "index.sql");
        assert_eq!(route.path_basename_no_extn, "index");
        assert_eq!(route.path_dirname, "/console/info-schema");
        assert_eq!(route.path_extn_terminal.as_deref(), Some("sql"));
        assert_eq!(route.path_extns, Some(vec!["sql".to_string()]));
    }
}
