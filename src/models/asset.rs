//! Asset and diagram projections used for matching.

use serde::{Deserialize, Serialize};

/// Identifier of an asset node in the graph store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetKey {
    /// Namespace the asset lives in.
    pub space: String,
    /// External id within the space.
    pub external_id: String,
}

impl AssetKey {
    pub fn new(space: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            space: space.into(),
            external_id: external_id.into(),
        }
    }

    /// Parse the `space:external_id` form used in config files and
    /// query parameters.
    pub fn parse(s: &str) -> Option<Self> {
        let (space, external_id) = s.split_once(':')?;
        if space.is_empty() || external_id.is_empty() {
            return None;
        }
        Some(Self::new(space, external_id))
    }
}

impl std::fmt::Display for AssetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.space, self.external_id)
    }
}

/// Operational grouping key for diagrams and reference data.
///
/// Diagrams are batched and reference data cached per scope, so two
/// diagrams from the same site/unit share one candidate list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeKey {
    pub site: String,
    /// Absent for site-wide diagrams.
    pub unit: Option<String>,
}

impl ScopeKey {
    pub fn new(site: impl Into<String>, unit: Option<String>) -> Self {
        Self {
            site: site.into(),
            unit,
        }
    }

    /// Stable token usable inside cache keys.
    pub fn token(&self) -> String {
        match &self.unit {
            Some(unit) => format!("{}/{}", self.site, unit),
            None => format!("{}/-", self.site),
        }
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.token())
    }
}

/// Projection of a target asset usable for matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateAsset {
    pub key: AssetKey,
    pub name: String,
    /// Alias strings to match against, in preference order.
    pub aliases: Vec<String>,
    pub scope: ScopeKey,
}

impl CandidateAsset {
    /// All strings this asset can be detected under (name first).
    pub fn match_strings(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(|a| a.as_str()))
    }
}

/// Read-only projection of a diagram document node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagramNode {
    pub external_id: String,
    pub name: String,
    /// Primary scope attribute. Missing is a data error.
    pub site: Option<String>,
    /// Secondary scope attribute.
    pub unit: Option<String>,
    pub page_count: u32,
    /// Marker labels ("in process", "annotated") plus anything else the
    /// owning system attached.
    pub labels: Vec<String>,
}

impl DiagramNode {
    /// Grouping scope, if the diagram carries its site attribute.
    pub fn scope(&self) -> Option<ScopeKey> {
        self.site
            .as_ref()
            .map(|site| ScopeKey::new(site.clone(), self.unit.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_key_parse() {
        let key = AssetKey::parse("assets:pump-001").unwrap();
        assert_eq!(key, AssetKey::new("assets", "pump-001"));
        // External ids may themselves contain colons.
        let key = AssetKey::parse("assets:ns:pump-001").unwrap();
        assert_eq!(key.external_id, "ns:pump-001");
        assert!(AssetKey::parse("no-colon").is_none());
        assert!(AssetKey::parse(":missing-space").is_none());
    }

    #[test]
    fn test_scope_token() {
        let with_unit = ScopeKey::new("plant-a", Some("u3".to_string()));
        assert_eq!(with_unit.token(), "plant-a/u3");

        let site_only = ScopeKey::new("plant-a", None);
        assert_eq!(site_only.token(), "plant-a/-");
        assert_ne!(with_unit, site_only);
    }

    #[test]
    fn test_diagram_scope_requires_site() {
        let mut node = DiagramNode {
            external_id: "d1".to_string(),
            name: "P&ID 001".to_string(),
            site: None,
            unit: Some("u3".to_string()),
            page_count: 1,
            labels: vec![],
        };
        assert!(node.scope().is_none());

        node.site = Some("plant-a".to_string());
        let scope = node.scope().unwrap();
        assert_eq!(scope.site, "plant-a");
        assert_eq!(scope.unit.as_deref(), Some("u3"));
    }
}
