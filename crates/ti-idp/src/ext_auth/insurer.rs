use serde::{Deserialize, Serialize};

/// An insurer offering authentication through its own app.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InsurerEntry {
    /// Display name.
    #[serde(rename = "kk_app_name")]
    pub name: String,
    /// Identifier passed to the third-party authorization endpoint.
    #[serde(rename = "kk_app_id")]
    pub identifier: String,
}

impl InsurerEntry {
    /// Creates an entry.
    #[must_use]
    pub fn new(name: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identifier: identifier.into(),
        }
    }
}

/// Claims of the signed insurer directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsurerDirectory {
    /// Listed insurers.
    #[serde(rename = "kk_app_list", default)]
    pub entries: Vec<InsurerEntry>,
}

impl InsurerDirectory {
    /// Looks up an insurer by identifier.
    #[must_use]
    pub fn find(&self, identifier: &str) -> Option<&InsurerEntry> {
        self.entries.iter().find(|e| e.identifier == identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_wire_names() {
        let json = r#"{"kk_app_list":[{"kk_app_name":"Test BKK","kk_app_id":"K1"}]}"#;
        let directory: InsurerDirectory = serde_json::from_str(json).unwrap();
        assert_eq!(directory.find("K1"), Some(&InsurerEntry::new("Test BKK", "K1")));
        assert!(directory.find("K2").is_none());
    }
}
