//! Login credentials and coordinator registry, both loaded once and shared
//! read-only across all probes of a pass.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Usernames mapped to candidate passwords, tried in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct CredentialSet {
    entries: Vec<(String, Vec<String>)>,
}

impl CredentialSet {
    pub fn new(entries: Vec<(String, Vec<String>)>) -> Self {
        Self { entries }
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// Every (username, password) pair in the order they should be attempted.
    pub fn attempts(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.entries.iter().flat_map(|(user, passwords)| {
            passwords
                .iter()
                .map(move |password| (user.as_str(), password.as_str()))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|(_, passwords)| passwords.is_empty())
    }
}

impl TryFrom<Map<String, Value>> for CredentialSet {
    type Error = String;

    fn try_from(map: Map<String, Value>) -> Result<Self, Self::Error> {
        let mut entries = Vec::with_capacity(map.len());
        for (user, value) in map {
            let passwords: Vec<String> = serde_json::from_value(value)
                .map_err(|e| format!("passwords for '{}' must be a list of strings: {}", user, e))?;
            entries.push((user, passwords));
        }
        Ok(Self { entries })
    }
}

/// One coordinator ("build master") that workers attach to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Master {
    pub hostname: String,
    pub http_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct MasterRegistry {
    masters: Vec<Master>,
}

impl MasterRegistry {
    pub fn new(masters: Vec<Master>) -> Self {
        Self { masters }
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// HTTP port of the first registry entry whose hostname matches exactly.
    pub fn http_port(&self, hostname: &str) -> Option<u16> {
        self.masters
            .iter()
            .find(|m| m.hostname == hostname)
            .map(|m| m.http_port)
    }

    pub fn len(&self) -> usize {
        self.masters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_attempts_follow_file_order() {
        let creds =
            CredentialSet::from_json(r#"{"root": ["a", "b"], "cltbld": ["c"]}"#).unwrap();
        let attempts: Vec<_> = creds.attempts().collect();
        assert_eq!(attempts, vec![("root", "a"), ("root", "b"), ("cltbld", "c")]);
    }

    #[test]
    fn credentials_reject_non_list_passwords() {
        let err = CredentialSet::from_json(r#"{"root": "a"}"#).unwrap_err();
        assert!(err.to_string().contains("root"));
    }

    #[test]
    fn empty_credentials() {
        assert!(CredentialSet::from_json(r#"{"root": []}"#).unwrap().is_empty());
        assert!(CredentialSet::default().is_empty());
    }

    #[test]
    fn registry_ignores_extra_fields() {
        let registry = MasterRegistry::from_json(
            r#"[
                {"hostname": "bm01.example.net", "http_port": 8001, "role": "build", "enabled": true},
                {"hostname": "bm02.example.net", "http_port": 8201}
            ]"#,
        )
        .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.http_port("bm02.example.net"), Some(8201));
        assert_eq!(registry.http_port("bm03.example.net"), None);
    }
}
