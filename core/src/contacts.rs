//! Contacts manager (C9, spec §4.9).
//!
//! Tracks two things: the curated `contacts:` list (name, normalized
//! numbers) and an `unprocessed:` section of names observed during import
//! that have not yet been attached to a curated contact.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fs::FileSystem;
use crate::repo::RepoPaths;

const UNKNOWN_PLACEHOLDERS: [&str; 3] = ["(Unknown)", "null", ""];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub numbers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum UnprocessedYaml {
    Structured { phone_number: String, contact_names: Vec<String> },
    Legacy(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct ContactsFile {
    #[serde(default)]
    contacts: Vec<Contact>,
    #[serde(default)]
    unprocessed: Vec<UnprocessedYaml>,
}

pub struct ContactsManager {
    contacts: Vec<Contact>,
    name_by_number: HashMap<String, String>,
    unprocessed_names: BTreeMap<String, BTreeSet<String>>,
    unprocessed_phone_display: HashMap<String, String>,
}

impl ContactsManager {
    /// A missing `contacts.yaml` is not an error: an empty contacts set.
    pub fn load(fs: &Arc<dyn FileSystem>, paths: &RepoPaths) -> Result<Self> {
        let path = paths.contacts_yaml();
        if !fs.exists(&path) {
            return Ok(Self {
                contacts: Vec::new(),
                name_by_number: HashMap::new(),
                unprocessed_names: BTreeMap::new(),
                unprocessed_phone_display: HashMap::new(),
            });
        }
        let bytes = fs.read(&path)?;
        let parsed: ContactsFile = serde_yaml::from_slice(&bytes)?;

        let mut name_by_number = HashMap::new();
        for contact in &parsed.contacts {
            for number in &contact.numbers {
                let normalized = normalize_number(number);
                if let Some(existing) = name_by_number.get(&normalized) {
                    if existing != &contact.name {
                        return Err(Error::DuplicateNumber {
                            number: normalized,
                            names: vec![existing.clone(), contact.name.clone()],
                        });
                    }
                } else {
                    name_by_number.insert(normalized, contact.name.clone());
                }
            }
        }

        let mut manager = Self {
            contacts: parsed.contacts,
            name_by_number,
            unprocessed_names: BTreeMap::new(),
            unprocessed_phone_display: HashMap::new(),
        };

        for entry in parsed.unprocessed {
            let (phone, names) = match entry {
                UnprocessedYaml::Structured { phone_number, contact_names } => (phone_number, contact_names),
                UnprocessedYaml::Legacy(raw) => {
                    let (phone, name) = split_legacy_unprocessed(&raw);
                    (phone, vec![name])
                }
            };
            let normalized = normalize_number(&phone);
            if manager.name_by_number.contains_key(&normalized) {
                continue;
            }
            for name in names {
                manager.merge_unprocessed(&normalized, &phone, &name);
            }
        }

        Ok(manager)
    }

    pub fn save(&self, fs: &Arc<dyn FileSystem>, paths: &RepoPaths) -> Result<()> {
        let mut contacts = self.contacts.clone();
        contacts.sort_by(|a, b| a.name.cmp(&b.name));

        let mut unprocessed: Vec<UnprocessedYaml> = self
            .unprocessed_names
            .iter()
            .map(|(normalized, names)| UnprocessedYaml::Structured {
                phone_number: self.unprocessed_phone_display.get(normalized).cloned().unwrap_or_else(|| normalized.clone()),
                contact_names: names.iter().cloned().collect(),
            })
            .collect();
        unprocessed.sort_by(|a, b| match (a, b) {
            (UnprocessedYaml::Structured { phone_number: pa, .. }, UnprocessedYaml::Structured { phone_number: pb, .. }) => pa.cmp(pb),
            _ => std::cmp::Ordering::Equal,
        });

        let file = ContactsFile { contacts, unprocessed };
        let bytes = serde_yaml::to_string(&file)?.into_bytes();
        fs.write_atomic(&paths.root.join(".tmp"), &paths.contacts_yaml(), &bytes)
    }

    pub fn contact_count(&self) -> usize {
        self.contacts.len()
    }

    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn name_for_number(&self, raw_number: &str) -> Option<&str> {
        self.name_by_number.get(&normalize_number(raw_number)).map(String::as_str)
    }

    /// Extracts contact names from a possibly-multi-valued MMS `address`
    /// and `contact_name` pair (spec §4.9 multi-address extraction).
    pub fn add_unprocessed(&mut self, address: &str, contact_name: &str) -> Result<()> {
        let addrs: Vec<&str> = address.split('~').collect();
        let names: Vec<&str> = contact_name.split(',').collect();
        if addrs.len() != names.len() {
            return Err(Error::AddressContactMismatch { addr_count: addrs.len(), name_count: names.len() });
        }
        for (addr, name) in addrs.into_iter().zip(names.into_iter()) {
            let normalized = normalize_number(addr);
            if self.name_by_number.contains_key(&normalized) {
                continue;
            }
            self.merge_unprocessed(&normalized, addr, name);
        }
        Ok(())
    }

    fn merge_unprocessed(&mut self, normalized: &str, phone_display: &str, name: &str) {
        let trimmed = name.trim().to_string();
        self.unprocessed_phone_display.entry(normalized.to_string()).or_insert_with(|| phone_display.to_string());
        let entry = self.unprocessed_names.entry(normalized.to_string()).or_default();
        if is_unknown(&trimmed) {
            if !entry.iter().any(|n| !is_unknown(n)) {
                entry.insert(trimmed);
            }
        } else {
            entry.retain(|n| !is_unknown(n));
            entry.insert(trimmed);
        }
    }
}

fn is_unknown(name: &str) -> bool {
    UNKNOWN_PLACEHOLDERS.contains(&name)
}

/// Strips all non-digits; drops a leading `1` for 11-digit numbers.
fn normalize_number(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() == 11 && digits.starts_with('1') {
        digits[1..].to_string()
    } else {
        digits
    }
}

fn split_legacy_unprocessed(raw: &str) -> (String, String) {
    match raw.split_once(": ") {
        Some((phone, name)) => (phone.trim().to_string(), name.trim().to_string()),
        None => (raw.trim().to_string(), String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFs;

    fn fs_with(contacts_yaml: &str) -> Arc<dyn FileSystem> {
        let fs = MemFs::new();
        fs.write_new(&RepoPaths::new("/repo").contacts_yaml(), contacts_yaml.as_bytes()).unwrap();
        Arc::new(fs)
    }

    #[test]
    fn normalizes_leading_country_code() {
        assert_eq!(normalize_number("+1-555-123-4567"), "5551234567");
        assert_eq!(normalize_number("555-123-4567"), "5551234567");
    }

    #[test]
    fn missing_file_is_empty_not_error() {
        let fs: Arc<dyn FileSystem> = Arc::new(MemFs::new());
        let manager = ContactsManager::load(&fs, &RepoPaths::new("/repo")).unwrap();
        assert_eq!(manager.contact_count(), 0);
    }

    #[test]
    fn duplicate_number_conflicting_names_is_error() {
        let fs = fs_with("contacts:\n  - name: Alice\n    numbers: [\"5551234567\"]\n  - name: Bob\n    numbers: [\"555-123-4567\"]\n");
        let err = ContactsManager::load(&fs, &RepoPaths::new("/repo")).unwrap_err();
        assert!(matches!(err, Error::DuplicateNumber { .. }));
    }

    #[test]
    fn legacy_unprocessed_string_is_parsed() {
        let fs = fs_with("contacts: []\nunprocessed:\n  - \"5551234567: Alice\"\n");
        let manager = ContactsManager::load(&fs, &RepoPaths::new("/repo")).unwrap();
        assert_eq!(manager.unprocessed_names.get("5551234567").unwrap().iter().next().unwrap(), "Alice");
    }

    #[test]
    fn multi_address_extraction_requires_matching_counts() {
        let mut manager = ContactsManager::load(&Arc::new(MemFs::new()), &RepoPaths::new("/repo")).unwrap();
        let err = manager.add_unprocessed("555~666", "OnlyOne").unwrap_err();
        assert!(matches!(err, Error::AddressContactMismatch { addr_count: 2, name_count: 1 }));
    }

    #[test]
    fn unknown_placeholder_removed_when_real_name_arrives() {
        let mut manager = ContactsManager::load(&Arc::new(MemFs::new()), &RepoPaths::new("/repo")).unwrap();
        manager.add_unprocessed("5551234567", "(Unknown)").unwrap();
        assert_eq!(manager.unprocessed_names["5551234567"].len(), 1);
        manager.add_unprocessed("5551234567", "Alice").unwrap();
        let names = &manager.unprocessed_names["5551234567"];
        assert_eq!(names.len(), 1);
        assert!(names.contains("Alice"));
    }

    #[test]
    fn known_number_never_added_to_unprocessed() {
        let fs = fs_with("contacts:\n  - name: Alice\n    numbers: [\"5551234567\"]\n");
        let mut manager = ContactsManager::load(&fs, &RepoPaths::new("/repo")).unwrap();
        manager.add_unprocessed("5551234567", "Someone Else").unwrap();
        assert!(manager.unprocessed_names.is_empty());
    }

    #[test]
    fn save_round_trips_through_load() {
        let fs: Arc<dyn FileSystem> = Arc::new(MemFs::new());
        let paths = RepoPaths::new("/repo");
        let mut manager = ContactsManager::load(&fs, &paths).unwrap();
        manager.add_unprocessed("5551234567", "Alice").unwrap();
        manager.save(&fs, &paths).unwrap();
        let reloaded = ContactsManager::load(&fs, &paths).unwrap();
        assert_eq!(reloaded.unprocessed_names["5551234567"].iter().next().unwrap(), "Alice");
    }
}
