//! Alias book mapping short names to addresses

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::atomic::write_atomic;
use crate::error::PersistenceError;

/// File name used by older releases, migrated on first load
const LEGACY_FILE: &str = "tor_contacts.json";

/// `contacts.json`: a JSON object of alias to address
#[derive(Debug, Clone, Default)]
pub struct ContactBook {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl ContactBook {
    /// Load `path`. A missing file is an empty book.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => parse(&path, &bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::migrate(path),
            Err(e) => return Err(PersistenceError::io(&path, e)),
        };
        Ok(ContactBook { path, entries })
    }

    fn migrate(path: PathBuf) -> Result<Self, PersistenceError> {
        let legacy = path.with_file_name(LEGACY_FILE);
        let entries = match std::fs::read(&legacy) {
            Ok(bytes) => parse(&legacy, &bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(PersistenceError::io(&legacy, e)),
        };
        let book = ContactBook { path, entries };
        if !book.entries.is_empty() {
            book.save()?;
            let _ = std::fs::remove_file(&legacy);
            info!(count = book.entries.len(), "migrated legacy contacts");
        }
        Ok(book)
    }

    /// Write the book back, pretty-printed
    pub fn save(&self) -> Result<(), PersistenceError> {
        let json = serde_json::to_vec_pretty(&self.entries)
            .map_err(|e| PersistenceError::json(&self.path, e))?;
        write_atomic(&self.path, &json)?;
        debug!(path = %self.path.display(), "contacts saved");
        Ok(())
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The address for `alias_or_address`, or the input itself
    pub fn resolve<'a>(&'a self, alias_or_address: &'a str) -> &'a str {
        self.entries
            .get(alias_or_address)
            .map(String::as_str)
            .unwrap_or(alias_or_address)
    }

    /// First alias (alphabetically) pointing at `address`
    pub fn find_by_address(&self, address: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, addr)| addr.as_str() == address)
            .map(|(alias, _)| alias.as_str())
    }

    /// Map `alias` to `address`, returning the previous address
    pub fn insert(&mut self, alias: impl Into<String>, address: impl Into<String>) -> Option<String> {
        self.entries.insert(alias.into(), address.into())
    }

    /// Forget `alias`, returning its address
    pub fn remove(&mut self, alias: &str) -> Option<String> {
        self.entries.remove(alias)
    }

    /// Aliases in sorted order
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Alias and address pairs, sorted by alias
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(a, b)| (a.as_str(), b.as_str()))
    }

    /// Number of contacts
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the book is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse(path: &Path, bytes: &[u8]) -> Result<BTreeMap<String, String>, PersistenceError> {
    serde_json::from_slice(bytes).map_err(|e| PersistenceError::json(path, e))
}

/// Strip a trailing `.onion` and surrounding whitespace
pub fn normalize_address(address: &str) -> &str {
    let address = address.trim();
    address.strip_suffix(".onion").unwrap_or(address)
}
