// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! On-disk migration catalog.
//!
//! A migration directory holds `NNN_slug.sql` up scripts and optional
//! `NNN_slug.down.sql` down scripts. The unit name is the file stem
//! (`NNN_slug`); units are ordered by name, so every numeric prefix in a
//! directory must have the same width. Files not ending in `.sql` are
//! ignored.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::MigrationError;

const UP_SUFFIX: &str = ".sql";
const DOWN_SUFFIX: &str = ".down.sql";

/// SHA-256 hex digest of a script's raw bytes.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// One migration unit as found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationUnit {
    /// File stem, e.g. `003_add_orders`.
    pub name: String,
    /// Numeric prefix as written (zero padding kept).
    pub prefix: String,
    pub up_script: String,
    pub down_script: Option<String>,
    /// SHA-256 hex of the up script bytes.
    pub checksum: String,
    pub path: PathBuf,
}

/// All migration units in a directory, ordered by name.
#[derive(Debug, Clone, Default)]
pub struct MigrationCatalog {
    units: Vec<MigrationUnit>,
}

/// Split `NNN_slug` into `("NNN", "slug")`.
fn parse_stem(stem: &str) -> Option<(&str, &str)> {
    let (prefix, slug) = stem.split_once('_')?;
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) || slug.is_empty() {
        return None;
    }
    Some((prefix, slug))
}

impl MigrationCatalog {
    /// Read and validate every migration unit under `dir`.
    pub async fn load(dir: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let dir = dir.as_ref();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| MigrationError::Io(dir.to_path_buf(), e))?;

        let mut ups: BTreeMap<String, (PathBuf, Vec<u8>)> = BTreeMap::new();
        let mut downs: HashMap<String, (PathBuf, Vec<u8>)> = HashMap::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MigrationError::Io(dir.to_path_buf(), e))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| MigrationError::Io(path.clone(), e))?;
            if !file_type.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
            else {
                continue;
            };

            let (stem, is_down) = if let Some(stem) = file_name.strip_suffix(DOWN_SUFFIX) {
                (stem.to_string(), true)
            } else if let Some(stem) = file_name.strip_suffix(UP_SUFFIX) {
                (stem.to_string(), false)
            } else {
                continue;
            };

            if parse_stem(&stem).is_none() {
                return Err(MigrationError::InvalidName(file_name));
            }

            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| MigrationError::Io(path.clone(), e))?;
            if is_down {
                downs.insert(stem, (path, bytes));
            } else {
                ups.insert(stem, (path, bytes));
            }
        }

        let mut units = Vec::with_capacity(ups.len());
        for (name, (path, bytes)) in ups {
            let down_script = match downs.remove(&name) {
                Some((down_path, down_bytes)) => Some(into_script(&down_path, down_bytes)?),
                None => None,
            };
            let unit_checksum = checksum(&bytes);
            let up_script = into_script(&path, bytes)?;
            let prefix = parse_stem(&name)
                .map(|(p, _)| p.to_string())
                .unwrap_or_default();
            units.push(MigrationUnit {
                name,
                prefix,
                up_script,
                down_script,
                checksum: unit_checksum,
                path,
            });
        }

        if let Some((orphan, _)) = downs.into_iter().next() {
            return Err(MigrationError::InconsistentCatalog(format!(
                "down script {orphan}{DOWN_SUFFIX} has no matching up script"
            )));
        }

        Self::from_units(units)
    }

    /// Build a catalog from already-read units, enforcing the naming rules.
    pub fn from_units(mut units: Vec<MigrationUnit>) -> Result<Self, MigrationError> {
        units.sort_by(|a, b| a.name.cmp(&b.name));

        let mut seen: HashMap<&str, &str> = HashMap::new();
        let mut width = None;
        for unit in &units {
            if let Some(existing) = seen.insert(unit.prefix.as_str(), unit.name.as_str()) {
                return Err(MigrationError::InconsistentCatalog(format!(
                    "prefix {} is shared by {} and {}",
                    unit.prefix, existing, unit.name
                )));
            }
            match width {
                None => width = Some(unit.prefix.len()),
                Some(w) if w != unit.prefix.len() => {
                    return Err(MigrationError::InconsistentCatalog(format!(
                        "prefix {} of {} is not {} digits wide",
                        unit.prefix, unit.name, w
                    )));
                }
                Some(_) => {}
            }
        }

        Ok(Self { units })
    }

    pub fn units(&self) -> &[MigrationUnit] {
        &self.units
    }

    pub fn get(&self, name: &str) -> Option<&MigrationUnit> {
        self.units.iter().find(|u| u.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

fn into_script(path: &Path, bytes: Vec<u8>) -> Result<String, MigrationError> {
    String::from_utf8(bytes).map_err(|_| MigrationError::InvalidScript(path.to_path_buf()))
}
