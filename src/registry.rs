//! Field and lock identities shared by every part of the monitor.
//!
//! Field definitions are produced by the instrumenter and never change during
//! a run. Lock aliases and display names are learned while the program runs,
//! so [`LockTable`] is the one mutable piece here.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use hashbrown::HashMap;
use log::{debug, info};

use crate::error::{MonitorError, Result};

pub type FieldId = u64;
pub type LockId = u64;
pub type ObjectId = u64;

#[derive(Clone, Debug)]
pub struct FieldDef {
    pub id: FieldId,
    pub declaring_type: String,
    pub name: String,
    pub is_static: bool,
    pub is_final: bool,
    pub is_volatile: bool,
}

impl FieldDef {
    pub fn new(id: FieldId, declaring_type: impl Into<String>, name: impl Into<String>, is_static: bool) -> Self {
        FieldDef {
            id,
            declaring_type: declaring_type.into(),
            name: name.into(),
            is_static,
            is_final: false,
            is_volatile: false,
        }
    }

    /// `declaring_type.name`, the string alert and monitor patterns match against.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.declaring_type, self.name)
    }
}

impl PartialEq for FieldDef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for FieldDef {}

impl std::hash::Hash for FieldDef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for FieldDef {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FieldDef {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.declaring_type, &self.name, self.id).cmp(&(&other.declaring_type, &other.name, other.id))
    }
}

impl std::fmt::Display for FieldDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.qualified_name())?;
        if self.is_static {
            write!(f, " (static)")?;
        }
        Ok(())
    }
}

/// All field definitions of a run, keyed by id.
#[derive(Clone, Debug, Default)]
pub struct FieldDefs {
    defs: HashMap<FieldId, Arc<FieldDef>>,
}

impl FieldDefs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the instrumenter's fields file: one definition per line,
    /// `id declaringType fieldName isStatic isFinal isVolatile`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| MonitorError::FieldsFile {
            path: path.to_path_buf(),
            source,
        })?;
        let defs = Self::parse(file)?;
        info!("loaded {} field definitions from {}", defs.len(), path.display());
        Ok(defs)
    }

    pub fn parse(reader: impl Read) -> Result<Self> {
        let mut defs = FieldDefs::new();
        for (idx, line) in BufReader::new(reader).lines().enumerate() {
            let line = line?;
            let lineno = idx + 1;
            if line.trim().is_empty() {
                continue;
            }
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let [id, clazz, field, is_static, is_final, is_volatile] = tokens[..] else {
                return Err(MonitorError::MalformedFieldDef {
                    line: lineno,
                    detail: format!("expected 6 columns, found {}", tokens.len()),
                });
            };
            let id = id.parse::<FieldId>().map_err(|e| MonitorError::MalformedFieldDef {
                line: lineno,
                detail: format!("bad field id {id:?}: {e}"),
            })?;
            let flag = |s: &str| -> Result<bool> {
                s.parse::<bool>().map_err(|_| MonitorError::MalformedFieldDef {
                    line: lineno,
                    detail: format!("expected true/false, found {s:?}"),
                })
            };
            defs.insert(FieldDef {
                id,
                declaring_type: clazz.to_owned(),
                name: field.to_owned(),
                is_static: flag(is_static)?,
                is_final: flag(is_final)?,
                is_volatile: flag(is_volatile)?,
            });
        }
        Ok(defs)
    }

    pub fn insert(&mut self, def: FieldDef) {
        self.defs.insert(def.id, Arc::new(def));
    }

    pub fn get(&self, id: FieldId) -> Option<&Arc<FieldDef>> {
        self.defs.get(&id)
    }

    pub fn contains(&self, id: FieldId) -> bool {
        self.defs.contains_key(&id)
    }

    pub fn values(&self) -> impl Iterator<Item = &Arc<FieldDef>> {
        self.defs.values()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

impl FromIterator<FieldDef> for FieldDefs {
    fn from_iter<I: IntoIterator<Item = FieldDef>>(iter: I) -> Self {
        let mut defs = FieldDefs::new();
        for def in iter {
            defs.insert(def);
        }
        defs
    }
}

#[derive(Debug, Default)]
struct LockTableInner {
    aliases: HashMap<LockId, LockId>,
    names: HashMap<LockId, String>,
}

/// Canonical lock identities and display names.
///
/// The reader and writer handle of a read/write lock both resolve to the lock
/// itself, so lock-set intersection treats them as one exclusion domain.
#[derive(Debug, Default)]
pub struct LockTable {
    inner: RwLock<LockTableInner>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_rw_lock(&self, lock: LockId, read: LockId, write: LockId) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.aliases.insert(read, lock);
        inner.aliases.insert(write, lock);
        debug!("defined read/write lock {lock} (read {read}, write {write})");
    }

    pub fn canonical(&self, id: LockId) -> LockId {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.aliases.get(&id).copied().unwrap_or(id)
    }

    /// Names a lock for reports. The first name given sticks.
    pub fn name_lock(&self, id: LockId, name: impl Into<String>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.names.entry(id).or_insert_with(|| name.into());
    }

    pub fn name(&self, id: LockId) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.names.get(&id).cloned()
    }

    pub fn names_for(&self, ids: impl IntoIterator<Item = LockId>) -> BTreeMap<LockId, String> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        ids.into_iter()
            .filter_map(|id| inner.names.get(&id).map(|n| (id, n.clone())))
            .collect()
    }
}

/// Everything the analysis needs to resolve ids coming off the event stream.
#[derive(Debug, Default)]
pub struct Registry {
    pub fields: Arc<FieldDefs>,
    pub locks: Arc<LockTable>,
}

impl Registry {
    pub fn new(fields: FieldDefs) -> Self {
        Registry { fields: Arc::new(fields), locks: Arc::new(LockTable::new()) }
    }
}
