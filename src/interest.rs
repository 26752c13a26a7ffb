//! Which fields get tracked, and which tracked fields raise alerts.
//!
//! Patterns are regular expressions matched against the whole of
//! `declaringType.fieldName`. An empty pattern matches nothing.

use hashbrown::HashSet;
use regex::Regex;

use crate::error::{MonitorError, Result};
use crate::registry::{FieldDefs, FieldId};

#[derive(Clone, Debug)]
pub struct FieldPattern {
    source: String,
    regex: Option<Regex>,
}

impl FieldPattern {
    pub fn compile(which: &'static str, pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Ok(Self::none());
        }
        let regex = Regex::new(&format!("^(?:{pattern})$")).map_err(|source| MonitorError::InvalidPattern {
            which,
            pattern: pattern.to_owned(),
            source,
        })?;
        Ok(FieldPattern { source: pattern.to_owned(), regex: Some(regex) })
    }

    pub fn none() -> Self {
        FieldPattern { source: String::new(), regex: None }
    }

    pub fn matches(&self, qualified_name: &str) -> bool {
        self.regex.as_ref().is_some_and(|r| r.is_match(qualified_name))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn resolve(&self, defs: &FieldDefs) -> HashSet<FieldId> {
        if self.regex.is_none() {
            return HashSet::new();
        }
        defs.values()
            .filter(|def| self.matches(&def.qualified_name()))
            .map(|def| def.id)
            .collect()
    }
}

/// The three alert selections: fields confined to the UI thread, fields that
/// must not be shared, and fields that must always hold a lock.
#[derive(Clone, Debug)]
pub struct AlertSpec {
    edt: FieldPattern,
    shared: FieldPattern,
    lock_set: FieldPattern,
    edt_fields: HashSet<FieldId>,
    shared_fields: HashSet<FieldId>,
    lock_set_fields: HashSet<FieldId>,
}

impl AlertSpec {
    pub fn new(edt: &str, shared: &str, lock_set: &str, defs: &FieldDefs) -> Result<Self> {
        let edt = FieldPattern::compile("edt field", edt)?;
        let shared = FieldPattern::compile("shared field", shared)?;
        let lock_set = FieldPattern::compile("lock set field", lock_set)?;
        Ok(Self::resolved(edt, shared, lock_set, defs))
    }

    pub fn empty() -> Self {
        AlertSpec {
            edt: FieldPattern::none(),
            shared: FieldPattern::none(),
            lock_set: FieldPattern::none(),
            edt_fields: HashSet::new(),
            shared_fields: HashSet::new(),
            lock_set_fields: HashSet::new(),
        }
    }

    fn resolved(edt: FieldPattern, shared: FieldPattern, lock_set: FieldPattern, defs: &FieldDefs) -> Self {
        AlertSpec {
            edt_fields: edt.resolve(defs),
            shared_fields: shared.resolve(defs),
            lock_set_fields: lock_set.resolve(defs),
            edt,
            shared,
            lock_set,
        }
    }

    /// Builds the next revision. A `None` keeps the current pattern. Nothing
    /// changes unless every given pattern compiles.
    pub fn merge(&self, edt: Option<&str>, shared: Option<&str>, lock_set: Option<&str>, defs: &FieldDefs) -> Result<Self> {
        let edt = match edt {
            Some(p) => FieldPattern::compile("edt field", p)?,
            None => self.edt.clone(),
        };
        let shared = match shared {
            Some(p) => FieldPattern::compile("shared field", p)?,
            None => self.shared.clone(),
        };
        let lock_set = match lock_set {
            Some(p) => FieldPattern::compile("lock set field", p)?,
            None => self.lock_set.clone(),
        };
        Ok(Self::resolved(edt, shared, lock_set, defs))
    }

    pub fn edt_fields(&self) -> &HashSet<FieldId> {
        &self.edt_fields
    }

    pub fn shared_fields(&self) -> &HashSet<FieldId> {
        &self.shared_fields
    }

    pub fn lock_set_fields(&self) -> &HashSet<FieldId> {
        &self.lock_set_fields
    }

    pub fn edt_pattern(&self) -> &str {
        self.edt.as_str()
    }

    pub fn shared_pattern(&self) -> &str {
        self.shared.as_str()
    }

    pub fn lock_set_pattern(&self) -> &str {
        self.lock_set.as_str()
    }
}

/// Selects the fields whose accesses are recorded at all.
#[derive(Clone, Debug)]
pub struct MonitorSpec {
    pattern: FieldPattern,
    tracked: HashSet<FieldId>,
}

impl MonitorSpec {
    pub fn new(pattern: &str, defs: &FieldDefs) -> Result<Self> {
        let pattern = FieldPattern::compile("tracked field", pattern)?;
        let tracked = pattern.resolve(defs);
        Ok(MonitorSpec { pattern, tracked })
    }

    pub fn empty() -> Self {
        MonitorSpec { pattern: FieldPattern::none(), tracked: HashSet::new() }
    }

    pub fn is_monitoring(&self, field: FieldId) -> bool {
        self.tracked.contains(&field)
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}
