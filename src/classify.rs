//! Class name → bin resolution.
//!
//! Lookup order: built-in table, learned store, then the operator. Answers from
//! the operator are persisted before they are returned. Static entries always
//! win and are never shadowed by learning.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::SortError;
use crate::prompt::HumanPrompt;
use crate::storage::{PutOutcome, SharedStore};
use crate::{normalize_class_name, validate_class_name, BinColor, ClassificationEntry, EntrySource};

/// Built-in mapping for classes the stock model knows.
pub const STATIC_BIN_MAPPING: &[(&str, BinColor)] = &[
    ("plastic", BinColor::Yellow),
    ("plastic_bottle", BinColor::Yellow),
    ("bottle", BinColor::Yellow),
    ("cardboard", BinColor::Yellow),
    ("paper", BinColor::Yellow),
    ("metal", BinColor::Yellow),
    ("glass", BinColor::Yellow),
    ("can", BinColor::Yellow),
    ("banana_peel", BinColor::Green),
    ("food", BinColor::Green),
    ("organic", BinColor::Green),
    ("tissue", BinColor::Brown),
    ("trash", BinColor::Brown),
];

pub fn static_bin_for(class_name: &str) -> Option<BinColor> {
    STATIC_BIN_MAPPING
        .iter()
        .find(|(name, _)| *name == class_name)
        .map(|(_, bin)| *bin)
}

/// Resolves classes to bins and learns new mappings from the operator.
///
/// Interactive resolution is single-flight per class: concurrent callers for
/// the same unknown class queue behind the first, then re-read the store, so
/// one operator answer serves all of them.
pub struct ClassificationResolver {
    store: SharedStore,
    prompt: Arc<dyn HumanPrompt>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ClassificationResolver {
    pub fn new(store: SharedStore, prompt: Arc<dyn HumanPrompt>) -> Self {
        Self {
            store,
            prompt,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Non-interactive lookup that also reports where the mapping came from.
    pub fn lookup(&self, class_name: &str) -> Result<Option<(BinColor, EntrySource)>> {
        let name = normalize_class_name(class_name);
        if let Some(bin) = static_bin_for(&name) {
            return Ok(Some((bin, EntrySource::Static)));
        }
        Ok(self.learned(&name)?.map(|bin| (bin, EntrySource::Learned)))
    }

    /// Map `class_name` to a bin.
    ///
    /// Returns `Ok(None)` when every source is exhausted (unknown class,
    /// operator declined, or invalid answer). Store failures are errors.
    pub fn resolve(&self, class_name: &str, allow_interactive: bool) -> Result<Option<BinColor>> {
        let name = match validate_class_name(class_name) {
            Ok(name) => name,
            Err(err) => {
                log::warn!("ClassificationResolver: not resolving: {}", err);
                return Ok(None);
            }
        };
        if let Some((bin, _)) = self.lookup(&name)? {
            return Ok(Some(bin));
        }
        if !allow_interactive {
            log::debug!("ClassificationResolver: no mapping for '{}'", name);
            return Ok(None);
        }

        let gate = self.gate_for(&name)?;
        let result = {
            let _held = gate
                .lock()
                .map_err(|_| anyhow!("classification gate lock poisoned"))?;
            self.resolve_with_operator(&name)
        };
        self.release_gate(&name, gate);
        result
    }

    fn resolve_with_operator(&self, name: &str) -> Result<Option<BinColor>> {
        // Another caller may have learned it while we queued.
        if let Some(bin) = self.learned(name)? {
            return Ok(Some(bin));
        }
        match self.prompt.ask_bin(name) {
            Ok(Some(bin)) => match self.put_learned(name, bin)? {
                PutOutcome::Inserted | PutOutcome::Unchanged => {
                    log::info!("ClassificationResolver: learned '{}' -> {}", name, bin);
                    Ok(Some(bin))
                }
                PutOutcome::Conflict(existing) => {
                    log::warn!(
                        "ClassificationResolver: '{}' already mapped to {}; keeping it",
                        name,
                        existing
                    );
                    Ok(Some(existing))
                }
            },
            Ok(None) => {
                log::info!("ClassificationResolver: no bin given for '{}'", name);
                Ok(None)
            }
            Err(err) => {
                log::warn!("ClassificationResolver: {}", err);
                Ok(None)
            }
        }
    }

    /// Persist an explicit mapping.
    ///
    /// Fails with `SortError::ConflictingMapping` when the class already maps to
    /// a different bin (static or learned); nothing is written in that case.
    pub fn learn(&self, class_name: &str, bin_color: BinColor) -> Result<PutOutcome> {
        let name = validate_class_name(class_name)?;
        if let Some(existing) = static_bin_for(&name) {
            if existing == bin_color {
                return Ok(PutOutcome::Unchanged);
            }
            return Err(SortError::ConflictingMapping {
                class_name: name,
                existing,
            }
            .into());
        }
        match self.put_learned(&name, bin_color)? {
            PutOutcome::Conflict(existing) => Err(SortError::ConflictingMapping {
                class_name: name,
                existing,
            }
            .into()),
            outcome => Ok(outcome),
        }
    }

    /// Static and learned entries together, static first.
    pub fn entries(&self) -> Result<Vec<ClassificationEntry>> {
        let mut out: Vec<ClassificationEntry> = STATIC_BIN_MAPPING
            .iter()
            .map(|(name, bin)| ClassificationEntry {
                class_name: name.to_string(),
                bin_color: *bin,
                source: EntrySource::Static,
            })
            .collect();
        let learned = self
            .store
            .lock()
            .map_err(|_| anyhow!("classification store lock poisoned"))?
            .entries()?;
        out.extend(
            learned
                .into_iter()
                .filter(|entry| static_bin_for(&entry.class_name).is_none()),
        );
        Ok(out)
    }

    fn learned(&self, name: &str) -> Result<Option<BinColor>> {
        self.store
            .lock()
            .map_err(|_| anyhow!("classification store lock poisoned"))?
            .get(name)
    }

    fn put_learned(&self, name: &str, bin: BinColor) -> Result<PutOutcome> {
        self.store
            .lock()
            .map_err(|_| anyhow!("classification store lock poisoned"))?
            .put(name, bin)
    }

    fn gate_for(&self, name: &str) -> Result<Arc<Mutex<()>>> {
        let mut inflight = self
            .inflight
            .lock()
            .map_err(|_| anyhow!("classification gate table poisoned"))?;
        Ok(inflight
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    fn release_gate(&self, name: &str, gate: Arc<Mutex<()>>) {
        if let Ok(mut inflight) = self.inflight.lock() {
            drop(gate);
            // Clones are only taken under this lock, so a lone table reference
            // means nobody is queued.
            let idle = inflight
                .get(name)
                .is_some_and(|entry| Arc::strong_count(entry) == 1);
            if idle {
                inflight.remove(name);
            }
        }
    }
}
