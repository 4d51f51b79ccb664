use std::collections::HashSet;

use circwatch_core::{normalize_title, Entry};

/// Normalized titles already recorded, seeded from the catalog at run start
/// and grown as the run accepts entries.
#[derive(Debug, Clone, Default)]
pub struct DedupStore {
    titles: HashSet<String>,
}

impl DedupStore {
    pub fn load(catalog: &[Entry]) -> Self {
        let mut store = Self::default();
        for entry in catalog {
            store.add(&entry.title);
        }
        store
    }

    pub fn contains(&self, title: &str) -> bool {
        self.titles.contains(&normalize_title(title))
    }

    /// Returns `false` if the title was already known.
    pub fn add(&mut self, title: &str) -> bool {
        self.titles.insert(normalize_title(title))
    }

    pub fn len(&self) -> usize {
        self.titles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.titles.is_empty()
    }
}
