//! Repository catalog: merges overlapping search results into one list.

use serde_json::Value;
use std::collections::HashSet;
use std::convert::Infallible;
use tracing::{debug, info};

use crate::harvest::traits::HarvestStage;
use crate::model::{RepositoryDescriptor, SearchItem};

/// Deduplicated repositories plus accounting of what was dropped.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub repositories: Vec<RepositoryDescriptor>,
    pub stats: CatalogStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatalogStats {
    /// Entries seen across all candidate lists
    pub candidates: usize,
    /// Entries kept in the catalog
    pub accepted: usize,
    /// Entries dropped because an earlier entry had the same id
    pub duplicates: usize,
    /// Entries dropped by the language filter
    pub filtered: usize,
    /// Entries that could not be decoded into a repository
    pub malformed: usize,
}

/// Builds a [`Catalog`] from raw candidate lists.
///
/// Lists are consumed in order and entries within a list in order; the first
/// entry with a given id wins. The output therefore depends only on the input
/// sequence. When a language filter is set, entries whose reported language
/// is absent or differs (ignoring case) are dropped before deduplication, so
/// a filtered entry never shadows a later matching one.
#[derive(Debug, Clone, Default)]
pub struct CatalogBuilder {
    language: Option<String>,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_language_filter(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn build(&self, lists: &[Vec<Value>]) -> Catalog {
        let mut catalog = Catalog::default();
        let mut seen = HashSet::new();

        for entry in lists.iter().flatten() {
            catalog.stats.candidates += 1;

            let item = match decode(entry) {
                Some(item) => item,
                None => {
                    debug!(entry = %entry, "Skipping malformed repository entry");
                    catalog.stats.malformed += 1;
                    continue;
                }
            };

            if !self.language_matches(item.language.as_deref()) {
                catalog.stats.filtered += 1;
                continue;
            }

            if !seen.insert(item.id) {
                catalog.stats.duplicates += 1;
                continue;
            }

            catalog.repositories.push(item.into());
        }

        catalog.stats.accepted = catalog.repositories.len();
        info!(
            candidates = catalog.stats.candidates,
            accepted = catalog.stats.accepted,
            duplicates = catalog.stats.duplicates,
            filtered = catalog.stats.filtered,
            malformed = catalog.stats.malformed,
            "Catalog built"
        );
        catalog
    }

    fn language_matches(&self, reported: Option<&str>) -> bool {
        match (&self.language, reported) {
            (None, _) => true,
            (Some(wanted), Some(reported)) => wanted.eq_ignore_ascii_case(reported.trim()),
            (Some(_), None) => false,
        }
    }
}

impl HarvestStage for CatalogBuilder {
    type Input = Vec<Vec<Value>>;
    type Output = Catalog;
    type Error = Infallible;

    fn execute(&self, input: Self::Input) -> Result<Self::Output, Self::Error> {
        Ok(self.build(&input))
    }

    fn stage_name(&self) -> &'static str {
        "catalog"
    }
}

/// Decodes an entry, rejecting names that cannot form a checkout directory.
fn decode(entry: &Value) -> Option<SearchItem> {
    let item: SearchItem = serde_json::from_value(entry.clone()).ok()?;
    if !is_path_component(&item.name)
        || !is_path_component(&item.owner.login)
        || item.clone_url.trim().is_empty()
    {
        return None;
    }
    Some(item)
}

fn is_path_component(s: &str) -> bool {
    !s.is_empty() && s != "." && s != ".." && !s.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: u64, login: &str, name: &str, language: Option<&str>) -> Value {
        json!({
            "id": id,
            "name": name,
            "owner": {"id": id * 10, "login": login},
            "clone_url": format!("https://example.com/{}/{}.git", login, name),
            "language": language,
        })
    }

    fn ids(catalog: &Catalog) -> Vec<u64> {
        catalog.repositories.iter().map(|r| r.id).collect()
    }

    #[test]
    fn test_empty_input() {
        let catalog = CatalogBuilder::new().build(&[]);
        assert!(catalog.repositories.is_empty());
        assert_eq!(catalog.stats, CatalogStats::default());

        let catalog = CatalogBuilder::new().build(&[vec![], vec![]]);
        assert!(catalog.repositories.is_empty());
    }

    #[test]
    fn test_overlapping_lists_keep_first_occurrence() {
        let first = vec![
            entry(42, "alice", "demo", Some("ABAP")),
            entry(1, "bob", "tools", Some("ABAP")),
        ];
        let mut renamed = entry(42, "alice", "demo-renamed", Some("ABAP"));
        renamed["owner"]["id"] = json!(7);
        let second = vec![renamed, entry(2, "carol", "zreport", Some("ABAP"))];

        let catalog = CatalogBuilder::new().build(&[first, second]);

        assert_eq!(ids(&catalog), vec![42, 1, 2]);
        assert_eq!(catalog.repositories[0].name, "demo");
        assert_eq!(catalog.stats.duplicates, 1);
        assert_eq!(catalog.stats.accepted, 3);
    }

    #[test]
    fn test_language_filter_is_case_insensitive() {
        let list = vec![
            entry(1, "a", "one", Some("ABAP")),
            entry(2, "b", "two", Some("abap")),
            entry(3, "c", "three", Some("JavaScript")),
            entry(4, "d", "four", None),
            entry(5, "e", "five", Some("Abap")),
        ];

        let catalog = CatalogBuilder::new()
            .with_language_filter("abap")
            .build(&[list]);

        assert_eq!(ids(&catalog), vec![1, 2, 5]);
        assert_eq!(catalog.stats.filtered, 2);
    }

    #[test]
    fn test_filtered_entry_does_not_shadow_later_match() {
        let lists = vec![
            vec![entry(9, "a", "mixed", Some("Java"))],
            vec![entry(9, "a", "mixed", Some("ABAP"))],
        ];

        let catalog = CatalogBuilder::new()
            .with_language_filter("abap")
            .build(&lists);

        assert_eq!(ids(&catalog), vec![9]);
        assert_eq!(catalog.stats.duplicates, 0);
    }

    #[test]
    fn test_no_filter_keeps_missing_language() {
        let catalog = CatalogBuilder::new().build(&[vec![entry(4, "d", "four", None)]]);
        assert_eq!(ids(&catalog), vec![4]);
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let list = vec![
            json!({"id": "not-a-number", "name": "x"}),
            json!(null),
            json!({"id": 3, "name": "../escape", "owner": {"id": 1, "login": "a"}, "clone_url": "u"}),
            json!({"id": 4, "name": "ok", "owner": {"id": 1, "login": "a"}, "clone_url": " "}),
            entry(5, "e", "five", None),
        ];

        let catalog = CatalogBuilder::new().build(&[list]);

        assert_eq!(ids(&catalog), vec![5]);
        assert_eq!(catalog.stats.malformed, 4);
        assert_eq!(catalog.stats.candidates, 5);
    }

    #[test]
    fn test_build_is_deterministic() {
        let lists = vec![
            vec![entry(3, "c", "c", None), entry(1, "a", "a", None)],
            vec![entry(1, "a", "a", None), entry(2, "b", "b", None)],
            vec![entry(2, "b", "b", None), entry(3, "c", "c", None)],
        ];
        let builder = CatalogBuilder::new();

        let first = builder.build(&lists);
        let second = builder.build(&lists);

        assert_eq!(first.repositories, second.repositories);
        assert_eq!(ids(&first), vec![3, 1, 2]);
    }

    #[test]
    fn test_output_ids_are_unique() {
        let lists: Vec<Vec<Value>> = (0..5)
            .map(|round| {
                (0..20)
                    .map(|i| entry((i * (round + 1)) % 13, "o", &format!("r{}", i), None))
                    .collect()
            })
            .collect();

        let catalog = CatalogBuilder::new().build(&lists);

        let unique: HashSet<u64> = ids(&catalog).into_iter().collect();
        assert_eq!(unique.len(), catalog.repositories.len());
        assert_eq!(
            catalog.stats.accepted + catalog.stats.duplicates,
            catalog.stats.candidates
        );
    }

    #[test]
    fn test_runs_as_harvest_stage() {
        let builder = CatalogBuilder::new();
        let catalog = builder
            .execute(vec![vec![entry(1, "a", "a", None)]])
            .unwrap();
        assert_eq!(catalog.repositories.len(), 1);
        assert_eq!(builder.stage_name(), "catalog");
    }
}
