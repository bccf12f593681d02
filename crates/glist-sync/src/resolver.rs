//! Title resolution against the catalog and reconciliation of sheet rows.

use glist_core::{CatalogRecord, CellRef, CellUpdate, PriorIds, ResolvedColumns, SourceRow};
use glist_storage::{CatalogApi, CatalogError, ResolutionCache};
use tracing::{debug, info, warn};

/// Turns freeform titles into catalog records, consulting and updating the
/// resolution cache.
pub struct ResolverEngine {
    catalog: Box<dyn CatalogApi>,
    cache: ResolutionCache,
}

impl ResolverEngine {
    pub fn new(catalog: Box<dyn CatalogApi>, cache: ResolutionCache) -> Self {
        Self { catalog, cache }
    }

    pub fn cache(&self) -> &ResolutionCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ResolutionCache {
        &mut self.cache
    }

    pub fn into_cache(self) -> ResolutionCache {
        self.cache
    }

    /// Resolve `title` to a catalog record.
    ///
    /// Without `prior` the cache answers first; a cached entry whose
    /// `override_id` was hand-edited is re-resolved against that id. With
    /// `prior`, an override id that differs from the detected id is fetched
    /// directly, falling back to a title search when the catalog does not
    /// know it. A settled prior is served from the cache when possible.
    /// Titles the catalog cannot match at all resolve to the `"unknown"`
    /// placeholder, which is cached like any other record.
    pub async fn resolve(
        &mut self,
        title: &str,
        prior: Option<&PriorIds>,
    ) -> Result<CatalogRecord, CatalogError> {
        let from_cache;
        let prior = match prior {
            Some(prior) => prior,
            None => match self.cache.lookup(title) {
                Some(entry) if entry.has_override() => {
                    info!(%title, override_id = %entry.override_id, "cached entry overridden");
                    from_cache = entry.prior();
                    &from_cache
                }
                Some(entry) => {
                    debug!(%title, id = %entry.id, "resolved from cache");
                    return Ok(entry.to_record());
                }
                None => {
                    from_cache = PriorIds::default();
                    &from_cache
                }
            },
        };

        let record = match prior.override_target() {
            Some(target) => match self.catalog.fetch_by_id(target).await {
                Ok(record) => record,
                Err(err) if err.is_not_found() => {
                    warn!(%title, override_id = %target, "override id unknown to catalog, searching by title");
                    self.search(title).await?
                }
                Err(err) => return Err(err),
            },
            None => {
                if prior.detected().is_some() {
                    if let Some(entry) = self.cache.lookup(title) {
                        return Ok(entry.to_record());
                    }
                }
                self.search(title).await?
            }
        };

        self.cache.insert(title, &record);
        Ok(record)
    }

    async fn search(&self, title: &str) -> Result<CatalogRecord, CatalogError> {
        let results = self.catalog.search_by_title(title).await?;
        let wanted = title.to_lowercase();
        let picked = results
            .iter()
            .find(|r| r.title.to_lowercase() == wanted)
            .or_else(|| results.first())
            .cloned();
        Ok(match picked {
            Some(record) => record,
            None => {
                warn!(%title, "no catalog match, recording placeholder");
                CatalogRecord::placeholder(title)
            }
        })
    }
}

/// Where a sheet keeps its title and metadata block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetLayout {
    pub sheet_name: String,
    pub title_column: usize,
    pub metadata_column: usize,
}

impl SheetLayout {
    pub fn new(sheet_name: impl Into<String>, metadata_column: usize) -> Self {
        Self {
            sheet_name: sheet_name.into(),
            title_column: 0,
            metadata_column,
        }
    }
}

/// Finds rows that need resolution and builds the cell updates correcting them.
pub struct SheetReconciler<'r> {
    resolver: &'r mut ResolverEngine,
    layout: SheetLayout,
}

impl<'r> SheetReconciler<'r> {
    pub fn new(resolver: &'r mut ResolverEngine, layout: SheetLayout) -> Self {
        Self { resolver, layout }
    }

    /// Settled rows produce nothing. Each stale row produces a title-cell
    /// update and a metadata-block update, in row order. The first resolver
    /// failure aborts the pass and no updates are returned.
    pub async fn reconcile(&mut self, rows: &[SourceRow]) -> Result<Vec<CellUpdate>, CatalogError> {
        let mut updates = Vec::new();
        for row in rows {
            if !row.is_stale() {
                continue;
            }

            let mut prior = row.prior();
            if prior.detected() != prior.overridden() {
                prior = prior.without_detected();
            }
            if prior.overridden().is_some() {
                info!(row = row.row_number, title = %row.title, "row {} is overridden", row.row_number);
            } else {
                info!(row = row.row_number, title = %row.title, "row {} is new", row.row_number);
            }

            let record = self.resolver.resolve(&row.title, Some(&prior)).await?;
            updates.push(CellUpdate::row(
                &CellRef::new(&self.layout.sheet_name, self.layout.title_column, row.row_number),
                vec![record.title.clone()],
            ));
            updates.push(CellUpdate::row(
                &CellRef::new(&self.layout.sheet_name, self.layout.metadata_column, row.row_number),
                ResolvedColumns::from_record(&record).to_cells(),
            ));
        }
        debug!(sheet = %self.layout.sheet_name, updates = updates.len(), "reconciliation finished");
        Ok(updates)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;

    pub(crate) fn game(id: &str, title: &str) -> CatalogRecord {
        CatalogRecord {
            catalog_id: id.to_string(),
            title: title.to_string(),
            description: format!("about {title}"),
            cover_url: None,
        }
    }

    /// In-memory catalog counting every call it serves.
    #[derive(Clone, Default)]
    pub(crate) struct FakeCatalog {
        pub searches: BTreeMap<String, Vec<CatalogRecord>>,
        pub games: BTreeMap<String, CatalogRecord>,
        pub failing_titles: Vec<String>,
        pub search_calls: Arc<AtomicUsize>,
        pub fetch_calls: Arc<AtomicUsize>,
    }

    impl FakeCatalog {
        pub(crate) fn with_search(mut self, title: &str, results: Vec<CatalogRecord>) -> Self {
            self.searches.insert(title.to_string(), results);
            self
        }

        pub(crate) fn with_game(mut self, record: CatalogRecord) -> Self {
            self.games.insert(record.catalog_id.clone(), record);
            self
        }

        pub(crate) fn failing_on(mut self, title: &str) -> Self {
            self.failing_titles.push(title.to_string());
            self
        }

        pub(crate) fn calls(&self) -> usize {
            self.search_calls.load(Ordering::SeqCst) + self.fetch_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CatalogApi for FakeCatalog {
        async fn search_by_title(&self, title: &str) -> Result<Vec<CatalogRecord>, CatalogError> {
            self.search_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing_titles.iter().any(|t| t == title) {
                return Err(CatalogError::HttpStatus {
                    status: 503,
                    path: "/search".to_string(),
                });
            }
            Ok(self.searches.get(title).cloned().unwrap_or_default())
        }

        async fn fetch_by_id(&self, id: &str) -> Result<CatalogRecord, CatalogError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            self.games
                .get(id)
                .cloned()
                .ok_or_else(|| CatalogError::NotFound(id.to_string()))
        }
    }

    fn engine(catalog: &FakeCatalog) -> ResolverEngine {
        let dir = std::env::temp_dir().join("glist-resolver-tests-unsaved.json");
        ResolverEngine::new(Box::new(catalog.clone()), ResolutionCache::new(dir))
    }

    fn source_row(row_number: u32, title: &str, detected: &str, overridden: &str) -> SourceRow {
        let cell = |v: &str| (!v.is_empty()).then(|| v.to_string());
        SourceRow {
            row_number,
            title: title.to_string(),
            resolved: ResolvedColumns {
                detected_id: cell(detected),
                override_id: cell(overridden),
                cover_url: None,
                description: None,
            },
        }
    }

    fn settled_rows(updates: &[CellUpdate], rows: &[SourceRow]) -> Vec<SourceRow> {
        rows.iter()
            .map(|row| {
                let meta = updates
                    .iter()
                    .find(|u| u.target().map(|t| t.row == row.row_number && t.column == 7).unwrap_or(false));
                match meta {
                    Some(update) => {
                        let cells = &update.values[0];
                        source_row(row.row_number, &row.title, &cells[0], &cells[1])
                    }
                    None => row.clone(),
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn exact_title_match_beats_catalog_order() {
        let catalog = FakeCatalog::default().with_search(
            "doom",
            vec![game("1", "Doom II"), game("2", "DOOM"), game("3", "doom")],
        );
        let mut resolver = engine(&catalog);
        let record = resolver.resolve("doom", Some(&PriorIds::default())).await.unwrap();
        assert_eq!(record.catalog_id, "2");
    }

    #[tokio::test]
    async fn first_result_wins_without_exact_match() {
        let catalog = FakeCatalog::default().with_search(
            "Monkey Island",
            vec![game("7", "The Secret of Monkey Island"), game("8", "Monkey Island 2")],
        );
        let mut resolver = engine(&catalog);
        let record = resolver.resolve("Monkey Island", None).await.unwrap();
        assert_eq!(record.catalog_id, "7");
        assert_eq!(resolver.cache().lookup("Monkey Island").unwrap().id, "7");
    }

    #[tokio::test]
    async fn unmatched_titles_are_cached_as_unknown() {
        let catalog = FakeCatalog::default();
        let mut resolver = engine(&catalog);

        let record = resolver.resolve("Zelda Breth", None).await.unwrap();
        assert_eq!(record, CatalogRecord::placeholder("Zelda Breth"));
        assert_eq!(record.description, "");
        assert!(record.cover_url.is_none());

        let again = resolver.resolve("Zelda Breth", None).await.unwrap();
        assert_eq!(again, record);
        assert_eq!(catalog.calls(), 1, "placeholder served from cache");
    }

    #[tokio::test]
    async fn forgetting_a_placeholder_forces_a_new_search() {
        let catalog = FakeCatalog::default();
        let mut resolver = engine(&catalog);
        resolver.resolve("Loom", None).await.unwrap();
        resolver.cache_mut().forget("Loom");
        resolver.resolve("Loom", None).await.unwrap();
        assert_eq!(catalog.search_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn override_is_fetched_and_collapses() {
        let catalog = FakeCatalog::default()
            .with_game(game("9", "Quake"))
            .with_game(game("5", "Quake III"));
        let mut resolver = engine(&catalog);

        let prior = PriorIds::new(Some("5".into()), Some("9".into()));
        let record = resolver.resolve("Quake", Some(&prior)).await.unwrap();
        assert_eq!(record.catalog_id, "9");
        let cached = resolver.cache().lookup("Quake").unwrap();
        assert_eq!((cached.id.as_str(), cached.override_id.as_str()), ("9", "9"));
        assert_eq!(catalog.fetch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(catalog.search_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_override_falls_through_to_search() {
        let catalog = FakeCatalog::default().with_search("Quake", vec![game("9", "Quake")]);
        let mut resolver = engine(&catalog);

        let prior = PriorIds::new(None, Some("404404".into()));
        let record = resolver.resolve("Quake", Some(&prior)).await.unwrap();
        assert_eq!(record.catalog_id, "9");
        assert_eq!(catalog.fetch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(catalog.search_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hand_edited_cache_override_is_honored() {
        let catalog = FakeCatalog::default().with_game(game("42", "Grim Fandango"));
        let mut resolver = engine(&catalog);
        resolver.cache_mut().insert("grim", &game("41", "Grim"));
        resolver.resolve("grim", None).await.unwrap();
        assert_eq!(catalog.calls(), 0);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("games.json");
        std::fs::write(
            &path,
            r#"{"grim": {"id": 41, "override_id": 42, "title": "Grim", "description": null}}"#,
        )
        .unwrap();
        let mut cache = ResolutionCache::new(path.clone());
        cache.load().await;
        let mut resolver = ResolverEngine::new(Box::new(catalog.clone()), cache);

        let record = resolver.resolve("grim", None).await.unwrap();
        assert_eq!(record.catalog_id, "42");
        assert!(!resolver.cache().lookup("grim").unwrap().has_override());
    }

    #[tokio::test]
    async fn settled_prior_uses_cache_without_network() {
        let catalog = FakeCatalog::default();
        let mut resolver = engine(&catalog);
        resolver.cache_mut().insert("Myst", &game("11", "Myst"));

        let prior = PriorIds::new(Some("11".into()), Some("11".into()));
        let record = resolver.resolve("Myst", Some(&prior)).await.unwrap();
        assert_eq!(record.catalog_id, "11");
        assert_eq!(catalog.calls(), 0);
    }

    #[tokio::test]
    async fn another_world_row_produces_title_and_metadata_updates() {
        let mut found = game("124", "Another World");
        found.description = "...".into();
        found.cover_url = Some("http://x/a.jpg".into());
        let catalog = FakeCatalog::default().with_search("Another World", vec![found]);
        let mut resolver = engine(&catalog);

        let rows = vec![source_row(2, "Another World", "", "")];
        let updates = SheetReconciler::new(&mut resolver, SheetLayout::new("Schedule", 7))
            .reconcile(&rows)
            .await
            .unwrap();

        assert_eq!(
            updates,
            vec![
                CellUpdate {
                    range: "Schedule!A2".into(),
                    values: vec![vec!["Another World".into()]],
                },
                CellUpdate {
                    range: "Schedule!H2".into(),
                    values: vec![vec![
                        "124".into(),
                        "124".into(),
                        "http://x/a.jpg".into(),
                        "...".into()
                    ]],
                },
            ]
        );
    }

    #[tokio::test]
    async fn catalog_title_replaces_operator_spelling() {
        let catalog = FakeCatalog::default().with_search("another world", vec![game("124", "Another World")]);
        let mut resolver = engine(&catalog);
        let updates = SheetReconciler::new(&mut resolver, SheetLayout::new("Schedule", 7))
            .reconcile(&[source_row(3, "another world", "", "")])
            .await
            .unwrap();
        assert_eq!(updates[0].values, vec![vec!["Another World".to_string()]]);
    }

    #[tokio::test]
    async fn second_pass_is_a_no_op() {
        let catalog = FakeCatalog::default()
            .with_search("Loom", vec![game("3", "Loom")])
            .with_search("Zork", vec![game("4", "Zork I")]);
        let mut resolver = engine(&catalog);
        let rows = vec![
            source_row(2, "Loom", "", ""),
            source_row(3, "Zork", "", ""),
            source_row(4, "Nothing Here", "", ""),
        ];

        let first = SheetReconciler::new(&mut resolver, SheetLayout::new("Schedule", 7))
            .reconcile(&rows)
            .await
            .unwrap();
        assert_eq!(first.len(), 6);
        let calls_after_first = catalog.calls();

        let rows = settled_rows(&first, &rows);
        let second = SheetReconciler::new(&mut resolver, SheetLayout::new("Schedule", 7))
            .reconcile(&rows)
            .await
            .unwrap();
        assert!(second.is_empty());
        assert_eq!(catalog.calls(), calls_after_first);
    }

    #[tokio::test]
    async fn overridden_row_is_rewritten_with_collapsed_ids() {
        let catalog = FakeCatalog::default().with_game(game("9", "Quake"));
        let mut resolver = engine(&catalog);
        let updates = SheetReconciler::new(&mut resolver, SheetLayout::new("Schedule", 7))
            .reconcile(&[source_row(5, "Quake", "5", "9")])
            .await
            .unwrap();
        assert_eq!(updates[1].range, "Schedule!H5");
        assert_eq!(updates[1].values[0][..2], ["9".to_string(), "9".to_string()]);
    }

    #[tokio::test]
    async fn settled_rows_are_left_alone() {
        let catalog = FakeCatalog::default();
        let mut resolver = engine(&catalog);
        let updates = SheetReconciler::new(&mut resolver, SheetLayout::new("Schedule", 7))
            .reconcile(&[source_row(2, "Myst", "11", "11"), source_row(3, "Riven", "unknown", "unknown")])
            .await
            .unwrap();
        assert!(updates.is_empty());
        assert_eq!(catalog.calls(), 0);
    }

    #[tokio::test]
    async fn failure_midway_emits_nothing() {
        let mut catalog = FakeCatalog::default().failing_on("Third");
        for title in ["First", "Second", "Fourth", "Fifth"] {
            catalog = catalog.with_search(title, vec![game(title, title)]);
        }
        let mut resolver = engine(&catalog);
        let rows: Vec<_> = ["First", "Second", "Third", "Fourth", "Fifth"]
            .iter()
            .enumerate()
            .map(|(idx, title)| source_row(idx as u32 + 2, title, "", ""))
            .collect();

        let result = SheetReconciler::new(&mut resolver, SheetLayout::new("Schedule", 7))
            .reconcile(&rows)
            .await;
        assert!(matches!(result, Err(CatalogError::HttpStatus { status: 503, .. })));
        assert_eq!(catalog.search_calls.load(Ordering::SeqCst), 3);
    }
}
