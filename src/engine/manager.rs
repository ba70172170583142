use super::index::DomainFilterIndex;
use super::source::{FilterCategory, FilterSource, ParsedList};
use super::traits::ListFetcher;
use crate::config::FilterSourceConfig;
use crate::error::FilterError;
use anyhow::Context;
use arc_swap::ArcSwap;
use chrono::Utc;
use futures::{stream, StreamExt};
use reqwest::Client;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::io::StreamReader;
use tracing::{info, warn};

/// Fetches lists over HTTPS and parses them line by line as they stream in.
pub struct HttpListFetcher {
    client: Client,
}

impl HttpListFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("AdShield/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build HTTP client for filter lists")?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl ListFetcher for HttpListFetcher {
    async fn fetch(&self, url: &str) -> anyhow::Result<ParsedList> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("{} returned an error status", url))?;

        let stream = resp
            .bytes_stream()
            .map(|result| result.map_err(std::io::Error::other));
        let reader = StreamReader::new(stream);
        let mut lines = BufReader::new(reader).lines();
        let mut list = ParsedList::default();

        while let Some(line) = lines.next_line().await? {
            list.push_line(&line);
        }
        Ok(list)
    }
}

/// Owns the subscribed filter sources, their downloaded content, and the
/// live [`DomainFilterIndex`].
///
/// Every mutation ends in a rebuild that merges the content of all enabled
/// sources on the blocking pool and installs the result with one atomic
/// store. Lookups keep using the previous index until then.
pub struct FilterRepository {
    fetcher: Arc<dyn ListFetcher>,
    index: Arc<ArcSwap<DomainFilterIndex>>,
    sources: RwLock<Vec<FilterSource>>,
    contents: RwLock<FxHashMap<u32, Arc<ParsedList>>>,
    fetch_locks: Mutex<FxHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    rebuild_lock: tokio::sync::Mutex<()>,
    next_id: AtomicU32,
    fp_rate: f64,
    concurrent_downloads: usize,
}

impl FilterRepository {
    pub fn new(fetcher: Arc<dyn ListFetcher>, fp_rate: f64, concurrent_downloads: usize) -> Self {
        Self {
            fetcher,
            index: Arc::new(ArcSwap::from_pointee(DomainFilterIndex::empty())),
            sources: RwLock::new(Vec::new()),
            contents: RwLock::new(FxHashMap::default()),
            fetch_locks: Mutex::new(FxHashMap::default()),
            rebuild_lock: tokio::sync::Mutex::new(()),
            next_id: AtomicU32::new(1),
            fp_rate,
            concurrent_downloads: concurrent_downloads.max(1),
        }
    }

    /// Register the configured sources. Nothing is fetched until
    /// [`load_all_enabled_filters`](Self::load_all_enabled_filters).
    pub fn seed(&self, configs: &[FilterSourceConfig]) {
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        for cfg in configs {
            if sources.iter().any(|s| s.url == cfg.url) {
                continue;
            }
            sources.push(FilterSource {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                url: cfg.url.clone(),
                enabled: cfg.enabled,
                built_in: cfg.built_in,
                category: cfg.category,
                domain_count: 0,
                last_updated: None,
            });
        }
    }

    pub fn sources(&self) -> Vec<FilterSource> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// URLs of the currently enabled sources, in subscription order.
    pub fn enabled_urls(&self) -> Vec<String> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.url.clone())
            .collect()
    }

    /// Shared handle to the live index, for readers that outlive a borrow.
    pub fn index_handle(&self) -> Arc<ArcSwap<DomainFilterIndex>> {
        self.index.clone()
    }

    pub fn index(&self) -> Arc<DomainFilterIndex> {
        self.index.load_full()
    }

    pub fn is_blocked(&self, domain: &str) -> bool {
        self.index.load().query(domain)
    }

    /// Subscribe to a user-supplied list, fetch it and rebuild.
    pub async fn add_source(&self, url: &str, category: FilterCategory) -> Result<u32, FilterError> {
        let id = {
            let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
            if sources.iter().any(|s| s.url == url) {
                return Err(FilterError::DuplicateSource(url.to_string()));
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            sources.push(FilterSource {
                id,
                url: url.to_string(),
                enabled: true,
                built_in: false,
                category,
                domain_count: 0,
                last_updated: None,
            });
            id
        };
        info!("Added filter source {} ({})", id, url);

        if let Err(e) = self.fetch_source(id, url).await {
            warn!("Filter source {} added without content: {:#}", id, e);
        }
        self.rebuild().await?;
        Ok(id)
    }

    pub async fn remove_source(&self, id: u32) -> Result<(), FilterError> {
        {
            let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
            let pos = sources
                .iter()
                .position(|s| s.id == id)
                .ok_or(FilterError::UnknownSource(id))?;
            if sources[pos].built_in {
                return Err(FilterError::BuiltInSource(id));
            }
            let removed = sources.remove(pos);
            info!("Removed filter source {} ({})", id, removed.url);
            self.prune_fetch_lock(&removed.url);
        }
        self.contents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        self.rebuild().await?;
        Ok(())
    }

    pub async fn set_enabled(&self, id: u32, enabled: bool) -> Result<(), FilterError> {
        let url = {
            let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
            let source = sources
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or(FilterError::UnknownSource(id))?;
            if source.enabled == enabled {
                return Ok(());
            }
            source.enabled = enabled;
            source.url.clone()
        };

        if enabled && !self.has_content(id) {
            if let Err(e) = self.fetch_source(id, &url).await {
                warn!("{:#}", e);
            }
        }
        self.rebuild().await?;
        Ok(())
    }

    /// Make exactly `urls` the enabled set, subscribing to any URL not yet
    /// known. Used when a protection profile becomes active.
    pub async fn apply_enabled_urls(&self, urls: &[String]) -> Result<usize, FilterError> {
        let missing: Vec<(u32, String)> = {
            let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
            for url in urls {
                if !sources.iter().any(|s| &s.url == url) {
                    sources.push(FilterSource {
                        id: self.next_id.fetch_add(1, Ordering::Relaxed),
                        url: url.clone(),
                        enabled: true,
                        built_in: false,
                        category: FilterCategory::Ad,
                        domain_count: 0,
                        last_updated: None,
                    });
                }
            }
            for source in sources.iter_mut() {
                source.enabled = urls.contains(&source.url);
            }
            sources
                .iter()
                .filter(|s| s.enabled && !self.has_content(s.id))
                .map(|s| (s.id, s.url.clone()))
                .collect()
        };

        self.fetch_many(missing).await;
        self.rebuild().await
    }

    /// Re-download one source and rebuild. A failed download drops that
    /// source's contribution; the rebuild still happens.
    pub async fn refresh(&self, id: u32) -> Result<usize, FilterError> {
        let url = self
            .sources()
            .into_iter()
            .find(|s| s.id == id)
            .map(|s| s.url)
            .ok_or(FilterError::UnknownSource(id))?;

        let fetched = self.fetch_source(id, &url).await;
        self.rebuild().await?;
        fetched
    }

    /// Download every enabled source in parallel and install the merged
    /// index. Returns the number of distinct blocked domains.
    pub async fn load_all_enabled_filters(&self) -> Result<usize, FilterError> {
        let enabled: Vec<(u32, String)> = self
            .sources()
            .into_iter()
            .filter(|s| s.enabled)
            .map(|s| (s.id, s.url))
            .collect();

        info!("Loading {} enabled filter sources...", enabled.len());
        self.fetch_many(enabled).await;
        self.rebuild().await
    }

    /// Drop the installed index and all downloaded content. Nothing is
    /// blocked by lists until the next load.
    pub async fn clear_cache(&self) {
        let _guard = self.rebuild_lock.lock().await;
        self.contents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.index.store(Arc::new(DomainFilterIndex::empty()));
        info!("Filter index cleared");
    }

    fn has_content(&self, id: u32) -> bool {
        self.contents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    fn fetch_lock(&self, url: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.fetch_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(url.to_string())
            .or_default()
            .clone()
    }

    /// Forget the per-URL lock unless a download still holds it.
    fn prune_fetch_lock(&self, url: &str) {
        let mut locks = self.fetch_locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(url).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(url);
        }
    }

    async fn fetch_many(&self, targets: Vec<(u32, String)>) {
        let tasks = targets.into_iter().map(|(id, url)| async move {
            if let Err(e) = self.fetch_source(id, &url).await {
                warn!("{:#}", e);
            }
        });
        stream::iter(tasks)
            .buffer_unordered(self.concurrent_downloads)
            .collect::<Vec<()>>()
            .await;
    }

    /// One download per URL at a time; a second caller waits for the first.
    async fn fetch_source(&self, id: u32, url: &str) -> Result<usize, FilterError> {
        let lock = self.fetch_lock(url);
        let _guard = lock.lock().await;

        info!("Fetching filter source {} from {}", id, url);
        match self.fetcher.fetch(url).await {
            Ok(list) => {
                let count = list.domain_count();
                self.contents
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id, Arc::new(list));
                self.update_source(id, count);
                info!("Parsed {} domains from filter source {}", count, id);
                Ok(count)
            }
            Err(source) => {
                self.contents
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                self.update_source(id, 0);
                Err(FilterError::Fetch {
                    url: url.to_string(),
                    source,
                })
            }
        }
    }

    fn update_source(&self, id: u32, domain_count: usize) {
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(source) = sources.iter_mut().find(|s| s.id == id) {
            source.domain_count = domain_count;
            if domain_count > 0 {
                source.last_updated = Some(Utc::now());
            }
        }
    }

    async fn rebuild(&self) -> Result<usize, FilterError> {
        let _guard = self.rebuild_lock.lock().await;

        let lists: Vec<Arc<ParsedList>> = {
            let sources = self.sources.read().unwrap_or_else(PoisonError::into_inner);
            let contents = self.contents.read().unwrap_or_else(PoisonError::into_inner);
            sources
                .iter()
                .filter(|s| s.enabled)
                .filter_map(|s| contents.get(&s.id).cloned())
                .collect()
        };
        let raw_count: usize = lists.iter().map(|l| l.domain_count()).sum();
        let fp_rate = self.fp_rate;

        let index = tokio::task::spawn_blocking(move || {
            DomainFilterIndex::from_lists(lists.iter().map(Arc::as_ref), fp_rate)
        })
        .await
        .map_err(|e| FilterError::IndexBuild(e.to_string()))?;

        let count = index.len();
        info!(
            "Filter index rebuilt. Distinct domains: {} (from {} raw entries, {} exceptions, {} KiB bloom)",
            count,
            raw_count,
            index.exception_count(),
            index.bloom_size_bytes() / 1024
        );
        self.index.store(Arc::new(index));
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Semaphore;

    struct StaticFetcher {
        lists: HashMap<String, String>,
        calls: AtomicUsize,
    }

    impl StaticFetcher {
        fn new(lists: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                lists: lists
                    .iter()
                    .map(|(u, t)| (u.to_string(), t.to_string()))
                    .collect(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl ListFetcher for StaticFetcher {
        async fn fetch(&self, url: &str) -> anyhow::Result<ParsedList> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.lists.get(url) {
                Some(text) => Ok(ParsedList::from_text(text)),
                None => anyhow::bail!("connection refused"),
            }
        }
    }

    /// Holds every download of a gated URL until the test releases it.
    struct GatedFetcher {
        lists: HashMap<String, String>,
        gated: Vec<String>,
        entered: Semaphore,
        release: Semaphore,
        active: AtomicUsize,
        max_active: AtomicUsize,
        calls: AtomicUsize,
    }

    impl GatedFetcher {
        fn new(lists: &[(&str, &str)], gated: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                lists: lists
                    .iter()
                    .map(|(u, t)| (u.to_string(), t.to_string()))
                    .collect(),
                gated: gated.iter().map(|u| u.to_string()).collect(),
                entered: Semaphore::new(0),
                release: Semaphore::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            })
        }

        async fn wait_entered(&self) {
            self.entered.acquire().await.unwrap().forget();
        }
    }

    #[async_trait::async_trait]
    impl ListFetcher for GatedFetcher {
        async fn fetch(&self, url: &str) -> anyhow::Result<ParsedList> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.gated.iter().any(|g| g == url) {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_active.fetch_max(now, Ordering::SeqCst);
                self.entered.add_permits(1);
                self.release.acquire().await.unwrap().forget();
                self.active.fetch_sub(1, Ordering::SeqCst);
            }
            match self.lists.get(url) {
                Some(text) => Ok(ParsedList::from_text(text)),
                None => anyhow::bail!("connection refused"),
            }
        }
    }

    fn source(url: &str, built_in: bool) -> FilterSourceConfig {
        FilterSourceConfig {
            url: url.to_string(),
            category: FilterCategory::Ad,
            enabled: true,
            built_in,
        }
    }

    #[tokio::test]
    async fn test_load_concrete_list() {
        let fetcher = StaticFetcher::new(&[(
            "https://lists.test/a",
            "0.0.0.0 ads.example.com\n||analytics.example.com^\nmalware.example.com",
        )]);
        let repo = FilterRepository::new(fetcher, 0.01, 4);
        repo.seed(&[source("https://lists.test/a", true)]);

        let count = repo.load_all_enabled_filters().await.unwrap();
        assert_eq!(count, 3);
        assert!(repo.is_blocked("ads.example.com"));
        assert!(repo.is_blocked("analytics.example.com"));
        assert!(repo.is_blocked("malware.example.com"));
        assert!(!repo.is_blocked("google.com"));

        let sources = repo.sources();
        assert_eq!(sources[0].domain_count, 3);
        assert!(sources[0].last_updated.is_some());
    }

    #[tokio::test]
    async fn test_empty_source_set_loads_zero() {
        let repo = FilterRepository::new(StaticFetcher::new(&[]), 0.01, 4);
        assert_eq!(repo.load_all_enabled_filters().await.unwrap(), 0);
        assert!(!repo.is_blocked("ads.example.com"));
    }

    #[tokio::test]
    async fn test_unreachable_source_is_omitted() {
        let fetcher = StaticFetcher::new(&[("https://lists.test/a", "a.com\n")]);
        let repo = FilterRepository::new(fetcher, 0.01, 2);
        repo.seed(&[
            source("https://lists.test/a", true),
            source("https://lists.test/down", true),
        ]);

        assert_eq!(repo.load_all_enabled_filters().await.unwrap(), 1);
        assert!(repo.is_blocked("x.a.com"));

        let id = repo.sources()[1].id;
        assert!(matches!(repo.refresh(id).await, Err(FilterError::Fetch { .. })));
        assert!(repo.is_blocked("x.a.com"));
    }

    #[tokio::test]
    async fn test_clear_cache_unblocks_everything() {
        let fetcher = StaticFetcher::new(&[("https://lists.test/a", "ads.example.com\n")]);
        let repo = FilterRepository::new(fetcher, 0.01, 4);
        repo.seed(&[source("https://lists.test/a", true)]);
        repo.load_all_enabled_filters().await.unwrap();
        assert!(repo.is_blocked("ads.example.com"));

        repo.clear_cache().await;
        assert!(!repo.is_blocked("ads.example.com"));
        assert!(repo.index().is_empty());
    }

    #[tokio::test]
    async fn test_source_lifecycle() {
        let fetcher = StaticFetcher::new(&[
            ("https://lists.test/a", "a.com\n"),
            ("https://lists.test/b", "b.com\n"),
        ]);
        let repo = FilterRepository::new(fetcher.clone(), 0.01, 4);
        repo.seed(&[source("https://lists.test/a", true)]);
        repo.load_all_enabled_filters().await.unwrap();

        let added = repo
            .add_source("https://lists.test/b", FilterCategory::Security)
            .await
            .unwrap();
        assert!(repo.is_blocked("b.com"));
        assert!(matches!(
            repo.add_source("https://lists.test/b", FilterCategory::Ad).await,
            Err(FilterError::DuplicateSource(_))
        ));

        repo.set_enabled(added, false).await.unwrap();
        assert!(!repo.is_blocked("b.com"));
        repo.set_enabled(added, true).await.unwrap();
        assert!(repo.is_blocked("b.com"));
        // Content was kept while disabled.
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

        let built_in = repo.sources()[0].id;
        assert!(matches!(
            repo.remove_source(built_in).await,
            Err(FilterError::BuiltInSource(_))
        ));
        repo.remove_source(added).await.unwrap();
        assert!(!repo.is_blocked("b.com"));
        assert!(matches!(
            repo.remove_source(added).await,
            Err(FilterError::UnknownSource(_))
        ));
    }

    #[tokio::test]
    async fn test_apply_enabled_urls_switches_set() {
        let fetcher = StaticFetcher::new(&[
            ("https://lists.test/a", "a.com\n"),
            ("https://lists.test/kids", "games.com\n"),
        ]);
        let repo = FilterRepository::new(fetcher, 0.01, 4);
        repo.seed(&[source("https://lists.test/a", true)]);
        repo.load_all_enabled_filters().await.unwrap();

        let count = repo
            .apply_enabled_urls(&["https://lists.test/kids".to_string()])
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert!(repo.is_blocked("games.com"));
        assert!(!repo.is_blocked("a.com"));
        assert_eq!(repo.sources().len(), 2);
    }

    #[tokio::test]
    async fn test_same_url_is_never_fetched_concurrently() {
        let url = "https://lists.test/slow";
        let fetcher = GatedFetcher::new(&[(url, "slow.example.com\n")], &[url]);
        let repo = FilterRepository::new(fetcher.clone(), 0.01, 4);
        repo.seed(&[source(url, true)]);
        let id = repo.sources()[0].id;

        let driver = async {
            fetcher.wait_entered().await;
            // Give the second refresh time to reach the fetch lock.
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(fetcher.active.load(Ordering::SeqCst), 1);
            assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
            fetcher.release.add_permits(1);

            fetcher.wait_entered().await;
            fetcher.release.add_permits(1);
        };
        let (first, second, ()) = tokio::join!(repo.refresh(id), repo.refresh(id), driver);

        assert_eq!(first.unwrap(), 1);
        assert_eq!(second.unwrap(), 1);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(fetcher.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lookups_use_previous_index_until_rebuilt() {
        let slow = "https://lists.test/slow";
        let fetcher = GatedFetcher::new(
            &[("https://lists.test/a", "a.com\n"), (slow, "b.com\n")],
            &[slow],
        );
        let repo = FilterRepository::new(fetcher.clone(), 0.01, 4);
        repo.seed(&[source("https://lists.test/a", true)]);
        repo.load_all_enabled_filters().await.unwrap();
        let previous = repo.index();

        let driver = async {
            fetcher.wait_entered().await;
            assert!(repo.is_blocked("a.com"));
            assert!(!repo.is_blocked("b.com"));
            assert!(Arc::ptr_eq(&previous, &repo.index()));
            fetcher.release.add_permits(1);
        };
        let (added, ()) = tokio::join!(repo.add_source(slow, FilterCategory::Ad), driver);
        added.unwrap();

        assert!(repo.is_blocked("a.com"));
        assert!(repo.is_blocked("b.com"));
        // A reader holding the old snapshot still sees it unchanged.
        assert!(!previous.query("b.com"));
    }

    #[tokio::test]
    async fn test_remove_source_prunes_fetch_lock() {
        let fetcher = StaticFetcher::new(&[("https://lists.test/b", "b.com\n")]);
        let repo = FilterRepository::new(fetcher, 0.01, 4);
        let id = repo
            .add_source("https://lists.test/b", FilterCategory::Ad)
            .await
            .unwrap();
        assert_eq!(repo.fetch_locks.lock().unwrap().len(), 1);

        repo.remove_source(id).await.unwrap();
        assert!(repo.fetch_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enabled_urls_tracks_toggles() {
        let fetcher = StaticFetcher::new(&[
            ("https://lists.test/a", "a.com\n"),
            ("https://lists.test/b", "b.com\n"),
        ]);
        let repo = FilterRepository::new(fetcher, 0.01, 4);
        let mut disabled = source("https://lists.test/b", false);
        disabled.enabled = false;
        repo.seed(&[source("https://lists.test/a", true), disabled]);
        let b = repo.sources()[1].id;

        repo.set_enabled(b, true).await.unwrap();
        let a = repo.sources()[0].id;
        repo.set_enabled(a, false).await.unwrap();
        assert_eq!(repo.enabled_urls(), vec!["https://lists.test/b".to_string()]);
    }

    #[tokio::test]
    async fn test_exception_in_one_list_keeps_other_lists_blocking() {
        let fetcher = StaticFetcher::new(&[
            ("https://lists.test/hosts", "0.0.0.0 ads.example.com\n"),
            ("https://lists.test/abp", "||pixel.example.com^\n@@||example.com^\n"),
        ]);
        let repo = FilterRepository::new(fetcher, 0.01, 4);
        repo.seed(&[
            source("https://lists.test/hosts", true),
            source("https://lists.test/abp", true),
        ]);
        repo.load_all_enabled_filters().await.unwrap();

        assert!(repo.is_blocked("ads.example.com"));
        assert!(!repo.is_blocked("pixel.example.com"));
    }
}
