use rustc_hash::FxHashSet;

use super::bloom::{BloomFilter, DEFAULT_FALSE_POSITIVE_RATE};
use super::source::ParsedList;
use crate::domain::parent_chain;

/// Probabilistic + exact membership index over every blocked domain of the
/// enabled filter sources.
///
/// A query walks the domain and its parents; each candidate is first tested
/// against the bloom filter and only confirmed against the exact sets on a
/// possible hit. A list exception (`@@||domain^` inside a list) suppresses
/// that same list's blocks for the exception domain and its subdomains;
/// entries from other lists still apply.
#[derive(Debug)]
pub struct DomainFilterIndex {
    bloom: BloomFilter,
    /// Entries from lists that declare no exceptions.
    domains: FxHashSet<Box<str>>,
    /// Lists that declare exceptions keep their entries apart.
    scoped: Vec<ScopedList>,
    distinct: usize,
    exception_count: usize,
    fp_rate: f64,
}

#[derive(Debug)]
struct ScopedList {
    domains: FxHashSet<Box<str>>,
    exceptions: FxHashSet<Box<str>>,
}

impl ScopedList {
    fn excepts(&self, domain: &str) -> bool {
        parent_chain(domain).any(|d| self.exceptions.contains(d))
    }
}

fn lowered<S: AsRef<str>>(items: impl IntoIterator<Item = S>) -> FxHashSet<Box<str>> {
    items
        .into_iter()
        .map(|d| d.as_ref().to_ascii_lowercase().into_boxed_str())
        .collect()
}

impl DomainFilterIndex {
    /// An index that blocks nothing.
    pub fn empty() -> Self {
        Self::with_fp_rate(std::iter::empty::<&str>(), DEFAULT_FALSE_POSITIVE_RATE)
    }

    pub fn build<S: AsRef<str>>(domains: impl IntoIterator<Item = S>) -> Self {
        Self::with_fp_rate(domains, DEFAULT_FALSE_POSITIVE_RATE)
    }

    pub fn with_fp_rate<S: AsRef<str>>(domains: impl IntoIterator<Item = S>, fp_rate: f64) -> Self {
        Self::assemble(lowered(domains), Vec::new(), fp_rate)
    }

    /// A single list together with its own exceptions.
    pub fn with_exceptions<S: AsRef<str>, E: AsRef<str>>(
        domains: impl IntoIterator<Item = S>,
        exceptions: impl IntoIterator<Item = E>,
        fp_rate: f64,
    ) -> Self {
        let list = ScopedList {
            domains: lowered(domains),
            exceptions: lowered(exceptions),
        };
        if list.exceptions.is_empty() {
            return Self::assemble(list.domains, Vec::new(), fp_rate);
        }
        Self::assemble(FxHashSet::default(), vec![list], fp_rate)
    }

    /// Merge downloaded lists. Each list's exceptions only cover its own
    /// entries.
    pub fn from_lists<'a>(lists: impl IntoIterator<Item = &'a ParsedList>, fp_rate: f64) -> Self {
        let mut domains = FxHashSet::default();
        let mut scoped = Vec::new();
        for list in lists {
            if list.exceptions.is_empty() {
                domains.extend(lowered(list.blocked.iter()));
            } else {
                scoped.push(ScopedList {
                    domains: lowered(list.blocked.iter()),
                    exceptions: lowered(list.exceptions.iter()),
                });
            }
        }
        Self::assemble(domains, scoped, fp_rate)
    }

    fn assemble(domains: FxHashSet<Box<str>>, scoped: Vec<ScopedList>, fp_rate: f64) -> Self {
        let distinct = if scoped.is_empty() {
            domains.len()
        } else {
            domains
                .iter()
                .chain(scoped.iter().flat_map(|l| l.domains.iter()))
                .map(|d| &**d)
                .collect::<FxHashSet<&str>>()
                .len()
        };
        let exception_count = scoped.iter().map(|l| l.exceptions.len()).sum();

        let mut bloom = BloomFilter::with_rate(distinct, fp_rate);
        for domain in domains.iter().chain(scoped.iter().flat_map(|l| l.domains.iter())) {
            bloom.insert(domain.as_bytes());
        }

        Self {
            bloom,
            domains,
            scoped,
            distinct,
            exception_count,
            fp_rate,
        }
    }

    /// True if `domain` or one of its parents is a listed domain and no
    /// exception of the listing source covers it.
    pub fn query(&self, domain: &str) -> bool {
        self.matched_entry(domain).is_some()
    }

    /// The list entry responsible for blocking `domain`, if any.
    pub fn matched_entry(&self, domain: &str) -> Option<&str> {
        if self.distinct == 0 {
            return None;
        }
        let domain = domain.trim_end_matches('.');
        if domain.bytes().any(|b| b.is_ascii_uppercase()) {
            let lowered = domain.to_ascii_lowercase();
            return self.lookup(&lowered);
        }
        self.lookup(domain)
    }

    fn lookup(&self, domain: &str) -> Option<&str> {
        let candidates = move || {
            parent_chain(domain).filter(move |candidate| self.bloom.might_contain(candidate.as_bytes()))
        };
        if let Some(entry) = candidates().find_map(|c| self.domains.get(c)) {
            return Some(&**entry);
        }
        self.scoped
            .iter()
            .filter(|list| !list.excepts(domain))
            .find_map(|list| candidates().find_map(|c| list.domains.get(c)))
            .map(|entry| &**entry)
    }

    pub fn len(&self) -> usize {
        self.distinct
    }

    pub fn is_empty(&self) -> bool {
        self.distinct == 0
    }

    pub fn exception_count(&self) -> usize {
        self.exception_count
    }

    pub fn fp_rate(&self) -> f64 {
        self.fp_rate
    }

    pub fn bloom_size_bytes(&self) -> usize {
        self.bloom.size_bytes()
    }
}

impl Default for DomainFilterIndex {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_domain_matching() {
        let index = DomainFilterIndex::build(["ads.example.com", "b.com"]);

        assert!(index.query("ads.example.com"));
        assert!(index.query("sub.ads.example.com"));
        assert!(index.query("deep.sub.ads.example.com"));
        assert!(!index.query("badads.example.com"));
        assert!(!index.query("example.com"));

        assert!(index.query("a.b.com"));
        assert!(index.query("x.a.b.com"));
        assert!(!index.query("evilb.com"));
    }

    #[test]
    fn test_query_is_case_insensitive() {
        let index = DomainFilterIndex::build(["Tracker.Example.com"]);
        assert!(index.query("TRACKER.example.COM"));
        assert!(index.query("tracker.example.com."));
        assert_eq!(index.matched_entry("x.tracker.example.com"), Some("tracker.example.com"));
    }

    #[test]
    fn test_empty_index_blocks_nothing() {
        let index = DomainFilterIndex::empty();
        assert!(index.is_empty());
        assert!(!index.query("ads.example.com"));
        assert!(!index.query(""));
    }

    #[test]
    fn test_exceptions_override_list_entries() {
        let index = DomainFilterIndex::with_exceptions(
            ["example.com"],
            ["cdn.example.com"],
            0.01,
        );
        assert!(index.query("ads.example.com"));
        assert!(!index.query("cdn.example.com"));
        assert!(!index.query("img.cdn.example.com"));
        assert_eq!(index.exception_count(), 1);
    }

    #[test]
    fn test_exception_only_covers_its_own_list() {
        let ads = ParsedList::from_text("ads.example.com\ncdn.example.com\n");
        let abp = ParsedList::from_text("||tracker.example.com^\n@@||example.com^\n");
        let index = DomainFilterIndex::from_lists([&ads, &abp], 0.01);

        // The other list's entries are untouched by the exception.
        assert!(index.query("ads.example.com"));
        assert!(index.query("img.cdn.example.com"));
        // The declaring list's own entry is suppressed.
        assert!(!index.query("tracker.example.com"));
        assert_eq!(index.len(), 3);
        assert_eq!(index.exception_count(), 1);
    }

    #[test]
    fn test_overlapping_lists_count_distinct_domains() {
        let a = ParsedList::from_text("a.com\nb.com\n");
        let b = ParsedList::from_text("b.com\n@@||ok.b.com^\n");
        let index = DomainFilterIndex::from_lists([&a, &b], 0.01);
        assert_eq!(index.len(), 2);
        // List a has no exception for ok.b.com.
        assert!(index.query("ok.b.com"));
    }

    #[test]
    fn test_large_index_has_no_false_negatives() {
        let domains: Vec<String> = (0..50_000).map(|i| format!("t{}.ads.net", i)).collect();
        let index = DomainFilterIndex::with_fp_rate(&domains, 0.001);
        assert_eq!(index.len(), 50_000);
        assert!(domains.iter().all(|d| index.query(d)));
        assert!(!index.query("t50001.ads.net"));
        assert!(!index.query("ads.net"));
    }
}
