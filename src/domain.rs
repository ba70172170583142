//! Domain name helpers shared by the matchers.

/// Iterate `domain` followed by each parent obtained by stripping the
/// left-most label, stopping at the bare second-level domain.
///
/// `a.b.example.com` yields `a.b.example.com`, `b.example.com`, `example.com`.
/// A single-label name yields only itself.
pub fn parent_chain(domain: &str) -> ParentChain<'_> {
    ParentChain {
        next: (!domain.is_empty()).then_some(domain),
    }
}

pub struct ParentChain<'a> {
    next: Option<&'a str>,
}

impl<'a> Iterator for ParentChain<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let current = self.next.take()?;
        if let Some(idx) = current.find('.') {
            let parent = &current[idx + 1..];
            if parent.contains('.') {
                self.next = Some(parent);
            }
        }
        Some(current)
    }
}

/// Lower-case a queried name and drop the trailing root dot.
pub fn normalize_query_name(name: &str) -> String {
    let mut name = name.trim_end_matches('.').to_string();
    name.make_ascii_lowercase();
    name
}
