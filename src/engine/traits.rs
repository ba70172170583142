use super::source::ParsedList;

/// Downloads and parses one remote list.
///
/// The "Control Plane" seam: the repository never talks to the network
/// directly, so tests can hand it canned list content.
#[async_trait::async_trait]
pub trait ListFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<ParsedList>;
}
