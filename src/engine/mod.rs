mod bloom;
mod index;
mod manager;
mod source;
mod traits;

pub use bloom::{BloomFilter, DEFAULT_FALSE_POSITIVE_RATE};
pub use index::DomainFilterIndex;
pub use manager::{FilterRepository, HttpListFetcher};
pub use source::{FilterCategory, FilterSource, ParsedList};
pub use traits::ListFetcher;
