//! `linkfetch` turns links found on web pages into absolute URLs and fetches
//! them with rotating headers, a single retry and an optional on-disk page cache.
//!
//! ```no_run
//! use linkfetch::{FetchOptions, Fetcher};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let fetcher = Fetcher::builder().with_cache_dir("./cache").build()?;
//!
//! let url = fetcher.resolve("../docs/index.html", "https://example.com/blog/post.html");
//! let options = FetchOptions::new().use_cache(true).write_to_cache(true);
//!
//! if let Some(page) = fetcher.fetch(&url, &options).await? {
//!     println!("{} -> {} bytes", page.url, page.text().len());
//! }
//! # Ok(())
//! # }
//! ```

mod cache;
mod error;
mod facts;
mod fetcher;
mod resolver;
mod response;
mod store;

pub use cache::ResponseCache;
pub use error::FetchError;
pub use facts::{decompose, LinkFacts, LinkParser};
pub use fetcher::{
    DownloadRequest, DownloadStatus, FetchOptions, Fetcher, FetcherBuilder, OnFailure,
};
pub use resolver::{reanchor, Resolver};
pub use response::CachedResponse;
pub use store::{MemoryStore, Store};
