//! On-disk store of response snapshots, indexed in memory by URL.
//!
//! Each snapshot lives in its own file named `<process-id>-<random-id>`, so
//! several processes can share one directory and each can purge only what
//! it wrote. Entries never expire; they go away through [`ResponseCache::remove`],
//! [`ResponseCache::purge`] or [`ResponseCache::clear`].

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::FetchError;
use crate::response::CachedResponse;
use crate::store::{MemoryStore, Store};

pub struct ResponseCache {
    dir: PathBuf,
    process_id: String,
    index: Arc<dyn Store<String>>, // URL -> file id.
}

impl ResponseCache {
    pub fn new(dir: impl Into<PathBuf>, process_id: impl Into<String>) -> Self {
        Self::with_index(dir, process_id, Arc::new(MemoryStore::<String>::new()))
    }

    pub fn with_index(
        dir: impl Into<PathBuf>,
        process_id: impl Into<String>,
        index: Arc<dyn Store<String>>,
    ) -> Self {
        Self {
            dir: dir.into(),
            process_id: process_id.into(),
            index,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn contains(&self, url: &str) -> bool {
        self.index.get(url).is_some()
    }

    fn file_prefix(&self) -> String {
        format!("{}-", self.process_id)
    }

    /// Snapshot stored for `url`. A missing, unreadable or corrupt file is a miss.
    pub async fn get(&self, url: &str) -> Option<CachedResponse> {
        let file_id = self.index.get(url)?;

        let bytes = match fs::read(self.dir.join(&file_id)).await {
            Ok(bytes) => bytes,
            Err(error) => {
                debug!(url, file_id = %file_id, %error, "cached page unreadable");
                return None;
            }
        };

        match CachedResponse::from_bytes(&bytes) {
            Ok(response) => Some(response),
            Err(error) => {
                debug!(url, file_id = %file_id, %error, "cached page corrupt");
                None
            }
        }
    }

    /// Writes `response` to a new file and points `url` at it. Returns the file id.
    pub async fn put(&self, url: &str, response: &CachedResponse) -> Result<String, FetchError> {
        fs::create_dir_all(&self.dir).await?;

        let file_id = format!("{}{}", self.file_prefix(), Uuid::new_v4().simple());
        fs::write(self.dir.join(&file_id), response.to_bytes()?).await?;

        if let Some(previous) = self.index.replace(url.to_string(), file_id.clone()) {
            remove_quietly(&self.dir.join(previous)).await;
        }

        debug!(url, file_id = %file_id, "cached page");
        Ok(file_id)
    }

    /// Forgets `url` and deletes its file. Returns whether an entry existed.
    pub async fn remove(&self, url: &str) -> Result<bool, FetchError> {
        let Some(file_id) = self.index.remove(url) else {
            return Ok(false);
        };

        match fs::remove_file(self.dir.join(file_id)).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(true),
            Err(error) => Err(error.into()),
        }
    }

    /// Deletes every file written under this process id. Returns how many went.
    pub async fn purge(&self) -> Result<usize, FetchError> {
        let prefix = self.file_prefix();
        self.remove_files(|name| name.starts_with(&prefix)).await
    }

    /// Purges this process's files and forgets the whole index.
    pub async fn clear(&self) -> Result<(), FetchError> {
        self.purge().await?;
        self.index.clear();
        Ok(())
    }

    /// Deletes every file in the cache directory, whichever process wrote it.
    pub async fn clear_dir(&self) -> Result<usize, FetchError> {
        self.remove_files(|_| true).await
    }

    async fn remove_files(&self, matches: impl Fn(&str) -> bool) -> Result<usize, FetchError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(0),
            Err(error) => return Err(error.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if !name.to_str().is_some_and(&matches) {
                continue;
            }
            if remove_quietly(&entry.path()).await {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

async fn remove_quietly(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(()) => true,
        Err(error) => {
            warn!(path = %path.display(), %error, "could not remove cached page");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use tempfile::TempDir;

    fn page(body: &str) -> CachedResponse {
        CachedResponse {
            status_code: 200,
            headers: IndexMap::from([("content-type".to_string(), "text/plain".to_string())]),
            content: body.as_bytes().to_vec(),
            encoding: None,
            url: "https://example.com/".to_string(),
        }
    }

    fn file_count(dir: &Path) -> usize {
        std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
    }

    #[tokio::test]
    async fn put_then_get() {
        let tmp = TempDir::new().unwrap();
        let cache = ResponseCache::new(tmp.path().join("pages"), "4242");

        let file_id = cache.put("https://example.com/", &page("hello")).await.unwrap();

        assert!(file_id.starts_with("4242-"));
        assert!(cache.contains("https://example.com/"));
        assert_eq!(cache.get("https://example.com/").await, Some(page("hello")));
        assert_eq!(cache.get("https://example.com/other").await, None);
    }

    #[tokio::test]
    async fn overwriting_replaces_the_old_file() {
        let tmp = TempDir::new().unwrap();
        let cache = ResponseCache::new(tmp.path(), "1");

        cache.put("https://example.com/", &page("old")).await.unwrap();
        cache.put("https://example.com/", &page("new")).await.unwrap();

        assert_eq!(file_count(tmp.path()), 1);
        assert_eq!(cache.get("https://example.com/").await, Some(page("new")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_overwrites_leave_one_file() {
        let tmp = TempDir::new().unwrap();
        let cache = ResponseCache::new(tmp.path(), "1");

        let writes = (0..16).map(|i| {
            let cache = &cache;
            async move {
                cache
                    .put("https://example.com/", &page(&format!("v{i}")))
                    .await
            }
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap();
        }

        assert_eq!(file_count(tmp.path()), 1);
        assert!(cache.get("https://example.com/").await.is_some());
    }

    #[tokio::test]
    async fn missing_or_corrupt_file_is_a_miss() {
        let tmp = TempDir::new().unwrap();
        let cache = ResponseCache::new(tmp.path(), "1");

        let gone = cache.put("https://example.com/gone", &page("x")).await.unwrap();
        std::fs::remove_file(tmp.path().join(gone)).unwrap();
        assert_eq!(cache.get("https://example.com/gone").await, None);

        let broken = cache.put("https://example.com/broken", &page("x")).await.unwrap();
        std::fs::write(tmp.path().join(broken), b"{not json").unwrap();
        assert_eq!(cache.get("https://example.com/broken").await, None);
    }

    #[tokio::test]
    async fn remove_single_entry() {
        let tmp = TempDir::new().unwrap();
        let cache = ResponseCache::new(tmp.path(), "1");

        cache.put("https://example.com/a", &page("a")).await.unwrap();
        cache.put("https://example.com/b", &page("b")).await.unwrap();

        assert!(cache.remove("https://example.com/a").await.unwrap());
        assert!(!cache.remove("https://example.com/a").await.unwrap());
        assert_eq!(cache.get("https://example.com/a").await, None);
        assert_eq!(cache.get("https://example.com/b").await, Some(page("b")));
        assert_eq!(file_count(tmp.path()), 1);
    }

    #[tokio::test]
    async fn purge_only_touches_own_files() {
        let tmp = TempDir::new().unwrap();
        let mine = ResponseCache::new(tmp.path(), "7");
        let theirs = ResponseCache::new(tmp.path(), "77");

        mine.put("https://example.com/a", &page("a")).await.unwrap();
        mine.put("https://example.com/b", &page("b")).await.unwrap();
        theirs.put("https://example.com/a", &page("a")).await.unwrap();

        assert_eq!(mine.purge().await.unwrap(), 2);
        assert_eq!(mine.get("https://example.com/a").await, None);
        assert_eq!(theirs.get("https://example.com/a").await, Some(page("a")));

        assert_eq!(theirs.clear_dir().await.unwrap(), 1);
        assert_eq!(file_count(tmp.path()), 0);
    }

    #[tokio::test]
    async fn clear_forgets_index() {
        let tmp = TempDir::new().unwrap();
        let cache = ResponseCache::new(tmp.path(), "1");

        cache.put("https://example.com/a", &page("a")).await.unwrap();
        cache.clear().await.unwrap();

        assert!(!cache.contains("https://example.com/a"));
        assert_eq!(file_count(tmp.path()), 0);
    }

    #[tokio::test]
    async fn purge_without_directory() {
        let tmp = TempDir::new().unwrap();
        let cache = ResponseCache::new(tmp.path().join("never-created"), "1");
        assert_eq!(cache.purge().await.unwrap(), 0);
    }
}
