//! The cached, retrying page fetcher.

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use indexmap::IndexMap;
use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, HeaderValue, REFERER, USER_AGENT};
use reqwest::{Client, Proxy};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::cache::ResponseCache;
use crate::error::{is_transient, FetchError};
use crate::facts::{decompose, LinkFacts, LinkParser};
use crate::resolver::Resolver;
use crate::response::CachedResponse;
use crate::store::{MemoryStore, Store};

// Default configuration constants.
const CACHE_DIR: &str = "./data/.cached_webpages/";
const TIMEOUT_SECONDS: u64 = 3;
const MAX_CONCURRENT_REQUESTS: usize = 16;
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
];
const PROBE_URLS: &[&str] = &["https://www.google.com", "https://www.bing.com"];

/// Configuration parameters for the `Fetcher`.
struct FetcherConfig {
    user_agents: Vec<String>,
    cache_dir: PathBuf,
    timeout: Duration,
    process_id: String,
    max_concurrent_requests: usize,
    probe_urls: Vec<String>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agents: USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
            cache_dir: PathBuf::from(CACHE_DIR),
            timeout: Duration::from_secs(TIMEOUT_SECONDS),
            process_id: std::process::id().to_string(),
            max_concurrent_requests: MAX_CONCURRENT_REQUESTS,
            probe_urls: PROBE_URLS.iter().map(|url| url.to_string()).collect(),
        }
    }
}

/// Builder pattern for `Fetcher`.
pub struct FetcherBuilder {
    config: FetcherConfig,
    parser: Option<LinkParser>,
    page_index: Option<Arc<dyn Store<String>>>,
}

impl Default for FetcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FetcherBuilder {
    pub fn new() -> Self {
        FetcherBuilder {
            config: FetcherConfig::default(),
            parser: None,
            page_index: None,
        }
    }

    /// Pool the `User-Agent` of each request is drawn from.
    pub fn with_user_agents<I, S>(mut self, user_agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.user_agents = user_agents.into_iter().map(Into::into).collect();
        self
    }

    /// Directory cached pages are written to. Created on first write.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    /// Default bound on a single HTTP call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Prefix for cache file names. Processes sharing a cache directory need distinct ids.
    pub fn with_process_id(mut self, process_id: impl Into<String>) -> Self {
        self.config.process_id = process_id.into();
        self
    }

    /// Limit for concurrent requests in [`Fetcher::fetch_all`].
    pub fn with_max_concurrent_requests(mut self, requests: usize) -> Self {
        self.config.max_concurrent_requests = requests;
        self
    }

    /// URLs tried by [`Fetcher::is_online`].
    pub fn with_probe_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.probe_urls = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Share a parser (and its link-facts cache) with other components.
    pub fn with_parser(mut self, parser: LinkParser) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn with_link_cache(self, cache: Arc<dyn Store<LinkFacts>>) -> Self {
        self.with_parser(LinkParser::with_cache(cache))
    }

    /// Store holding the URL -> cache file index.
    pub fn with_page_index(mut self, index: Arc<dyn Store<String>>) -> Self {
        self.page_index = Some(index);
        self
    }

    /// Consumes the builder and returns a configured `Fetcher` instance.
    pub fn build(self) -> Result<Fetcher> {
        if self.config.user_agents.is_empty() {
            bail!("User agent pool is empty.");
        }
        if self.config.max_concurrent_requests == 0 {
            bail!("Concurrency limit must be at least 1.");
        }

        let parser = self.parser.unwrap_or_default();
        let index = self
            .page_index
            .unwrap_or_else(|| Arc::new(MemoryStore::<String>::new()));
        let cache = ResponseCache::with_index(
            self.config.cache_dir.clone(),
            self.config.process_id.clone(),
            index,
        );

        Fetcher::from_parts(self.config, Resolver::new(parser), cache)
    }
}

/// What to do once the single retry has also failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnFailure {
    /// Give back `None` for error statuses and transient errors alike.
    #[default]
    ReturnNone,
    /// Give back the error-status response; `None` after transient errors.
    ReturnFalsy,
    /// Give back the error-status response; return transient errors as `Err`.
    Raise,
    /// Give back `None` for error statuses; return transient errors as `Err`.
    NoneOrRaise,
}

impl OnFailure {
    /// Maps the `return_none` / `raise_error` flag pair onto a policy.
    /// `return_none` governs error statuses, `raise_error` transient errors.
    pub fn from_flags(return_none: bool, raise_error: bool) -> Self {
        match (return_none, raise_error) {
            (true, false) => Self::ReturnNone,
            (false, true) => Self::Raise,
            (false, false) => Self::ReturnFalsy,
            (true, true) => Self::NoneOrRaise,
        }
    }
}

/// Per-call knobs for [`Fetcher::fetch`].
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// `Referer` to send; defaults to the homepage of the fetched URL.
    pub referer: Option<String>,
    /// Replaces the randomly drawn header set.
    pub headers: Option<HeaderMap>,
    pub proxy: Option<String>,
    /// Overrides the fetcher's default timeout.
    pub timeout: Option<Duration>,
    /// Serve from the page cache when the URL is there.
    pub use_cache: bool,
    /// Store usable responses in the page cache.
    pub write_to_cache: bool,
    /// Client to send through instead of the fetcher's own.
    pub session: Option<Client>,
    pub on_failure: OnFailure,
}

impl FetchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn write_to_cache(mut self, write_to_cache: bool) -> Self {
        self.write_to_cache = write_to_cache;
        self
    }

    pub fn session(mut self, session: Client) -> Self {
        self.session = Some(session);
        self
    }

    pub fn on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = on_failure;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    Retry,
}

/// A download with optional fallback mirrors.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Primary link first, then mirrors, tried in order.
    pub links: Vec<String>,
    pub destination_dir: PathBuf,
    pub filename: String,
    /// Replace a file that already exists instead of keeping it.
    pub overwrite: bool,
    /// Count an existing older file as success when every link fails.
    pub allow_stale_on_failure: bool,
}

impl DownloadRequest {
    pub fn new(
        link: impl Into<String>,
        destination_dir: impl Into<PathBuf>,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            links: vec![link.into()],
            destination_dir: destination_dir.into(),
            filename: filename.into(),
            overwrite: false,
            allow_stale_on_failure: true,
        }
    }

    /// Names the file after the last path segment of `link` (or its host).
    pub fn from_url(link: impl Into<String>, destination_dir: impl Into<PathBuf>) -> Result<Self> {
        let link = link.into();
        let filename = decompose(&link)
            .file_name()
            .with_context(|| format!("No file name in link {link}"))?;
        Ok(Self::new(link, destination_dir, filename))
    }

    pub fn with_mirrors<I, S>(mut self, mirrors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.links.extend(mirrors.into_iter().map(Into::into));
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn allow_stale_on_failure(mut self, allow: bool) -> Self {
        self.allow_stale_on_failure = allow;
        self
    }
}

/// How a [`DownloadRequest`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadStatus {
    /// Written from the given link.
    Downloaded {
        source: String,
    },
    /// File existed and overwriting was not requested; nothing was fetched.
    AlreadyPresent,
    /// Every link failed but an earlier copy is on disk.
    Stale,
    Failed,
}

impl DownloadStatus {
    pub fn is_success(&self) -> bool {
        !matches!(self, DownloadStatus::Failed)
    }
}

/// Fetches pages with rotating headers, one retry and an optional page cache.
pub struct Fetcher {
    config: FetcherConfig, // Configuration parameters.
    client: Client,        // Default HTTP client.
    resolver: Resolver,    // Link resolution, shares its parser for referers.
    cache: ResponseCache,  // Cached pages on disk, indexed by URL.
}

impl Fetcher {
    fn from_parts(config: FetcherConfig, resolver: Resolver, cache: ResponseCache) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(config.timeout).build()?,
            config,
            resolver,
            cache,
        })
    }

    /// Initializes a new `Fetcher` instance with the default configuration.
    pub fn new() -> Result<Self> {
        FetcherBuilder::new().build()
    }

    pub fn builder() -> FetcherBuilder {
        FetcherBuilder::new()
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn parser(&self) -> &LinkParser {
        self.resolver.parser()
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Absolute URL of `reference` found on `page_url`.
    pub fn resolve(&self, reference: &str, page_url: &str) -> String {
        self.resolver.resolve(reference, page_url, None)
    }

    /// A header set with a `User-Agent` drawn from the pool and an optional `Referer`.
    pub fn random_headers(&self, referer: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();

        if let Some(value) = self
            .config
            .user_agents
            .choose(&mut rand::thread_rng())
            .and_then(|ua| HeaderValue::from_str(ua).ok())
        {
            headers.insert(USER_AGENT, value);
        }
        if let Some(value) = referer.and_then(|referer| HeaderValue::from_str(referer).ok()) {
            headers.insert(REFERER, value);
        }

        headers
    }

    /// Fetches `url`, retrying once on an error status or a transient error.
    ///
    /// `Ok(None)` and `Ok(Some(falsy))` after the retry depend on
    /// [`FetchOptions::on_failure`]. Permanent errors are returned at once.
    #[tracing::instrument(level = "debug", skip(self, options))]
    pub async fn fetch(
        &self,
        url: &str,
        options: &FetchOptions,
    ) -> Result<Option<CachedResponse>, FetchError> {
        if options.use_cache {
            if let Some(cached) = self.cache.get(url).await {
                debug!("served from page cache");
                return Ok(Some(cached));
            }
        }

        let client = self.client_for(options)?;
        let headers = self.request_headers(url, options);
        let timeout = options.timeout.unwrap_or(self.config.timeout);

        let response = self
            .attempt(
                &client,
                url,
                &headers,
                timeout,
                options.on_failure,
                Attempt::First,
            )
            .await?;

        if let Some(page) = &response {
            if options.write_to_cache && page.is_usable() {
                if let Err(error) = self.cache.put(url, page).await {
                    warn!(%error, "could not cache page");
                }
            }
        }

        Ok(response)
    }

    /// Sends one GET and, on the first failure, exactly one more.
    #[async_recursion::async_recursion]
    async fn attempt(
        &self,
        client: &Client,
        url: &str,
        headers: &HeaderMap,
        timeout: Duration,
        on_failure: OnFailure,
        attempt: Attempt,
    ) -> Result<Option<CachedResponse>, FetchError> {
        let outcome = match client
            .get(url)
            .headers(headers.clone())
            .timeout(timeout)
            .send()
            .await
        {
            Ok(response) => CachedResponse::from_response(response).await,
            Err(error) => Err(error),
        };

        match outcome {
            Ok(page) if page.is_usable() => Ok(Some(page)),
            Ok(page) => {
                if attempt == Attempt::First {
                    debug!(status = page.status_code, "error status, retrying");
                    return self
                        .attempt(client, url, headers, timeout, on_failure, Attempt::Retry)
                        .await;
                }
                match on_failure {
                    OnFailure::ReturnNone | OnFailure::NoneOrRaise => Ok(None),
                    OnFailure::ReturnFalsy | OnFailure::Raise => Ok(Some(page)),
                }
            }
            Err(error) if is_transient(&error) => {
                if attempt == Attempt::First {
                    debug!(%error, "transient error, retrying");
                    return self
                        .attempt(client, url, headers, timeout, on_failure, Attempt::Retry)
                        .await;
                }
                match on_failure {
                    OnFailure::Raise | OnFailure::NoneOrRaise => Err(error.into()),
                    OnFailure::ReturnNone | OnFailure::ReturnFalsy => Ok(None),
                }
            }
            Err(error) => Err(error.into()),
        }
    }

    fn client_for(&self, options: &FetchOptions) -> Result<Client, FetchError> {
        if let Some(session) = &options.session {
            return Ok(session.clone());
        }

        let Some(proxy) = &options.proxy else {
            return Ok(self.client.clone());
        };

        let to_error = |source| FetchError::Proxy {
            proxy: proxy.clone(),
            source,
        };
        Client::builder()
            .timeout(self.config.timeout)
            .proxy(Proxy::all(proxy.as_str()).map_err(to_error)?)
            .build()
            .map_err(to_error)
    }

    fn request_headers(&self, url: &str, options: &FetchOptions) -> HeaderMap {
        let mut headers = options
            .headers
            .clone()
            .unwrap_or_else(|| self.random_headers(None));

        let referer = options
            .referer
            .clone()
            .or_else(|| self.parser().homepage(url));
        match referer.and_then(|referer| HeaderValue::from_str(&referer).ok()) {
            Some(value) => {
                headers.insert(REFERER, value);
            }
            None => {
                headers.remove(REFERER);
            }
        }

        headers
    }

    /// Fetches every URL concurrently, at most `max_concurrent_requests` at a time.
    /// Results come back in input order.
    pub async fn fetch_all<I, S>(
        &self,
        urls: I,
        options: &FetchOptions,
    ) -> IndexMap<String, Result<Option<CachedResponse>, FetchError>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let semaphore = Semaphore::new(self.config.max_concurrent_requests);
        let urls: Vec<String> = urls.into_iter().map(Into::into).collect();

        let semaphore = &semaphore;
        let results = join_all(urls.iter().map(|url| async move {
            let _permit = semaphore.acquire().await;
            self.fetch(url, options).await
        }))
        .await;

        urls.into_iter().zip(results).collect()
    }

    /// Whether a HEAD request to `url` comes back with a usable status.
    pub async fn is_reachable(&self, url: &str, timeout: Option<Duration>) -> bool {
        let result = self
            .client
            .head(url)
            .headers(self.random_headers(None))
            .timeout(timeout.unwrap_or(self.config.timeout))
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status();
                !(status.is_client_error() || status.is_server_error())
            }
            Err(error) => {
                debug!(url, %error, "unreachable");
                false
            }
        }
    }

    /// Whether any configured probe URL is reachable.
    pub async fn is_online(&self) -> bool {
        for url in &self.config.probe_urls {
            if self.is_reachable(url, None).await {
                return true;
            }
        }
        false
    }

    /// Downloads the first link of `request` that yields a usable response
    /// into `destination_dir/filename`.
    #[tracing::instrument(level = "debug", skip_all, fields(filename = %request.filename))]
    pub async fn link_downloader(&self, request: &DownloadRequest) -> Result<DownloadStatus> {
        let destination = request.destination_dir.join(&request.filename);
        let exists = fs::try_exists(&destination).await.unwrap_or(false);

        if !request.overwrite && exists {
            return Ok(DownloadStatus::AlreadyPresent);
        }

        // One header set for every mirror; the referer still follows each link.
        let options = FetchOptions::new()
            .headers(self.random_headers(None))
            .on_failure(OnFailure::ReturnFalsy);

        for link in &request.links {
            let page = match self.fetch(link, &options).await {
                Ok(Some(page)) if page.is_usable() => page,
                Ok(Some(page)) => {
                    warn!(link = %link, status = page.status_code, "download failed");
                    continue;
                }
                Ok(None) => {
                    warn!(link = %link, "download failed");
                    continue;
                }
                Err(error) => {
                    warn!(link = %link, %error, "download failed");
                    continue;
                }
            };

            debug!(
                link = %link,
                content_type = ?page.content_type(),
                bytes = page.content.len(),
                "downloaded"
            );
            fs::create_dir_all(&request.destination_dir)
                .await
                .with_context(|| format!("Cannot create {}", request.destination_dir.display()))?;
            fs::write(&destination, &page.content)
                .await
                .with_context(|| format!("Cannot write {}", destination.display()))?;

            return Ok(DownloadStatus::Downloaded {
                source: link.clone(),
            });
        }

        if request.allow_stale_on_failure && fs::try_exists(&destination).await.unwrap_or(false) {
            return Ok(DownloadStatus::Stale);
        }
        Ok(DownloadStatus::Failed)
    }
}
