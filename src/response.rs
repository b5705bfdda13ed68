//! Snapshot of an HTTP response that can be persisted and replayed.

use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8};
use indexmap::IndexMap;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Status, headers, body and final URL of one fetched page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status_code: u16,
    /// Header names are lowercase; repeated headers are joined with `", "`.
    pub headers: IndexMap<String, String>,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
    /// Charset declared by the server, if any.
    pub encoding: Option<String>,
    /// URL the body was served from, after redirects.
    pub url: String,
}

impl CachedResponse {
    /// Drains a live response into a snapshot.
    pub async fn from_response(response: reqwest::Response) -> Result<Self, reqwest::Error> {
        let status_code = response.status().as_u16();
        let url = response.url().to_string();

        let mut headers: IndexMap<String, String> = IndexMap::new();
        for (name, value) in response.headers() {
            let Ok(value) = value.to_str() else {
                continue;
            };
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }

        let encoding = headers
            .get(CONTENT_TYPE.as_str())
            .and_then(|content_type| content_type.parse::<mime::Mime>().ok())
            .and_then(|parsed| {
                parsed
                    .get_param(mime::CHARSET)
                    .map(|charset| charset.to_string())
            });

        let content = response.bytes().await?.to_vec();

        Ok(Self {
            status_code,
            headers,
            content,
            encoding,
            url,
        })
    }

    /// False for client and server errors (4xx, 5xx), true otherwise.
    pub fn is_usable(&self) -> bool {
        !(400..600).contains(&self.status_code)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Body decoded as text.
    ///
    /// Uses the declared charset when there is one, otherwise guesses it from
    /// byte frequencies. Unknown charsets fall back to UTF-8; undecodable
    /// bytes become U+FFFD.
    pub fn text(&self) -> String {
        if self.content.is_empty() {
            return String::new();
        }

        let encoding = match &self.encoding {
            Some(label) => Encoding::for_label(label.trim().as_bytes()).unwrap_or(UTF_8),
            None => {
                let mut detector = EncodingDetector::new();
                detector.feed(&self.content, true);
                detector.guess(None, true)
            }
        };

        let (text, _, _) = encoding.decode(&self.content);
        text.into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.text())
    }

    /// Declared content type, or the type sniffed from the body's magic bytes.
    pub fn content_type(&self) -> Option<String> {
        self.header(CONTENT_TYPE.as_str())
            .and_then(|content_type| content_type.parse::<mime::Mime>().ok())
            .map(|parsed| parsed.essence_str().to_string())
            .or_else(|| infer::get(&self.content).map(|kind| kind.mime_type().to_string()))
    }

    /// Serialized form written to the on-disk cache.
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
