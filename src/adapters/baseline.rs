//! Digital baseline text sources.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::core::RetryPolicy;
use crate::domain::VerseId;

#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Baseline service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Field '{field}' missing from baseline response")]
    MissingField { field: String },

    #[error("No baseline text for {0}")]
    NotFound(String),
}

impl BaselineError {
    /// Network errors and server-side statuses are retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::MissingField { .. } | Self::NotFound(_) => false,
        }
    }
}

/// Trait for baseline text providers
#[async_trait]
pub trait BaselineSource: Send + Sync {
    async fn fetch(&self, verse_id: &VerseId) -> Result<String, BaselineError>;
}

/// Fetches baseline text over HTTP with retry and backoff
pub struct HttpBaselineSource {
    url_template: String,
    text_field: String,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl HttpBaselineSource {
    pub fn new(
        url_template: impl Into<String>,
        text_field: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, BaselineError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url_template: url_template.into(),
            text_field: text_field.into(),
            retry,
            client,
        })
    }

    pub fn url_for(&self, verse_id: &VerseId) -> String {
        render_url(&self.url_template, verse_id)
    }

    async fn fetch_once(&self, url: &str) -> Result<String, BaselineError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BaselineError::Status {
                status: status.as_u16(),
                body,
            });
        }

        if self.text_field.is_empty() {
            return Ok(response.text().await?);
        }
        let json: JsonValue = response.json().await?;
        extract_text(&json, &self.text_field)
    }
}

#[async_trait]
impl BaselineSource for HttpBaselineSource {
    async fn fetch(&self, verse_id: &VerseId) -> Result<String, BaselineError> {
        let url = self.url_for(verse_id);
        let url = url.as_str();
        self.retry
            .run("baseline fetch", BaselineError::is_transient, move |_| {
                self.fetch_once(url)
            })
            .await
    }
}

/// In-memory source (manifests and tests)
#[derive(Debug, Clone, Default)]
pub struct StaticBaselineSource {
    texts: HashMap<VerseId, String>,
}

impl StaticBaselineSource {
    pub fn new(texts: impl IntoIterator<Item = (VerseId, String)>) -> Self {
        Self {
            texts: texts.into_iter().collect(),
        }
    }
}

#[async_trait]
impl BaselineSource for StaticBaselineSource {
    async fn fetch(&self, verse_id: &VerseId) -> Result<String, BaselineError> {
        self.texts
            .get(verse_id)
            .cloned()
            .ok_or_else(|| BaselineError::NotFound(verse_id.to_string()))
    }
}

/// Fill `{verse}`, `{book}`, `{chapter}` and `{number}` placeholders
pub fn render_url(template: &str, verse_id: &VerseId) -> String {
    template
        .replace("{verse}", &encode_component(&verse_id.to_string()))
        .replace("{book}", &encode_component(&verse_id.book))
        .replace("{chapter}", &verse_id.chapter.to_string())
        .replace("{number}", &verse_id.verse.to_string())
}

fn encode_component(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            ' ' => "%20".to_string(),
            ':' => "%3A".to_string(),
            c => c.to_string(),
        })
        .collect()
}

/// Walk a dotted path (`data.text`, `versions.0.text`) to a string.
/// Arrays of strings at the end of the path are joined with spaces.
pub fn extract_text(json: &JsonValue, path: &str) -> Result<String, BaselineError> {
    let missing = || BaselineError::MissingField {
        field: path.to_string(),
    };

    let mut node = json;
    for key in path.split('.').filter(|k| !k.is_empty()) {
        node = match node {
            JsonValue::Array(items) => key
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i))
                .ok_or_else(missing)?,
            JsonValue::Object(map) => map.get(key).ok_or_else(missing)?,
            _ => return Err(missing()),
        };
    }

    match node {
        JsonValue::String(s) => Ok(s.clone()),
        JsonValue::Array(items) => {
            let parts: Option<Vec<&str>> = items.iter().map(|v| v.as_str()).collect();
            parts.map(|p| p.join(" ")).ok_or_else(missing)
        }
        _ => Err(missing()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_url() {
        let verse: VerseId = "Genesis 1:3".parse().unwrap();
        assert_eq!(
            render_url("https://texts.example/api/{verse}?lang=he", &verse),
            "https://texts.example/api/Genesis%201%3A3?lang=he"
        );
        assert_eq!(
            render_url("https://texts.example/{book}/{chapter}/{number}", &verse),
            "https://texts.example/Genesis/1/3"
        );
    }

    #[test]
    fn test_extract_text_paths() {
        let body = json!({"versions": [{"text": "ויאמר אלהים"}], "he": ["יהי", "אור"]});
        assert_eq!(extract_text(&body, "versions.0.text").unwrap(), "ויאמר אלהים");
        assert_eq!(extract_text(&body, "he").unwrap(), "יהי אור");
        assert!(matches!(
            extract_text(&body, "versions.3.text"),
            Err(BaselineError::MissingField { .. })
        ));
    }

    #[tokio::test]
    async fn test_static_source() {
        let verse: VerseId = "Genesis 1:1".parse().unwrap();
        let source = StaticBaselineSource::new([(verse.clone(), "בראשית".to_string())]);
        assert_eq!(source.fetch(&verse).await.unwrap(), "בראשית");
        let other: VerseId = "Genesis 1:2".parse().unwrap();
        assert!(matches!(source.fetch(&other).await, Err(BaselineError::NotFound(_))));
    }

    #[test]
    fn test_status_transience() {
        let server = BaselineError::Status {
            status: 503,
            body: String::new(),
        };
        let client = BaselineError::Status {
            status: 404,
            body: String::new(),
        };
        assert!(server.is_transient());
        assert!(!client.is_transient());
    }
}
