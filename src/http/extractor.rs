//! Caller key extraction from inbound HTTP requests.

use axum::http::request::Parts;

use crate::error::{Result, ZlimitError};

/// Derives a stable caller key from a request.
///
/// Implementations only look at request metadata (headers, path, method,
/// extensions); the body is never read.
pub trait KeyExtractor: Send + Sync {
    fn extract(&self, parts: &Parts) -> Result<String>;
}

/// Builds the key by joining the values of a fixed list of headers with `-`.
///
/// Use headers that are guaranteed to be unique per client.
#[derive(Debug, Clone)]
pub struct HeaderKeyExtractor {
    headers: Vec<String>,
}

impl HeaderKeyExtractor {
    pub fn new<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

impl KeyExtractor for HeaderKeyExtractor {
    fn extract(&self, parts: &Parts) -> Result<String> {
        let mut values = Vec::with_capacity(self.headers.len());

        for name in &self.headers {
            // give up on the first header without a usable value
            let value = parts
                .headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ZlimitError::MissingKeyHeader(name.clone()))?;
            values.push(value);
        }

        Ok(values.join("-"))
    }
}
