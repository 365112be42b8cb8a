//! Texture group served over HTTP.

use std::time::Duration;

use reqwest::StatusCode;

use super::{BoxFuture, SourceError, TextureSource, TilePayload};
use crate::coord::NodeId;

/// Default per-request timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches tiles from a URL template.
///
/// The template may use `{group}`, `{level}`, `{x}` and `{y}`, e.g.
/// `https://tiles.example.com/{group}/{level}/{x}/{y}.png`.
pub struct HttpTextureGroup {
    client: reqwest::Client,
    template: String,
    group: String,
}

impl HttpTextureGroup {
    /// Creates a source with the default timeout.
    pub fn new(template: impl Into<String>, group: impl Into<String>) -> Result<Self, SourceError> {
        Self::with_timeout(template, group, DEFAULT_HTTP_TIMEOUT)
    }

    /// Creates a source with a custom request timeout.
    pub fn with_timeout(
        template: impl Into<String>,
        group: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Transient(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            template: template.into(),
            group: group.into(),
        })
    }

    /// Expands the URL template for `node`.
    pub fn build_url(&self, node: NodeId) -> String {
        self.template
            .replace("{group}", &self.group)
            .replace("{level}", &node.level.to_string())
            .replace("{x}", &node.x.to_string())
            .replace("{y}", &node.y.to_string())
    }
}

impl TextureSource for HttpTextureGroup {
    fn name(&self) -> &str {
        &self.group
    }

    fn fetch(&self, node: NodeId) -> BoxFuture<'_, Result<TilePayload, SourceError>> {
        let url = self.build_url(node);
        Box::pin(async move {
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| SourceError::Transient(format!("Request failed: {}", e)))?;

            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                return Err(SourceError::NotFound(node));
            }
            if !status.is_success() {
                return Err(SourceError::Transient(format!("HTTP {} from {}", status, url)));
            }

            let body = response
                .bytes()
                .await
                .map_err(|e| SourceError::Transient(format!("Failed to read response: {}", e)))?;
            Ok(TilePayload::new(body))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_construction() {
        let source =
            HttpTextureGroup::new("https://tiles.example.com/{group}/{level}/{x}/{y}.png", "sat")
                .unwrap();
        assert_eq!(
            source.build_url(NodeId::new(7, 12, 99)),
            "https://tiles.example.com/sat/7/12/99.png"
        );
        assert_eq!(source.name(), "sat");
    }

    #[test]
    fn test_template_without_group() {
        let source = HttpTextureGroup::new("http://localhost/{level}-{x}-{y}", "ignored").unwrap();
        assert_eq!(source.build_url(NodeId::new(0, 1, 0)), "http://localhost/0-1-0");
    }
}
