//! Data sources for address balance lookups.
//!
//! Every source sits behind [`BalanceSource`] so the page-layout specific parsing of
//! one explorer cannot leak into the rest of the pipeline.

use crate::oracle::types::{ExtractionRule, LookupError, SourceConfig};
use crate::types::LookupResult;
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, instrument};

/// Upper bound on how much text after the label is scanned.
const MAX_SCAN_CHARS: usize = 4096;

/// Formal contract for one external balance source.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    /// Name reported in findings and logs.
    fn name(&self) -> &str;

    /// Query the source for one address.
    async fn fetch(&self, address: &str) -> Result<LookupResult, LookupError>;
}

/// Block explorer address page scraped over HTTP.
pub struct ExplorerSource {
    config: SourceConfig,
    http_client: Client,
}

impl ExplorerSource {
    pub fn new(config: SourceConfig, http_client: Client) -> Self {
        Self {
            config,
            http_client,
        }
    }
}

#[async_trait]
impl BalanceSource for ExplorerSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    #[instrument(skip(self), fields(source = %self.config.name))]
    async fn fetch(&self, address: &str) -> Result<LookupResult, LookupError> {
        let url = self.config.url_for(address);
        let response = self.http_client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(LookupError::Status(response.status().as_u16()));
        }

        let body = response.text().await?;
        let amount = extract_value(&body, &self.config.rule).ok_or(LookupError::Extraction)?;

        debug!("Extracted amount {:?}", amount);
        Ok(LookupResult::from_amount(&amount))
    }
}

/// Apply an extraction rule to a page body.
pub fn extract_value(body: &str, rule: &ExtractionRule) -> Option<String> {
    let anchored = &body[body.find(&rule.anchor)?..];
    let label_at = anchored.find(&rule.label)?;
    let after = &anchored[label_at + rule.label.len()..];

    let end = after
        .char_indices()
        .nth(MAX_SCAN_CHARS)
        .map(|(i, _)| i)
        .unwrap_or(after.len());

    strip_tags(&after[..end])
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .nth(rule.line_offset)
        .map(str::to_string)
}

/// Replace every markup tag with a line break and decode the entities explorers use
/// around amounts.
fn strip_tags(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;

    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                text.push('\n');
            }
            '>' if in_tag => in_tag = false,
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }

    text.replace("&nbsp;", " ")
        .replace("&#36;", "$")
        .replace("&amp;", "&")
}
