//! Ordered, first-success-wins extraction rules.
//!
//! Each field has a list of candidate selectors tried in order:
//!
//! - **Title**: the first selector whose first match has non-empty text.
//! - **Body**: the first container selector that yields anything. Inside it,
//!   non-empty `<p>` texts joined with `\n` are preferred; the container's
//!   flattened text is used only when it has no paragraphs.
//! - **Publish time**: the first selector whose first match has non-empty text,
//!   parsed against the layouts in order. When no layout matches the publish
//!   time stays absent and later selectors are not consulted, unless the
//!   rules set `time_fallthrough`: then each selector's text is tried in turn
//!   until one parses.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use scraper::{ElementRef, Html, Selector};

use crate::error::{IngestError, Result};
use crate::models::Article;
use crate::scrapers::ArticleParser;

/// Declarative rule set for one site.
#[derive(Debug, Clone)]
pub struct ExtractionRules {
    /// Title selectors, most specific first.
    pub title: &'static [&'static str],
    /// Body container selectors, most specific first.
    pub body: &'static [&'static str],
    /// Publish time selectors, most specific first.
    pub publish_time: &'static [&'static str],
    /// `chrono` layouts tried against the publish time text, most specific first.
    pub time_layouts: &'static [&'static str],
    /// Offset of the site's local time from UTC, in seconds.
    pub utc_offset_secs: i32,
    /// Keep trying later publish time selectors when a non-empty match does
    /// not parse.
    pub time_fallthrough: bool,
}

/// An [`ArticleParser`] driven by compiled [`ExtractionRules`].
#[derive(Debug)]
pub struct RuleParser {
    title: Vec<Selector>,
    body: Vec<Selector>,
    publish_time: Vec<Selector>,
    paragraph: Selector,
    time_layouts: Vec<&'static str>,
    offset: FixedOffset,
    time_fallthrough: bool,
}

fn compile(selectors: &[&str]) -> Result<Vec<Selector>> {
    selectors
        .iter()
        .map(|s| {
            Selector::parse(s).map_err(|e| IngestError::Selector {
                selector: s.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Text of the first element matching any selector, trying selectors in order.
fn first_text(document: &Html, selectors: &[Selector]) -> Option<String> {
    selectors.iter().find_map(|selector| {
        document
            .select(selector)
            .next()
            .map(element_text)
            .filter(|text| !text.is_empty())
    })
}

impl RuleParser {
    pub fn new(rules: &ExtractionRules) -> Result<Self> {
        let offset = FixedOffset::east_opt(rules.utc_offset_secs).ok_or_else(|| {
            IngestError::InvalidRequest(format!("utc offset {} out of range", rules.utc_offset_secs))
        })?;
        Ok(Self {
            title: compile(rules.title)?,
            body: compile(rules.body)?,
            publish_time: compile(rules.publish_time)?,
            paragraph: compile(&["p"])?.remove(0),
            time_layouts: rules.time_layouts.to_vec(),
            offset,
            time_fallthrough: rules.time_fallthrough,
        })
    }

    fn extract_body(&self, document: &Html) -> String {
        for container in &self.body {
            let matches: Vec<ElementRef<'_>> = document.select(container).collect();
            if matches.is_empty() {
                continue;
            }

            let paragraphs: Vec<String> = matches
                .iter()
                .flat_map(|m| m.select(&self.paragraph))
                .map(element_text)
                .filter(|text| !text.is_empty())
                .collect();
            if !paragraphs.is_empty() {
                return paragraphs.join("\n");
            }

            let flattened = matches
                .iter()
                .flat_map(|m| m.text())
                .collect::<String>()
                .trim()
                .to_string();
            if !flattened.is_empty() {
                return flattened;
            }
        }
        String::new()
    }

    fn extract_publish_time(&self, document: &Html) -> Option<DateTime<Utc>> {
        if !self.time_fallthrough {
            return first_text(document, &self.publish_time)
                .and_then(|text| self.parse_publish_time(&text));
        }
        self.publish_time.iter().find_map(|selector| {
            document
                .select(selector)
                .next()
                .map(element_text)
                .filter(|text| !text.is_empty())
                .and_then(|text| self.parse_publish_time(&text))
        })
    }

    /// Parse `text` with the first layout that accepts it, in the site's offset.
    pub fn parse_publish_time(&self, text: &str) -> Option<DateTime<Utc>> {
        self.time_layouts.iter().find_map(|layout| {
            let naive = NaiveDateTime::parse_from_str(text, layout)
                .ok()
                .or_else(|| {
                    NaiveDate::parse_from_str(text, layout)
                        .ok()
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                })?;
            self.offset
                .from_local_datetime(&naive)
                .single()
                .map(|t| t.with_timezone(&Utc))
        })
    }
}

impl ArticleParser for RuleParser {
    fn parse(&self, html: &str) -> Result<Article> {
        let document = Html::parse_document(html);

        let title = first_text(&document, &self.title).unwrap_or_default();
        let content = self.extract_body(&document);
        let publish_time = self.extract_publish_time(&document);

        Ok(Article {
            title,
            content,
            publish_time,
        })
    }
}
