//! Site parsers and the registry that routes raw pages to them.
//!
//! Each site is a declarative [`rules::ExtractionRules`] value compiled into a
//! [`rules::RuleParser`]. Parsers are registered under the site's source code
//! in a [`ContentRouter`]; adding a site means registering another parser.
//!
//! # Supported Sources
//!
//! | Source code | Module | Site |
//! |-------------|--------|------|
//! | `people_military` | [`people`] | People's Daily military channel |
//! | `gmw_military` | [`gmw`] | Guangming Online military channel |

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{IngestError, Result};
use crate::models::Article;

pub mod gmw;
pub mod people;
pub mod rules;

use rules::RuleParser;

/// Turns the HTML of one page into an [`Article`].
pub trait ArticleParser: Send + Sync {
    fn parse(&self, html: &str) -> Result<Article>;
}

/// Registry mapping source codes to parsers.
#[derive(Default)]
pub struct ContentRouter {
    parsers: HashMap<String, Arc<dyn ArticleParser>>,
}

impl fmt::Debug for ContentRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codes: Vec<&String> = self.parsers.keys().collect();
        codes.sort();
        f.debug_struct("ContentRouter").field("codes", &codes).finish()
    }
}

impl ContentRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Router with every built-in site registered.
    pub fn with_builtin_sources() -> Result<Self> {
        let mut router = Self::new();
        router.register(people::SOURCE_CODE, Arc::new(RuleParser::new(&people::RULES)?));
        router.register(gmw::SOURCE_CODE, Arc::new(RuleParser::new(&gmw::RULES)?));
        Ok(router)
    }

    /// Register `parser` for `code`, replacing any previous registration.
    pub fn register(&mut self, code: impl Into<String>, parser: Arc<dyn ArticleParser>) {
        self.parsers.insert(code.into(), parser);
    }

    pub fn supports(&self, code: &str) -> bool {
        self.parsers.contains_key(code)
    }

    /// Parse `html` with the parser registered for `code`.
    pub fn parse(&self, code: &str, html: &str) -> Result<Article> {
        let parser = self
            .parsers
            .get(code)
            .ok_or_else(|| IngestError::UnsupportedSource(code.to_string()))?;
        parser.parse(html)
    }
}
