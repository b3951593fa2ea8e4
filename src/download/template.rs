//! Output filename templates.
//!
//! Templates use `{{ key }}` placeholders and are compiled when the
//! config is loaded, so a bad template never reaches a download.
//!
//! ```
//! use bankdownloader::download::{FilenameTemplate, TemplateContext};
//! use bankdownloader::schedule::DateWindow;
//! use chrono::NaiveDate;
//!
//! let template = FilenameTemplate::parse("{{source}}/{{account-slug}}-{{from}}.csv").unwrap();
//! let window = DateWindow::new(
//!     NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
//!     NaiveDate::from_ymd_opt(2020, 1, 31).unwrap(),
//! );
//! let ctx = TemplateContext::new("anz", "My Account", "123", window);
//! assert_eq!(template.render(&ctx), "anz/my-account-2020-01-01.csv");
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, SecondsFormat};

use crate::schedule::DateWindow;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("filename template is empty")]
    Empty,

    #[error("unclosed placeholder at offset {offset} in template {template:?}")]
    Unclosed { template: String, offset: usize },

    #[error("unknown placeholder {key:?} in template {template:?} (known: {known})")]
    UnknownPlaceholder {
        template: String,
        key: String,
        known: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKey {
    Source,
    SourceSlug,
    Account,
    AccountSlug,
    Number,
    NumberSlug,
    From,
    FromSlug,
    FromUnix,
    To,
    ToSlug,
    ToUnix,
}

impl TemplateKey {
    pub const ALL: [TemplateKey; 12] = [
        TemplateKey::Source,
        TemplateKey::SourceSlug,
        TemplateKey::Account,
        TemplateKey::AccountSlug,
        TemplateKey::Number,
        TemplateKey::NumberSlug,
        TemplateKey::From,
        TemplateKey::FromSlug,
        TemplateKey::FromUnix,
        TemplateKey::To,
        TemplateKey::ToSlug,
        TemplateKey::ToUnix,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TemplateKey::Source => "source",
            TemplateKey::SourceSlug => "source-slug",
            TemplateKey::Account => "account",
            TemplateKey::AccountSlug => "account-slug",
            TemplateKey::Number => "number",
            TemplateKey::NumberSlug => "number-slug",
            TemplateKey::From => "from",
            TemplateKey::FromSlug => "from-slug",
            TemplateKey::FromUnix => "from-unix",
            TemplateKey::To => "to",
            TemplateKey::ToSlug => "to-slug",
            TemplateKey::ToUnix => "to-unix",
        }
    }
}

impl FromStr for TemplateKey {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TemplateKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or(())
    }
}

impl fmt::Display for TemplateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Key(TemplateKey),
}

/// A compiled filename template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl FilenameTemplate {
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        if template.trim().is_empty() {
            return Err(TemplateError::Empty);
        }

        let mut segments = Vec::new();
        let mut rest = template;
        let mut offset = 0;

        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after_open = &rest[open + 2..];
            let Some(close) = after_open.find("}}") else {
                return Err(TemplateError::Unclosed {
                    template: template.to_string(),
                    offset: offset + open,
                });
            };

            let name = after_open[..close].trim();
            let key = name
                .parse::<TemplateKey>()
                .map_err(|_| TemplateError::UnknownPlaceholder {
                    template: template.to_string(),
                    key: name.to_string(),
                    known: TemplateKey::ALL.map(TemplateKey::as_str).join(", "),
                })?;
            segments.push(Segment::Key(key));

            let consumed = open + 2 + close + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    /// The template text as configured.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn keys(&self) -> impl Iterator<Item = TemplateKey> + '_ {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Key(key) => Some(*key),
            Segment::Literal(_) => None,
        })
    }

    pub fn render(&self, ctx: &TemplateContext) -> String {
        let mut out = String::with_capacity(self.source.len() + 32);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Key(key) => out.push_str(&ctx.value(*key)),
            }
        }
        out
    }
}

impl FromStr for FilenameTemplate {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FilenameTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Values available to a [`FilenameTemplate`].
///
/// Dates are calendar days. Their slug and UNIX forms use midnight UTC so
/// that rendered names do not depend on the machine's timezone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateContext {
    pub source: String,
    pub account_name: String,
    pub account_number: String,
    pub window: DateWindow,
}

impl TemplateContext {
    pub fn new(
        source: impl Into<String>,
        account_name: impl Into<String>,
        account_number: impl Into<String>,
        window: DateWindow,
    ) -> Self {
        Self {
            source: source.into(),
            account_name: account_name.into(),
            account_number: account_number.into(),
            window,
        }
    }

    pub fn value(&self, key: TemplateKey) -> String {
        match key {
            TemplateKey::Source => self.source.clone(),
            TemplateKey::SourceSlug => slugify(&self.source),
            TemplateKey::Account => self.account_name.clone(),
            TemplateKey::AccountSlug => slugify(&self.account_name),
            TemplateKey::Number => self.account_number.clone(),
            TemplateKey::NumberSlug => slugify(&self.account_number),
            TemplateKey::From => raw_date(self.window.from),
            TemplateKey::FromSlug => slug_date(self.window.from),
            TemplateKey::FromUnix => unix_date(self.window.from).to_string(),
            TemplateKey::To => raw_date(self.window.to),
            TemplateKey::ToSlug => slug_date(self.window.to),
            TemplateKey::ToUnix => unix_date(self.window.to).to_string(),
        }
    }
}

fn raw_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn slug_date(date: NaiveDate) -> String {
    slugify(
        &date
            .and_time(chrono::NaiveTime::MIN)
            .and_utc()
            .to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

fn unix_date(date: NaiveDate) -> i64 {
    date.and_time(chrono::NaiveTime::MIN).and_utc().timestamp()
}

/// Lowercase ASCII alphanumerics separated by single dashes.
///
/// Non-ASCII text is transliterated first, so "Café" becomes "cafe".
pub fn slugify(value: &str) -> String {
    let ascii = deunicode::deunicode(value);
    let mut out = String::with_capacity(ascii.len());
    let mut pending_dash = false;
    for ch in ascii.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}
