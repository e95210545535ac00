//! Server-rendered query form and result view.
//!
//! The page is a single MiniJinja template with HTML auto-escaping. Answer
//! markdown is shown as text after the citation shim runs, with the shim's
//! links rendered as anchors; sources become a separate list.

use std::borrow::Cow;
use std::sync::LazyLock;

use eagle_common::upstream::Citation;
use minijinja::Environment;
use regex::Regex;
use serde::Serialize;

use crate::error::RelayError;
use crate::relay::AnalysisResult;

const TEMPLATE_NAME: &str = "console.html";
const TEMPLATE: &str = include_str!("../templates/console.html");

pub const ERROR_MESSAGE: &str = "An error occurred while processing your request.";

// Some answers list sources as "-: https://..." instead of a markdown link.
static MALFORMED_CITATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-: (https?://\S+)").expect("valid regex"));

// Opening half of a `[URL](URL)` link; the closing half is matched by hand.
static LINK_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(https?://[^\]\s]+)\]\(").expect("valid regex"));

/// Rewrite the `-: URL` pattern into `[URL](URL)`. Nothing else is touched.
pub fn fix_citation_links(markdown: &str) -> Cow<'_, str> {
    MALFORMED_CITATION.replace_all(markdown, "[${1}](${1})")
}

/// A run of answer text, or a link whose label and target are the same URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct AnswerSegment {
    text: String,
    href: Option<String>,
}

impl AnswerSegment {
    fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            href: None,
        }
    }

    fn link(url: &str) -> Self {
        Self {
            text: url.to_string(),
            href: Some(url.to_string()),
        }
    }
}

/// Split markdown into text and `[URL](URL)` links so the page can render
/// the links as anchors. URLs may contain parentheses.
fn answer_segments(markdown: &str) -> Vec<AnswerSegment> {
    let mut segments = Vec::new();
    let mut last = 0;
    for caps in LINK_OPEN.captures_iter(markdown) {
        let (Some(open), Some(url)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if open.start() < last {
            continue;
        }
        let closes = markdown[open.end()..]
            .strip_prefix(url.as_str())
            .is_some_and(|rest| rest.starts_with(')'));
        if !closes {
            continue;
        }
        if open.start() > last {
            segments.push(AnswerSegment::text(&markdown[last..open.start()]));
        }
        segments.push(AnswerSegment::link(url.as_str()));
        last = open.end() + url.len() + 1;
    }
    if last < markdown.len() {
        segments.push(AnswerSegment::text(&markdown[last..]));
    }
    segments
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct SourceLink {
    href: Option<String>,
    label: String,
}

impl From<&Citation> for SourceLink {
    fn from(citation: &Citation) -> Self {
        let label = citation
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(&citation.url)
            .to_string();
        // Only web links are clickable.
        let href = (citation.url.starts_with("http://") || citation.url.starts_with("https://"))
            .then(|| citation.url.clone());
        Self { href, label }
    }
}

#[derive(Debug, Default, Serialize)]
struct ConsoleView<'a> {
    query: &'a str,
    answer: Option<Vec<AnswerSegment>>,
    sources: Vec<SourceLink>,
    error: Option<&'static str>,
}

pub struct Console {
    env: Environment<'static>,
}

impl Console {
    pub fn new() -> Result<Self, minijinja::Error> {
        let mut env = Environment::new();
        env.add_template(TEMPLATE_NAME, TEMPLATE)?;
        Ok(Self { env })
    }

    pub fn render_form(&self) -> Result<String, minijinja::Error> {
        self.render(&ConsoleView::default())
    }

    /// Render the page after a submission. Errors of every kind collapse to
    /// [`ERROR_MESSAGE`].
    pub fn render_outcome(
        &self,
        query: &str,
        outcome: &Result<AnalysisResult, RelayError>,
    ) -> Result<String, minijinja::Error> {
        let view = match outcome {
            Ok(result) => ConsoleView {
                query,
                answer: Some(answer_segments(&fix_citation_links(&result.response))),
                sources: result.citations.iter().map(SourceLink::from).collect(),
                error: None,
            },
            Err(_) => ConsoleView {
                query,
                error: Some(ERROR_MESSAGE),
                ..ConsoleView::default()
            },
        };
        self.render(&view)
    }

    fn render(&self, view: &ConsoleView<'_>) -> Result<String, minijinja::Error> {
        self.env.get_template(TEMPLATE_NAME)?.render(view)
    }
}
