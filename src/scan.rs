use crate::materialize::is_data_url;
use log::trace;
use regex::{Captures, Regex};
use std::sync::LazyLock;

/// `![alt](path){: width=W height=H}`, attributes in any order, either optional
static MARKDOWN_QUALIFIED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"!\[([^\]]*)\]\(\s*([^)\s][^)\n]*?)(?:\s+"[^"]*")?\s*\)\s*\{:([^}\n]*)\}"#,
    )
    .expect("valid markdown qualified regex")
});

/// `![alt](path =WxH)`, either number optional
static MARKDOWN_DIMENSIONS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"!\[([^\]]*)\]\(\s*([^)\s][^)\n]*?)\s*=\s*(\d*)x(\d*)\s*\)")
        .expect("valid markdown dimensions regex")
});

/// `![alt](path)`, with an optional `"title"` that is not part of the path
static MARKDOWN_BARE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"!\[([^\]]*)\]\(\s*([^)\s][^)\n]*?)(?:\s+"[^"]*")?\s*\)"#)
        .expect("valid markdown bare regex")
});

static HTML_IMG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<img\b[^>]*>").expect("valid img tag regex"));

static HTML_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)([a-z][a-z0-9_:-]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .expect("valid attribute regex")
});

/// Which surface syntax a reference was written in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Markdown,
    Html,
}

/// One image mention found in a document, not yet materialized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Original text of the whole match, restored verbatim on failure
    pub raw: String,
    pub alt: String,
    /// Relative path or absolute URL
    pub locator: String,
    /// Byte offsets into the document, half-open
    pub start: usize,
    pub end: usize,
    /// Requested size, 0 when unspecified
    pub width: u32,
    pub height: u32,
    pub kind: SourceKind,
}

/// Grammars in registration order. Earlier entries win any overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grammar {
    MarkdownQualified,
    MarkdownDimensions,
    MarkdownBare,
    HtmlSized,
    HtmlPlain,
}

const GRAMMARS: [Grammar; 5] = [
    Grammar::MarkdownQualified,
    Grammar::MarkdownDimensions,
    Grammar::MarkdownBare,
    Grammar::HtmlSized,
    Grammar::HtmlPlain,
];

/// Byte ranges already taken by an accepted reference
#[derive(Debug, Default)]
struct Claims(Vec<(usize, usize)>);

impl Claims {
    fn try_claim(&mut self, start: usize, end: usize) -> bool {
        if self.0.iter().any(|&(s, e)| start < e && s < end) {
            return false;
        }
        self.0.push((start, end));
        true
    }
}

/// Find every image reference in `document`, ordered by position with no
/// two spans overlapping.
pub fn scan(document: &str) -> Vec<ImageReference> {
    let mut claims = Claims::default();
    let mut refs = Vec::new();

    for grammar in GRAMMARS {
        for candidate in candidates(grammar, document) {
            if is_data_url(&candidate.locator) {
                trace!("Skipping data URL at {}", candidate.start);
                continue;
            }
            if !claims.try_claim(candidate.start, candidate.end) {
                trace!(
                    "Dropping {:?} match at {}..{} (span already claimed)",
                    grammar, candidate.start, candidate.end
                );
                continue;
            }
            trace!(
                "Found {:?} reference {:?} at {}..{} ({}x{})",
                grammar,
                candidate.locator,
                candidate.start,
                candidate.end,
                candidate.width,
                candidate.height
            );
            refs.push(candidate);
        }
    }

    refs.sort_by_key(|r| r.start);
    refs
}

fn candidates(grammar: Grammar, document: &str) -> Vec<ImageReference> {
    match grammar {
        Grammar::MarkdownQualified => MARKDOWN_QUALIFIED
            .captures_iter(document)
            .filter_map(|c| {
                let (width, height) = size_attributes(c.get(3).map_or("", |m| m.as_str()));
                markdown_reference(&c, width, height)
            })
            .collect(),
        Grammar::MarkdownDimensions => MARKDOWN_DIMENSIONS
            .captures_iter(document)
            .filter(|c| (3..=4).any(|i| c.get(i).is_some_and(|m| !m.as_str().is_empty())))
            .filter_map(|c| {
                let group = |i: usize| c.get(i).map(|m| m.as_str());
                markdown_reference(&c, group(3), group(4))
            })
            .collect(),
        Grammar::MarkdownBare => MARKDOWN_BARE
            .captures_iter(document)
            .filter(|c| {
                // A `{:` that never closes still belongs to a qualified reference
                let end = c.get(0).map_or(0, |m| m.end());
                !document[end..].trim_start().starts_with("{:")
            })
            .filter_map(|c| markdown_reference(&c, None, None))
            .collect(),
        Grammar::HtmlSized => html_references(document, true),
        Grammar::HtmlPlain => html_references(document, false),
    }
}

fn markdown_reference(
    caps: &Captures,
    width: Option<&str>,
    height: Option<&str>,
) -> Option<ImageReference> {
    let whole = caps.get(0)?;
    let group = |i: usize| caps.get(i).map(|m| m.as_str());
    Some(ImageReference {
        raw: whole.as_str().to_string(),
        alt: group(1).unwrap_or_default().to_string(),
        locator: group(2).unwrap_or_default().trim().to_string(),
        start: whole.start(),
        end: whole.end(),
        width: parse_dimension(width),
        height: parse_dimension(height),
        kind: SourceKind::Markdown,
    })
}

/// First `width` and `height` values among `key=value` pairs, other keys ignored
fn size_attributes(attrs: &str) -> (Option<&str>, Option<&str>) {
    let mut width = None;
    let mut height = None;
    for attr in HTML_ATTR.captures_iter(attrs) {
        let value = attr
            .get(2)
            .or_else(|| attr.get(3))
            .or_else(|| attr.get(4))
            .map_or("", |m| m.as_str());
        match attr[1].to_ascii_lowercase().as_str() {
            "width" => width = width.or(Some(value)),
            "height" => height = height.or(Some(value)),
            _ => {}
        }
    }
    (width, height)
}

fn html_references(document: &str, sized: bool) -> Vec<ImageReference> {
    let mut refs = Vec::new();
    for tag in HTML_IMG.find_iter(document) {
        let mut src = None;
        let mut alt = None;
        let mut width = None;
        let mut height = None;

        // Skip the `<img` prefix so the element name is never read as an attribute
        for attr in HTML_ATTR.captures_iter(&tag.as_str()[4..]) {
            let value = attr
                .get(2)
                .or_else(|| attr.get(3))
                .or_else(|| attr.get(4))
                .map_or("", |m| m.as_str());
            match attr[1].to_ascii_lowercase().as_str() {
                "src" => src = src.or(Some(value)),
                "alt" => alt = alt.or(Some(value)),
                "width" => width = width.or(Some(value)),
                "height" => height = height.or(Some(value)),
                _ => {}
            }
        }

        let Some(src) = src.map(str::trim).filter(|s| !s.is_empty()) else {
            continue;
        };
        if sized && width.is_none() && height.is_none() {
            continue;
        }

        refs.push(ImageReference {
            raw: tag.as_str().to_string(),
            alt: alt.unwrap_or_default().to_string(),
            locator: src.to_string(),
            start: tag.start(),
            end: tag.end(),
            width: if sized { parse_dimension(width) } else { 0 },
            height: if sized { parse_dimension(height) } else { 0 },
            kind: SourceKind::Html,
        });
    }
    refs
}

/// Parse a captured size. Missing, empty, relative (`%`) or malformed values
/// all mean "unspecified".
fn parse_dimension(value: Option<&str>) -> u32 {
    let Some(value) = value.map(str::trim) else {
        return 0;
    };
    if value.ends_with('%') {
        return 0;
    }
    value
        .strip_suffix("px")
        .unwrap_or(value)
        .trim()
        .parse()
        .unwrap_or(0)
}
