//! Document Section Parser (§4.1).
//!
//! Splits a case document's raw body into the closed set of section types,
//! preserving both a plain-text and a lightly-marked-up form of each
//! section. Never fails hard: documents that don't match the heading
//! pattern table fall back to a single `facts` section and report
//! `ParseMethod::Unstructured` instead of erroring.

use regex::Regex;
use scraper::{Html, Selector};
use std::sync::LazyLock;

use crate::model::SectionType;

/// How a document's sections were identified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMethod {
    /// Every section was identified via a heading pattern match.
    HeadingMatch,
    /// No heading patterns matched; the whole body was treated as `facts`.
    Unstructured,
}

/// One parsed section: plain text plus the lightly-marked-up original span.
#[derive(Debug, Clone)]
pub struct ParsedSection {
    pub section_type: SectionType,
    pub text: String,
    pub markup: String,
}

/// The result of parsing one case document.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub sections: Vec<ParsedSection>,
    pub parse_method: ParseMethod,
}

impl ParsedDocument {
    pub fn section(&self, section_type: SectionType) -> Option<&ParsedSection> {
        self.sections
            .iter()
            .find(|s| s.section_type == section_type)
    }

    pub fn is_empty(&self) -> bool {
        self.sections.iter().all(|s| s.text.trim().is_empty())
    }
}

/// Heading text patterns mapped to section types, tried in document order.
/// Case-insensitive, tolerant of trailing colons/numbering (e.g. "II. Facts").
static HEADING_PATTERNS: LazyLock<Vec<(Regex, SectionType)>> = LazyLock::new(|| {
    vec![
        (r"(?i)^\s*(?:[ivx0-9]+[.\):]?\s*)?facts?\s*:?\s*$", SectionType::Facts),
        (
            r"(?i)^\s*(?:[ivx0-9]+[.\):]?\s*)?discussion\s*:?\s*$",
            SectionType::Discussion,
        ),
        (
            r"(?i)^\s*(?:[ivx0-9]+[.\):]?\s*)?questions?(?:\s+presented)?\s*:?\s*$",
            SectionType::Questions,
        ),
        (
            r"(?i)^\s*(?:[ivx0-9]+[.\):]?\s*)?conclusions?\s*:?\s*$",
            SectionType::Conclusions,
        ),
        (
            r"(?i)^\s*(?:[ivx0-9]+[.\):]?\s*)?references?\s*:?\s*$",
            SectionType::References,
        ),
        (
            r"(?i)^\s*(?:[ivx0-9]+[.\):]?\s*)?dissent(?:ing\s+opinion)?\s*:?\s*$",
            SectionType::Dissenting,
        ),
    ]
    .into_iter()
    .map(|(pat, kind)| (Regex::new(pat).expect("static heading pattern compiles"), kind))
    .collect()
});

static HTML_TAG: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").unwrap());

/// Strip HTML tags to plain text using `scraper`, collapsing whitespace.
fn html_to_text(markup: &str) -> String {
    let fragment = Html::parse_fragment(markup);
    let text: String = if let Some(body) = fragment.select(&HTML_TAG).next() {
        body.text().collect::<Vec<_>>().join(" ")
    } else {
        fragment.root_element().text().collect::<Vec<_>>().join(" ")
    };
    collapse_whitespace(&text)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn looks_like_html(body: &str) -> bool {
    body.contains("</") || body.contains("/>") || body.trim_start().starts_with('<')
}

/// Parse a raw case document body into its closed-set sections (§4.1).
///
/// Accepts either plain text (paragraphs separated by blank lines, with
/// standalone heading lines recognized via [`HEADING_PATTERNS`]) or lightly
/// marked-up HTML (headings as `<h1>`-`<h4>` or bold standalone lines).
pub fn parse_document(body: &str) -> ParsedDocument {
    let is_html = looks_like_html(body);
    let lines: Vec<String> = if is_html {
        html_lines(body)
    } else {
        body.lines().map(str::to_string).collect()
    };

    // Keyed by section type, per §4.1's "closed set of section types" contract:
    // a repeated heading of a type already seen merges into that type's entry
    // rather than starting a second one, so `ParsedDocument::section` never
    // silently drops text under a second occurrence of the same heading.
    let mut sections: Vec<(SectionType, Vec<String>)> = Vec::new();
    let mut current: Option<usize> = None;
    let mut matched_any = false;

    for line in &lines {
        if let Some(kind) = match_heading(line) {
            matched_any = true;
            current = Some(match sections.iter().position(|(k, _)| *k == kind) {
                Some(idx) => idx,
                None => {
                    sections.push((kind, Vec::new()));
                    sections.len() - 1
                }
            });
            continue;
        }
        if line.trim().is_empty() {
            continue;
        }
        match current {
            Some(idx) => {
                sections[idx].1.push(line.clone());
            }
            None => {
                // Content before any heading is matched belongs to an implicit facts section.
                if sections.first().map(|(k, _)| *k) != Some(SectionType::Facts) {
                    sections.insert(0, (SectionType::Facts, Vec::new()));
                }
                sections[0].1.push(line.clone());
            }
        }
    }

    if !matched_any || sections.is_empty() {
        let text = collapse_whitespace(body);
        return ParsedDocument {
            sections: vec![ParsedSection {
                section_type: SectionType::Facts,
                markup: body.to_string(),
                text,
            }],
            parse_method: ParseMethod::Unstructured,
        };
    }

    let parsed = sections
        .into_iter()
        .map(|(kind, body_lines)| {
            let markup = body_lines.join("\n");
            let text = collapse_whitespace(&markup);
            ParsedSection {
                section_type: kind,
                text,
                markup,
            }
        })
        .filter(|s| !s.text.is_empty())
        .collect::<Vec<_>>();

    if parsed.is_empty() {
        let text = collapse_whitespace(body);
        return ParsedDocument {
            sections: vec![ParsedSection {
                section_type: SectionType::Facts,
                markup: body.to_string(),
                text,
            }],
            parse_method: ParseMethod::Unstructured,
        };
    }

    ParsedDocument {
        sections: parsed,
        parse_method: ParseMethod::HeadingMatch,
    }
}

fn match_heading(line: &str) -> Option<SectionType> {
    HEADING_PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(line.trim()))
        .map(|(_, kind)| *kind)
}

/// Render HTML into a list of logical lines: block-level element text nodes
/// and standalone heading text, so heading-pattern matching can reuse the
/// plain-text code path.
fn html_lines(markup: &str) -> Vec<String> {
    let text = html_to_text(markup);
    // html_to_text already collapses everything onto one line; re-split on
    // heading keywords isn't reliable post-collapse, so parse block
    // elements directly instead.
    let fragment = Html::parse_fragment(markup);
    let block_selector = Selector::parse("h1,h2,h3,h4,p,div,li,b,strong").unwrap();
    let mut lines: Vec<String> = fragment
        .select(&block_selector)
        .map(|el| collapse_whitespace(&el.text().collect::<Vec<_>>().join(" ")))
        .filter(|s| !s.is_empty())
        .collect();
    if lines.is_empty() {
        lines.push(text);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_with_headings_splits_into_sections() {
        let body = "FACTS:\nAn engineer signed a set of plans.\n\nQUESTIONS:\nWas this ethical?\n\nCONCLUSIONS:\nNo, it was not.\n";
        let doc = parse_document(body);
        assert_eq!(doc.parse_method, ParseMethod::HeadingMatch);
        assert!(doc.section(SectionType::Facts).is_some());
        assert!(doc.section(SectionType::Questions).is_some());
        assert!(doc.section(SectionType::Conclusions).is_some());
        assert!(doc.section(SectionType::Facts).unwrap().text.contains("engineer"));
    }

    #[test]
    fn unmatched_body_falls_back_to_unstructured_facts() {
        let body = "Just some narrative text with no recognizable headings at all.";
        let doc = parse_document(body);
        assert_eq!(doc.parse_method, ParseMethod::Unstructured);
        assert_eq!(doc.sections.len(), 1);
        assert_eq!(doc.sections[0].section_type, SectionType::Facts);
    }

    #[test]
    fn html_headings_are_recognized() {
        let body = "<h2>Facts</h2><p>An engineer certified unsafe plans.</p><h2>Conclusions</h2><p>This violates the code of ethics.</p>";
        let doc = parse_document(body);
        assert_eq!(doc.parse_method, ParseMethod::HeadingMatch);
        assert!(doc.section(SectionType::Facts).unwrap().text.contains("engineer"));
        assert!(doc.section(SectionType::Conclusions).is_some());
    }

    #[test]
    fn repeated_heading_of_the_same_type_merges_into_one_section() {
        let body = "Facts\nThe engineer inspected the bridge.\n\nDiscussion\nFirst point of discussion.\n\n\
                    Discussion\nSecond point of discussion, raised later.\n";
        let doc = parse_document(body);
        assert_eq!(doc.sections.iter().filter(|s| s.section_type == SectionType::Discussion).count(), 1);
        let discussion = doc.section(SectionType::Discussion).unwrap();
        assert!(discussion.text.contains("First point"));
        assert!(discussion.text.contains("Second point"));
    }

    #[test]
    fn numbered_roman_headings_match() {
        let body = "I. Facts\nThe case involves a bridge inspection.\n\nIII. Conclusion\nThe engineer acted properly.\n";
        let doc = parse_document(body);
        assert_eq!(doc.parse_method, ParseMethod::HeadingMatch);
        assert!(doc.section(SectionType::Facts).is_some());
        assert!(doc.section(SectionType::Conclusions).is_some());
    }

    #[test]
    fn empty_document_has_no_nonempty_sections() {
        let doc = parse_document("   \n\n   ");
        assert!(doc.is_empty());
    }
}
