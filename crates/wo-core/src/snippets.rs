//! Geographic snippet extraction and highlighting.
//!
//! Turns a cleaned text plus its annotations into sentence-level snippets,
//! indexed by district/neighborhood code, and renders them with the matched
//! toponyms wrapped in a highlight marker.
//!
//! # Algorithm
//!
//! 1. Split the text into sentence spans (Unicode sentence boundaries; line
//!    breaks inside a sentence do not split it, nor do Dutch abbreviations
//!    and initials).
//! 2. Build an [`IntervalIndex`] over every annotation posting, each interval
//!    carrying the annotation's districts and neighborhoods.
//! 3. Keep only sentences overlapping at least one posting. Each kept
//!    sentence becomes a snippet; its overlapping postings are recorded
//!    relative to the sentence start, per code.
//! 4. Render with [`format_snippet`], trimming long stretches of context
//!    between highlights to word boundaries.
//!
//! All offsets are character (Unicode scalar) offsets, matching the
//! postings produced by the annotation service.

use std::collections::{BTreeMap, BTreeSet};

use unicode_segmentation::UnicodeSegmentation;

use crate::interval::{Interval, IntervalIndex};
use crate::models::{Annotation, DocumentBody, Posting, TextRecord};

pub const HIGHLIGHT_OPEN: &str = r#"<em class="c-details--toponym">"#;
pub const HIGHLIGHT_CLOSE: &str = "</em>";

/// Default number of context characters kept around highlights.
pub const DEFAULT_CONTEXT_CHARS: usize = 70;

const ELLIPSIS: &str = " … ";

/// Snippets derived from one text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoSnippets {
    /// Raw sentence text of every kept sentence, newlines flattened.
    pub snippets: Vec<String>,
    /// `code -> snippet index -> relative postings`.
    pub by_code: BTreeMap<String, BTreeMap<usize, Vec<Posting>>>,
}

/// Dutch abbreviations that do not end a sentence. Compared lowercased.
const ABBREVIATIONS: &[&str] = &[
    "a.s.", "afd.", "art.", "bijv.", "blz.", "burg.", "bv.", "ca.", "d.d.", "dhr.", "dr.",
    "drs.", "e.a.", "e.d.", "evt.", "excl.", "i.c.m.", "i.p.v.", "i.v.m.", "incl.", "ing.",
    "ir.", "jl.", "m.b.t.", "m.i.v.", "mevr.", "mln.", "mr.", "mw.", "n.a.v.", "nr.", "o.a.",
    "o.b.v.", "p.", "pag.", "prof.", "resp.", "str.", "t.a.v.", "t.b.v.", "t.o.v.", "tel.",
    "vs.", "weth.", "z.g.", "zgn.",
];

/// Sentence spans of `text` as `(start, end)` character offsets.
///
/// Spans are ordered and non-overlapping, exclude surrounding whitespace,
/// and whitespace-only segments are dropped. A boundary right after a known
/// abbreviation or an initial ("J.") is not a sentence end.
pub fn sentence_spans(text: &str) -> Vec<(usize, usize)> {
    // '\n' and ' ' are both one byte, so segment positions line up with `text`.
    let flattened: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    let chars: Vec<char> = flattened.chars().collect();

    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut offset = 0;
    for sentence in flattened.split_sentence_bounds() {
        let len = sentence.chars().count();
        let leading = sentence.chars().take_while(|c| c.is_whitespace()).count();
        if leading < len {
            let trailing = sentence
                .chars()
                .rev()
                .take_while(|c| c.is_whitespace())
                .count();
            let span = (offset + leading, offset + len - trailing);
            let continues = spans
                .last()
                .is_some_and(|prev| ends_in_abbreviation(&chars[prev.0..prev.1]));
            match spans.last_mut() {
                Some(prev) if continues => prev.1 = span.1,
                _ => spans.push(span),
            }
        }
        offset += len;
    }
    spans
}

fn ends_in_abbreviation(sentence: &[char]) -> bool {
    if sentence.last() != Some(&'.') {
        return false;
    }
    let start = sentence
        .iter()
        .rposition(|c| c.is_whitespace())
        .map_or(0, |i| i + 1);
    let token: String = sentence[start..]
        .iter()
        .skip_while(|c| !c.is_alphanumeric())
        .collect();
    let mut letters = token.chars();
    let initial = matches!(
        (letters.next(), letters.next(), letters.next()),
        (Some(c), Some('.'), None) if c.is_uppercase()
    );
    initial || ABBREVIATIONS.contains(&token.to_lowercase().as_str())
}

/// Build the snippet list and per-code posting index for `text`.
pub fn generate_geo_snippets(text: &str, annotations: &[Annotation]) -> GeoSnippets {
    let index = IntervalIndex::new(annotations.iter().flat_map(|ann| {
        let codes: Vec<String> = ann.codes().cloned().collect();
        ann.postings.iter().map(move |p| Interval {
            begin: p.start(),
            end: p.end(),
            data: codes.clone(),
        })
    }));

    let mut out = GeoSnippets::default();
    if index.is_empty() {
        return out;
    }

    let chars: Vec<char> = text.chars().collect();
    for (start, end) in sentence_spans(text) {
        let hits = index.overlapping(start, end);
        if hits.is_empty() {
            continue;
        }

        let snippet_index = out.snippets.len();
        for iv in hits {
            let relative = Posting(iv.begin.max(start) - start, iv.end.min(end) - start);
            for code in &iv.data {
                out.by_code
                    .entry(code.clone())
                    .or_default()
                    .entry(snippet_index)
                    .or_default()
                    .push(relative);
            }
        }

        out.snippets.push(
            chars[start..end]
                .iter()
                .map(|&c| if c == '\n' || c == '\r' { ' ' } else { c })
                .collect(),
        );
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GapPosition {
    Leading,
    Between,
    Trailing,
}

/// Render `raw` with every posting highlighted and long context trimmed.
///
/// Postings must be sorted. One that begins before the end of the previous
/// highlight is skipped rather than nested.
pub fn format_snippet(raw: &str, postings: &[Posting], context: usize) -> String {
    let chars: Vec<char> = raw.chars().collect();
    let mut out = String::with_capacity(raw.len() + postings.len() * 40);
    let mut cursor = 0;

    for posting in postings {
        let begin = posting.start();
        let end = posting.end().min(chars.len());
        if begin < cursor || begin >= end {
            continue;
        }
        let position = if cursor == 0 {
            GapPosition::Leading
        } else {
            GapPosition::Between
        };
        out.push_str(&trim_context(&chars[cursor..begin], position, context));
        out.push_str(HIGHLIGHT_OPEN);
        out.extend(&chars[begin..end]);
        out.push_str(HIGHLIGHT_CLOSE);
        cursor = end;
    }

    if cursor == 0 {
        out.extend(&chars[..]);
    } else {
        out.push_str(&trim_context(&chars[cursor..], GapPosition::Trailing, context));
    }
    out
}

/// Shorten a stretch of context to about `budget` characters per side.
///
/// Cuts only at whitespace. When no cut keeps a token whole, the gap (or
/// that side of it) is left as is.
fn trim_context(gap: &[char], position: GapPosition, budget: usize) -> String {
    let len = gap.len();
    let untouched = || collect(gap);

    match position {
        GapPosition::Leading if len > budget => match tail_cut(gap, budget) {
            Some(cut) => collect(&gap[cut..]).trim_start().to_string(),
            None => untouched(),
        },
        GapPosition::Trailing if len > budget => match head_cut(gap, budget) {
            Some(cut) => collect(&gap[..cut]).trim_end().to_string(),
            None => untouched(),
        },
        GapPosition::Between if len > 2 * budget => {
            let head = head_cut(gap, budget).or_else(|| first_break(gap));
            let tail = tail_cut(gap, budget).or_else(|| last_break(gap));
            match (head, tail) {
                (Some(h), Some(t)) if h < t && gap[h..t].iter().any(|c| !c.is_whitespace()) => {
                    format!(
                        "{}{}{}",
                        collect(&gap[..h]).trim_end(),
                        ELLIPSIS,
                        collect(&gap[t..]).trim_start()
                    )
                }
                _ => untouched(),
            }
        }
        _ => untouched(),
    }
}

fn collect(chars: &[char]) -> String {
    chars.iter().collect()
}

/// End of the longest word-aligned prefix of at most `budget` characters.
fn head_cut(gap: &[char], budget: usize) -> Option<usize> {
    if gap[budget].is_whitespace() {
        return Some(budget);
    }
    gap[..budget]
        .iter()
        .rposition(|c| c.is_whitespace())
        .filter(|&i| i > 0)
}

/// Start of the longest word-aligned suffix of at most `budget` characters.
fn tail_cut(gap: &[char], budget: usize) -> Option<usize> {
    let start = gap.len() - budget;
    if gap[start - 1].is_whitespace() {
        return Some(start);
    }
    let ws = gap[start..].iter().position(|c| c.is_whitespace())?;
    Some(start + ws + 1).filter(|&i| i < gap.len())
}

/// End of the first token, when something follows it.
fn first_break(gap: &[char]) -> Option<usize> {
    gap.iter().position(|c| c.is_whitespace()).filter(|&i| i > 0)
}

/// Start of the last token, when something precedes it.
fn last_break(gap: &[char]) -> Option<usize> {
    gap.iter()
        .rposition(|c| c.is_whitespace())
        .map(|i| i + 1)
        .filter(|&i| i < gap.len())
}

/// Render the snippets relevant to `code`, or those of every code when `None`.
///
/// A code without recorded snippets yields an empty list. Postings of
/// annotations without any code are never highlighted.
pub fn select_snippets(geo: &GeoSnippets, code: Option<&str>, context: usize) -> Vec<String> {
    let selected: BTreeMap<usize, Vec<Posting>> = match code {
        Some(code) => geo.by_code.get(code).cloned().unwrap_or_default(),
        None => {
            let mut merged: BTreeMap<usize, Vec<Posting>> = BTreeMap::new();
            for (&i, postings) in geo.by_code.values().flatten() {
                merged.entry(i).or_default().extend(postings);
            }
            for postings in merged.values_mut() {
                postings.sort();
                postings.dedup();
            }
            merged
        }
    };
    selected
        .iter()
        .map(|(&i, postings)| format_snippet(&geo.snippets[i], postings, context))
        .collect()
}

/// Highlighted snippets of `text` for `code` (all codes when `None`).
pub fn filtered_snippets(
    text: &str,
    annotations: &[Annotation],
    code: Option<&str>,
    context: usize,
) -> Vec<String> {
    if text.is_empty() || annotations.is_empty() {
        return Vec::new();
    }
    let geo = generate_geo_snippets(text, annotations);
    select_snippets(&geo, code, context)
}

fn fill_snippets(record: &mut TextRecord, code: Option<&str>, context: usize) {
    if record.annotations.is_empty() {
        return;
    }
    let snippets = record
        .annotated_text()
        .map(|text| filtered_snippets(text, &record.annotations, code, context))
        .unwrap_or_default();
    record.snippets = snippets;
}

/// Populate `snippets` on the body, its motion, and every annotated source.
pub fn add_doc_snippets(body: &mut DocumentBody, code: Option<&str>, context: usize) {
    fill_snippets(&mut body.record, code, context);
    if let Some(motion) = &mut body.motion {
        fill_snippets(motion, code, context);
    }
    for source in &mut body.sources {
        fill_snippets(source, code, context);
    }
}

/// Sorted, de-duplicated toponyms of a document.
///
/// Covers the body's own annotations, the motion's, and every source's.
/// With a `code`, only annotations referring to that district or
/// neighborhood contribute.
pub fn aggregate_toponyms(body: &DocumentBody, code: Option<&str>) -> Vec<String> {
    let records = std::iter::once(&body.record)
        .chain(body.motion.iter())
        .chain(body.sources.iter());

    records
        .flat_map(|record| record.annotations.iter())
        .filter(|ann| code.map_or(true, |c| ann.refers_to(c)))
        .map(|ann| ann.toponym.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
