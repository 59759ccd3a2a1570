use chrono::{DateTime, Utc};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::OnceLock;

/// Minimum length for a bullet item to count as content.
const MIN_ITEM_CHARS: usize = 4;

/// Structured output of one self-critique cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CritiqueRecord {
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_good_reply: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example_bad_reply: Option<String>,
    #[serde(default)]
    pub regressions: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narrative_summary: Option<String>,
    #[serde(default)]
    pub key_learnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
}

impl CritiqueRecord {
    /// Non-empty fields among strengths, weaknesses and recommendations.
    pub fn core_field_count(&self) -> usize {
        [&self.strengths, &self.weaknesses, &self.recommendations]
            .iter()
            .filter(|items| !items.is_empty())
            .count()
    }

    /// Like `core_field_count`, also counting patterns.
    pub fn primary_field_count(&self) -> usize {
        self.core_field_count() + usize::from(!self.patterns.is_empty())
    }

    pub fn is_valid(&self) -> bool {
        self.core_field_count() >= 2
    }
}

/// One strategy for turning generated text into a critique.
pub trait CritiqueParser: Send + Sync {
    fn name(&self) -> &'static str;

    fn parse(&self, raw: &str) -> Option<CritiqueRecord>;
}

/// Runs parsers in order and keeps the first record produced.
pub struct CritiqueExtractor {
    parsers: Vec<Box<dyn CritiqueParser>>,
}

impl Default for CritiqueExtractor {
    fn default() -> Self {
        Self::new(vec![Box::new(StructuredParser), Box::new(MarkdownParser)])
    }
}

impl CritiqueExtractor {
    pub fn new(parsers: Vec<Box<dyn CritiqueParser>>) -> Self {
        Self { parsers }
    }

    /// `None` means the text held too little to use, not that anything failed.
    pub fn extract(&self, raw: &str) -> Option<CritiqueRecord> {
        if raw.trim().is_empty() {
            return None;
        }
        for parser in &self.parsers {
            if let Some(record) = parser.parse(raw) {
                tracing::debug!("Critique extracted by {} parser", parser.name());
                return Some(record);
            }
            tracing::debug!("Critique parser {} found nothing usable", parser.name());
        }
        None
    }
}

pub fn extract_critique(raw: &str) -> Option<CritiqueRecord> {
    CritiqueExtractor::default().extract(raw)
}

// ---------------------------------------------------------------------------
// Structured (JSON) path
// ---------------------------------------------------------------------------

pub struct StructuredParser;

impl CritiqueParser for StructuredParser {
    fn name(&self) -> &'static str {
        "structured"
    }

    fn parse(&self, raw: &str) -> Option<CritiqueRecord> {
        let text = strip_thinking_tags(raw);
        let body = extract_from_code_block(&text).unwrap_or(text);
        let span = first_balanced_object(&body)?;

        let value: Value = match serde_json::from_str(span) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!("Critique JSON span did not parse: {}", e);
                return None;
            }
        };
        let obj = value.as_object()?;

        let record = CritiqueRecord {
            strengths: list_field(obj, &["strengths"]),
            weaknesses: list_field(obj, &["weaknesses"]),
            patterns: list_field(obj, &["patterns"]),
            recommendations: list_field(obj, &["recommendations"]),
            example_good_reply: text_field(
                obj,
                &["exampleGoodReply", "example_good_reply", "bestReply", "best_reply"],
            ),
            example_bad_reply: text_field(
                obj,
                &["exampleBadReply", "example_bad_reply", "worstReply", "worst_reply"],
            ),
            regressions: list_field(obj, &["regressions"]),
            improvements: list_field(obj, &["improvements"]),
            narrative_summary: text_field(
                obj,
                &["narrativeSummary", "narrative_summary", "summary"],
            ),
            key_learnings: list_field(obj, &["keyLearnings", "key_learnings"]),
            suggested_phase: text_field(obj, &["suggestedPhase", "suggested_phase"]),
            generated_at: text_field(obj, &["generatedAt", "generated_at"])
                .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
                .map(|ts| ts.with_timezone(&Utc)),
        };

        record.is_valid().then_some(record)
    }
}

fn field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| obj.get(*key))
}

fn list_field(obj: &Map<String, Value>, keys: &[&str]) -> Vec<String> {
    match field(obj, keys) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Object(inner) => inner
                    .get("text")
                    .or_else(|| inner.get("item"))
                    .and_then(|v| v.as_str())
                    .map(|s| s.trim().to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn text_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    field(obj, keys)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn strip_thinking_tags(text: &str) -> String {
    let mut result = text.to_string();
    for (open_tag, close_tag) in [("<thinking>", "</thinking>"), ("<think>", "</think>")] {
        while let Some(start) = result.find(open_tag) {
            if let Some(end) = result[start..].find(close_tag) {
                let end_pos = start + end + close_tag.len();
                result.replace_range(start..end_pos, "");
            } else {
                // Unclosed tag -- strip from tag to end of string
                result.replace_range(start.., "");
            }
        }
    }
    result.trim().to_string()
}

fn extract_from_code_block(text: &str) -> Option<String> {
    if let Some(start) = text.find("```json") {
        if let Some(end) = text[start + 7..].find("```") {
            return Some(text[start + 7..start + 7 + end].trim().to_string());
        }
    }
    if let Some(start) = text.find("```") {
        if let Some(end) = text[start + 3..].find("```") {
            let content = text[start + 3..start + 3 + end].trim();
            if content.starts_with('{') {
                return Some(content.to_string());
            }
        }
    }
    None
}

/// First `{...}` span with matched braces, ignoring braces inside JSON strings.
pub fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Markdown fallback path
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Strengths,
    Weaknesses,
    Patterns,
    Recommendations,
    Improvements,
    Regressions,
    KeyLearnings,
    Summary,
}

impl Section {
    fn from_label(label: &str) -> Option<Self> {
        let label = label.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| label.contains(n));

        if has(&["weakness", "need", "areas", "didn't", "did not", "isn't", "is not", "shortcoming"]) {
            Some(Section::Weaknesses)
        } else if has(&["strength", "well", "positive", "worked"]) {
            Some(Section::Strengths)
        } else if has(&["pattern", "theme"]) {
            Some(Section::Patterns)
        } else if has(&["recommend", "actionable", "action item", "suggestion", "next step"]) {
            Some(Section::Recommendations)
        } else if has(&["regression"]) {
            Some(Section::Regressions)
        } else if has(&["learning", "lesson"]) {
            Some(Section::KeyLearnings)
        } else if has(&["improvement"]) {
            Some(Section::Improvements)
        } else if has(&["summary", "overall"]) {
            Some(Section::Summary)
        } else {
            None
        }
    }
}

fn header_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)^(strengths?|what(?: went|'s going| is going| are going| is working| worked)? well|doing well|what worked|positives",
            r"|weakness(?:es)?|needs? improvement|areas? (?:for|of|to|needing) improve(?:ment)?",
            r"|what (?:didn't|did not|isn't|is not) work(?:ing)?|shortcomings",
            r"|(?:observed |recurring )?patterns?|recurring themes",
            r"|recommendations?|actionable changes|action items|suggestions|next steps",
            r"|regressions?|key learnings|learnings|lessons learned",
            r"|improvements?(?: since last (?:review|reflection|time))?",
            r"|summary|overall(?: assessment)?)",
            r"(?:\s*\([^)]*\))?\s*(?:[:\-]\s*(.*))?$"
        ))
        .ok()
    })
    .as_ref()
}

fn example_regex(good: bool) -> Option<&'static Regex> {
    static GOOD: OnceLock<Option<Regex>> = OnceLock::new();
    static BAD: OnceLock<Option<Regex>> = OnceLock::new();
    let (cell, labels) = if good {
        (&GOOD, "best|good")
    } else {
        (&BAD, "worst|bad")
    };
    cell.get_or_init(|| {
        Regex::new(&format!(
            r#"(?i)(?:{labels})\s+(?:example\s+)?(?:reply|response)[^"“\n]*["“]([^"”\n]+)["”]"#
        ))
        .ok()
    })
    .as_ref()
}

fn is_example_line(line: &str) -> bool {
    [true, false]
        .into_iter()
        .filter_map(example_regex)
        .any(|re| re.is_match(line))
}

fn capture_example(text: &str, good: bool) -> Option<String> {
    example_regex(good)?
        .captures(text)?
        .get(1)
        .map(|m| m.as_str().to_string())
}

fn strip_bullet(line: &str) -> Option<&str> {
    for marker in ["- ", "* ", "• ", "· ", "+ "] {
        if let Some(rest) = line.strip_prefix(marker) {
            return Some(rest.trim());
        }
    }
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &line[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return Some(rest.trim());
        }
    }
    None
}

fn clean_label(text: &str) -> String {
    text.replace("**", "")
        .replace("__", "")
        .trim_start_matches('#')
        .trim()
        .trim_matches(|c| c == '*' || c == '_')
        .trim()
        .to_string()
}

/// Header label and any inline content after it.
fn parse_header(line: &str) -> Option<(Section, Option<String>)> {
    let line = line.trim();
    // "## 1. Strengths" is a heading, numbered or not.
    let (candidate, is_bullet) = match line.strip_prefix('#') {
        Some(heading) => {
            let heading = heading.trim_start_matches('#').trim();
            (strip_bullet(heading).unwrap_or(heading), false)
        }
        None => match strip_bullet(line) {
            Some(rest) => (rest, true),
            None => (line, false),
        },
    };
    let cleaned = clean_label(candidate);
    let caps = header_regex()?.captures(&cleaned)?;
    let section = Section::from_label(caps.get(1)?.as_str())?;
    let inline = caps
        .get(2)
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty());

    // "- Strengths: shows up" inside a list is an item, not a header.
    if is_bullet && inline.is_some() {
        return None;
    }
    Some((section, inline))
}

fn clean_item(raw: &str) -> Option<String> {
    let item = raw.replace("**", "").trim().to_string();
    (item.chars().count() >= MIN_ITEM_CHARS).then_some(item)
}

fn split_inline(raw: &str) -> Vec<String> {
    raw.split(';').filter_map(clean_item).collect()
}

pub struct MarkdownParser;

impl MarkdownParser {
    fn push(record: &mut CritiqueRecord, section: Section, items: Vec<String>) {
        let target = match section {
            Section::Strengths => &mut record.strengths,
            Section::Weaknesses => &mut record.weaknesses,
            Section::Patterns => &mut record.patterns,
            Section::Recommendations => &mut record.recommendations,
            Section::Improvements => &mut record.improvements,
            Section::Regressions => &mut record.regressions,
            Section::KeyLearnings => &mut record.key_learnings,
            Section::Summary => {
                let joined = items.join(" ");
                if !joined.is_empty() {
                    record.narrative_summary = Some(match record.narrative_summary.take() {
                        Some(existing) => format!("{} {}", existing, joined),
                        None => joined,
                    });
                }
                return;
            }
        };
        target.extend(items);
    }
}

impl CritiqueParser for MarkdownParser {
    fn name(&self) -> &'static str {
        "markdown"
    }

    fn parse(&self, raw: &str) -> Option<CritiqueRecord> {
        let text = strip_thinking_tags(raw);
        let mut record = CritiqueRecord::default();
        let mut current: Option<Section> = None;
        let mut collected_in_section = 0usize;
        let mut blank_run = 0usize;

        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                blank_run += 1;
                if blank_run >= 2 {
                    current = None;
                }
                continue;
            }
            blank_run = 0;

            if let Some((section, inline)) = parse_header(trimmed) {
                current = Some(section);
                collected_in_section = 0;
                if let Some(inline) = inline {
                    let items = if section == Section::Summary {
                        vec![inline]
                    } else {
                        split_inline(&inline)
                    };
                    collected_in_section += items.len();
                    Self::push(&mut record, section, items);
                }
                continue;
            }

            let Some(section) = current else {
                continue;
            };
            if is_example_line(trimmed) {
                continue;
            }

            if let Some(item) = strip_bullet(trimmed) {
                if let Some(item) = clean_item(item) {
                    collected_in_section += 1;
                    Self::push(&mut record, section, vec![item]);
                }
            } else if section == Section::Summary {
                Self::push(&mut record, section, vec![trimmed.to_string()]);
            } else if trimmed.contains(';') {
                let items = split_inline(trimmed);
                collected_in_section += items.len();
                Self::push(&mut record, section, items);
            } else if collected_in_section > 0 {
                // Prose after a list closes the section.
                current = None;
            }
        }

        record.example_good_reply = capture_example(&text, true);
        record.example_bad_reply = capture_example(&text, false);

        (record.primary_field_count() >= 2).then_some(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_minimal_record() {
        let record =
            extract_critique(r#"{"strengths":["x"],"weaknesses":["y"],"recommendations":["z"]}"#)
                .expect("record");
        assert_eq!(record.strengths, vec!["x"]);
        assert_eq!(record.weaknesses, vec!["y"]);
        assert_eq!(record.recommendations, vec!["z"]);
    }

    #[test]
    fn structured_and_bullets_agree() {
        let json = r#"{
            "strengths": ["asks follow-up questions"],
            "weaknesses": ["replies run long"],
            "recommendations": ["lead with the answer"]
        }"#;
        let bullets = "Strengths:\n- asks follow-up questions\n\nWeaknesses:\n- replies run long\n\nRecommendations:\n- lead with the answer\n";

        let from_json = extract_critique(json).expect("json record");
        let from_bullets = MarkdownParser.parse(bullets).expect("bullet record");
        assert!(StructuredParser.parse(bullets).is_none());

        assert_eq!(from_json.strengths, from_bullets.strengths);
        assert_eq!(from_json.weaknesses, from_bullets.weaknesses);
        assert_eq!(from_json.recommendations, from_bullets.recommendations);
        assert_eq!(extract_critique(bullets), Some(from_bullets));
    }

    #[test]
    fn unrelated_notes_yield_nothing() {
        assert!(extract_critique(r#"{"notes": "all good this week"}"#).is_none());
        assert!(extract_critique("notes: all good this week\nnothing else to add").is_none());
        assert!(extract_critique("   ").is_none());
    }

    #[test]
    fn single_primary_field_rejected_on_both_paths() {
        assert!(extract_critique(r#"{"strengths": ["warm greeting style"]}"#).is_none());
        assert!(extract_critique("Strengths:\n- warm greeting style\n- quick to help").is_none());
    }

    #[test]
    fn structured_handles_wrapping_and_coercion() {
        let raw = r#"<think>plan {the} answer</think>
Here you go:
```json
{
  "strengths": "keeps a friendly tone",
  "weaknesses": ["overuses {curly} jargon", ""],
  "recommendations": [{"text": "define terms inline"}],
  "exampleGoodReply": "glad it helped!",
  "key_learnings": ["short beats clever"],
  "suggestedPhase": "consolidate",
  "generatedAt": "2024-05-01T10:00:00Z"
}
```
trailing prose }"#;
        let record = extract_critique(raw).expect("record");
        assert_eq!(record.strengths, vec!["keeps a friendly tone"]);
        assert_eq!(record.weaknesses, vec!["overuses {curly} jargon"]);
        assert_eq!(record.recommendations, vec!["define terms inline"]);
        assert_eq!(record.example_good_reply.as_deref(), Some("glad it helped!"));
        assert_eq!(record.key_learnings, vec!["short beats clever"]);
        assert_eq!(record.suggested_phase.as_deref(), Some("consolidate"));
        assert!(record.generated_at.is_some());
    }

    #[test]
    fn invalid_json_falls_through_to_markdown() {
        let raw = "{ this is not json }\n\n## What's going well\n* Clear structure\n* Good pacing in threads\n\n**Needs improvement**\n1. Too many caveats\n2) Ignores questions\n\nActionable changes: trim caveats; answer first; ok\n";
        let record = extract_critique(raw).expect("record");
        assert_eq!(record.strengths, vec!["Clear structure", "Good pacing in threads"]);
        assert_eq!(record.weaknesses, vec!["Too many caveats", "Ignores questions"]);
        assert_eq!(record.recommendations, vec!["trim caveats", "answer first"]);
    }

    #[test]
    fn markdown_captures_examples_verbatim() {
        let raw = "Strengths:\n- Engages with specifics\nWeaknesses:\n- Generic sign-offs\n\nBest reply: \"What stood out to you most?\"\nWorst reply: “Thanks!!”\n";
        let record = MarkdownParser.parse(raw).expect("record");
        assert_eq!(
            record.example_good_reply.as_deref(),
            Some("What stood out to you most?")
        );
        assert_eq!(record.example_bad_reply.as_deref(), Some("Thanks!!"));
        assert_eq!(record.strengths, vec!["Engages with specifics"]);
        assert_eq!(record.weaknesses, vec!["Generic sign-offs"]);
    }

    #[test]
    fn blank_run_and_prose_close_sections() {
        let raw = "Strengths:\n- Remembers context\n\n\n- stray bullet after gap\nWeaknesses:\n- Rambles on\nOverall the week went fine.\n- not a weakness\nPatterns:\n- late night replies are terse\n";
        let record = MarkdownParser.parse(raw).expect("record");
        assert_eq!(record.strengths, vec!["Remembers context"]);
        assert_eq!(record.weaknesses, vec!["Rambles on"]);
        assert_eq!(record.patterns, vec!["late night replies are terse"]);
    }

    #[test]
    fn numbered_headings_are_sections() {
        let raw = "## 1. Strengths\n- Asks specific follow-ups\n\n## 2. Weaknesses\n- Replies run long\n\n### 3) Recommendations\n- Lead with the answer\n";
        let record = extract_critique(raw).expect("record");
        assert_eq!(record.strengths, vec!["Asks specific follow-ups"]);
        assert_eq!(record.weaknesses, vec!["Replies run long"]);
        assert_eq!(record.recommendations, vec!["Lead with the answer"]);
    }

    #[test]
    fn balanced_span_respects_strings() {
        let text = r#"prefix {"a": "}{", "b": {"c": 1}} suffix {"d": 2}"#;
        assert_eq!(
            first_balanced_object(text),
            Some(r#"{"a": "}{", "b": {"c": 1}}"#)
        );
        assert_eq!(first_balanced_object("no braces"), None);
        assert_eq!(first_balanced_object("{ unclosed"), None);
    }
}
