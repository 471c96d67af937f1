//! Subtitle normalization.
//!
//! Both upstream encodings (legacy `<text start= dur=>` markup and the
//! `events`/`segs` JSON track) converge on a sorted `Vec<SubtitleEntry>`, and
//! both output formats (plain text, SRT) are rendered from it.

use clap::ValueEnum;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::error::SubsError;

/// Default gap (seconds) under which adjacent entries are folded together.
pub const DEFAULT_MERGE_GAP: f64 = 0.1;

/// One timed caption line. `start < end` for everything the parsers return.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubtitleEntry {
  pub start: f64,
  pub end: f64,
  pub text: String,
}

impl SubtitleEntry {
  pub fn new(start: f64, end: f64, text: impl Into<String>) -> Self {
    Self { start, end, text: text.into() }
  }
}

/// Output file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
  #[default]
  Srt,
  Txt,
}

impl OutputFormat {
  pub fn extension(self) -> &'static str {
    match self {
      OutputFormat::Srt => "srt",
      OutputFormat::Txt => "txt",
    }
  }

  pub fn render(self, entries: &[SubtitleEntry]) -> String {
    match self {
      OutputFormat::Srt => to_indexed_timed_format(entries),
      OutputFormat::Txt => to_line_delimited_text(entries, "\n"),
    }
  }
}

/// Upstream wire encoding of a captured payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEncoding {
  /// `{"events":[{"tStartMs":..,"dDurationMs":..,"segs":[{"utf8":..}]}]}`
  Events,
  /// `<transcript><text start=".." dur="..">..</text></transcript>`
  LegacyMarkup,
  Unknown,
}

impl SourceEncoding {
  /// Classify a payload from its `fmt` query value and a sniff of the body.
  pub fn detect(fmt: &str, content: &str) -> Self {
    if fmt == "json3" || content.contains("\"events\"") {
      SourceEncoding::Events
    } else if content.contains("<transcript>") || content.contains("<text") {
      SourceEncoding::LegacyMarkup
    } else {
      SourceEncoding::Unknown
    }
  }
}

/// Normalize a captured payload of any supported encoding.
///
/// Unknown bodies are tried as an event document once more; if that yields
/// nothing the raw text becomes a single 0 to 10 s entry so the user still gets
/// something readable.
pub fn normalize(fmt: &str, content: &str) -> Vec<SubtitleEntry> {
  match SourceEncoding::detect(fmt, content) {
    SourceEncoding::Events => parse_event_format(content),
    SourceEncoding::LegacyMarkup => parse_legacy_markup(content),
    SourceEncoding::Unknown => {
      if let Ok(entries) = try_parse_event_format(content)
        && !entries.is_empty()
      {
        return entries;
      }
      let text = clean_text(content);
      if text.is_empty() {
        return Vec::new();
      }
      warn!(fmt, "subtitle: unknown payload encoding, treating as plain text");
      vec![SubtitleEntry::new(0.0, 10.0, text)]
    }
  }
}

// --- Parsers ---

static TEXT_ELEMENT: LazyLock<Regex> = LazyLock::new(|| {
  // Safety: literal pattern, covered by the tests below.
  Regex::new(r"(?s)<text\b([^>]*)>(.*?)</text>").expect("valid <text> pattern")
});

static START_ATTR: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r#"\bstart="([^"]*)""#).expect("valid start attribute pattern"));

static DUR_ATTR: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r#"\bdur="([^"]*)""#).expect("valid dur attribute pattern"));

static MARKUP_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid tag pattern"));

static ENTITY: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"&(#[xX][0-9a-fA-F]+|#[0-9]+|[a-zA-Z]+);").expect("valid entity pattern"));

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

fn attr_seconds(re: &Regex, attrs: &str) -> Option<f64> {
  re.captures(attrs)?.get(1)?.as_str().trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse legacy `<text start="s" dur="s">` markup.
///
/// Entries without a parseable start or a positive duration are dropped, as
/// are entries whose text is empty once entities are decoded and markup removed.
pub fn parse_legacy_markup(xml: &str) -> Vec<SubtitleEntry> {
  let mut entries: Vec<SubtitleEntry> = TEXT_ELEMENT
    .captures_iter(xml)
    .filter_map(|caps| {
      let attrs = caps.get(1).map_or("", |m| m.as_str());
      let start = attr_seconds(&START_ATTR, attrs).filter(|s| *s >= 0.0)?;
      let dur = attr_seconds(&DUR_ATTR, attrs).filter(|d| *d > 0.0)?;
      let text = clean_text(caps.get(2).map_or("", |m| m.as_str()));
      if text.is_empty() {
        return None;
      }
      Some(SubtitleEntry::new(start, start + dur, text))
    })
    .collect();

  sort_by_start(&mut entries);
  debug!(count = entries.len(), "subtitle: parsed legacy markup");
  entries
}

#[derive(Deserialize)]
struct EventTrack {
  #[serde(default)]
  events: Vec<serde_json::Value>,
}

fn event_to_entry(event: &serde_json::Value) -> Option<SubtitleEntry> {
  let segs = event.get("segs")?.as_array()?;
  let raw: String = segs.iter().filter_map(|seg| seg.get("utf8")?.as_str()).collect();
  if raw.trim().is_empty() {
    return None;
  }

  let start_ms = event.get("tStartMs")?.as_f64().filter(|v| v.is_finite() && *v >= 0.0)?;
  let dur_ms = event.get("dDurationMs")?.as_f64().filter(|v| v.is_finite() && *v > 0.0)?;

  let text = clean_text(&raw);
  if text.is_empty() {
    return None;
  }
  Some(SubtitleEntry::new(start_ms / 1000.0, (start_ms + dur_ms) / 1000.0, text))
}

fn try_parse_event_format(json: &str) -> Result<Vec<SubtitleEntry>, SubsError> {
  let track: EventTrack = serde_json::from_str(json).map_err(|e| SubsError::ParseFailure(e.to_string()))?;
  let mut entries: Vec<SubtitleEntry> = track.events.iter().filter_map(event_to_entry).collect();
  sort_by_start(&mut entries);
  Ok(entries)
}

/// Parse the JSON event-list track. Malformed JSON yields an empty sequence.
pub fn parse_event_format(json: &str) -> Vec<SubtitleEntry> {
  match try_parse_event_format(json) {
    Ok(entries) => {
      debug!(count = entries.len(), "subtitle: parsed event track");
      entries
    }
    Err(e) => {
      warn!(err = %e, "subtitle: event track unreadable, returning no entries");
      Vec::new()
    }
  }
}

fn sort_by_start(entries: &mut [SubtitleEntry]) {
  entries.sort_by(|a, b| a.start.total_cmp(&b.start));
}

fn decode_entity(caps: &Captures) -> String {
  let name = &caps[1];
  let decoded = match name {
    "amp" => Some('&'),
    "lt" => Some('<'),
    "gt" => Some('>'),
    "quot" => Some('"'),
    "apos" => Some('\''),
    "nbsp" => Some(' '),
    _ => {
      if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
        u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
      } else if let Some(dec) = name.strip_prefix('#') {
        dec.parse::<u32>().ok().and_then(char::from_u32)
      } else {
        None
      }
    }
  };
  decoded.map_or_else(|| caps[0].to_string(), |c| c.to_string())
}

/// Decode repeatedly so double-encoded text (`&amp;#39;`) comes out plain.
/// Every decode shortens the string, so this terminates.
fn decode_entities(raw: &str) -> String {
  let mut text = raw.to_string();
  loop {
    let decoded = ENTITY.replace_all(&text, decode_entity).into_owned();
    if decoded == text {
      return text;
    }
    text = decoded;
  }
}

/// Decode entities, strip markup, collapse whitespace.
pub fn clean_text(raw: &str) -> String {
  let decoded = decode_entities(raw);
  let stripped = MARKUP_TAG.replace_all(&decoded, "");
  WHITESPACE.replace_all(&stripped, " ").trim().to_string()
}

// --- Writers ---

/// Join trimmed entry text with `separator`.
pub fn to_line_delimited_text(entries: &[SubtitleEntry], separator: &str) -> String {
  entries.iter().map(|e| e.text.trim()).collect::<Vec<_>>().join(separator)
}

/// `HH:MM:SS,mmm`
pub fn format_timestamp(seconds: f64) -> String {
  let total_ms = if seconds.is_finite() && seconds > 0.0 { (seconds * 1000.0).round() as u64 } else { 0 };
  let hours = total_ms / 3_600_000;
  let minutes = (total_ms % 3_600_000) / 60_000;
  let secs = (total_ms % 60_000) / 1000;
  let millis = total_ms % 1000;
  format!("{:02}:{:02}:{:02},{:03}", hours, minutes, secs, millis)
}

/// Render SRT: index, `start --> end`, text, blank line.
pub fn to_indexed_timed_format(entries: &[SubtitleEntry]) -> String {
  let mut out = String::new();
  for (i, entry) in entries.iter().enumerate() {
    if i > 0 {
      out.push('\n');
    }
    // Writing into a String cannot fail.
    let _ = write!(
      out,
      "{}\n{} --> {}\n{}\n",
      i + 1,
      format_timestamp(entry.start),
      format_timestamp(entry.end),
      entry.text
    );
  }
  out
}

/// Sort by start, then left-fold every entry that starts within `max_gap`
/// of the running entry's end (overlaps included) into it.
pub fn merge_adjacent(entries: &[SubtitleEntry], max_gap: f64) -> Vec<SubtitleEntry> {
  let mut sorted = entries.to_vec();
  sort_by_start(&mut sorted);

  let mut merged = Vec::with_capacity(sorted.len());
  let mut iter = sorted.into_iter();
  let Some(mut current) = iter.next() else { return merged };

  for next in iter {
    if next.start - current.end <= max_gap {
      current.end = current.end.max(next.end);
      current.text.push(' ');
      current.text.push_str(&next.text);
    } else {
      merged.push(std::mem::replace(&mut current, next));
    }
  }
  merged.push(current);
  merged
}
