//! Meeting extraction and local calendar events.
//!
//! [`parse_meeting`] pulls dates, times, participants, meeting links, and
//! topic words out of free text with regular expressions and suggests a
//! title. [`CreateCalendarEventTool`] writes one iCalendar (`.ics`) file per
//! event into a configured directory, which any calendar app can import.
//!
//! | Tool | Mutating |
//! |------|----------|
//! | `parse_meeting_from_text` | no |
//! | `create_calendar_event` | yes |

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use memex_core::{MemexError, Result};

use crate::tools::{Tool, ToolContext};

const DATE_PATTERNS: &[&str] = &[
    r"\b(?:monday|tuesday|wednesday|thursday|friday|saturday|sunday)\b",
    r"\b\d{1,2}/\d{1,2}/\d{4}\b",
    r"\b\d{4}-\d{2}-\d{2}\b",
    r"\b(?:january|february|march|april|may|june|july|august|september|october|november|december)\s+\d{1,2}(?:st|nd|rd|th)?\b",
    r"\b(?:today|tomorrow|next\s+week|this\s+week)\b",
];

const TIME_PATTERNS: &[&str] = &[
    r"\b\d{1,2}:\d{2}\s*(?:am|pm)\b",
    r"\b\d{1,2}\s*(?:am|pm)\b",
    r"\b(?:morning|afternoon|evening|noon)\b",
];

const EMAIL_PATTERN: &str = r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b";

const LINK_PATTERNS: &[&str] = &[
    r"https://\S*zoom\S*",
    r"https://\S*teams\S*",
    r"https://\S*meet\S*",
    r"https://\S*webex\S*",
];

const TOPIC_KEYWORDS: &[&str] = &[
    "meeting", "discussion", "review", "standup", "sync", "planning", "strategy", "project", "demo",
    "presentation", "interview", "call", "conference", "workshop", "training",
];

const TITLE_PATTERNS: &[&str] = &[
    r"(?:meeting|call|discussion|sync)\s+(?:about|on|for|regarding)\s+([^.!?]+)",
    r"([^.!?]+)\s+(?:meeting|call|discussion|sync)",
    r"(?:let's|we should|need to)\s+(?:discuss|talk about|meet about)\s+([^.!?]+)",
];

/// What [`parse_meeting`] found. Every list is deduplicated
/// case-insensitively, in order of first appearance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeetingInfo {
    pub dates: Vec<String>,
    pub times: Vec<String>,
    pub participants: Vec<String>,
    pub meeting_links: Vec<String>,
    pub topics: Vec<String>,
    pub suggested_title: String,
    /// 0.3 for dates, 0.3 for times, 0.2 for participants, 0.1 each for
    /// topics and links.
    pub confidence: f64,
}

fn case_insensitive(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("(?i){}", pattern))
        .map_err(|e| MemexError::configuration(format!("invalid pattern {}: {}", pattern, e)))
}

/// Matches of all `patterns`, skipping any that overlap an earlier match.
fn collect_matches(text: &str, patterns: &[&str]) -> Result<Vec<String>> {
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut found = Vec::new();
    for pattern in patterns {
        for m in case_insensitive(pattern)?.find_iter(text) {
            if spans.iter().any(|&(s, e)| m.start() < e && s < m.end()) {
                continue;
            }
            spans.push((m.start(), m.end()));
            found.push(m.as_str().to_string());
        }
    }
    Ok(dedup(found))
}

fn dedup(values: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values
        .into_iter()
        .filter(|v| seen.insert(v.to_lowercase()))
        .collect()
}

pub fn parse_meeting(text: &str) -> Result<MeetingInfo> {
    let dates = collect_matches(text, DATE_PATTERNS)?;
    let times = collect_matches(text, TIME_PATTERNS)?;
    let participants = collect_matches(text, &[EMAIL_PATTERN])?;
    let meeting_links = collect_matches(text, LINK_PATTERNS)?;

    let lowered = text.to_lowercase();
    let mut topics = Vec::new();
    for keyword in TOPIC_KEYWORDS.iter().filter(|k| lowered.contains(*k)) {
        let re = case_insensitive(&format!(r"\b\w*{}\w*\b", keyword))?;
        topics.extend(re.find_iter(text).map(|m| m.as_str().to_string()));
    }
    let topics = dedup(topics);

    let suggested_title = suggest_title(text, &topics)?;

    let mut confidence: f64 = 0.0;
    for (found, weight) in [
        (!dates.is_empty(), 0.3),
        (!times.is_empty(), 0.3),
        (!participants.is_empty(), 0.2),
        (!topics.is_empty(), 0.1),
        (!meeting_links.is_empty(), 0.1),
    ] {
        if found {
            confidence += weight;
        }
    }

    Ok(MeetingInfo {
        dates,
        times,
        participants,
        meeting_links,
        topics,
        suggested_title,
        confidence: confidence.min(1.0),
    })
}

fn suggest_title(text: &str, topics: &[String]) -> Result<String> {
    for pattern in TITLE_PATTERNS {
        let Some(caps) = case_insensitive(pattern)?.captures(text) else {
            continue;
        };
        let title = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
        let len = title.chars().count();
        if len > 5 && len < 100 {
            return Ok(title_case(title));
        }
    }
    if topics.is_empty() {
        Ok("Meeting".to_string())
    } else {
        let first: Vec<&str> = topics.iter().take(2).map(String::as_str).collect();
        Ok(format!("Meeting: {}", first.join(", ")))
    }
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

pub struct ParseMeetingTool;

#[async_trait]
impl Tool for ParseMeetingTool {
    fn name(&self) -> &str {
        "parse_meeting_from_text"
    }

    fn description(&self) -> &str {
        "Parse meeting information (date, time, participants, topic) from natural language text"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text containing meeting information" }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
        let text = args["text"].as_str().unwrap_or_default();
        Ok(serde_json::to_value(parse_meeting(text)?)?)
    }
}

// ============ Event files ============

/// An event boundary: either an absolute instant or a local wall-clock
/// time without an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EventTime {
    Utc(DateTime<Utc>),
    Floating(NaiveDateTime),
}

impl EventTime {
    fn parse(field: &str, value: &str) -> Result<Self> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
            return Ok(EventTime::Utc(dt.with_timezone(&Utc)));
        }
        ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
            .map(EventTime::Floating)
            .ok_or_else(|| {
                MemexError::validation(format!(
                    "{} must be an ISO 8601 date-time like 2024-01-15T14:00:00, got '{}'",
                    field, value
                ))
            })
    }

    fn to_ics(self) -> String {
        match self {
            EventTime::Utc(dt) => dt.format("%Y%m%dT%H%M%SZ").to_string(),
            EventTime::Floating(dt) => dt.format("%Y%m%dT%H%M%S").to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct EventDraft {
    summary: String,
    start: EventTime,
    end: EventTime,
    description: String,
    location: String,
    attendees: Vec<String>,
}

impl EventDraft {
    fn from_args(args: &Value) -> Result<Self> {
        let text = |key: &str| args[key].as_str().unwrap_or_default().to_string();

        let summary = text("summary");
        if summary.trim().is_empty() {
            return Err(MemexError::validation("summary must not be empty"));
        }
        let start = EventTime::parse("start_datetime", &text("start_datetime"))?;
        let end = EventTime::parse("end_datetime", &text("end_datetime"))?;
        match (start, end) {
            (EventTime::Utc(_), EventTime::Floating(_)) | (EventTime::Floating(_), EventTime::Utc(_)) => {
                return Err(MemexError::validation(
                    "start_datetime and end_datetime must both carry an offset or neither",
                ));
            }
            _ if end <= start => {
                return Err(MemexError::validation("end_datetime must be after start_datetime"));
            }
            _ => {}
        }

        let attendees: Vec<String> = args["attendees"]
            .as_array()
            .map(|list| list.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        if let Some(bad) = attendees.iter().find(|a| !a.contains('@')) {
            return Err(MemexError::validation(format!(
                "attendee '{}' is not an email address",
                bad
            )));
        }

        Ok(Self {
            summary,
            start,
            end,
            description: text("description"),
            location: text("location"),
            attendees,
        })
    }

    fn to_ics(&self, uid: &str, stamp: DateTime<Utc>) -> String {
        let mut lines = vec![
            "BEGIN:VCALENDAR".to_string(),
            "VERSION:2.0".to_string(),
            "PRODID:-//memex//EN".to_string(),
            "BEGIN:VEVENT".to_string(),
            format!("UID:{}@memex", uid),
            format!("DTSTAMP:{}", stamp.format("%Y%m%dT%H%M%SZ")),
            format!("DTSTART:{}", self.start.to_ics()),
            format!("DTEND:{}", self.end.to_ics()),
            format!("SUMMARY:{}", escape_text(&self.summary)),
        ];
        if !self.description.is_empty() {
            lines.push(format!("DESCRIPTION:{}", escape_text(&self.description)));
        }
        if !self.location.is_empty() {
            lines.push(format!("LOCATION:{}", escape_text(&self.location)));
        }
        for attendee in &self.attendees {
            lines.push(format!("ATTENDEE:mailto:{}", attendee));
        }
        lines.push("END:VEVENT".to_string());
        lines.push("END:VCALENDAR".to_string());

        let mut out = lines.join("\r\n");
        out.push_str("\r\n");
        out
    }
}

/// RFC 5545 TEXT escaping.
fn escape_text(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace(';', "\\;")
        .replace(',', "\\,")
        .replace("\r\n", "\\n")
        .replace('\n', "\\n")
}

/// Writes confirmed events as `.ics` files.
pub struct CreateCalendarEventTool {
    events_dir: PathBuf,
}

impl CreateCalendarEventTool {
    pub fn new(events_dir: impl Into<PathBuf>) -> Self {
        Self {
            events_dir: events_dir.into(),
        }
    }

    pub fn events_dir(&self) -> &Path {
        &self.events_dir
    }
}

#[async_trait]
impl Tool for CreateCalendarEventTool {
    fn name(&self) -> &str {
        "create_calendar_event"
    }

    fn description(&self) -> &str {
        "Create a new calendar event. Use this when the user asks to schedule a meeting or add something to their calendar"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "summary": { "type": "string", "description": "Event title" },
                "start_datetime": {
                    "type": "string",
                    "description": "Start in ISO format, e.g. 2024-01-15T14:00:00"
                },
                "end_datetime": {
                    "type": "string",
                    "description": "End in ISO format, e.g. 2024-01-15T15:00:00"
                },
                "description": { "type": "string", "default": "" },
                "location": { "type": "string", "default": "" },
                "attendees": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Attendee email addresses",
                    "default": []
                }
            },
            "required": ["summary", "start_datetime", "end_datetime"]
        })
    }

    fn is_mutating(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
        let draft = EventDraft::from_args(&args)?;
        let uid = Uuid::new_v4().to_string();
        let body = draft.to_ics(&uid, Utc::now());

        tokio::fs::create_dir_all(&self.events_dir)
            .await
            .map_err(|e| MemexError::storage(format!("{}: {}", self.events_dir.display(), e)))?;
        let path = self.events_dir.join(format!("{}.ics", uid));
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| MemexError::storage(format!("{}: {}", path.display(), e)))?;

        info!(event_id = %uid, path = %path.display(), "created calendar event");
        Ok(json!({
            "event_id": uid,
            "path": path.display().to_string(),
            "summary": draft.summary,
            "attendees": draft.attendees,
        }))
    }
}
