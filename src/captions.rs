#![forbid(unsafe_code)]

//! Normalizer for the "json3" timed-caption documents served by caption CDNs.
//!
//! The format is external and only loosely specified, so every field is
//! treated as optional. Anything malformed degrades to "skip this event" or
//! an empty result; this module never returns an error and never panics.

use serde::Serialize;
use serde_json::Value;

/// One plain-text caption line with absolute timing in seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaptionSegment {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

/// Converts a json3 caption document into ordered text segments.
///
/// Each event contributes at most one segment: the `utf8` fragments of its
/// `segs` array are concatenated, newlines become spaces, and the result is
/// trimmed. Events without usable text are dropped, so the output can be
/// shorter than the `events` array. A document without an `events` array
/// yields an empty vec.
pub fn parse_json3_captions(document: &Value) -> Vec<CaptionSegment> {
    let Some(events) = document.get("events").and_then(Value::as_array) else {
        return Vec::new();
    };

    let mut segments = Vec::new();
    for event in events {
        let Some(segs) = event.get("segs").and_then(Value::as_array) else {
            continue;
        };

        let mut combined = String::new();
        for seg in segs {
            if let Some(fragment) = seg.get("utf8").and_then(Value::as_str) {
                combined.push_str(fragment);
            }
        }

        let text = combined.replace('\n', " ");
        let text = text.trim();
        if text.is_empty() {
            continue;
        }

        let start = millis_field(event, "tStartMs") / 1000.0;
        // Negative durations have been observed on broken tracks; clamp so
        // `end >= start` always holds.
        let duration = (millis_field(event, "dDurationMs") / 1000.0).max(0.0);

        segments.push(CaptionSegment {
            text: text.to_string(),
            start,
            end: start + duration,
        });
    }

    segments
}

fn millis_field(event: &Value, key: &str) -> f64 {
    event.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}
