//! WebVTT transcript parsing: cues with `<v Speaker>` voice spans become
//! transcript messages, with consecutive same-speaker cues merged.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;

use memoir_core::{ConversationMessage, MessageMeta};

/// One parsed cue.
#[derive(Debug, Clone, PartialEq)]
pub struct VttCue {
    pub start: Duration,
    pub end: Duration,
    pub speaker: Option<String>,
    pub text: String,
}

/// Parse `HH:MM:SS.mmm` or `MM:SS.mmm` cue timestamps.
fn parse_cue_timestamp(text: &str) -> Result<Duration> {
    let parts: Vec<&str> = text.trim().split(':').collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [h, m, s] => (h.parse::<u64>()?, m.parse::<u64>()?, s.parse::<f64>()?),
        [m, s] => (0, m.parse::<u64>()?, s.parse::<f64>()?),
        _ => return Err(anyhow!("invalid cue timestamp {text:?}")),
    };
    Ok(Duration::from_secs_f64(
        (hours * 3600 + minutes * 60) as f64 + seconds,
    ))
}

/// Parse the cues of one WebVTT document.
pub fn parse_vtt(content: &str) -> Result<Vec<VttCue>> {
    let voice_tag = Regex::new(r"<v\s+([^>]+)>").expect("voice tag pattern is valid");
    let any_tag = Regex::new(r"</?[^>]+>").expect("tag pattern is valid");

    let mut cues = Vec::new();
    let mut lines = content.lines().peekable();
    while let Some(line) = lines.next() {
        let Some((start_text, end_text)) = line.split_once("-->") else {
            continue;
        };
        let start = parse_cue_timestamp(start_text)?;
        // Cue settings may trail the end timestamp.
        let end_text = end_text.trim().split_whitespace().next().unwrap_or("");
        let end = parse_cue_timestamp(end_text)?;

        let mut payload = String::new();
        while let Some(&next) = lines.peek() {
            if next.trim().is_empty() {
                break;
            }
            if !payload.is_empty() {
                payload.push(' ');
            }
            payload.push_str(next.trim());
            lines.next();
        }

        let speaker = voice_tag
            .captures(&payload)
            .map(|captures| captures[1].trim().to_string());
        let text = any_tag.replace_all(&payload, "").trim().to_string();
        if text.is_empty() {
            continue;
        }
        cues.push(VttCue {
            start,
            end,
            speaker,
            text,
        });
    }
    Ok(cues)
}

/// Turn cues into transcript messages: consecutive cues from the same
/// speaker merge into one message; every other speaker in the transcript
/// becomes a listener.
pub fn messages_from_cues(
    cues: &[VttCue],
    start_date: Option<DateTime<Utc>>,
) -> Vec<ConversationMessage> {
    let speakers: Vec<String> = {
        let mut seen = Vec::new();
        for cue in cues {
            if let Some(speaker) = &cue.speaker {
                if !seen.contains(speaker) {
                    seen.push(speaker.clone());
                }
            }
        }
        seen
    };

    let mut merged: Vec<(Option<String>, String, Duration)> = Vec::new();
    for cue in cues {
        match merged.last_mut() {
            Some((speaker, text, _)) if *speaker == cue.speaker => {
                text.push(' ');
                text.push_str(&cue.text);
            }
            _ => merged.push((cue.speaker.clone(), cue.text.clone(), cue.start)),
        }
    }

    merged
        .into_iter()
        .map(|(speaker, text, offset)| {
            let listeners = speaker
                .as_ref()
                .map(|current| {
                    speakers
                        .iter()
                        .filter(|other| *other != current)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            let mut message = ConversationMessage::new(
                vec![text],
                MessageMeta::Transcript { speaker, listeners },
            );
            if let Some(base) = start_date {
                let timestamp = base + chrono::Duration::milliseconds(offset.as_millis() as i64);
                message.timestamp = Some(timestamp.to_rfc3339());
            }
            message
        })
        .collect()
}

/// Parse one VTT file into transcript messages.
pub fn parse_vtt_file(
    path: &Path,
    start_date: Option<DateTime<Utc>>,
) -> Result<Vec<ConversationMessage>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let cues = parse_vtt(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(messages_from_cues(&cues, start_date))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "WEBVTT\n\n\
        00:00:01.000 --> 00:00:04.000\n\
        <v Alice>Hello there Bob.</v>\n\n\
        00:00:04.000 --> 00:00:06.000\n\
        <v Alice>How have you been?</v>\n\n\
        00:00:06.500 --> 00:00:09.000\n\
        <v Bob>Pretty well, thanks.</v>\n";

    #[test]
    fn cues_parse_with_speakers() {
        let cues = parse_vtt(SAMPLE).unwrap();
        assert_eq!(cues.len(), 3);
        assert_eq!(cues[0].speaker.as_deref(), Some("Alice"));
        assert_eq!(cues[0].text, "Hello there Bob.");
        assert_eq!(cues[0].start, Duration::from_secs(1));
        assert_eq!(cues[2].speaker.as_deref(), Some("Bob"));
    }

    #[test]
    fn consecutive_same_speaker_cues_merge() {
        let cues = parse_vtt(SAMPLE).unwrap();
        let messages = messages_from_cues(&cues, None);
        assert_eq!(messages.len(), 2);
        assert_eq!(
            messages[0].text_chunks[0],
            "Hello there Bob. How have you been?"
        );
        match &messages[0].metadata {
            MessageMeta::Transcript { speaker, listeners } => {
                assert_eq!(speaker.as_deref(), Some("Alice"));
                assert_eq!(listeners, &vec!["Bob".to_string()]);
            }
            other => panic!("unexpected metadata {other:?}"),
        }
    }

    #[test]
    fn start_date_offsets_cue_times() {
        use chrono::TimeZone;
        let cues = parse_vtt(SAMPLE).unwrap();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let messages = messages_from_cues(&cues, Some(base));
        assert_eq!(
            messages[0].timestamp.as_deref(),
            Some("2024-01-01T00:00:01+00:00")
        );
    }

    #[test]
    fn hours_and_minutes_formats_both_parse() {
        assert_eq!(
            parse_cue_timestamp("01:02:03.500").unwrap(),
            Duration::from_secs_f64(3723.5)
        );
        assert_eq!(
            parse_cue_timestamp("02:03.500").unwrap(),
            Duration::from_secs_f64(123.5)
        );
        assert!(parse_cue_timestamp("nope").is_err());
    }
}
