//! Incremental server-sent-event decoding and utterance assembly.
//!
//! [`SseDecoder`] turns arbitrary byte chunks into complete events (blank
//! line separated, `event:` and `data:` fields, `\n` or `\r\n` line endings).
//! [`TranscriptAssembler`] interprets those events as speech-to-text
//! progress and yields one string per finished utterance.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    /// `data` parsed as JSON, when it is JSON
    pub json: Option<Value>,
}

impl SseEvent {
    /// The semantic type: the JSON `type` field, else the `event:` name.
    pub fn kind(&self) -> Option<&str> {
        self.json
            .as_ref()
            .and_then(|json| json.get("type"))
            .and_then(Value::as_str)
            .or(self.event.as_deref())
    }

    fn field(&self, name: &str) -> Option<&str> {
        self.json
            .as_ref()
            .and_then(|json| json.get(name))
            .and_then(Value::as_str)
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every event completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.take_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush an event left unterminated when the stream ended.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
            self.take_line(&line);
        }
        self.dispatch()
    }

    fn take_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        let json = serde_json::from_str(&data).ok();
        Some(SseEvent { event, data, json })
    }
}

/// Accumulates transcription deltas and emits finished utterances.
#[derive(Debug, Default)]
pub struct TranscriptAssembler {
    buffer: String,
    last_item: Option<String>,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }

    pub fn apply(&mut self, event: &SseEvent) -> Option<String> {
        let kind = event.kind()?;
        // The assistant's own output must not be fed back in as user speech.
        if kind.starts_with("response.") {
            return None;
        }

        if kind == "conversation.item.completed" {
            let item = event.json.as_ref()?.get("item")?;
            let role = item.get("role").and_then(Value::as_str);
            if role.is_some_and(|role| role != "user") {
                return None;
            }
            let text = content_text(item);
            self.buffer.clear();
            let item_id = item.get("id").and_then(Value::as_str);
            return self.emit(text, item_id);
        }

        if kind.ends_with(".delta") {
            if let Some(delta) = event.field("delta") {
                self.buffer.push_str(delta);
            }
            return None;
        }

        if kind.ends_with(".done") || kind.ends_with(".completed") {
            let text = event
                .field("transcript")
                .or_else(|| event.field("text"))
                .filter(|text| !text.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| self.buffer.clone());
            self.buffer.clear();
            return self.emit(text, event.field("item_id"));
        }

        None
    }

    fn emit(&mut self, text: String, item_id: Option<&str>) -> Option<String> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        if let Some(id) = item_id {
            if self.last_item.as_deref() == Some(id) {
                return None;
            }
            self.last_item = Some(id.to_string());
        }
        Some(text.to_string())
    }
}

fn content_text(item: &Value) -> String {
    item.get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|block| {
                    block
                        .get("transcript")
                        .or_else(|| block.get("text"))
                        .and_then(Value::as_str)
                })
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(chunks: &[&str]) -> Vec<SseEvent> {
        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(decoder.push(chunk.as_bytes()));
        }
        events.extend(decoder.finish());
        events
    }

    #[test]
    fn events_split_across_chunks() {
        let events = decode_all(&[
            "event: transcript.delta\nda",
            "ta: {\"delta\":\"hel\"}\n",
            "\nevent: ping\ndata: not json\n\n",
        ]);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("transcript.delta"));
        assert_eq!(events[0].json.as_ref().and_then(|j| j["delta"].as_str()), Some("hel"));
        assert_eq!(events[1].data, "not json");
        assert!(events[1].json.is_none());
    }

    #[test]
    fn crlf_multi_data_and_comments() {
        let events = decode_all(&[": keepalive\r\n\r\ndata: line one\r\ndata: line two\r\n\r\n"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line one\nline two");
        assert_eq!(events[0].event, None);
    }

    #[test]
    fn unterminated_event_is_flushed_on_finish() {
        let events = decode_all(&["data: {\"type\":\"x.done\"}"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), Some("x.done"));
    }

    #[test]
    fn multibyte_text_split_mid_character() {
        let bytes = "data: {\"delta\":\"héllo\"}\n\n".as_bytes();
        let split = bytes.iter().position(|b| *b == 0xC3).expect("multibyte start") + 1;
        let mut decoder = SseDecoder::new();
        let mut events = decoder.push(&bytes[..split]);
        events.extend(decoder.push(&bytes[split..]));
        assert_eq!(events[0].json.as_ref().and_then(|j| j["delta"].as_str()), Some("héllo"));
    }

    fn event(json: &str) -> SseEvent {
        SseEvent {
            event: None,
            data: json.to_string(),
            json: serde_json::from_str(json).ok(),
        }
    }

    #[test]
    fn deltas_flush_on_done() {
        let mut assembler = TranscriptAssembler::new();
        assert_eq!(assembler.apply(&event(r#"{"type":"transcript.delta","delta":"what is "}"#)), None);
        assert_eq!(assembler.apply(&event(r#"{"type":"transcript.delta","delta":"the time"}"#)), None);
        assert_eq!(assembler.pending(), "what is the time");
        assert_eq!(
            assembler.apply(&event(r#"{"type":"transcript.done"}"#)),
            Some("what is the time".to_string())
        );
        assert_eq!(assembler.pending(), "");
    }

    #[test]
    fn explicit_transcript_wins_over_buffer() {
        let mut assembler = TranscriptAssembler::new();
        assembler.apply(&event(r#"{"type":"conversation.item.input_audio_transcription.delta","delta":"wat is"}"#));
        let done = assembler.apply(&event(
            r#"{"type":"conversation.item.input_audio_transcription.completed","item_id":"item_1","transcript":"What is it?"}"#,
        ));
        assert_eq!(done, Some("What is it?".to_string()));
        assert_eq!(assembler.pending(), "");
    }

    #[test]
    fn item_completed_reads_content_blocks_once() {
        let mut assembler = TranscriptAssembler::new();
        let first = assembler.apply(&event(
            r#"{"type":"conversation.item.input_audio_transcription.completed","item_id":"item_9","transcript":"hello there"}"#,
        ));
        assert_eq!(first, Some("hello there".to_string()));
        let duplicate = assembler.apply(&event(
            r#"{"type":"conversation.item.completed","item":{"id":"item_9","role":"user","content":[{"type":"input_audio","transcript":"hello there"}]}}"#,
        ));
        assert_eq!(duplicate, None);

        let next = assembler.apply(&event(
            r#"{"type":"conversation.item.completed","item":{"id":"item_10","content":[{"type":"input_text","text":"book"},{"type":"input_text","text":"a table"}]}}"#,
        ));
        assert_eq!(next, Some("book a table".to_string()));
    }

    #[test]
    fn assistant_output_is_ignored() {
        let mut assembler = TranscriptAssembler::new();
        assert_eq!(
            assembler.apply(&event(r#"{"type":"response.audio_transcript.done","transcript":"I am the assistant"}"#)),
            None
        );
        assert_eq!(
            assembler.apply(&event(
                r#"{"type":"conversation.item.completed","item":{"role":"assistant","content":[{"text":"hi"}]}}"#
            )),
            None
        );
    }

    #[test]
    fn empty_done_emits_nothing() {
        let mut assembler = TranscriptAssembler::new();
        assert_eq!(assembler.apply(&event(r#"{"type":"transcript.done"}"#)), None);
        assert_eq!(assembler.apply(&event(r#"{"type":"session.updated"}"#)), None);
    }
}
