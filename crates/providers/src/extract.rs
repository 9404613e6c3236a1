//! Response text extraction and SSE line parsing.

/// Pull the generated text out of a provider response body.
///
/// Understands Gemini (`candidates[0].content.parts[0].text`) and
/// OpenAI-style (`choices[0].message.content`) shapes. Returns an empty
/// string when neither matches.
pub fn extract_ai_text(raw: &serde_json::Value) -> String {
    if let Some(text) = raw
        .pointer("/candidates/0/content/parts/0/text")
        .and_then(|v| v.as_str())
    {
        return text.to_string();
    }
    if let Some(text) = raw
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
    {
        return text.to_string();
    }
    String::new()
}

/// One parsed line of an OpenAI-style event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// A content delta.
    Text(String),
    /// `data: [DONE]`
    Done,
    /// Blank lines, comments, other fields, and deltas without content.
    Ignore,
}

pub fn parse_sse_line(line: &str) -> SseLine {
    let line = line.trim_end_matches('\r');
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Ignore;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<serde_json::Value>(data) {
        Ok(value) => match value.pointer("/choices/0/delta/content").and_then(|v| v.as_str()) {
            Some(text) if !text.is_empty() => SseLine::Text(text.to_string()),
            _ => SseLine::Ignore,
        },
        Err(e) => {
            tracing::trace!(error = %e, "Skipping unparseable stream line");
            SseLine::Ignore
        }
    }
}

/// Splits a byte stream into lines. A line is decoded only once its
/// newline has arrived, so multi-byte characters may straddle reads.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            lines.push(String::from_utf8_lossy(&line[..end]).into_owned());
        }
        lines
    }

    /// The trailing line that never got a newline, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_openai_content() {
        let raw = json!({ "choices": [{ "message": { "role": "assistant", "content": "Chapter one." } }] });
        assert_eq!(extract_ai_text(&raw), "Chapter one.");
    }

    #[test]
    fn extracts_gemini_text() {
        let raw = json!({ "candidates": [{ "content": { "parts": [{ "text": "Rain fell." }] } }] });
        assert_eq!(extract_ai_text(&raw), "Rain fell.");
    }

    #[test]
    fn unknown_shape_yields_empty() {
        assert_eq!(extract_ai_text(&json!({ "output": "x" })), "");
    }

    #[test]
    fn sse_lines() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#),
            SseLine::Text("Hel".into())
        );
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive"), SseLine::Ignore);
        assert_eq!(parse_sse_line(""), SseLine::Ignore);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            SseLine::Ignore
        );
        assert_eq!(parse_sse_line("data: not json"), SseLine::Ignore);
    }

    #[test]
    fn line_buffer_keeps_split_characters_intact() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"你好\"}}]}\n";
        let bytes = line.as_bytes();
        let split = line.find('你').unwrap() + 1;

        let mut buffer = LineBuffer::new();
        assert!(buffer.push(&bytes[..split]).is_empty());
        let lines = buffer.push(&bytes[split..]);
        assert_eq!(lines.len(), 1);
        assert_eq!(parse_sse_line(&lines[0]), SseLine::Text("你好".into()));
        assert_eq!(buffer.finish(), None);

        assert!(buffer.push(b"data: [DO").is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("data: [DO"));
    }
}
