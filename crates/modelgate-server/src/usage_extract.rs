//! Token-usage extraction from forwarded response bodies.
//!
//! The gateway streams upstream bytes straight to the client while
//! feeding each chunk through a [`UsageScanner`], so token counts come
//! out of provider response metadata without buffering the whole body.
//! JSON bodies are parsed once at stream close; SSE bodies are scanned
//! line by line and the last `usage` object seen wins (OpenAI-style
//! streams send it in the final chunk).
//!
//! A response without usage metadata yields zeros — counts are never
//! estimated.

/// Upper bound on buffered bytes for usage extraction. Bodies past this
/// still stream through; only the extraction gives up.
const SCAN_CAP: usize = 1 << 20;

/// Extracted token counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: i64,
    pub output: i64,
}

enum Mode {
    /// Buffer the body and parse once at close.
    Json,
    /// Scan `data:` lines as they stream.
    Sse,
}

/// Incremental scanner fed with response chunks.
pub struct UsageScanner {
    mode: Mode,
    buffer: Vec<u8>,
    usage: Option<TokenUsage>,
}

impl UsageScanner {
    /// Choose the scanning mode from the upstream content type.
    #[must_use]
    pub fn new(content_type: Option<&str>) -> Self {
        let mode = if content_type.is_some_and(|ct| ct.starts_with("text/event-stream")) {
            Mode::Sse
        } else {
            Mode::Json
        };
        Self {
            mode,
            buffer: Vec::new(),
            usage: None,
        }
    }

    /// Feed one body chunk.
    pub fn feed(&mut self, chunk: &[u8]) {
        match self.mode {
            Mode::Json => {
                if self.buffer.len() < SCAN_CAP {
                    self.buffer.extend_from_slice(chunk);
                }
            }
            Mode::Sse => {
                self.buffer.extend_from_slice(chunk);
                while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                    self.scan_sse_line(&line);
                }
                // A pathological stream without newlines must not grow
                // unbounded.
                if self.buffer.len() > SCAN_CAP {
                    self.buffer.clear();
                }
            }
        }
    }

    /// Close the scanner and return the counts (zeros when the upstream
    /// omitted usage metadata).
    #[must_use]
    pub fn finish(mut self) -> TokenUsage {
        match self.mode {
            Mode::Json => {
                if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&self.buffer) {
                    if let Some(usage) = usage_from_value(&value) {
                        self.usage = Some(usage);
                    }
                }
            }
            Mode::Sse => {
                let rest = std::mem::take(&mut self.buffer);
                self.scan_sse_line(&rest);
            }
        }
        self.usage.unwrap_or_default()
    }

    fn scan_sse_line(&mut self, line: &[u8]) {
        let Ok(text) = std::str::from_utf8(line) else {
            return;
        };
        let Some(data) = text.trim().strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(data) {
            if let Some(usage) = usage_from_value(&value) {
                // Last-seen wins; streams report cumulative counts.
                self.usage = Some(usage);
            }
        }
    }
}

/// Read a `usage` object, accepting both OpenAI (`prompt_tokens`/
/// `completion_tokens`) and Anthropic (`input_tokens`/`output_tokens`)
/// key styles.
fn usage_from_value(value: &serde_json::Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    if !usage.is_object() {
        return None;
    }
    let read = |keys: [&str; 2]| {
        keys.iter()
            .find_map(|key| usage.get(*key))
            .and_then(serde_json::Value::as_i64)
            .unwrap_or(0)
    };
    Some(TokenUsage {
        input: read(["prompt_tokens", "input_tokens"]),
        output: read(["completion_tokens", "output_tokens"]),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn json_body_with_usage() {
        let mut scanner = UsageScanner::new(Some("application/json"));
        let body = br#"{"id":"r-1","usage":{"prompt_tokens":20,"completion_tokens":5}}"#;
        // Split across chunks.
        scanner.feed(&body[..10]);
        scanner.feed(&body[10..]);
        assert_eq!(scanner.finish(), TokenUsage { input: 20, output: 5 });
    }

    #[test]
    fn json_body_without_usage_is_zero() {
        let mut scanner = UsageScanner::new(Some("application/json"));
        scanner.feed(br#"{"id":"r-1"}"#);
        assert_eq!(scanner.finish(), TokenUsage::default());
    }

    #[test]
    fn anthropic_key_style_is_accepted() {
        let mut scanner = UsageScanner::new(Some("application/json"));
        scanner.feed(br#"{"usage":{"input_tokens":7,"output_tokens":3}}"#);
        assert_eq!(scanner.finish(), TokenUsage { input: 7, output: 3 });
    }

    #[test]
    fn sse_stream_takes_the_last_usage() {
        let mut scanner = UsageScanner::new(Some("text/event-stream"));
        scanner.feed(b"data: {\"choices\":[{}]}\n\n");
        scanner.feed(b"data: {\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":1}}\n\n");
        scanner.feed(b"data: {\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":4}}\n\n");
        scanner.feed(b"data: [DONE]\n\n");
        assert_eq!(scanner.finish(), TokenUsage { input: 10, output: 4 });
    }

    #[test]
    fn sse_line_split_across_chunks() {
        let mut scanner = UsageScanner::new(Some("text/event-stream"));
        scanner.feed(b"data: {\"usage\":{\"prompt_to");
        scanner.feed(b"kens\":8,\"completion_tokens\":2}}\n");
        assert_eq!(scanner.finish(), TokenUsage { input: 8, output: 2 });
    }

    #[test]
    fn sse_final_line_without_newline_counts() {
        let mut scanner = UsageScanner::new(Some("text/event-stream"));
        scanner.feed(b"data: {\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":1}}");
        assert_eq!(scanner.finish(), TokenUsage { input: 3, output: 1 });
    }

    #[test]
    fn malformed_body_yields_zero() {
        let mut scanner = UsageScanner::new(Some("application/json"));
        scanner.feed(b"not json at all");
        assert_eq!(scanner.finish(), TokenUsage::default());
    }
}
