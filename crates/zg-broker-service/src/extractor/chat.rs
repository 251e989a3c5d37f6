//! Chat completions extractor.
//!
//! Billable units are whitespace-separated words. Responses may be a single
//! JSON document or a server-sent event stream of `data: {...}` lines ending
//! with `data: [DONE]`.

use serde::Deserialize;

use super::{decode_body, ExtractError, ReqRespExtractor};

const SSE_DATA_PREFIX: &str = "data:";
const SSE_DONE: &str = "[DONE]";

/// Extractor for OpenAI-compatible `/chat/completions`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatCompletions;

#[derive(Debug, Deserialize)]
struct ChatRequest {
    messages: Vec<RequestMessage>,
}

#[derive(Debug, Deserialize)]
struct RequestMessage {
    #[serde(default)]
    content: Option<MessageContent>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ResponseMessage>,
    #[serde(default)]
    delta: Option<ResponseMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// Yield the JSON payloads of a fragment, skipping blank lines, SSE fields
/// other than `data` and the `[DONE]` sentinel. A plain JSON body yields
/// itself.
fn payloads(chunk: &[u8]) -> Result<Vec<&str>, ExtractError> {
    let text = std::str::from_utf8(chunk).map_err(|e| {
        ExtractError::Decode(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;

    let is_event_stream = text
        .lines()
        .any(|line| line.trim_start().starts_with(SSE_DATA_PREFIX));
    if !is_event_stream {
        let body = text.trim();
        return Ok(if body.is_empty() || body == SSE_DONE {
            Vec::new()
        } else {
            vec![body]
        });
    }

    // The first line may have lost its prefix to `response_content`.
    Ok(text
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            match line.strip_prefix(SSE_DATA_PREFIX) {
                Some(data) => Some(data.trim_start()),
                None => line.starts_with('{').then_some(line),
            }
        })
        .filter(|line| !line.is_empty() && *line != SSE_DONE)
        .collect())
}

fn contains_done(chunk: &[u8]) -> bool {
    std::str::from_utf8(chunk).is_ok_and(|text| {
        text.lines().any(|line| {
            let line = line.trim();
            line.strip_prefix(SSE_DATA_PREFIX)
                .map_or(line, str::trim_start)
                == SSE_DONE
        })
    })
}

impl ReqRespExtractor for ChatCompletions {
    fn input_count(&self, body: &[u8]) -> Result<u64, ExtractError> {
        let request: ChatRequest = serde_json::from_slice(body)?;
        Ok(request
            .messages
            .iter()
            .filter_map(|m| m.content.as_ref())
            .map(|content| match content {
                MessageContent::Text(text) => word_count(text),
                MessageContent::Parts(parts) => parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .map(word_count)
                    .sum(),
            })
            .sum())
    }

    fn output_count(&self, chunks: &[&[u8]]) -> Result<u64, ExtractError> {
        let mut total = 0;
        for chunk in chunks {
            for payload in payloads(chunk)? {
                let response: ChatResponse = serde_json::from_str(payload)?;
                total += response
                    .choices
                    .iter()
                    .filter_map(|c| c.message.as_ref().or(c.delta.as_ref()))
                    .filter_map(|m| m.content.as_deref())
                    .map(word_count)
                    .sum::<u64>();
            }
        }
        Ok(total)
    }

    fn stream_completed(&self, chunk: &[u8]) -> Result<bool, ExtractError> {
        if contains_done(chunk) {
            return Ok(true);
        }
        for payload in payloads(chunk)? {
            let response: ChatResponse = serde_json::from_str(payload)?;
            if response.choices.iter().any(|c| c.finish_reason.is_some()) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn response_content(
        &self,
        body: &[u8],
        encoding: Option<&str>,
    ) -> Result<Vec<u8>, ExtractError> {
        let decoded = decode_body(body, encoding)?;
        let start = decoded
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(decoded.len());
        let trimmed = &decoded[start..];
        Ok(trimmed
            .strip_prefix(b"data: ")
            .unwrap_or(trimmed)
            .to_vec())
    }
}
