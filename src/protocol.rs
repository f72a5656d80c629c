//! Wire formats for the exec and log-stream endpoints.
//!
//! Exec connections carry raw keystrokes out, raw shell output in, and one
//! out-of-band control line: `resize:<cols>,<rows>`.
//!
//! Log connections carry JSON envelopes `{"type": ..., "data": ...}`. Peers
//! that do not envelope their output are tolerated: any frame that does not
//! decode as an envelope is treated as one raw log line.

use bytes::Bytes;
use serde::Deserialize;

use crate::logstream::LogFilter;
use crate::session::ExecTarget;
use crate::transport::{url_encode, WireFrame};

/// Prefix of the resize control line.
pub const RESIZE_PREFIX: &str = "resize:";

/// Build the exec URL for a target under `base` (e.g. `ws://host:8080`).
pub fn exec_url(base: &str, target: &ExecTarget) -> String {
    format!(
        "{}/api/clusters/{}/namespaces/{}/pods/{}/exec?container={}",
        base.trim_end_matches('/'),
        url_encode(&target.context),
        url_encode(&target.namespace),
        url_encode(&target.pod),
        url_encode(&target.container),
    )
}

/// Build the log-stream URL with one repeated query parameter per filter value.
pub fn log_stream_url(base: &str, filter: &LogFilter) -> String {
    let dimensions = [
        ("clusters", &filter.clusters),
        ("namespaces", &filter.namespaces),
        ("pods", &filter.pods),
        ("containers", &filter.containers),
        ("logLevels", &filter.levels),
    ];
    let query: Vec<String> = dimensions
        .iter()
        .flat_map(|(key, values)| {
            values
                .iter()
                .map(move |value| format!("{}={}", key, url_encode(value)))
        })
        .collect();

    let mut url = format!("{}/api/logs/stream", base.trim_end_matches('/'));
    if !query.is_empty() {
        url.push('?');
        url.push_str(&query.join("&"));
    }
    url
}

/// Encode terminal input. Bytes are never altered; UTF-8 goes out as text.
pub fn encode_input(data: Bytes) -> WireFrame {
    match String::from_utf8(data.to_vec()) {
        Ok(text) => WireFrame::Text(text),
        Err(_) => WireFrame::Binary(data),
    }
}

/// Encode a resize control frame.
pub fn encode_resize(cols: u16, rows: u16) -> WireFrame {
    WireFrame::Text(format!("{RESIZE_PREFIX}{cols},{rows}"))
}

/// Decode exec output. Both frame kinds are appended verbatim.
pub fn decode_output(frame: WireFrame) -> Bytes {
    frame.into_bytes()
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not a log envelope: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// A classified log-stream unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogMessage {
    Log(String),
    Info(String),
    Error(String),
    /// Envelope with a type this client does not know; carries the type.
    Ignored(String),
}

/// Decode a JSON envelope strictly.
pub fn parse_envelope(text: &str) -> Result<LogMessage, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    let data = match envelope.data {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    };
    Ok(match envelope.kind.as_str() {
        "log" => LogMessage::Log(data),
        "info" => LogMessage::Info(data),
        "end" if data.is_empty() => LogMessage::Info("stream ended".to_string()),
        "end" => LogMessage::Info(data),
        "error" => LogMessage::Error(data),
        _ => LogMessage::Ignored(envelope.kind),
    })
}

/// Classify an inbound log frame, falling back to raw text.
pub fn classify(frame: &WireFrame) -> LogMessage {
    let text = match frame {
        WireFrame::Text(text) => std::borrow::Cow::Borrowed(text.as_str()),
        WireFrame::Binary(data) => String::from_utf8_lossy(data),
    };
    match parse_envelope(&text) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(error = %e, "treating frame as raw log text");
            LogMessage::Log(text.into_owned())
        }
    }
}
