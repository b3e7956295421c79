use crate::FleetState;
use serde_json::Value;
use thiserror::Error;
use url::Url;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
pub const LIVE_SOCKET_PATH: &str = "/ws";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("snapshot must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    #[error("stream ended inside an event ({0} bytes discarded)")]
    Truncated(usize),
    #[error("unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<WireError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> DecodeReport<T> {
    fn push_frame(&mut self, frame: T) {
        self.frames.push(frame);
    }

    fn push_error(&mut self, error: WireError) {
        self.errors.push(error);
    }
}

/// Decodes one live-socket payload. Every payload is a whole snapshot,
/// never a patch, so callers replace their copy wholesale.
pub fn decode_snapshot(payload: &str) -> Result<FleetState, WireError> {
    decode_snapshot_with_limit(payload, DEFAULT_MAX_FRAME_BYTES)
}

pub fn decode_snapshot_with_limit(
    payload: &str,
    max_frame_bytes: usize,
) -> Result<FleetState, WireError> {
    if payload.len() > max_frame_bytes {
        return Err(WireError::OversizedFrame {
            size: payload.len(),
            max: max_frame_bytes,
        });
    }
    let value: Value =
        serde_json::from_str(payload).map_err(|err| WireError::Decode(err.to_string()))?;
    if !value.is_object() {
        return Err(WireError::NotAnObject(json_kind(&value)));
    }
    serde_json::from_value(value).map_err(|err| WireError::Decode(err.to_string()))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Derives the live socket endpoint from the dashboard's HTTP base url:
/// `http` becomes `ws`, `https` becomes `wss`, and the path is `/ws`.
pub fn live_socket_url(base: &Url) -> Result<Url, WireError> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(WireError::UnsupportedScheme(other.to_string())),
    };
    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|_| WireError::UnsupportedScheme(base.scheme().to_string()))?;
    url.set_path(LIVE_SOCKET_PATH);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Resolves a per-use event stream endpoint such as `/api/logs/42/stream`.
pub fn stream_url(base: &Url, path: &str) -> Result<Url, WireError> {
    base.join(path)
        .map_err(|err| WireError::InvalidEndpoint(format!("{path}: {err}")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` decoder. `data:` lines accumulate and a
/// blank line emits the event; comment lines start with `:`.
pub struct SseFrameDecoder {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    data: Vec<String>,
    data_bytes: usize,
    event: Option<String>,
    id: Option<String>,
    overflowed: bool,
}

impl SseFrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            data: Vec::new(),
            data_bytes: 0,
            event: None,
            id: None,
            overflowed: false,
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<SseEvent> {
        let mut report = DecodeReport::default();
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            line.pop();
            if line.ends_with(b"\r") {
                line.pop();
            }
            self.process_line(&line, &mut report);
        }

        if self.pending.len() > self.max_frame_bytes {
            report.push_error(WireError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
            self.reset_event();
        }

        report
    }

    /// Ends the stream. A trailing event without its blank line is discarded.
    pub fn finish(&mut self) -> DecodeReport<SseEvent> {
        let mut report = DecodeReport::default();
        if !self.pending.is_empty() {
            let mut line = std::mem::take(&mut self.pending);
            if line.ends_with(b"\r") {
                line.pop();
            }
            self.process_line(&line, &mut report);
        }
        if !self.data.is_empty() {
            report.push_error(WireError::Truncated(self.data_bytes));
        }
        self.reset_event();
        report
    }

    fn process_line(&mut self, line: &[u8], report: &mut DecodeReport<SseEvent>) {
        if line.is_empty() {
            self.dispatch(report);
            return;
        }
        let line = match std::str::from_utf8(line) {
            Ok(value) => value,
            Err(err) => {
                report.push_error(WireError::Decode(format!("invalid utf-8 in stream: {err}")));
                return;
            }
        };
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => {
                if self.overflowed {
                    return;
                }
                self.data_bytes += value.len() + 1;
                if self.data_bytes > self.max_frame_bytes {
                    report.push_error(WireError::OversizedFrame {
                        size: self.data_bytes,
                        max: self.max_frame_bytes,
                    });
                    self.data.clear();
                    self.overflowed = true;
                    return;
                }
                self.data.push(value.to_string());
            }
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self, report: &mut DecodeReport<SseEvent>) {
        if self.data.is_empty() {
            self.reset_event();
            return;
        }
        let data = self.data.join("\n");
        report.push_frame(SseEvent {
            event: self.event.take(),
            id: self.id.take(),
            data,
        });
        self.reset_event();
    }

    fn reset_event(&mut self) {
        self.data.clear();
        self.data_bytes = 0;
        self.event = None;
        self.id = None;
        self.overflowed = false;
    }
}

impl Default for SseFrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}
