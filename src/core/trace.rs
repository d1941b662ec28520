//! Forwarded-frame trace sink
//!
//! Records every frame a proxy forwards, for offline inspection.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Trace file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceFormat {
    /// Lossy UTF-8 text
    #[default]
    Text,
    /// Hex dump
    Hex,
    /// JSON lines
    JsonLines,
}

impl TraceFormat {
    /// Get file extension for format
    pub fn extension(&self) -> &'static str {
        match self {
            TraceFormat::Text => "txt",
            TraceFormat::Hex => "hex",
            TraceFormat::JsonLines => "jsonl",
        }
    }

    /// Name as accepted by `from_str`
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceFormat::Text => "text",
            TraceFormat::Hex => "hex",
            TraceFormat::JsonLines => "json_lines",
        }
    }
}

impl FromStr for TraceFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(TraceFormat::Text),
            "hex" => Ok(TraceFormat::Hex),
            "json_lines" | "jsonl" => Ok(TraceFormat::JsonLines),
            other => Err(format!("unknown trace format: {}", other)),
        }
    }
}

/// Where and how to trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Output file, appended to
    pub path: PathBuf,
    /// Line format
    #[serde(default)]
    pub format: TraceFormat,
}

/// Frame direction as seen from the real transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Forwarded to the transport on behalf of a subscriber
    Tx,
    /// Read from the transport
    Rx,
}

impl Direction {
    fn label(&self) -> &'static str {
        match self {
            Direction::Tx => "TX",
            Direction::Rx => "RX",
        }
    }
}

/// A single trace entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    /// When the frame was forwarded
    pub timestamp: DateTime<Local>,
    /// Direction
    pub direction: Direction,
    /// Sending subscriber, for TX entries
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Routing or source id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<u32>,
    /// Payload
    #[serde(with = "crate::core::hex_serde")]
    pub data: Vec<u8>,
}

impl TraceEntry {
    /// Create new entry
    pub fn new(
        direction: Direction,
        origin: Option<&str>,
        remote_id: Option<u32>,
        data: &[u8],
    ) -> Self {
        Self {
            timestamp: Local::now(),
            direction,
            origin: origin.map(String::from),
            remote_id,
            data: data.to_vec(),
        }
    }

    fn prefix(&self) -> String {
        let mut prefix = format!(
            "[{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.direction.label()
        );
        if let Some(origin) = &self.origin {
            prefix.push_str(&format!(" from={}", origin));
        }
        if let Some(id) = self.remote_id {
            prefix.push_str(&format!(" id={}", id));
        }
        prefix
    }

    /// Format as text
    pub fn to_text(&self) -> String {
        format!("{} {}", self.prefix(), String::from_utf8_lossy(&self.data))
    }

    /// Format as hex
    pub fn to_hex(&self) -> String {
        let hex: Vec<String> = self.data.iter().map(|b| format!("{:02X}", b)).collect();
        format!("{} {}", self.prefix(), hex.join(" "))
    }

    /// Format as JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Render in `format`
    pub fn render(&self, format: TraceFormat) -> String {
        match format {
            TraceFormat::Text => self.to_text(),
            TraceFormat::Hex => self.to_hex(),
            TraceFormat::JsonLines => self.to_json(),
        }
    }
}

/// Trace file writer, shareable between the forward and receive loops
pub struct TraceSink {
    file: Mutex<BufWriter<File>>,
    format: TraceFormat,
    path: PathBuf,
    lines: Mutex<usize>,
}

impl TraceSink {
    /// Open (append) the configured trace file
    pub fn create(config: &TraceConfig) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.path)?;
        tracing::debug!(
            path = %config.path.display(),
            format = config.format.as_str(),
            "Trace started"
        );
        Ok(Self {
            file: Mutex::new(BufWriter::new(file)),
            format: config.format,
            path: config.path.clone(),
            lines: Mutex::new(0),
        })
    }

    /// Trace file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record one frame
    pub fn record(
        &self,
        direction: Direction,
        origin: Option<&str>,
        remote_id: Option<u32>,
        data: &[u8],
    ) {
        let line = TraceEntry::new(direction, origin, remote_id, data).render(self.format);
        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "{}", line) {
            tracing::warn!(path = %self.path.display(), error = %e, "Trace write failed");
            return;
        }

        let mut lines = self.lines.lock();
        *lines += 1;
        if *lines % 100 == 0 {
            let _ = file.flush();
        }
    }

    /// Lines written so far
    pub fn lines(&self) -> usize {
        *self.lines.lock()
    }

    /// Flush to disk
    pub fn flush(&self) {
        let _ = self.file.lock().flush();
    }
}

impl Drop for TraceSink {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_text_and_hex() {
        let entry = TraceEntry::new(Direction::Tx, Some("aux_a"), Some(5), b"XYZ");
        let text = entry.to_text();
        assert!(text.contains("TX from=aux_a id=5 XYZ"));

        let hex = TraceEntry::new(Direction::Rx, None, None, &[0x01, 0xAB]).to_hex();
        assert!(hex.ends_with("RX 01 AB"));
    }

    #[test]
    fn test_entry_json_uses_hex_payload() {
        let json = TraceEntry::new(Direction::Rx, None, Some(7), b"ABC").to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["data"], "414243");
        assert_eq!(value["direction"], "Rx");
        assert_eq!(value["remote_id"], 7);
        assert!(value.get("origin").is_none());
    }

    #[test]
    fn test_sink_writes_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.hex");
        {
            let sink = TraceSink::create(&TraceConfig {
                path: path.clone(),
                format: TraceFormat::Hex,
            })
            .unwrap();
            sink.record(Direction::Tx, Some("a"), None, b"\x01\x02");
            sink.record(Direction::Rx, None, Some(3), b"\xFF");
            assert_eq!(sink.lines(), 2);
        }
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("TX from=a 01 02"));
        assert!(lines[1].ends_with("RX id=3 FF"));
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("hex".parse::<TraceFormat>().unwrap(), TraceFormat::Hex);
        assert_eq!("jsonl".parse::<TraceFormat>().unwrap(), TraceFormat::JsonLines);
        assert!("csv".parse::<TraceFormat>().is_err());
    }
}
