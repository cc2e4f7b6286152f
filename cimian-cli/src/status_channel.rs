//! The local status channel (spec §6 "Status channel"): newline-delimited
//! JSON over a loopback TCP socket, consumed by an optional GUI status
//! window. Grounded on the teacher's `ffi` callback idiom — a plain
//! synchronous sink invoked from the run loop — adapted here to write to a
//! `TcpStream` instead of calling back across an FFI boundary. If nothing
//! is listening on the port, messages are dropped silently, matching the
//! spec's "the Driver proceeds silently" requirement.

use std::io::Write as _;
use std::net::TcpStream;
use std::time::Duration;

use cimian_types::{EventRecord, EventStatus};
use serde_json::json;

pub const STATUS_CHANNEL_ADDR: &str = "127.0.0.1:19847";

pub struct StatusChannel {
    stream: Option<TcpStream>,
}

impl StatusChannel {
    /// Attempts to connect to the status channel listener. Never fails: if
    /// no listener is present, returns a channel that silently drops every
    /// message sent to it.
    pub fn connect() -> Self {
        let stream = STATUS_CHANNEL_ADDR
            .parse()
            .ok()
            .and_then(|addr| TcpStream::connect_timeout(&addr, Duration::from_millis(500)).ok());
        StatusChannel { stream }
    }

    fn send(&mut self, value: serde_json::Value) {
        let Some(stream) = &mut self.stream else {
            return;
        };
        let mut line = value.to_string();
        line.push('\n');
        if stream.write_all(line.as_bytes()).is_err() {
            self.stream = None;
        }
    }

    pub fn status_message(&mut self, data: &str) {
        self.send(json!({ "type": "statusMessage", "data": data }));
    }

    pub fn detail_message(&mut self, data: &str) {
        self.send(json!({ "type": "detailMessage", "data": data }));
    }

    /// `percent < 0` means indeterminate progress.
    pub fn percent_progress(&mut self, percent: i32) {
        self.send(json!({ "type": "percentProgress", "percent": percent }));
    }

    pub fn log_message(&mut self, data: &str, error: Option<&str>) {
        self.send(json!({ "type": "logMessage", "data": data, "error": error }));
    }

    pub fn quit(&mut self) {
        self.send(json!({ "type": "quit" }));
    }

    /// Translates one Reporter `EventRecord` into the status channel's
    /// message shapes.
    pub fn forward_event(&mut self, event: &EventRecord) {
        let label = match &event.item_name {
            Some(name) => format!("{} {}", event.action, name),
            None => event.action.clone(),
        };

        match event.status {
            EventStatus::Failed => {
                self.log_message(&label, event.message.as_deref());
            }
            _ => {
                self.status_message(&label);
                if let Some(message) = &event.message {
                    self.detail_message(message);
                }
            }
        }
    }
}
