use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
}

/// A structured `event=<name> key=value ...` line.
///
/// Every state transition and every accept/skip decision is reported as one
/// of these so test runs and field logs can be grepped for the same tokens.
#[derive(Debug, Clone)]
pub struct Event {
    name: &'static str,
    level: Level,
    fields: Vec<(&'static str, String)>,
}

impl Event {
    pub fn info(name: &'static str) -> Self {
        Self { name, level: Level::Info, fields: Vec::new() }
    }

    pub fn warn(name: &'static str) -> Self {
        Self { name, level: Level::Warn, fields: Vec::new() }
    }

    pub fn debug(name: &'static str) -> Self {
        Self { name, level: Level::Debug, fields: Vec::new() }
    }

    /// Add a field, quoting the value only when it needs it
    pub fn field(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        let value = value.to_string();
        let rendered = if needs_quotes(&value) { quote(&value) } else { value };
        self.fields.push((key, rendered));
        self
    }

    /// Add a field whose value is always double-quoted (host names, free text)
    pub fn quoted(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.fields.push((key, quote(&value.to_string())));
        self
    }

    pub fn level(&self) -> Level {
        self.level
    }
}

fn needs_quotes(value: &str) -> bool {
    value.is_empty() || value.chars().any(|c| c.is_whitespace() || c == '"' || c == '=')
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        if c == '\n' {
            out.push_str("\\n");
            continue;
        }
        out.push(c);
    }
    out.push('"');
    out
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event={}", self.name)?;
        for (key, value) in &self.fields {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

/// Destination for structured events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Forwards events to `tracing` under the `k3s_discoverd::event` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        match event.level() {
            Level::Debug => tracing::debug!(target: "k3s_discoverd::event", "{}", event),
            Level::Info => tracing::info!(target: "k3s_discoverd::event", "{}", event),
            Level::Warn => tracing::warn!(target: "k3s_discoverd::event", "{}", event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_plain_and_quoted_fields() {
        let event = Event::info("mdns_select")
            .quoted("host", "leader-mdns.local")
            .field("port", 6443)
            .field("reason", "no server yet");
        assert_eq!(
            event.to_string(),
            "event=mdns_select host=\"leader-mdns.local\" port=6443 reason=\"no server yet\""
        );
    }

    #[test]
    fn test_quote_escapes_embedded_quotes() {
        let event = Event::warn("mdns_query_attempt").field("stderr", "bad \"arg\"\nnext");
        assert_eq!(
            event.to_string(),
            "event=mdns_query_attempt stderr=\"bad \\\"arg\\\"\\nnext\""
        );
        assert_eq!(event.level(), Level::Warn);
    }

    #[test]
    fn test_empty_value_is_quoted() {
        let event = Event::debug("x").field("k", "");
        assert_eq!(event.to_string(), "event=x k=\"\"");
    }
}
