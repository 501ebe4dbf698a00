//! Structured event logging with size-based rotation.
//!
//! Independent of the `tracing` diagnostics layer: this is the
//! operational log an embedding host configures per server (access
//! records, auth failures, monitor actions). Events carry a dotted
//! name (`rx.complete`, `monitor.ban.start`), a level 0-5, and a flat
//! field list.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::error::HttpResult;

/// Output format for one trace line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceFormat {
    /// NCSA common log format; only `rx.complete` events render fully.
    Common,
    /// `event level key=value ...`
    Detail,
    /// One JSON object per line.
    Json,
}

struct TraceFile {
    file: Option<File>,
    written: u64,
}

/// A shared, thread-safe trace logger.
pub struct Trace {
    path: Option<PathBuf>,
    max_size: u64,
    backup_count: u32,
    level: u8,
    format: TraceFormat,
    /// Per-event level overrides; an event absent here uses its caller's level.
    events: HashMap<String, u8>,
    header: Option<String>,
    out: Mutex<TraceFile>,
}

impl Trace {
    pub fn disabled() -> Trace {
        Trace {
            path: None,
            max_size: 0,
            backup_count: 0,
            level: 0,
            format: TraceFormat::Detail,
            events: HashMap::new(),
            header: None,
            out: Mutex::new(TraceFile { file: None, written: 0 }),
        }
    }

    /// Open a trace log. `max_size` of zero disables rotation.
    pub fn open(
        path: impl AsRef<Path>,
        level: u8,
        format: TraceFormat,
        max_size: u64,
        backup_count: u32,
        header: Option<String>,
    ) -> HttpResult<Trace> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut written = file.metadata()?.len();
        if written == 0
            && let Some(ref line) = header
        {
            writeln!(file, "{line}")?;
            written += line.len() as u64 + 1;
        }
        Ok(Trace {
            path: Some(path),
            max_size,
            backup_count,
            level,
            format,
            events: HashMap::new(),
            header,
            out: Mutex::new(TraceFile { file: Some(file), written }),
        })
    }

    /// Override the level at which a named event is emitted.
    pub fn set_event_level(&mut self, event: impl Into<String>, level: u8) {
        self.events.insert(event.into(), level);
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    /// Emit one event. Fields render in the order given.
    pub fn event(&self, name: &str, level: u8, fields: &[(&str, &str)]) {
        let effective = *self.events.get(name).unwrap_or(&level);
        if effective > self.level {
            return;
        }
        let line = match self.format {
            TraceFormat::Common => format_common(name, fields),
            TraceFormat::Detail => format_detail(name, effective, fields),
            TraceFormat::Json => format_json(name, effective, fields),
        };
        let Some(line) = line else { return };

        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(_) => return,
        };
        if out.file.is_none() {
            return;
        }
        if self.max_size > 0 && out.written + line.len() as u64 + 1 > self.max_size {
            self.rotate(&mut out);
        }
        if let Some(ref mut file) = out.file
            && writeln!(file, "{line}").is_ok()
        {
            out.written += line.len() as u64 + 1;
        }
    }

    /// Shift `log` → `log.1` → … → `log.N`, dropping the oldest.
    fn rotate(&self, out: &mut TraceFile) {
        let Some(ref path) = self.path else { return };
        out.file = None;
        if self.backup_count == 0 {
            let _ = std::fs::remove_file(path);
        } else {
            let backup = |n: u32| PathBuf::from(format!("{}.{}", path.display(), n));
            let _ = std::fs::remove_file(backup(self.backup_count));
            for n in (1..self.backup_count).rev() {
                let _ = std::fs::rename(backup(n), backup(n + 1));
            }
            let _ = std::fs::rename(path, backup(1));
        }
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            out.written = 0;
            if let Some(ref line) = self.header
                && writeln!(file, "{line}").is_ok()
            {
                out.written = line.len() as u64 + 1;
            }
            out.file = Some(file);
        }
    }
}

fn field<'a>(fields: &'a [(&str, &str)], key: &str) -> &'a str {
    fields.iter().find(|(k, _)| *k == key).map(|(_, v)| *v).unwrap_or("-")
}

fn format_common(name: &str, fields: &[(&str, &str)]) -> Option<String> {
    if name != "rx.complete" {
        return None;
    }
    Some(format!(
        "{} - {} [{}] \"{} {} HTTP/1.1\" {} {}",
        field(fields, "ip"),
        field(fields, "user"),
        httpdate::fmt_http_date(SystemTime::now()),
        field(fields, "method"),
        field(fields, "uri"),
        field(fields, "status"),
        field(fields, "sent"),
    ))
}

fn format_detail(name: &str, level: u8, fields: &[(&str, &str)]) -> Option<String> {
    let mut line = format!(
        "{} {} {}",
        httpdate::fmt_http_date(SystemTime::now()),
        level,
        name
    );
    for (k, v) in fields {
        line.push(' ');
        line.push_str(k);
        line.push('=');
        line.push_str(v);
    }
    Some(line)
}

fn format_json(name: &str, level: u8, fields: &[(&str, &str)]) -> Option<String> {
    let mut map = serde_json::Map::new();
    map.insert("time".into(), httpdate::fmt_http_date(SystemTime::now()).into());
    map.insert("event".into(), name.into());
    map.insert("level".into(), level.into());
    for (k, v) in fields {
        map.insert((*k).into(), (*v).into());
    }
    Some(serde_json::Value::Object(map).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_filter_drops_verbose_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");
        let trace = Trace::open(&path, 2, TraceFormat::Detail, 0, 0, None).unwrap();
        trace.event("request.start", 2, &[("uri", "/a")]);
        trace.event("request.body", 4, &[("len", "10")]);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("request.start"));
        assert!(!text.contains("request.body"));
    }

    #[test]
    fn rotation_produces_numbered_backups() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");
        let trace = Trace::open(&path, 5, TraceFormat::Detail, 200, 2, None).unwrap();
        for i in 0..40 {
            trace.event("tick", 0, &[("n", &i.to_string())]);
        }
        assert!(path.exists());
        assert!(dir.path().join("trace.log.1").exists());
    }

    #[test]
    fn json_format_emits_one_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.log");
        let trace = Trace::open(&path, 5, TraceFormat::Json, 0, 0, None).unwrap();
        trace.event("auth.login", 2, &[("user", "ada")]);
        let text = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(value["event"], "auth.login");
        assert_eq!(value["user"], "ada");
    }
}
