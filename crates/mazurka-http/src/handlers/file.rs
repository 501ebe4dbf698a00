//! Static file serving: GET/HEAD/POST reads, PUT writes, DELETE,
//! OPTIONS, conditional requests, ranged responses and directory
//! redirects.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::time::SystemTime;

use crate::conn::Conn;
use crate::error::{HttpError, HttpResult};
use crate::http::Method;
use crate::packet::Packet;
use crate::queue::QueueId;
use crate::rx::ResolvedRange;
use crate::stage::{Dir, Stage, StageKind};

pub struct FileHandler;

impl Stage for FileHandler {
    fn name(&self) -> &'static str {
        "file"
    }

    fn kind(&self) -> StageKind {
        StageKind::Handler
    }

    /// Resolve the filename and gather file metadata while the
    /// pipeline opens, so downstream filters (range) see the entity
    /// length before any data moves.
    fn open(&self, conn: &mut Conn, q: QueueId) -> HttpResult<()> {
        if conn.queue(q).dir == Dir::Rx {
            return Ok(());
        }
        let Some(route) = conn.rx.route.clone() else {
            return Err(HttpError::Internal("file handler without a route".into()));
        };

        let lang = conn.rx.param("LANG").map(|l| l.to_string());
        let mut path = route.map_file(&conn.rx.target.clone(), lang.as_deref());
        path = apply_language_suffix(&route, lang.as_deref(), path);
        path = apply_extension_map(conn, &route, path);
        conn.tx.filename = Some(path.clone());

        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(_) => {
                if conn.rx.method == Method::Put
                    || conn.rx.method == Method::Options
                    || conn.rx.method == Method::Delete
                {
                    return Ok(());
                }
                return Err(HttpError::NotFound(format!("{} not found", path.display())));
            }
        };

        if metadata.is_dir() {
            if !conn.rx.uri.path.ends_with('/') {
                // Canonical directory form carries the trailing slash.
                let location = format!("{}/", conn.rx.uri.path);
                conn.redirect(301, &location)?;
                return Ok(());
            }
            for index in &route.index_files {
                let candidate = path.join(index);
                if candidate.is_file() {
                    conn.tx.filename = Some(candidate.clone());
                    return self.stat_entity(conn, candidate);
                }
            }
            // No index: the directory handler renders a listing later.
            return Ok(());
        }

        self.stat_entity(conn, path)
    }

    fn ready(&self, conn: &mut Conn) -> HttpResult<()> {
        if conn.tx.finalized {
            return Ok(());
        }
        match conn.rx.method {
            Method::Get | Method::Head | Method::Post => self.serve(conn),
            Method::Put => self.store(conn),
            Method::Delete => self.remove(conn),
            Method::Options => {
                conn.tx.headers.set("Allow", "OPTIONS, GET, HEAD, POST, PUT, DELETE");
                conn.tx.length = 0;
                conn.finalize_output();
                Ok(())
            }
            _ => Err(HttpError::Protocol(405, "method not supported for files".into())),
        }
    }
}

impl FileHandler {
    /// Stat the resolved file and populate the transmitter: length,
    /// modification time, the inode-size-mtime etag, MIME type, and
    /// the resolved ranges.
    fn stat_entity(&self, conn: &mut Conn, path: PathBuf) -> HttpResult<()> {
        let metadata = fs::metadata(&path)
            .map_err(|_| HttpError::NotFound(format!("{} not found", path.display())))?;
        let size = metadata.len();
        let modified = metadata.modified().ok();

        conn.tx.filename = Some(path.clone());
        conn.tx.file_size = size;
        conn.tx.file_modified = modified;
        conn.tx.length = size as i64;
        conn.tx.entity_length = size;
        conn.tx.etag = Some(make_etag(&metadata));
        conn.tx.headers.set_default("Accept-Ranges", "bytes");
        if conn.tx.mime_type.is_none() {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_string();
            let route = conn.rx.route.clone();
            conn.tx.mime_type = Some(match conn.host {
                Some(ref host) => host.mime_for(route.as_deref(), &ext),
                None => crate::host::mime_for_path(&path),
            });
        }

        self.check_conditionals(conn, modified)?;

        if !conn.rx.ranges.is_empty() && conn.tx.status == 200 {
            let mut resolved = Vec::new();
            for range in &conn.rx.ranges {
                match range.resolve(size) {
                    Some((offset, len)) => resolved.push(ResolvedRange { offset, len }),
                    None => {
                        conn.tx
                            .headers
                            .set("Content-Range", format!("bytes */{size}"));
                        return Err(HttpError::Protocol(416, "unsatisfiable range".into()));
                    }
                }
            }
            conn.tx.output_ranges = resolved;
        }
        Ok(())
    }

    /// Conditional-request gating: etag checks first, then dates.
    fn check_conditionals(&self, conn: &mut Conn, modified: Option<SystemTime>) -> HttpResult<()> {
        let etag = conn.tx.etag.clone().unwrap_or_default();
        if let Some(ref if_match) = conn.rx.if_match
            && if_match != "*"
            && !etag_listed(if_match, &etag)
        {
            return Err(HttpError::Protocol(412, "etag precondition failed".into()));
        }
        if let Some(since) = conn.rx.if_unmodified_since
            && let Some(modified) = modified
            && modified > since
        {
            return Err(HttpError::Protocol(412, "entity was modified".into()));
        }
        if let Some(ref if_none) = conn.rx.if_none_match
            && (if_none == "*" || etag_listed(if_none, &etag))
        {
            conn.tx.status = 304;
            return Ok(());
        }
        if let Some(since) = conn.rx.if_modified_since
            && conn.rx.if_none_match.is_none()
            && let Some(modified) = modified
            && floor_secs(modified) <= floor_secs(since)
        {
            conn.tx.status = 304;
        }
        Ok(())
    }

    fn serve(&self, conn: &mut Conn) -> HttpResult<()> {
        if conn.tx.status == 304 {
            conn.tx.length = 0;
            conn.finalize_output();
            return Ok(());
        }
        let Some(path) = conn.tx.filename.clone() else {
            return Err(HttpError::NotFound("no file resolved".into()));
        };
        if path.is_dir() {
            return crate::handlers::dir::serve_listing(conn, &path);
        }
        let file = File::open(&path)
            .map_err(|_| HttpError::NotFound(format!("{} not readable", path.display())))?;
        conn.tx.file = Some(file);
        let size = conn.tx.file_size;
        if size > 0 {
            conn.write_packet(Packet::entity(0, size));
        }
        conn.finalize_output();
        Ok(())
    }

    /// PUT: create or overwrite; an inbound Content-Range patches into
    /// the existing file at the given offset.
    fn store(&self, conn: &mut Conn) -> HttpResult<()> {
        let Some(path) = conn.tx.filename.clone() else {
            return Err(HttpError::Internal("no upload target resolved".into()));
        };
        let body = conn.read_body_bytes();
        let existed = path.exists();
        match conn.rx.in_content_range {
            Some((start, _end, _total)) => {
                let mut file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(false)
                    .open(&path)?;
                file.seek(SeekFrom::Start(start))?;
                file.write_all(&body)?;
            }
            None => {
                let mut file = File::create(&path)?;
                file.write_all(&body)?;
            }
        }
        conn.tx.status = if existed { 204 } else { 201 };
        conn.tx.length = 0;
        conn.finalize_output();
        Ok(())
    }

    fn remove(&self, conn: &mut Conn) -> HttpResult<()> {
        let Some(path) = conn.tx.filename.clone() else {
            return Err(HttpError::NotFound("no file resolved".into()));
        };
        fs::remove_file(&path)
            .map_err(|_| HttpError::NotFound(format!("{} not found", path.display())))?;
        conn.tx.status = 204;
        conn.tx.length = 0;
        conn.finalize_output();
        Ok(())
    }
}

/// A negotiated language with a suffix maps `page.html` to
/// `page.<suffix>.html` when that variant exists.
fn apply_language_suffix(
    route: &crate::router::Route,
    lang: Option<&str>,
    path: PathBuf,
) -> PathBuf {
    let Some(suffix) = lang
        .and_then(|l| route.languages.get(l))
        .and_then(|language| language.suffix.as_deref())
    else {
        return path;
    };
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return path;
    };
    let candidate = path.with_extension(format!("{suffix}.{ext}"));
    if candidate.is_file() { candidate } else { path }
}

/// Try configured extension variants, preferring compressed forms when
/// the client accepts gzip.
fn apply_extension_map(conn: &mut Conn, route: &crate::router::Route, path: PathBuf) -> PathBuf {
    let Some(ext) = path.extension().and_then(|e| e.to_str()).map(|e| e.to_string()) else {
        return path;
    };
    let Some(variants) = route.extension_map.get(&ext.to_ascii_lowercase()) else {
        return path;
    };
    let gzip_ok = conn
        .rx
        .header("accept-encoding")
        .map(|v| v.contains("gzip"))
        .unwrap_or(false);
    for variant in variants {
        let compressed = variant.ends_with("gz");
        if compressed && !gzip_ok {
            continue;
        }
        let candidate = path.with_extension(variant);
        if candidate.is_file() {
            if compressed {
                conn.tx.headers.set("Content-Encoding", "gzip");
                conn.tx.headers.append("Vary", "Accept-Encoding");
                // Content negotiation keys on the original type.
                let route = conn.rx.route.clone();
                if let Some(ref host) = conn.host {
                    conn.tx.mime_type = Some(host.mime_for(route.as_deref(), &ext));
                }
            }
            return candidate;
        }
    }
    path
}

/// `inode-size-mtime`, all hex.
fn make_etag(metadata: &fs::Metadata) -> String {
    #[cfg(unix)]
    let inode = {
        use std::os::unix::fs::MetadataExt;
        metadata.ino()
    };
    #[cfg(not(unix))]
    let inode = 0u64;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|m| m.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{inode:x}-{:x}-{mtime:x}", metadata.len())
}

fn etag_listed(header: &str, etag: &str) -> bool {
    header
        .split(',')
        .map(|t| t.trim().trim_matches('"'))
        .any(|t| t == etag)
}

fn floor_secs(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_format_is_inode_size_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"hello").unwrap();
        let metadata = std::fs::metadata(&path).unwrap();
        let etag = make_etag(&metadata);
        let parts: Vec<_> = etag.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(u64::from_str_radix(parts[1], 16).unwrap(), 5);
    }

    #[test]
    fn etag_lists_match_with_quotes() {
        assert!(etag_listed("\"abc\", \"def\"", "def"));
        assert!(!etag_listed("\"abc\"", "abd"));
    }
}
