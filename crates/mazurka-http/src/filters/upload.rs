//! Multipart/form-data upload parsing.
//!
//! Active for POST requests with a multipart content type. File parts
//! spool to temp files under the route's upload directory; plain fields
//! become request params. The spooled files attach to the request with
//! `FILE_*` params describing each one.

use std::io::Write;

use crate::conn::Conn;
use crate::error::{HttpError, HttpResult};
use crate::http::Method;
use crate::packet::{Packet, PacketTag};
use crate::queue::QueueId;
use crate::rx::UploadFile;
use crate::stage::{Dir, Stage, StageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadStage {
    Boundary,
    ContentHeader,
    ContentData,
    End,
}

struct PartInProgress {
    name: String,
    client_filename: Option<String>,
    content_type: Option<String>,
    file: Option<(std::fs::File, std::path::PathBuf)>,
    value: Vec<u8>,
    size: u64,
}

struct UploadState {
    stage: UploadStage,
    boundary: Vec<u8>,
    buf: Vec<u8>,
    part: Option<PartInProgress>,
    total: u64,
}

pub struct UploadFilter;

impl Stage for UploadFilter {
    fn name(&self) -> &'static str {
        "upload"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn matches(&self, conn: &Conn, dir: Dir) -> bool {
        dir == Dir::Rx
            && conn.rx.upload
            && conn.rx.method == Method::Post
            && conn.rx.upload_boundary.is_some()
    }

    fn open(&self, conn: &mut Conn, q: QueueId) -> HttpResult<()> {
        let boundary = conn
            .rx
            .upload_boundary
            .clone()
            .ok_or_else(|| HttpError::Parse("multipart content without boundary".into()))?;
        let mut marker = Vec::with_capacity(boundary.len() + 2);
        marker.extend_from_slice(b"--");
        marker.extend_from_slice(boundary.as_bytes());
        conn.queue_mut(q).state = Some(Box::new(UploadState {
            stage: UploadStage::Boundary,
            boundary: marker,
            buf: Vec::new(),
            part: None,
            total: 0,
        }));
        Ok(())
    }

    fn incoming(&self, conn: &mut Conn, q: QueueId, packet: Packet) -> HttpResult<()> {
        if packet.tag == PacketTag::End {
            let done = with_state(conn, q, |state| state.stage == UploadStage::End)?;
            if !done {
                return Err(HttpError::Parse("truncated multipart body".into()));
            }
            return conn.put_next(q, packet);
        }
        let upload_dir = conn
            .rx
            .route
            .as_ref()
            .map(|r| r.upload_dir.clone())
            .unwrap_or_else(std::env::temp_dir);
        let upload_limit = conn.limits.upload_size;

        let mut completed: Vec<CompletedPart> = Vec::new();
        let over_limit = {
            let state = state_mut(conn, q)?;
            state.buf.extend_from_slice(&packet.content);
            state.total += packet.content.len() as u64;
            if state.total > upload_limit {
                true
            } else {
                advance(state, &upload_dir, &mut completed)?;
                false
            }
        };
        if over_limit {
            return Err(HttpError::Protocol(413, "upload exceeds limit".into()));
        }
        for part in completed {
            attach_part(conn, part);
        }
        Ok(())
    }
}

/// A finished part ready to attach to the request.
enum CompletedPart {
    Field { name: String, value: String },
    File(UploadFile),
}

/// Run the multipart state machine over the buffered bytes.
fn advance(
    state: &mut UploadState,
    upload_dir: &std::path::Path,
    completed: &mut Vec<CompletedPart>,
) -> HttpResult<()> {
    loop {
        match state.stage {
            UploadStage::Boundary => {
                let Some(idx) = find(&state.buf, &state.boundary) else {
                    // Keep only a potential partial marker tail.
                    trim_to_tail(&mut state.buf, state.boundary.len() + 3);
                    return Ok(());
                };
                let after = idx + state.boundary.len();
                if state.buf.len() < after + 2 {
                    return Ok(());
                }
                if &state.buf[after..after + 2] == b"--" {
                    state.stage = UploadStage::End;
                    state.buf.clear();
                    return Ok(());
                }
                let mut cursor = after;
                if &state.buf[cursor..cursor + 2] == b"\r\n" {
                    cursor += 2;
                }
                state.buf.drain(..cursor);
                state.stage = UploadStage::ContentHeader;
            }
            UploadStage::ContentHeader => {
                let Some(end) = find(&state.buf, b"\r\n\r\n") else {
                    if state.buf.len() > 8 * 1024 {
                        return Err(HttpError::Parse("oversized part headers".into()));
                    }
                    return Ok(());
                };
                let headers = state.buf[..end].to_vec();
                state.buf.drain(..end + 4);
                let part = parse_part_headers(&headers, upload_dir)?;
                state.part = Some(part);
                state.stage = UploadStage::ContentData;
            }
            UploadStage::ContentData => {
                // Data runs until CRLF + boundary marker.
                let mut terminator = Vec::with_capacity(state.boundary.len() + 2);
                terminator.extend_from_slice(b"\r\n");
                terminator.extend_from_slice(&state.boundary);
                match find(&state.buf, &terminator) {
                    Some(idx) => {
                        let data = state.buf[..idx].to_vec();
                        write_part_data(state, &data)?;
                        state.buf.drain(..idx + 2);
                        if let Some(part) = state.part.take() {
                            completed.push(finish_part(part)?);
                        }
                        state.stage = UploadStage::Boundary;
                    }
                    None => {
                        // Everything except a possible partial terminator
                        // is safe to flush.
                        let safe = state.buf.len().saturating_sub(terminator.len() + 1);
                        if safe > 0 {
                            let data = state.buf[..safe].to_vec();
                            write_part_data(state, &data)?;
                            state.buf.drain(..safe);
                        }
                        return Ok(());
                    }
                }
            }
            UploadStage::End => {
                state.buf.clear();
                return Ok(());
            }
        }
    }
}

fn parse_part_headers(headers: &[u8], upload_dir: &std::path::Path) -> HttpResult<PartInProgress> {
    let text = std::str::from_utf8(headers)
        .map_err(|_| HttpError::Parse("part headers are not utf-8".into()))?;
    let mut name = None;
    let mut client_filename = None;
    let mut content_type = None;
    for line in text.split("\r\n") {
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("content-disposition:") {
            name = quoted_attr(line, "name");
            client_filename = quoted_attr(line, "filename");
        } else if lower.starts_with("content-type:") {
            content_type = Some(line[13..].trim().to_string());
        }
    }
    let name = name.ok_or_else(|| HttpError::Parse("part without a field name".into()))?;

    let file = if client_filename.is_some() {
        let spool = tempfile::Builder::new()
            .prefix("upload-")
            .tempfile_in(upload_dir)
            .map_err(|e| HttpError::Internal(format!("cannot spool upload: {e}")))?;
        let (file, path) = spool
            .keep()
            .map_err(|e| HttpError::Internal(format!("cannot keep spool file: {e}")))?;
        Some((file, path))
    } else {
        None
    };

    Ok(PartInProgress {
        name,
        client_filename,
        content_type,
        file,
        value: Vec::new(),
        size: 0,
    })
}

fn write_part_data(state: &mut UploadState, data: &[u8]) -> HttpResult<()> {
    let Some(ref mut part) = state.part else {
        return Err(HttpError::Parse("part data outside a part".into()));
    };
    part.size += data.len() as u64;
    match part.file {
        Some((ref mut file, _)) => file
            .write_all(data)
            .map_err(|e| HttpError::Internal(format!("upload write failed: {e}")))?,
        None => part.value.extend_from_slice(data),
    }
    Ok(())
}

fn finish_part(part: PartInProgress) -> HttpResult<CompletedPart> {
    match part.file {
        Some((file, path)) => {
            file.sync_all().ok();
            Ok(CompletedPart::File(UploadFile {
                name: part.name,
                client_filename: part.client_filename.unwrap_or_default(),
                filename: path,
                content_type: part.content_type,
                size: part.size,
            }))
        }
        None => Ok(CompletedPart::Field {
            name: part.name,
            value: String::from_utf8_lossy(&part.value).into_owned(),
        }),
    }
}

fn attach_part(conn: &mut Conn, part: CompletedPart) {
    match part {
        CompletedPart::Field { name, value } => {
            conn.rx.set_param(name, value);
        }
        CompletedPart::File(file) => {
            let field = file.name.clone();
            conn.rx.set_param(
                format!("FILE_FILENAME_{field}"),
                file.filename.display().to_string(),
            );
            conn.rx.set_param(
                format!("FILE_CLIENT_FILENAME_{field}"),
                file.client_filename.clone(),
            );
            if let Some(ref mime) = file.content_type {
                conn.rx.set_param(format!("FILE_CONTENT_TYPE_{field}"), mime.clone());
            }
            conn.rx.set_param(format!("FILE_SIZE_{field}"), file.size.to_string());
            conn.rx.set_param(format!("FILE_NAME_{field}"), field.clone());
            conn.rx.files.push(file);
        }
    }
}

/// Pull `name="value"` out of a Content-Disposition line. The match
/// must start an attribute, so `name=` does not fire inside
/// `filename=`.
fn quoted_attr(line: &str, attr: &str) -> Option<String> {
    let needle = format!("{attr}=\"");
    let lower = line.to_ascii_lowercase();
    let mut search = 0;
    while let Some(found) = lower[search..].find(&needle) {
        let idx = search + found;
        let boundary = idx == 0
            || matches!(lower.as_bytes()[idx - 1], b' ' | b';' | b'\t');
        if boundary {
            let rest = &line[idx + needle.len()..];
            let end = rest.find('"')?;
            return Some(rest[..end].to_string());
        }
        search = idx + needle.len();
    }
    None
}

fn find(data: &[u8], needle: &[u8]) -> Option<usize> {
    memchr::memmem::find(data, needle)
}

fn trim_to_tail(buf: &mut Vec<u8>, keep: usize) {
    if buf.len() > keep {
        buf.drain(..buf.len() - keep);
    }
}

fn state_mut<'a>(conn: &'a mut Conn, q: QueueId) -> HttpResult<&'a mut UploadState> {
    conn.queue_mut(q)
        .state
        .as_mut()
        .and_then(|s| s.downcast_mut::<UploadState>())
        .ok_or_else(|| HttpError::Internal("upload state missing".into()))
}

fn with_state<T>(
    conn: &mut Conn,
    q: QueueId,
    f: impl FnOnce(&mut UploadState) -> T,
) -> HttpResult<T> {
    Ok(f(state_mut(conn, q)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_attrs_parse() {
        let line = "Content-Disposition: form-data; name=\"avatar\"; filename=\"me.png\"";
        assert_eq!(quoted_attr(line, "name").as_deref(), Some("avatar"));
        assert_eq!(quoted_attr(line, "filename").as_deref(), Some("me.png"));
        assert_eq!(quoted_attr("Content-Disposition: form-data", "name"), None);
    }
}
