//! Directory listings: a sortable HTML index of a mapped directory.

use std::path::Path;
use std::time::SystemTime;

use crate::conn::Conn;
use crate::error::{HttpError, HttpResult};
use crate::stage::{Stage, StageKind};

pub struct DirHandler;

impl Stage for DirHandler {
    fn name(&self) -> &'static str {
        "dir"
    }

    fn kind(&self) -> StageKind {
        StageKind::Handler
    }

    fn ready(&self, conn: &mut Conn) -> HttpResult<()> {
        if conn.tx.finalized {
            return Ok(());
        }
        let route = conn
            .rx
            .route
            .clone()
            .ok_or_else(|| HttpError::Internal("dir handler without a route".into()))?;
        let lang = conn.rx.param("LANG").map(|l| l.to_string());
        let path = route.map_file(&conn.rx.target.clone(), lang.as_deref());
        serve_listing(conn, &path)
    }
}

struct Entry {
    name: String,
    is_dir: bool,
    size: u64,
    modified: Option<SystemTime>,
}

/// Render a sortable HTML index for `path`. Sorting is driven by the
/// `sort` (name|size|date) and `order` (asc|desc) query params.
pub fn serve_listing(conn: &mut Conn, path: &Path) -> HttpResult<()> {
    let mut entries = Vec::new();
    let read = std::fs::read_dir(path)
        .map_err(|_| HttpError::NotFound(format!("{} not listable", path.display())))?;
    for entry in read.flatten() {
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(_) => continue,
        };
        entries.push(Entry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: metadata.is_dir(),
            size: metadata.len(),
            modified: metadata.modified().ok(),
        });
    }

    let sort = conn.rx.param("sort").unwrap_or("name").to_string();
    let descending = conn.rx.param("order").map(|o| o == "desc").unwrap_or(false);
    match sort.as_str() {
        "size" => entries.sort_by_key(|e| e.size),
        "date" => entries.sort_by_key(|e| e.modified),
        _ => entries.sort_by(|a, b| a.name.cmp(&b.name)),
    }
    if descending {
        entries.reverse();
    }

    let dir_uri = conn.rx.uri.path.clone();
    conn.tx.status = 200;
    conn.tx.mime_type = Some("text/html".into());

    let flip = |col: &str| {
        if sort == col && !descending { "desc" } else { "asc" }
    };
    conn.write(format!(
        "<!DOCTYPE html>\n<html><head><title>Index of {dir_uri}</title></head>\n<body>\n\
         <h1>Index of {dir_uri}</h1>\n<table>\n<tr>\
         <th><a href=\"?sort=name&order={}\">Name</a></th>\
         <th><a href=\"?sort=size&order={}\">Size</a></th>\
         <th><a href=\"?sort=date&order={}\">Modified</a></th></tr>\n",
        flip("name"),
        flip("size"),
        flip("date"),
    ))?;
    if dir_uri != "/" {
        conn.write("<tr><td><a href=\"../\">../</a></td><td>-</td><td>-</td></tr>\n")?;
    }
    for entry in &entries {
        let slash = if entry.is_dir { "/" } else { "" };
        let size = if entry.is_dir { "-".to_string() } else { entry.size.to_string() };
        let date = entry
            .modified
            .map(httpdate::fmt_http_date)
            .unwrap_or_else(|| "-".into());
        conn.write(format!(
            "<tr><td><a href=\"{0}{slash}\">{0}{slash}</a></td><td>{size}</td><td>{date}</td></tr>\n",
            entry.name
        ))?;
    }
    conn.write("</table>\n</body></html>\n")?;
    conn.finalize_output();
    Ok(())
}
