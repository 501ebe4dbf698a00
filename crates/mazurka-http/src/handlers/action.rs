//! The action handler: routes whose target names a callback registered
//! on the `Http` context.

use crate::conn::Conn;
use crate::error::{HttpError, HttpResult};
use crate::stage::{Stage, StageKind};

pub struct ActionHandler;

impl Stage for ActionHandler {
    fn name(&self) -> &'static str {
        "action"
    }

    fn kind(&self) -> StageKind {
        StageKind::Handler
    }

    fn ready(&self, conn: &mut Conn) -> HttpResult<()> {
        if conn.tx.finalized {
            return Ok(());
        }
        let key = if conn.rx.target.is_empty() {
            conn.rx.path_info.clone()
        } else {
            conn.rx.target.clone()
        };
        let action = conn
            .http
            .action(&key)
            .ok_or_else(|| HttpError::NotFound(format!("no action bound to {key}")))?;
        action(conn)
    }
}
