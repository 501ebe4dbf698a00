//! The pass handler: a terminal stage that produces nothing of its
//! own. It backs redirects, literal write targets, CORS preflights and
//! error responses arranged before a real handler could run.

use crate::conn::Conn;
use crate::error::HttpResult;
use crate::stage::{Stage, StageKind};

pub struct PassHandler;

impl Stage for PassHandler {
    fn name(&self) -> &'static str {
        "pass"
    }

    fn kind(&self) -> StageKind {
        StageKind::Handler
    }

    fn ready(&self, conn: &mut Conn) -> HttpResult<()> {
        if !conn.tx.finalized {
            if conn.tx.length < 0 {
                conn.tx.length = 0;
            }
            conn.finalize_output();
        }
        Ok(())
    }
}
