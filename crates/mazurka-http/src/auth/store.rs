//! The application credential store interface.
//!
//! The built-in config store keeps digests of configured users; an
//! embedding host can instead supply its own verifier (database, PAM
//! wrapper, single sign-on) through this trait.

use std::sync::Arc;

use crate::conn::Conn;

/// Verifies a username/password pair. Implementations must not block
/// the dispatcher for long; slow backends should pre-warm or cache.
pub trait Verifier: Send + Sync {
    fn verify_user(self: Arc<Self>, conn: &mut Conn, username: &str, password: &str) -> bool;
}

/// A verifier built from a plain closure.
pub struct FnVerifier<F>(pub F);

impl<F> Verifier for FnVerifier<F>
where
    F: Fn(&mut Conn, &str, &str) -> bool + Send + Sync,
{
    fn verify_user(self: Arc<Self>, conn: &mut Conn, username: &str, password: &str) -> bool {
        (self.0)(conn, username, password)
    }
}
