//! Transient-error classification.
//!
//! The control plane reports "not ready yet" conditions only through its
//! error text, so they are recognized by substring.

use meshboot_api::ApiError;

/// Error text of a control plane that is still starting up.
const BOOTING_SIGNATURES: &[&str] = &[
    "No cluster leader",
    "ACL system is currently in legacy mode",
    "ACL support disabled",
    "ACL system not yet available",
    "Raft leadership lost",
    "rpc error making call: EOF",
];

/// The node is unreachable or reports that it is still booting.
pub fn is_booting(err: &ApiError) -> bool {
    if err.is_transport() {
        return true;
    }
    let message = err.message();
    BOOTING_SIGNATURES.iter().any(|sig| message.contains(sig))
}

/// The token has not replicated to the node yet (or the node is booting).
pub fn is_token_not_live(err: &ApiError) -> bool {
    is_booting(err) || err.is_not_found()
}

/// Any failure is worth retrying.
pub fn always(_: &ApiError) -> bool {
    true
}
