//! Datagram Endpoints
//!
//! Socket addressing is purely positional: every process derives every peer's
//! address from the shared socket directory and the peer's role, so no
//! address exchange is needed before the first message.

use crate::types::KidId;
use std::path::{Path, PathBuf};

/// The Coordinator's datagram socket path
pub fn coordinator_endpoint(socket_dir: &Path) -> PathBuf {
    socket_dir.join("coordinator.ipc")
}

/// A strand's datagram socket path, derived from its kid id.
/// Kid 0 is the Coordinator.
pub fn strand_endpoint(socket_dir: &Path, kid: KidId) -> PathBuf {
    if kid == 0 {
        coordinator_endpoint(socket_dir)
    } else {
        socket_dir.join(format!("strand-{kid}.ipc"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_per_kid() {
        let dir = Path::new("/run/weft");
        assert_eq!(
            coordinator_endpoint(dir),
            PathBuf::from("/run/weft/coordinator.ipc")
        );
        assert_eq!(
            strand_endpoint(dir, 3),
            PathBuf::from("/run/weft/strand-3.ipc")
        );
        assert_ne!(strand_endpoint(dir, 1), strand_endpoint(dir, 2));
    }

    #[test]
    fn kid_zero_is_the_coordinator() {
        let dir = Path::new("/run/weft");
        assert_eq!(strand_endpoint(dir, 0), coordinator_endpoint(dir));
    }
}
