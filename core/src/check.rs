//! Validity and safety checks for externally supplied parameters
//!
//! Everything that crosses a trust boundary (IPC inputs, filesystem paths
//! handed to the service, values embedded into system commands) is vetted
//! here before use.
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

/// VLAN IDs 0 and 1 are reserved, 4095 is the implementation marker.
pub fn is_valid_vlan_id(vid: u16) -> bool {
    (2..=4094).contains(&vid)
}

/// PCP is a 3 bit field in the 802.1Q tag.
pub fn is_valid_pcp(pcp: u8) -> bool {
    pcp <= 7
}

pub fn is_valid_path(path: &Path) -> bool {
    path.is_absolute()
}

/// A regular file that is neither a symlink nor one name of a hardlinked
/// inode. Used for the lock file.
pub fn is_valid_file(path: &Path) -> bool {
    if !is_valid_path(path) {
        return false;
    }

    // symlink_metadata does not follow the final component
    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(_) => return false,
    };

    if meta.file_type().is_symlink() {
        return false;
    }

    // More than one reference means somebody hardlinked the path
    if meta.nlink() > 1 {
        return false;
    }

    meta.file_type().is_file()
}

/// The service endpoint must be a socket inode with a single name.
///
/// Clients run this on every open so that a replaced or hardlinked endpoint
/// is rejected instead of silently talked to.
pub fn is_valid_unix_domain_socket(path: &Path) -> bool {
    if !is_valid_path(path) {
        return false;
    }

    let meta = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(_) => return false,
    };

    if meta.nlink() > 1 {
        return false;
    }

    meta.file_type().is_socket()
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixDatagram;

    use super::*;

    #[test]
    fn vlan_id_boundaries() {
        assert!(!is_valid_vlan_id(0));
        assert!(!is_valid_vlan_id(1));
        assert!(is_valid_vlan_id(2));
        assert!(is_valid_vlan_id(4094));
        assert!(!is_valid_vlan_id(4095));
    }

    #[test]
    fn pcp_boundaries() {
        assert!(is_valid_pcp(0));
        assert!(is_valid_pcp(7));
        assert!(!is_valid_pcp(8));
    }

    #[test]
    fn relative_paths_are_rejected() {
        assert!(!is_valid_path(Path::new("var/lock/detd")));
        assert!(is_valid_path(Path::new("/var/lock/detd")));
    }

    #[test]
    fn regular_file_accepted_hardlink_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("lock");
        std::fs::write(&file, "1234").unwrap();
        assert!(is_valid_file(&file));

        let link = dir.path().join("lock2");
        std::fs::hard_link(&file, &link).unwrap();
        assert!(!is_valid_file(&file));
    }

    #[test]
    fn socket_inode_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("endpoint.sock");
        let _socket = UnixDatagram::bind(&path).unwrap();
        assert!(is_valid_unix_domain_socket(&path));

        let file = dir.path().join("plain");
        std::fs::write(&file, "").unwrap();
        assert!(!is_valid_unix_domain_socket(&file));
    }
}
