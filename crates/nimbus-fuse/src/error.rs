//! Error-to-errno translation.

use std::ffi::c_int;

use nimbus_core::domain::DomainError;
use nimbus_core::NimbusError;

/// Map a process error onto the errno the kernel expects.
///
/// `Offline` maps to EIO only where it surfaces at all — reads of
/// cached data never produce it, because the read path does not touch
/// the network.
#[must_use]
pub fn errno_for(err: &NimbusError) -> c_int {
    match err {
        NimbusError::NotFound(_) => libc::ENOENT,
        NimbusError::AlreadyExists(_) => libc::EEXIST,
        NimbusError::InvalidName(_) => libc::EINVAL,
        NimbusError::PermissionDenied(_) => libc::EACCES,
        NimbusError::Domain(DomainError::InvalidName(_)) => libc::EINVAL,
        NimbusError::Domain(_) => libc::EIO,
        NimbusError::Offline(_) => libc::EIO,
        NimbusError::Transient(_) => libc::EAGAIN,
        NimbusError::AuthExpired | NimbusError::AuthFailed(_) => libc::EACCES,
        NimbusError::PreconditionFailed(_) => libc::EIO,
        NimbusError::Integrity(_) => libc::EIO,
        NimbusError::Corruption(_) => libc::EIO,
        NimbusError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semantic_errnos() {
        assert_eq!(errno_for(&NimbusError::NotFound("x".into())), libc::ENOENT);
        assert_eq!(
            errno_for(&NimbusError::AlreadyExists("x".into())),
            libc::EEXIST
        );
        assert_eq!(
            errno_for(&NimbusError::InvalidName("a:b".into())),
            libc::EINVAL
        );
        assert_eq!(
            errno_for(&NimbusError::Domain(DomainError::InvalidName("a|b".into()))),
            libc::EINVAL
        );
        assert_eq!(
            errno_for(&NimbusError::PermissionDenied("x".into())),
            libc::EACCES
        );
    }

    #[test]
    fn test_io_errno_passthrough() {
        let err = NimbusError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(errno_for(&err), libc::ENOSPC);
    }

    #[test]
    fn test_infrastructure_errors_are_eio() {
        assert_eq!(errno_for(&NimbusError::Offline("down".into())), libc::EIO);
        assert_eq!(errno_for(&NimbusError::Integrity("hash".into())), libc::EIO);
        assert_eq!(
            errno_for(&NimbusError::Corruption("page".into())),
            libc::EIO
        );
    }
}
