use nix::errno::Errno;

pub fn anyhow_errno(message_errno: Errno, message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(message_errno).context(message.into())
}

/// Errno a host filesystem adapter should report for `err`.
pub fn errno_of(err: &anyhow::Error) -> Errno {
    if let Some(errno) = err.root_cause().downcast_ref::<Errno>() {
        return *errno;
    }
    match err.root_cause().downcast_ref::<std::io::Error>() {
        Some(io_err) => io_err.raw_os_error().map_or(Errno::EIO, Errno::from_raw),
        None => Errno::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_survives_context() {
        let err = anyhow_errno(Errno::EINVAL, "bad buffer").context("read failed");
        assert_eq!(errno_of(&err), Errno::EINVAL);
        assert!(format!("{err:#}").contains("bad buffer"));
    }

    #[test]
    fn unknown_errors_map_to_eio() {
        assert_eq!(errno_of(&anyhow::anyhow!("boom")), Errno::EIO);
        let io = anyhow::Error::new(std::io::Error::from_raw_os_error(libc_enoent()));
        assert_eq!(errno_of(&io), Errno::ENOENT);
    }

    fn libc_enoent() -> i32 {
        Errno::ENOENT as i32
    }
}
