//! Path-addressed local channel: a Unix socket on Unix, a loopback TCP port
//! recorded in the endpoint file elsewhere.

use super::TerminalScope;
use std::io;
use std::path::Path;

pub(crate) use imp::{bind, connect, owner_uid, Listener, Stream};

pub(crate) fn remove_endpoint(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::trace!(path = %path.display(), "Removed terminal endpoint"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove terminal endpoint"),
    }
}

#[cfg(unix)]
mod imp {
    use super::TerminalScope;
    use std::io;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    pub(crate) type Stream = tokio::net::UnixStream;

    pub(crate) struct Listener {
        inner: tokio::net::UnixListener,
    }

    impl Listener {
        /// Accept one connection along with the peer's uid
        pub(crate) async fn accept(&self) -> io::Result<(Stream, Option<u32>)> {
            let (stream, _) = self.inner.accept().await?;
            let uid = stream.peer_cred().ok().map(|cred| cred.uid());
            Ok((stream, uid))
        }
    }

    pub(crate) fn bind(path: &Path, scope: TerminalScope) -> io::Result<Listener> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if path.exists() {
            // A live listener means another instance owns this endpoint
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{} is served by another instance", path.display()),
                ));
            }
            std::fs::remove_file(path)?;
        }

        let inner = tokio::net::UnixListener::bind(path)?;
        let mode = match scope {
            TerminalScope::Local => 0o600,
            TerminalScope::Global => 0o666,
        };
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        Ok(Listener { inner })
    }

    pub(crate) async fn connect(path: &Path) -> io::Result<Stream> {
        tokio::net::UnixStream::connect(path).await
    }

    pub(crate) fn owner_uid() -> Option<u32> {
        // SAFETY: geteuid has no preconditions and cannot fail
        Some(unsafe { libc::geteuid() })
    }
}

#[cfg(not(unix))]
mod imp {
    use super::TerminalScope;
    use std::io;
    use std::path::Path;

    pub(crate) type Stream = tokio::net::TcpStream;

    pub(crate) struct Listener {
        inner: tokio::net::TcpListener,
    }

    impl Listener {
        pub(crate) async fn accept(&self) -> io::Result<(Stream, Option<u32>)> {
            let (stream, _) = self.inner.accept().await?;
            Ok((stream, None))
        }
    }

    pub(crate) fn bind(path: &Path, _scope: TerminalScope) -> io::Result<Listener> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        std::fs::write(path, port.to_string())?;
        Ok(Listener {
            inner: tokio::net::TcpListener::from_std(listener)?,
        })
    }

    pub(crate) async fn connect(path: &Path) -> io::Result<Stream> {
        let port: u16 = tokio::fs::read_to_string(path)
            .await?
            .trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tokio::net::TcpStream::connect(("127.0.0.1", port)).await
    }

    pub(crate) fn owner_uid() -> Option<u32> {
        None
    }
}
