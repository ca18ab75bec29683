// Plugin socket housekeeping
//
// The runtime discovers plugins through sockets in its plugin directory; the
// real socket lives in a directory shared with the host and is symlinked in.

use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::net::UnixListener;

pub struct PluginSocket {
    socket: PathBuf,
    link: PathBuf,
}

impl PluginSocket {
    /// Binds `socket`, replacing a stale one, and force-links `link` to it.
    pub fn bind(socket: PathBuf, link: PathBuf) -> anyhow::Result<(Self, UnixListener)> {
        for dir in [socket.parent(), link.parent()].into_iter().flatten() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }

        remove_if_exists(&socket)
            .with_context(|| format!("Failed to remove stale socket {}", socket.display()))?;
        let listener = UnixListener::bind(&socket)
            .with_context(|| format!("Failed to bind {}", socket.display()))?;

        force_symlink(&socket, &link)
            .with_context(|| format!("Failed to link {}", link.display()))?;

        tracing::info!(socket = %socket.display(), link = %link.display(), "Plugin socket ready");
        Ok((Self { socket, link }, listener))
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn link(&self) -> &Path {
        &self.link
    }
}

impl Drop for PluginSocket {
    fn drop(&mut self) {
        // Leave the link alone if another instance has already replaced it.
        if std::fs::read_link(&self.link).is_ok_and(|target| target == self.socket) {
            if let Err(e) = std::fs::remove_file(&self.link) {
                tracing::warn!(link = %self.link.display(), error = %e, "Failed to remove plugin link");
            }
        }
        if let Err(e) = remove_if_exists(&self.socket) {
            tracing::warn!(socket = %self.socket.display(), error = %e, "Failed to remove plugin socket");
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn force_symlink(target: &Path, link: &Path) -> io::Result<()> {
    remove_if_exists(link)?;
    std::os::unix::fs::symlink(target, link)
}
