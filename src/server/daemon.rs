//! Main-socket lifecycle for `sockexecd`

use super::service::ServerService;
use crate::identity::main_socket_path;
use crate::resolver::clean_path;
use crate::rpc::RpcServer;
use anyhow::{anyhow, bail, Context, Result};
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{info, warn};

/// Service name clients address as `ServerService.<Method>`
pub const SERVICE_NAME: &str = "ServerService";

#[derive(Debug, Clone, Default)]
pub struct DaemonOptions {
    pub root: PathBuf,
    pub name: String,
    /// Directory to chdir into before listening
    pub start_dir: Option<PathBuf>,
    /// Resolved `KEY=VALUE` base overlay for every child
    pub base_env: Vec<String>,
}

pub struct Daemon {
    socket_path: PathBuf,
    listener: UnixListener,
    service: Arc<ServerService>,
    shutdown: Arc<AtomicBool>,
}

impl Daemon {
    /// Prepare the root directory and bind the main socket
    pub fn bind(options: &DaemonOptions) -> Result<Self> {
        if options.name.is_empty() {
            bail!("server name must not be empty");
        }
        let root = prepare_root(&options.root)?;

        if let Some(dir) = &options.start_dir {
            std::env::set_current_dir(dir).with_context(|| format!("server chdir {:?}", dir))?;
            if let Ok(cwd) = std::env::current_dir() {
                info!(cwd = %cwd.display(), "server cwd");
            }
        }

        let socket_path = main_socket_path(&root, &options.name);
        match fs::symlink_metadata(&socket_path) {
            Ok(_) => bail!("refusing to overwrite existing socket: {}", socket_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(anyhow!("stat socket {}: {}", socket_path.display(), e)),
        }

        let listener =
            UnixListener::bind(&socket_path).with_context(|| format!("listen {}", socket_path.display()))?;

        // Set socket permissions to 0600 (owner read/write only)
        let mut perms = fs::metadata(&socket_path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&socket_path, perms)?;

        info!(socket = %socket_path.display(), "server listening");

        Ok(Self {
            socket_path,
            listener,
            service: Arc::new(ServerService::new(root, options.base_env.clone())),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn service(&self) -> &Arc<ServerService> {
        &self.service
    }

    /// Setting this flag makes [`Daemon::run`] shut down
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Serve until the shutdown flag is set, then stop every session, wait
    /// for in-flight calls and remove the socket
    pub fn run(self) -> Result<()> {
        let server = Arc::new(RpcServer::new().with_service(SERVICE_NAME, self.service.clone()));
        let served = server.serve_listener(&self.listener, &self.shutdown);

        let stopped = self.service.cancel_all();
        warn!(sessions = stopped, "server shutting down; canceled all sessions");
        self.service.in_flight().wait_idle();

        drop(self.listener);
        if let Err(e) = fs::remove_file(&self.socket_path) {
            warn!(socket = %self.socket_path.display(), error = %e, "failed to remove main socket");
        }
        info!("server shutdown complete");

        served.context("accept loop failed")
    }
}

/// Absolute root, created 0755 when missing; `/` is refused
fn prepare_root(root: &Path) -> Result<PathBuf> {
    if root.as_os_str().is_empty() {
        bail!("root must not be empty");
    }
    let abs = if root.is_absolute() {
        clean_path(root)
    } else {
        clean_path(&std::env::current_dir().context("invalid root")?.join(root))
    };
    if abs == Path::new("/") {
        bail!("refusing to use root=/");
    }

    match fs::metadata(&abs) {
        Ok(meta) if meta.is_dir() => info!(root = %abs.display(), "server root"),
        Ok(_) => bail!("root is not a directory: {}", abs.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(&abs)
                .with_context(|| format!("mkdir root {}", abs.display()))?;
            info!(root = %abs.display(), "server root created");
        }
        Err(e) => return Err(anyhow!("stat root {}: {}", abs.display(), e)),
    }
    Ok(abs)
}
