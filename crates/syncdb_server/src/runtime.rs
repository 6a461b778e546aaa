//! Event loop.
//!
//! A single-threaded tokio runtime waits on the command socket, the agent
//! socket, the timer and signals. Each event is handled to completion before
//! the next one is picked up, so [`Server`] needs no locking.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::rundir::{remove_stale_socket, RunDir};
use crate::server::Server;
use std::future::Future;
use std::os::unix::net::UnixDatagram as StdUnixDatagram;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use syncdb_nsf::UnixAgentTransport;
use syncdb_protocol::MAX_DATAGRAM;
use tokio::net::UnixDatagram;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// A server bound to its run directory, ready to run.
#[derive(Debug)]
pub struct Daemon {
    server: Server,
    commands: StdUnixDatagram,
    agent: StdUnixDatagram,
    _run_dir: RunDir,
}

impl Daemon {
    /// Locks the run directory and binds the command and agent sockets.
    ///
    /// Sockets left behind by a previous run are removed first; holding the
    /// lock guarantees no live server owns them.
    pub fn bind(config: ServerConfig) -> ServerResult<Self> {
        let run_dir = RunDir::lock(config.run_dir())?;
        remove_stale_socket(&config.command_socket)?;
        remove_stale_socket(&config.agent_socket)?;

        let commands = bind_nonblocking(&config.command_socket)?;
        let agent = bind_nonblocking(&config.agent_socket)?;
        let transport = UnixAgentTransport::new(&config.agent_peer)?;
        info!(
            run_dir = %run_dir.path().display(),
            command_socket = %config.command_socket.display(),
            agent_socket = %config.agent_socket.display(),
            "server sockets bound"
        );

        let server = Server::new(config, Box::new(transport))?;
        Ok(Self {
            server,
            commands,
            agent,
            _run_dir: run_dir,
        })
    }

    /// Runs until SIGINT or SIGTERM on a current-thread runtime.
    pub fn serve(self) -> ServerResult<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(async {
            match shutdown_signal() {
                Ok(shutdown) => self.run(shutdown).await,
                Err(err) => Err(err),
            }
        })
    }

    /// Runs on a dedicated thread until the returned handle is shut down.
    pub fn spawn(self) -> ServerResult<ServerHandle> {
        let (tx, rx) = oneshot::channel::<()>();
        let thread = thread::Builder::new()
            .name("syncdb-server".into())
            .spawn(move || -> ServerResult<()> {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                runtime.block_on(self.run(async move {
                    let _ = rx.await;
                }))
            })?;
        Ok(ServerHandle {
            shutdown: Some(tx),
            thread: Some(thread),
        })
    }

    /// Runs the event loop until `shutdown` completes or a fatal error.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> ServerResult<()> {
        let Self {
            mut server,
            commands,
            agent,
            _run_dir,
        } = self;
        let command_path = server.config().command_socket.clone();
        let agent_path = server.config().agent_socket.clone();

        let result = event_loop(&mut server, commands, agent, shutdown).await;
        if let Err(err) = &result {
            error!(error = %err, "server stopped by fatal error");
        }

        for path in [&command_path, &agent_path] {
            if let Err(err) = remove_stale_socket(path) {
                debug!(path = %path.display(), error = %err, "could not remove socket");
            }
        }
        info!(stats = ?server.stats(), "server stopped");
        result
    }
}

fn bind_nonblocking(path: &std::path::Path) -> ServerResult<StdUnixDatagram> {
    let socket = StdUnixDatagram::bind(path)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

async fn event_loop(
    server: &mut Server,
    commands: StdUnixDatagram,
    agent: StdUnixDatagram,
    shutdown: impl Future<Output = ()>,
) -> ServerResult<()> {
    let commands = UnixDatagram::from_std(commands)?;
    let agent = UnixDatagram::from_std(agent)?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut timer = interval(server.config().tick_interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut command_buf = vec![0u8; MAX_DATAGRAM];
    let mut agent_buf = vec![0u8; MAX_DATAGRAM];
    tokio::pin!(shutdown);

    info!(version = syncdb_core::VERSION, "server running");
    loop {
        let outcome = tokio::select! {
            () = &mut shutdown => {
                info!("shutdown requested");
                return Ok(());
            }
            received = commands.recv_from(&mut command_buf) => match received {
                Ok((len, source)) => server.handle_datagram(&command_buf[..len], source.as_pathname()),
                Err(err) => {
                    warn!(error = %err, "command socket receive failed");
                    Ok(())
                }
            },
            received = agent.recv(&mut agent_buf) => match received {
                Ok(len) => server.handle_agent_datagram(&agent_buf[..len], Instant::now()),
                Err(err) => {
                    warn!(error = %err, "agent socket receive failed");
                    Ok(())
                }
            },
            _ = timer.tick() => server.tick(Instant::now()),
            _ = hangup.recv() => {
                info!("state dump requested\n{}", server.debug_dump());
                Ok(())
            }
        };
        outcome?;
    }
}

/// Completes on SIGINT or SIGTERM.
pub fn shutdown_signal() -> ServerResult<impl Future<Output = ()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => info!(signal = "SIGINT", "shutdown signal received"),
            _ = terminate.recv() => info!(signal = "SIGTERM", "shutdown signal received"),
        }
    })
}

/// Handle to a server running on its own thread.
#[derive(Debug)]
pub struct ServerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<ServerResult<()>>>,
}

impl ServerHandle {
    /// Returns true once the server thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stops the server and waits for its thread.
    pub fn shutdown(mut self) -> ServerResult<()> {
        self.stop()
    }

    fn stop(&mut self) -> ServerResult<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| ServerError::config("server thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "server thread ended with an error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncdb_core::PersistConfig;
    use tempfile::tempdir;

    #[test]
    fn bind_takes_the_run_dir_and_cleans_up() {
        let dir = tempdir().unwrap();
        let run = dir.path().join("run");
        let config = ServerConfig::new(&run).with_persist(PersistConfig::under(dir.path()));

        let daemon = Daemon::bind(config.clone()).unwrap();
        assert!(config.command_socket.exists());
        assert!(matches!(
            Daemon::bind(config.clone()),
            Err(ServerError::Locked { .. })
        ));

        let handle = daemon.spawn().unwrap();
        handle.shutdown().unwrap();
        assert!(!config.command_socket.exists());
        assert!(!config.agent_socket.exists());

        // The lock is released with the daemon.
        drop(Daemon::bind(config).unwrap());
    }
}
