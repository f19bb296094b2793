//! TCP listener and server lifecycle.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::connection;
use crate::state::{RandomReassign, ReassignPolicy, State};

pub struct Server {
    config: ServerConfig,
    policy: Box<dyn ReassignPolicy>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            policy: Box::new(RandomReassign),
        }
    }

    /// Server with a custom current-channel reassignment policy (for testing).
    pub fn with_policy(config: ServerConfig, policy: Box<dyn ReassignPolicy>) -> Self {
        Self { config, policy }
    }

    /// Run the server until a fatal listener error or Ctrl-C. Shutdown runs
    /// the logoff cascade for every active session before the listener is
    /// dropped.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        tracing::info!("Listening on {}", listener.local_addr()?);
        let state = Arc::new(Mutex::new(State::new(self.policy)));

        tokio::select! {
            res = serve(listener, Arc::clone(&state)) => res,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                state.lock().unwrap().shutdown_all();
                Ok(())
            }
        }
    }

    /// Start the server and return the bound address + task handle (for
    /// testing).
    pub async fn start(self) -> Result<(SocketAddr, JoinHandle<Result<()>>)> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Listening on {addr}");
        let state = Arc::new(Mutex::new(State::new(self.policy)));
        let handle = tokio::spawn(serve(listener, state));
        Ok((addr, handle))
    }
}

async fn serve(listener: TcpListener, state: Arc<Mutex<State>>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = connection::handle(stream, addr, state).await {
                        tracing::error!("Connection error: {e}");
                    }
                });
            }
            Err(e) => {
                tracing::error!("Accept error: {e}");
                state.lock().unwrap().shutdown_all();
                return Err(e.into());
            }
        }
    }
}
