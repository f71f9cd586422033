//! Relay server
//!
//! Owns the TCP listener and the room hub. Each accepted connection runs in
//! its own task; on shutdown the server stops accepting and closes every
//! room, which disconnects every session.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::AppError;
use crate::handler::handle_connection;
use crate::hub::Hub;

/// The relay server
pub struct Server {
    listener: TcpListener,
    hub: Arc<Hub>,
}

impl Server {
    /// Validate `config` and bind its listen address
    pub async fn bind(config: Config) -> Result<Self, AppError> {
        config.validate()?;
        let listener = TcpListener::bind(&config.addr).await?;
        Ok(Self {
            listener,
            hub: Hub::new(config),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.hub)
    }

    /// Accept connections until `shutdown` completes
    ///
    /// Then closes every room and waits, up to a grace period, for their
    /// teardown to finish.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, hub } = self;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!("New connection from {}", addr);
                        spawn_handler(stream, &hub);
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
            }
        }

        info!("Server shutting down");
        hub.close_all();

        // Each member gets up to one write deadline for the notice and one for the close
        let grace = hub.config().write_wait * 3;
        if !hub.wait_empty(grace).await {
            warn!("{} rooms still closing after {:?}", hub.room_count(), grace);
        }
        info!("Server stopped");
    }

    /// Accept connections until Ctrl-C
    pub async fn run_until_ctrl_c(self) {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to install ctrl-c handler: {}", e);
            }
        })
        .await;
    }
}

fn spawn_handler(stream: TcpStream, hub: &Arc<Hub>) {
    let hub = Arc::clone(hub);
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, hub).await {
            error!("Connection handler error: {}", e);
        }
    });
}
