#![cfg_attr(docsrs, feature(doc_cfg))]
//! The vantage6 node.
//!
//! A node runs at the premises of an organization. It authenticates against
//! the central server, keeps an event channel open to hear about new tasks,
//! runs the algorithm of every task addressed to it in a container next to
//! the local data and reports the encrypted outcome back.
//!
//! The node is made of a few long-running services:
//!
//! - the [`node::Node`] main loop, which takes results from the
//!   [`queue::TaskQueue`] and starts their containers,
//! - the [`socket::SocketChannel`], which delivers server events to the node
//!   and reconnects or refreshes the token as needed,
//! - the [`reporter::Reporter`], which encrypts and uploads the outputs of the
//!   finished containers,
//! - the [`proxy`] server, through which the containers talk to the server.

pub mod backend;
pub mod docker;
pub mod node;
pub mod proxy;
pub mod queue;
pub mod reporter;
pub mod server;
pub mod settings;
pub mod socket;

#[cfg(test)]
pub(crate) mod testutils;

use std::{future::Future, sync::Arc};

use tokio::{sync::mpsc, task::JoinSet};
use tracing::{error, info, warn};
use vantage6_client::{reqwest_backend, Client};
use vantage6_core::{crypto, PrincipalKind};

use crate::{
    docker::DockerBackend,
    node::{Node, NodeError},
    proxy::Proxy,
    queue::TaskQueue,
    reporter::Reporter,
    settings::Settings,
    socket::{SocketChannel, WebSocketConnector},
};

/// The long-running services of a node, each on its own task.
struct Services {
    tasks: JoinSet<(&'static str, Result<(), NodeError>)>,
}

impl Services {
    fn new() -> Self {
        Self { tasks: JoinSet::new() }
    }

    fn spawn<F>(&mut self, name: &'static str, service: F)
    where
        F: Future<Output = Result<(), NodeError>> + Send + 'static,
    {
        self.tasks.spawn(async move { (name, service.await) });
    }

    /// Waits for the first service to stop and aborts the others.
    async fn supervise(mut self) -> Result<(), NodeError> {
        let outcome = match self.tasks.join_next().await {
            Some(Ok((name, outcome))) => {
                warn!("shutting down: {} terminated", name);
                outcome
            }
            Some(Err(e)) => {
                error!("shutting down: {}", e);
                Err(NodeError::Join(e))
            }
            None => Ok(()),
        };
        self.tasks.shutdown().await;
        outcome
    }
}

/// Runs the node until one of its services stops.
///
/// The queue is filled once the event channel is connected, so no task
/// posted in between is missed.
///
/// # Errors
/// Fails when the node can't be set up, or when a service stops on a fatal
/// error.
pub async fn run(settings: Settings) -> Result<(), NodeError> {
    crypto::init()?;
    let socket_url = settings.socket_url()?;
    let Settings {
        api_key,
        server: server_settings,
        encryption,
        databases,
        socket: socket_settings,
        proxy: proxy_settings,
        docker: docker_settings,
        ..
    } = settings;

    let http = reqwest_backend(server_settings.request_timeout())?;
    let server = Arc::new(Client::new(
        http,
        server_settings.client_settings(),
        PrincipalKind::Node,
    )?);

    let node_id = node::authenticate(server.as_ref(), &api_key, server_settings.auth_retry_delay()).await;
    let identity = node::whoami(server.as_ref(), node_id).await?;
    let cryptor = node::setup_encryption(server.as_ref(), &encryption, &identity).await?;

    let queue = Arc::new(TaskQueue::new());
    let (completions_tx, completions_rx) = mpsc::unbounded_channel();
    let backend = DockerBackend::new(docker_settings, proxy_settings.host.clone(), completions_tx);
    let node = Arc::new(
        Node::new(
            server.clone(),
            backend,
            queue.clone(),
            Some(cryptor.clone()),
            identity.clone(),
            databases,
        )
        .allow_unencrypted_fallback(encryption.allow_unencrypted_fallback),
    );

    let (channel, socket) = SocketChannel::new(
        WebSocketConnector::new(socket_url),
        socket_settings,
        identity.node_id(),
        identity.rooms(),
    );
    let reporter = Reporter::new(server.clone(), cryptor.clone(), queue, socket, identity);
    let proxy = Proxy::new(server, cryptor);
    let bind_address = proxy_settings.bind_address;
    info!("proxy server listening on {}", bind_address);

    let mut services = Services::new();
    let handler = node.clone();
    services.spawn("event channel", async move {
        channel.run(handler).await.map_err(NodeError::from)
    });
    services.spawn("reporter", reporter.run(completions_rx));
    services.spawn("main loop", async move { node.run_main_loop().await });
    services.spawn("proxy server", async move {
        proxy::serve(bind_address, proxy).await;
        Err(NodeError::Stopped("proxy server"))
    });
    services.supervise().await
}
