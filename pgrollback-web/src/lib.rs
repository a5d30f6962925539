use axum::{routing::IntoMakeService, Extension, Router};
use hyper::server::accept::from_stream;
use pgrollback_core::err::{Context, Result};
use pgrollback_logging::{error, warn};
use pgrollback_proxy::stream::IOStream;
use tokio::{
    runtime::Handle,
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_stream::wrappers::ReceiverStream;

mod api;
mod handler;
mod healthcheck;
mod state;

pub use handler::*;
pub use state::*;

/// The operator dashboard's http api, served from connections the proxy
/// hands over after peek-based protocol detection.
pub struct HttpApi {
    srv: Option<JoinHandle<Result<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    handler: HttpApiHandler,
    rt_handle: Handle,
}

impl HttpApi {
    /// Starts the http api server
    pub async fn start(state: HttpApiState) -> Result<Self> {
        let rt_handle = Handle::current();
        let service = Self::app(state).into_make_service();

        let (queue, rx) = mpsc::channel(128);
        let (shutdown_tx, _) = broadcast::channel(1);

        let srv = Self::server(rx, service, shutdown_tx.subscribe());

        Ok(Self {
            srv: Some(srv),
            shutdown_tx,
            handler: HttpApiHandler { queue },
            rt_handle,
        })
    }

    fn app(state: HttpApiState) -> Router {
        Router::new()
            .nest("/api", api::router())
            .nest("/health", healthcheck::router())
            .layer(Extension(state))
    }

    fn server(
        rx: mpsc::Receiver<Result<Box<dyn IOStream>>>,
        svc: IntoMakeService<Router>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<Result<()>> {
        let server = axum::Server::builder(from_stream(ReceiverStream::new(rx)))
            .http1_only(true)
            .serve(svc)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            });

        tokio::spawn(async move {
            if let Err(err) = server.await {
                error!("Http server error: {:?}", err);
                return Err(err).context("Http server error");
            }

            Ok(())
        })
    }

    /// Gets the incoming request handler
    pub fn handler(&self) -> HttpApiHandler {
        self.handler.clone()
    }

    /// Terminates the http api server
    pub fn terminate(mut self) -> Result<()> {
        self.terminate_mut()
    }

    fn terminate_mut(&mut self) -> Result<()> {
        let srv = match self.srv.take() {
            Some(srv) => srv,
            None => return Ok(()),
        };

        let _ = self.shutdown_tx.send(());
        let _ = self.rt_handle.block_on(srv)?;

        Ok(())
    }
}

impl Drop for HttpApi {
    fn drop(&mut self) {
        if let Err(err) = self.terminate_mut() {
            warn!("Error while dropping http server: {:?}", err);
        }
    }
}
