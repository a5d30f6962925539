use async_trait::async_trait;
use pgrollback_core::err::{Error, Result};
use pgrollback_proxy::{handler::ConnectionHandler, stream::IOStream};
use tokio::sync::mpsc;

/// Feeds connections the proxy identified as http into the dashboard's
/// hyper server.
#[derive(Clone)]
pub struct HttpApiHandler {
    pub(crate) queue: mpsc::Sender<Result<Box<dyn IOStream>>>,
}

#[async_trait]
impl ConnectionHandler for HttpApiHandler {
    async fn handle(&self, con: Box<dyn IOStream>) -> Result<()> {
        self.queue
            .send(Ok(con))
            .await
            .map_err(|_| Error::msg("Request queue is closed"))
    }
}
