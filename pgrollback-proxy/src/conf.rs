use std::net::SocketAddr;

use crate::handler::ConnectionHandler;

/// The config for the proxy
pub struct ProxyConf {
    /// The socket address to bind on
    pub addr: SocketAddr,
    /// Protocol handlers
    pub handlers: HandlerConf,
}

/// Connection handlers
pub struct HandlerConf {
    pub(crate) postgres: Box<dyn ConnectionHandler>,
    pub(crate) http: Box<dyn ConnectionHandler>,
}

impl HandlerConf {
    pub fn new(
        postgres: impl ConnectionHandler + 'static,
        http: impl ConnectionHandler + 'static,
    ) -> Self {
        Self {
            postgres: Box::new(postgres),
            http: Box::new(http),
        }
    }
}
