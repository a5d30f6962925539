use pgrollback_core::err::{bail, Result};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    conf::ProxyConf,
    peekable::Peekable,
    proto::{http1::Http1Protocol, postgres::PostgresProtocol, Protocol},
};

/// A connection made to the proxy server
pub struct Connection<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> {
    conf: &'static ProxyConf,
    inner: Peekable<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static> Connection<S> {
    pub fn new(conf: &'static ProxyConf, inner: S) -> Self {
        Self {
            conf,
            inner: Peekable::new(inner),
        }
    }

    /// Handles the incoming connection.
    ///
    /// The postgres check runs first as it needs the smaller lookahead and
    /// database traffic dominates on this port.
    pub async fn handle(mut self) -> Result<()> {
        let mut pg = PostgresProtocol::new(self.conf);

        if let Ok(true) = pg.matches(&mut self.inner).await {
            return pg.handle(self.inner).await;
        }

        let mut http = Http1Protocol::new(self.conf);

        if let Ok(true) = http.matches(&mut self.inner).await {
            return http.handle(self.inner).await;
        }

        bail!("Unknown protocol");
    }
}

#[cfg(test)]
mod tests {
    use tokio::{io::AsyncWriteExt, net::UnixStream};

    use crate::test::{create_socket_pair, mock_config, MockConnectionHandler};

    use super::*;

    fn mock_connection(conf: &'static ProxyConf) -> (UnixStream, Connection<UnixStream>) {
        let (client, server) = create_socket_pair();

        (client, Connection::new(conf, server))
    }

    #[derive(Debug, PartialEq)]
    struct ReceivedConnections {
        postgres: usize,
        http: usize,
    }

    impl From<&'static ProxyConf> for ReceivedConnections {
        fn from(c: &'static ProxyConf) -> Self {
            Self {
                postgres: MockConnectionHandler::from_boxed(&c.handlers.postgres).num_received(),
                http: MockConnectionHandler::from_boxed(&c.handlers.http).num_received(),
            }
        }
    }

    #[tokio::test]
    async fn test_connection_postgres_protocol() {
        let conf = mock_config();
        let (mut client, connection) = mock_connection(conf);

        // Send postgres StartupMessage prefix
        client
            .write_all(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00])
            .await
            .unwrap();
        client.flush().await.unwrap();

        connection.handle().await.unwrap();

        assert_eq!(
            ReceivedConnections::from(conf),
            ReceivedConnections {
                postgres: 1,
                http: 0
            }
        )
    }

    #[tokio::test]
    async fn test_connection_http_protocol() {
        let conf = mock_config();
        let (mut client, connection) = mock_connection(conf);

        client
            .write_all(b"GET /api/sessions HTTP/1.1")
            .await
            .unwrap();
        client.flush().await.unwrap();

        connection.handle().await.unwrap();

        assert_eq!(
            ReceivedConnections::from(conf),
            ReceivedConnections {
                postgres: 0,
                http: 1
            }
        )
    }

    #[tokio::test]
    async fn test_connection_unknown_protocol() {
        let conf = mock_config();
        let (mut client, connection) = mock_connection(conf);

        client.write_all(b"who knows???????????????").await.unwrap();

        connection.handle().await.unwrap_err();

        assert_eq!(
            ReceivedConnections::from(conf),
            ReceivedConnections {
                postgres: 0,
                http: 0
            }
        )
    }
}
