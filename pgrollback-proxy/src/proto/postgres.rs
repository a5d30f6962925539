use async_trait::async_trait;
use pgrollback_core::err::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{conf::ProxyConf, peekable::Peekable, stream::Stream};

use super::Protocol;

pub struct PostgresProtocol {
    conf: &'static ProxyConf,
}

impl PostgresProtocol {
    pub fn new(conf: &'static ProxyConf) -> Self {
        Self { conf }
    }
}

const PG_SSL_REQUEST: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x04, 0xd2, 0x16, 0x2f];
const PG_PROTOCOL_VERSION: [u8; 4] = [0x00, 0x03, 0x00, 0x00];

/// Postgres protocol detection.
///
/// @see https://www.postgresql.org/docs/current/protocol-message-formats.html
///
/// The proxy does not terminate TLS, so an SSLRequest is answered with 'N'
/// and the client is expected to continue with a plain StartupMessage.
#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send + 'static> Protocol<S> for PostgresProtocol {
    async fn matches(&self, con: &mut Peekable<S>) -> Result<bool> {
        // First, check if this is an SSLRequest
        let mut buf = [0u8; 8];
        if con.peek(&mut buf[..]).await.is_err() {
            return Ok(false);
        }

        if buf == PG_SSL_REQUEST {
            return Ok(true);
        }

        // Second, check if this is a StartupMessage
        if buf[4..] == PG_PROTOCOL_VERSION {
            return Ok(true);
        }

        Ok(false)
    }

    async fn handle(&mut self, mut con: Peekable<S>) -> Result<()> {
        // Decline the SSL upgrade, if requested, and consume the request
        // so the handler sees a clean StartupMessage.
        // We peek first as we do not want to accidentally consume the
        // StartupMessage from the underlying stream.
        // @see https://www.postgresql.org/docs/current/protocol-flow.html#id-1.10.5.7.12
        let mut buf = [0u8; 8];
        con.peek(&mut buf[..]).await?;

        if buf == PG_SSL_REQUEST {
            con.read_exact(&mut buf).await?;
            con.write_all(b"N").await?;
            con.flush().await?;
        }

        self.conf
            .handlers
            .postgres
            .handle(Box::new(Stream(con)))
            .await
    }
}
