use async_trait::async_trait;
use pgrollback_core::err::Result;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{conf::ProxyConf, peekable::Peekable, stream::Stream};

use super::Protocol;

pub struct Http1Protocol {
    conf: &'static ProxyConf,
}

impl Http1Protocol {
    pub fn new(conf: &'static ProxyConf) -> Self {
        Self { conf }
    }
}

const HTTP_METHODS: [&str; 7] = [
    "OPTIONS ",
    "GET ",
    "HEAD ",
    "POST ",
    "PUT ",
    "DELETE ",
    "PATCH ",
];
const PEEK_LENGTH: usize = "OPTIONS ".len();

/// HTTP/1.1 protocol detection for the operator dashboard.
///
/// @see https://www.rfc-editor.org/rfc/rfc2616.html
#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static> Protocol<S> for Http1Protocol {
    async fn matches(&self, con: &mut Peekable<S>) -> Result<bool> {
        let mut buf = [0u8; PEEK_LENGTH];
        if con.peek(&mut buf[..]).await.is_err() {
            return Ok(false);
        }

        for method in HTTP_METHODS {
            if &buf[..method.len()] == method.as_bytes() {
                return Ok(true);
            }
        }

        Ok(false)
    }

    async fn handle(&mut self, con: Peekable<S>) -> Result<()> {
        self.conf.handlers.http.handle(Box::new(Stream(con))).await
    }
}

#[cfg(test)]
mod tests {
    use crate::test::mock_config;

    use super::*;

    #[tokio::test]
    async fn test_proto_http1_matches() {
        let proto = Http1Protocol::new(mock_config());

        assert_eq!(proto.matches(&mut vec![0u8].into()).await.unwrap(), false);
        assert_eq!(
            proto.matches(&mut b"abc".to_vec().into()).await.unwrap(),
            false
        );
        assert_eq!(
            proto
                .matches(&mut b"GET / HTTP/1.1".to_vec().into())
                .await
                .unwrap(),
            true
        );
        assert_eq!(
            proto
                .matches(&mut b"POST /abc HTTP/1.1".to_vec().into())
                .await
                .unwrap(),
            true
        );
        assert_eq!(
            proto
                .matches(&mut b"DELETE /api/sessions/t1 HTTP/1.1".to_vec().into())
                .await
                .unwrap(),
            true
        );
        assert_eq!(
            proto
                .matches(
                    // Postgres StartupMessage
                    &mut [0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00]
                        .to_vec()
                        .into()
                )
                .await
                .unwrap(),
            false
        );
    }
}
