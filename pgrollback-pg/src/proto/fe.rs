// @see https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::{
    collections::HashMap,
    io::{Cursor, Read},
};

use pgrollback_core::err::{bail, ensure, Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::common::{read_cstr, write_cstr, CancelKey, PostgresMessage};

pub const PROTOCOL_VERSION: i32 = 196608;
const SSL_REQUEST_CODE: i32 = 80877103;
const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Messages received from the postgres frontend.
///
/// The proxy terminates the protocol, so unlike a blind pass-through every
/// message type we accept is parsed in full.
#[derive(Debug, Clone, PartialEq)]
pub enum PostgresFrontendMessage {
    StartupMessage(PostgresFrontendStartupMessage),
    SslRequest,
    CancelRequest(CancelKey),
    PasswordMessage(String),
    Query(String),
    Parse(Parse),
    Bind(Bind),
    Describe(Describe),
    Execute(Execute),
    Close(Close),
    Sync,
    Flush,
    Terminate,
}

/// The client's first message: protocol version + connection parameters
#[derive(Debug, Clone, PartialEq)]
pub struct PostgresFrontendStartupMessage {
    pub params: HashMap<String, String>,
}

impl PostgresFrontendStartupMessage {
    pub fn new(params: HashMap<String, String>) -> Self {
        Self { params }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parse {
    pub name: String,
    pub query: String,
    pub param_types: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bind {
    pub portal: String,
    pub statement: String,
    pub param_formats: Vec<i16>,
    pub params: Vec<Option<Vec<u8>>>,
    pub result_formats: Vec<i16>,
}

/// What a Describe or Close message refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Describe {
    pub target: Target,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Execute {
    pub portal: String,
    pub max_rows: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Close {
    pub target: Target,
    pub name: String,
}

impl Target {
    fn parse(byte: u8) -> Result<Self> {
        match byte {
            b'S' => Ok(Self::Statement),
            b'P' => Ok(Self::Portal),
            _ => bail!("Invalid describe/close target: {}", byte as char),
        }
    }
}

impl PostgresFrontendMessage {
    /// Reads the first message of a connection, which is sent without a tag
    /// byte: a StartupMessage, SSLRequest or CancelRequest.
    pub async fn read_initial(stream: &mut (impl AsyncRead + Unpin)) -> Result<Self> {
        let message = PostgresMessage::read_untagged(stream).await?;
        let mut body = Cursor::new(message.body());

        let code = read_i32(&mut body)?;

        Ok(match code {
            SSL_REQUEST_CODE => Self::SslRequest,
            CANCEL_REQUEST_CODE => Self::CancelRequest(CancelKey {
                pid: read_i32(&mut body)?,
                key: read_i32(&mut body)?,
            }),
            PROTOCOL_VERSION => {
                let mut params = HashMap::new();

                loop {
                    let mut peek = [0u8; 1];
                    body.read_exact(&mut peek)
                        .context("Unexpected end of startup message")?;

                    if peek[0] == 0 {
                        break;
                    }

                    body.set_position(body.position() - 1);
                    let key = read_cstr(&mut body)?;
                    let value = read_cstr(&mut body)?;
                    params.insert(key, value);
                }

                Self::StartupMessage(PostgresFrontendStartupMessage::new(params))
            }
            _ => bail!("Unknown startup message code: {}", code),
        })
    }

    /// Reads a tagged postgres frontend message from the supplied stream
    pub async fn read(stream: &mut (impl AsyncRead + Unpin)) -> Result<Self> {
        let message = PostgresMessage::read(stream).await?;
        let mut body = Cursor::new(message.body());

        Ok(match message.tag() {
            b'Q' => Self::Query(read_cstr(&mut body)?),
            b'p' => Self::PasswordMessage(read_cstr(&mut body)?),
            b'P' => {
                let name = read_cstr(&mut body)?;
                let query = read_cstr(&mut body)?;
                let count = read_i16(&mut body)?;
                ensure!(count >= 0, "Invalid parameter type count");

                let mut param_types = Vec::with_capacity(count as _);
                for _ in 0..count {
                    param_types.push(read_i32(&mut body)?);
                }

                Self::Parse(Parse {
                    name,
                    query,
                    param_types,
                })
            }
            b'B' => {
                let portal = read_cstr(&mut body)?;
                let statement = read_cstr(&mut body)?;

                let count = read_i16(&mut body)?;
                ensure!(count >= 0, "Invalid parameter format count");
                let mut param_formats = Vec::with_capacity(count as _);
                for _ in 0..count {
                    param_formats.push(read_i16(&mut body)?);
                }

                let count = read_i16(&mut body)?;
                ensure!(count >= 0, "Invalid parameter count");
                let mut params = Vec::with_capacity(count as _);
                for _ in 0..count {
                    let len = read_i32(&mut body)?;

                    if len < 0 {
                        params.push(None);
                        continue;
                    }

                    let mut value = vec![0u8; len as _];
                    body.read_exact(&mut value)
                        .context("Unexpected end of bind message")?;
                    params.push(Some(value));
                }

                let count = read_i16(&mut body)?;
                ensure!(count >= 0, "Invalid result format count");
                let mut result_formats = Vec::with_capacity(count as _);
                for _ in 0..count {
                    result_formats.push(read_i16(&mut body)?);
                }

                Self::Bind(Bind {
                    portal,
                    statement,
                    param_formats,
                    params,
                    result_formats,
                })
            }
            b'D' => {
                let target = Target::parse(read_u8(&mut body)?)?;
                let name = read_cstr(&mut body)?;
                Self::Describe(Describe { target, name })
            }
            b'E' => {
                let portal = read_cstr(&mut body)?;
                let max_rows = read_i32(&mut body)?;
                Self::Execute(Execute { portal, max_rows })
            }
            b'C' => {
                let target = Target::parse(read_u8(&mut body)?)?;
                let name = read_cstr(&mut body)?;
                Self::Close(Close { target, name })
            }
            b'S' => Self::Sync,
            b'H' => Self::Flush,
            b'X' => Self::Terminate,
            tag => bail!("Unknown postgres frontend message tag: {}", tag as char),
        })
    }

    /// Converts the message into a postgres message that can be sent over
    /// the wire.
    ///
    /// Only the messages which the proxy itself sends to the backend are
    /// supported here.
    pub fn serialise(self) -> Result<PostgresMessage> {
        Ok(match self {
            Self::StartupMessage(startup) => PostgresMessage::build_untagged(|body| {
                std::io::Write::write_all(&mut *body, PROTOCOL_VERSION.to_be_bytes().as_slice())?;

                // Sort for a deterministic wire image
                let mut params: Vec<_> = startup.params.iter().collect();
                params.sort();

                for (key, value) in params {
                    write_cstr(body, key)?;
                    write_cstr(body, value)?;
                }

                std::io::Write::write_all(&mut *body, &[0])?;
                Ok(())
            })?,
            Self::PasswordMessage(password) => PostgresMessage::build(b'p', |body| {
                write_cstr(body, &password)?;
                Ok(())
            })?,
            Self::Query(sql) => PostgresMessage::build(b'Q', |body| {
                write_cstr(body, &sql)?;
                Ok(())
            })?,
            Self::Terminate => PostgresMessage::build(b'X', |_| Ok(()))?,
            msg => bail!("Message cannot be sent to the backend: {:?}", msg),
        })
    }

    /// Writes the message to the supplied stream
    pub async fn write(self, stream: &mut (impl AsyncWrite + Unpin)) -> Result<()> {
        let msg = self.serialise()?;

        stream
            .write_all(msg.as_slice())
            .await
            .context("Failed to write postgres frontend message")?;

        Ok(())
    }
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    let mut buf = [0u8; 1];
    cursor
        .read_exact(&mut buf)
        .context("Unexpected end of message")?;
    Ok(buf[0])
}

fn read_i16(cursor: &mut Cursor<&[u8]>) -> Result<i16> {
    let mut buf = [0u8; 2];
    cursor
        .read_exact(&mut buf)
        .context("Unexpected end of message")?;
    Ok(i16::from_be_bytes(buf))
}

fn read_i32(cursor: &mut Cursor<&[u8]>) -> Result<i32> {
    let mut buf = [0u8; 4];
    cursor
        .read_exact(&mut buf)
        .context("Unexpected end of message")?;
    Ok(i32::from_be_bytes(buf))
}
