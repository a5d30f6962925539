// @see https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::io::{Cursor, Read};

use pgrollback_core::err::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::common::{read_cstr, write_cstr, CancelKey, PostgresMessage};

/// Type oids used when the proxy synthesises its own row descriptions
pub const OID_BOOL: i32 = 16;
pub const OID_INT8: i32 = 20;
pub const OID_INT4: i32 = 23;
pub const OID_TEXT: i32 = 25;

/// Tags of messages the proxy treats as opaque pass-through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PostgresBackendMessageTag {
    Authentication = b'R',
    BackendKeyData = b'K',
    BindComplete = b'2',
    CloseComplete = b'3',
    CommandComplete = b'C',
    CopyInResponse = b'G',
    CopyOutResponse = b'H',
    DataRow = b'D',
    EmptyQueryResponse = b'I',
    ErrorResponse = b'E',
    NoData = b'n',
    NoticeResponse = b'N',
    NotificationResponse = b'A',
    ParameterDescription = b't',
    ParameterStatus = b'S',
    ParseComplete = b'1',
    PortalSuspended = b's',
    ReadyForQuery = b'Z',
    RowDescription = b'T',
}

impl TryFrom<u8> for PostgresBackendMessageTag {
    type Error = pgrollback_core::err::Error;

    fn try_from(tag: u8) -> Result<Self> {
        Ok(match tag {
            b'R' => Self::Authentication,
            b'K' => Self::BackendKeyData,
            b'2' => Self::BindComplete,
            b'3' => Self::CloseComplete,
            b'C' => Self::CommandComplete,
            b'G' => Self::CopyInResponse,
            b'H' => Self::CopyOutResponse,
            b'D' => Self::DataRow,
            b'I' => Self::EmptyQueryResponse,
            b'E' => Self::ErrorResponse,
            b'n' => Self::NoData,
            b'N' => Self::NoticeResponse,
            b'A' => Self::NotificationResponse,
            b't' => Self::ParameterDescription,
            b'S' => Self::ParameterStatus,
            b'1' => Self::ParseComplete,
            b's' => Self::PortalSuspended,
            b'Z' => Self::ReadyForQuery,
            b'T' => Self::RowDescription,
            _ => bail!("Unknown postgres backend message tag: {}", tag as char),
        })
    }
}

/// Messages sent by the postgres backend (or synthesised by the proxy in
/// its role as a backend towards the client).
///
/// Messages the proxy needs to interpret are parsed into their own
/// variants; the rest travel as opaque frames.
#[derive(Debug, PartialEq, Clone)]
pub enum PostgresBackendMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMd5Password([u8; 4]),
    AuthenticationSasl(Vec<String>),
    ReadyForQuery(u8),
    ParameterStatus(String, String),
    BackendKeyData(CancelKey),
    CommandComplete(String),
    ErrorResponse(ErrorResponse),
    Other(PostgresMessage),
}

impl PostgresBackendMessage {
    /// Reads a postgres backend message from the supplied stream
    pub async fn read(stream: &mut (impl AsyncRead + Unpin)) -> Result<Self> {
        let message = PostgresMessage::read(stream).await?;
        let mut body = Cursor::new(message.body());

        Ok(match message.tag() {
            b'R' => {
                let subtype = read_i32(&mut body)?;

                match subtype {
                    0 => Self::AuthenticationOk,
                    3 => Self::AuthenticationCleartextPassword,
                    5 => {
                        let mut salt = [0u8; 4];
                        body.read_exact(&mut salt)
                            .context("Unexpected end of authentication message")?;
                        Self::AuthenticationMd5Password(salt)
                    }
                    10 => {
                        let mut methods = vec![];
                        loop {
                            let method = read_cstr(&mut body)?;
                            if method.is_empty() {
                                break;
                            }
                            methods.push(method);
                        }
                        Self::AuthenticationSasl(methods)
                    }
                    _ => bail!("Unsupported authentication request: {}", subtype),
                }
            }
            b'Z' => {
                let mut status = [0u8; 1];
                body.read_exact(&mut status)
                    .context("Unexpected end of ready for query message")?;
                Self::ReadyForQuery(status[0])
            }
            b'S' => {
                let key = read_cstr(&mut body)?;
                let value = read_cstr(&mut body)?;
                Self::ParameterStatus(key, value)
            }
            b'K' => Self::BackendKeyData(CancelKey {
                pid: read_i32(&mut body)?,
                key: read_i32(&mut body)?,
            }),
            b'C' => Self::CommandComplete(read_cstr(&mut body)?),
            b'E' => Self::ErrorResponse(ErrorResponse::parse(&message)?),
            _ => Self::Other(message),
        })
    }

    /// Gets the tag of this message
    pub fn tag(&self) -> Result<PostgresBackendMessageTag> {
        Ok(match self {
            Self::AuthenticationOk
            | Self::AuthenticationCleartextPassword
            | Self::AuthenticationMd5Password(_)
            | Self::AuthenticationSasl(_) => PostgresBackendMessageTag::Authentication,
            Self::ReadyForQuery(_) => PostgresBackendMessageTag::ReadyForQuery,
            Self::ParameterStatus(_, _) => PostgresBackendMessageTag::ParameterStatus,
            Self::BackendKeyData(_) => PostgresBackendMessageTag::BackendKeyData,
            Self::CommandComplete(_) => PostgresBackendMessageTag::CommandComplete,
            Self::ErrorResponse(_) => PostgresBackendMessageTag::ErrorResponse,
            Self::Other(m) => m.tag().try_into()?,
        })
    }

    /// Converts the message into a postgres message that can be sent over
    /// the wire.
    pub fn serialise(self) -> Result<PostgresMessage> {
        Ok(match self {
            Self::Other(m) => m,
            Self::AuthenticationOk => PostgresMessage::build(b'R', |body| {
                write_i32(body, 0)?;
                Ok(())
            })?,
            Self::AuthenticationCleartextPassword => PostgresMessage::build(b'R', |body| {
                write_i32(body, 3)?;
                Ok(())
            })?,
            Self::AuthenticationMd5Password(salt) => PostgresMessage::build(b'R', |body| {
                write_i32(body, 5)?;
                std::io::Write::write_all(&mut *body, salt.as_slice())?;
                Ok(())
            })?,
            Self::AuthenticationSasl(methods) => PostgresMessage::build(b'R', move |body| {
                write_i32(body, 10)?;
                for method in methods.into_iter() {
                    write_cstr(body, &method)?;
                }
                std::io::Write::write_all(&mut *body, &[0])?;
                Ok(())
            })?,
            Self::ReadyForQuery(status) => PostgresMessage::build(b'Z', |body| {
                std::io::Write::write_all(&mut *body, &[status])?;
                Ok(())
            })?,
            Self::ParameterStatus(key, value) => PostgresMessage::build(b'S', |body| {
                write_cstr(body, &key)?;
                write_cstr(body, &value)?;
                Ok(())
            })?,
            Self::BackendKeyData(key) => PostgresMessage::build(b'K', |body| {
                write_i32(body, key.pid)?;
                write_i32(body, key.key)?;
                Ok(())
            })?,
            Self::CommandComplete(tag) => PostgresMessage::build(b'C', |body| {
                write_cstr(body, &tag)?;
                Ok(())
            })?,
            Self::ErrorResponse(error) => error.serialise()?,
        })
    }

    /// Writes the message to the supplied stream
    pub async fn write(self, stream: &mut (impl AsyncWrite + Unpin)) -> Result<()> {
        let msg = self.serialise()?;

        stream
            .write_all(msg.as_slice())
            .await
            .context("Failed to write postgres backend message")?;

        Ok(())
    }

    /// An error response originated by the proxy itself
    pub fn error_msg(message: impl Into<String>) -> Self {
        Self::ErrorResponse(ErrorResponse::new("ERROR", "XX000", message))
    }

    /// Synthesises a RowDescription message
    pub fn row_description(fields: Vec<FieldDescription>) -> Result<Self> {
        Ok(Self::Other(PostgresMessage::build(b'T', |body| {
            write_i16(body, i16::try_from(fields.len()).context("Too many fields")?)?;

            for field in fields.iter() {
                write_cstr(body, &field.name)?;
                // No originating table
                write_i32(body, 0)?;
                write_i16(body, 0)?;
                write_i32(body, field.type_oid)?;
                write_i16(body, field.type_size)?;
                write_i32(body, -1)?;
                // Text format
                write_i16(body, 0)?;
            }

            Ok(())
        })?))
    }

    /// Synthesises a text-format DataRow message
    pub fn data_row(values: Vec<Option<String>>) -> Result<Self> {
        Ok(Self::Other(PostgresMessage::build(b'D', |body| {
            write_i16(body, i16::try_from(values.len()).context("Too many columns")?)?;

            for value in values.iter() {
                match value {
                    Some(v) => {
                        write_i32(body, i32::try_from(v.len()).context("Value too large")?)?;
                        std::io::Write::write_all(&mut *body, v.as_bytes())?;
                    }
                    None => write_i32(body, -1)?,
                }
            }

            Ok(())
        })?))
    }

    /// Synthesises a ParameterDescription message with unspecified types
    pub fn parameter_description(count: usize) -> Result<Self> {
        Ok(Self::Other(PostgresMessage::build(b't', |body| {
            write_i16(body, i16::try_from(count).context("Too many parameters")?)?;

            for _ in 0..count {
                write_i32(body, 0)?;
            }

            Ok(())
        })?))
    }

    pub fn parse_complete() -> Self {
        Self::Other(PostgresMessage::Tagged(vec![b'1', 0, 0, 0, 4]))
    }

    pub fn bind_complete() -> Self {
        Self::Other(PostgresMessage::Tagged(vec![b'2', 0, 0, 0, 4]))
    }

    pub fn close_complete() -> Self {
        Self::Other(PostgresMessage::Tagged(vec![b'3', 0, 0, 0, 4]))
    }

    pub fn no_data() -> Self {
        Self::Other(PostgresMessage::Tagged(vec![b'n', 0, 0, 0, 4]))
    }

    pub fn empty_query_response() -> Self {
        Self::Other(PostgresMessage::Tagged(vec![b'I', 0, 0, 0, 4]))
    }
}

/// An ErrorResponse, kept alongside its original wire image when it came
/// from the backend so it can be forwarded verbatim.
#[derive(Debug, PartialEq, Clone)]
pub struct ErrorResponse {
    fields: Vec<(u8, String)>,
    raw: Option<PostgresMessage>,
}

impl ErrorResponse {
    /// Builds a new error response
    /// @see https://www.postgresql.org/docs/current/protocol-error-fields.html
    pub fn new(severity: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            fields: vec![
                (b'S', severity.into()),
                (b'C', code.into()),
                (b'M', message.into()),
            ],
            raw: None,
        }
    }

    /// Parses an error response from its wire image
    pub fn parse(message: &PostgresMessage) -> Result<Self> {
        let mut body = Cursor::new(message.body());
        let mut fields = vec![];

        loop {
            let mut tag = [0u8; 1];
            body.read_exact(&mut tag)
                .context("Unexpected end of error response")?;

            if tag[0] == 0 {
                break;
            }

            fields.push((tag[0], read_cstr(&mut body)?));
        }

        Ok(Self {
            fields,
            raw: Some(message.clone()),
        })
    }

    pub fn field(&self, tag: u8) -> Option<&str> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, v)| v.as_str())
    }

    pub fn severity(&self) -> Option<&str> {
        self.field(b'S')
    }

    pub fn code(&self) -> Option<&str> {
        self.field(b'C')
    }

    pub fn message(&self) -> Option<&str> {
        self.field(b'M')
    }

    /// Converts back into a wire message, preferring the original image
    pub fn serialise(self) -> Result<PostgresMessage> {
        if let Some(raw) = self.raw {
            return Ok(raw);
        }

        PostgresMessage::build(b'E', |body| {
            for (tag, value) in self.fields.iter() {
                std::io::Write::write_all(&mut *body, &[*tag])?;
                write_cstr(body, value)?;
            }

            std::io::Write::write_all(&mut *body, &[0])?;
            Ok(())
        })
    }
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}",
            self.severity().unwrap_or("ERROR"),
            self.message().unwrap_or("unknown error")
        )
    }
}

/// A single field in a synthesised RowDescription
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    pub name: String,
    pub type_oid: i32,
    pub type_size: i16,
}

impl FieldDescription {
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_oid: OID_TEXT,
            type_size: -1,
        }
    }

    pub fn int8(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_oid: OID_INT8,
            type_size: 8,
        }
    }

    pub fn int4(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_oid: OID_INT4,
            type_size: 4,
        }
    }

    pub fn bool(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_oid: OID_BOOL,
            type_size: 1,
        }
    }
}

fn read_i32(cursor: &mut Cursor<&[u8]>) -> Result<i32> {
    let mut buf = [0u8; 4];
    cursor
        .read_exact(&mut buf)
        .context("Unexpected end of message")?;
    Ok(i32::from_be_bytes(buf))
}

fn write_i16(body: &mut Cursor<Vec<u8>>, val: i16) -> Result<()> {
    std::io::Write::write_all(&mut *body, val.to_be_bytes().as_slice())?;
    Ok(())
}

fn write_i32(body: &mut Cursor<Vec<u8>>, val: i32) -> Result<()> {
    std::io::Write::write_all(&mut *body, val.to_be_bytes().as_slice())?;
    Ok(())
}
