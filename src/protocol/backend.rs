//! Backend message framing and parsers.

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, Bytes, BytesMut};
use std::io;

use super::buffer::Frame;
use crate::params::Oid;
use crate::protocol::Column;

/// Byte tags for the backend message variants the engine interprets
const AUTHENTICATION_TAG: u8 = b'R';
const BACKEND_KEY_DATA_TAG: u8 = b'K';
const BIND_COMPLETE_TAG: u8 = b'2';
const CLOSE_COMPLETE_TAG: u8 = b'3';
const COMMAND_COMPLETE_TAG: u8 = b'C';
const COPY_IN_RESPONSE_TAG: u8 = b'G';
const COPY_OUT_RESPONSE_TAG: u8 = b'H';
const COPY_BOTH_RESPONSE_TAG: u8 = b'W';
const DATA_ROW_TAG: u8 = b'D';
const EMPTY_QUERY_RESPONSE_TAG: u8 = b'I';
const ERROR_RESPONSE_TAG: u8 = b'E';
const NO_DATA_TAG: u8 = b'n';
const NOTICE_RESPONSE_TAG: u8 = b'N';
const NOTIFICATION_RESPONSE_TAG: u8 = b'A';
const PARAMETER_DESCRIPTION_TAG: u8 = b't';
const PARAMETER_STATUS_TAG: u8 = b'S';
const PARSE_COMPLETE_TAG: u8 = b'1';
const PORTAL_SUSPENDED_TAG: u8 = b's';
const READY_FOR_QUERY_TAG: u8 = b'Z';
const ROW_DESCRIPTION_TAG: u8 = b'T';

/// Field tags within an error or notice response
const FIELD_SEVERITY_TAG: u8 = b'S';
const FIELD_CODE_TAG: u8 = b'C';
const FIELD_MESSAGE_TAG: u8 = b'M';

/// Backend message variants the engine cares about.
#[derive(Debug)]
pub enum Message {
    /// Authentication succeeded.
    AuthenticationOk,
    /// Server requests the password in cleartext.
    AuthenticationCleartextPassword,
    /// Server requests an MD5-hashed password with the given salt.
    AuthenticationMd5Password {
        /// Salt to mix into the hash.
        salt: [u8; 4],
    },
    /// Server opens a SASL exchange offering these mechanisms.
    AuthenticationSasl {
        /// Mechanism names, strongest first.
        mechanisms: Vec<String>,
    },
    /// SASL challenge continuation.
    AuthenticationSaslContinue {
        /// Mechanism-specific challenge data.
        data: Bytes,
    },
    /// Final SASL server message.
    AuthenticationSaslFinal {
        /// Mechanism-specific verification data.
        data: Bytes,
    },
    /// Cancellation key for this session.
    BackendKeyData {
        /// Server process id.
        process_id: i32,
        /// Cancellation secret.
        secret_key: i32,
    },
    /// A bind has completed.
    BindComplete,
    /// A close has completed.
    CloseComplete,
    /// A command finished, with its completion tag.
    CommandComplete {
        /// Completion tag, e.g. `SELECT 1`.
        tag: String,
    },
    /// Server opened a copy-in stream.
    CopyInResponse,
    /// Server opened a copy-out stream.
    CopyOutResponse,
    /// Server opened a bidirectional copy stream.
    CopyBothResponse,
    /// One row of values; `None` cells are NULL.
    DataRow {
        /// Cell values in column order.
        values: Vec<Option<Bytes>>,
    },
    /// The query string was empty.
    EmptyQueryResponse,
    /// Server-reported error.
    ErrorResponse {
        /// Severity, e.g. `FATAL`.
        severity: String,
        /// SQLSTATE code.
        code: String,
        /// Primary human-readable message.
        message: String,
    },
    /// A describe found no result columns.
    NoData,
    /// Server-originated notice; swallowed by the engine.
    NoticeResponse {
        /// Primary human-readable message.
        message: String,
    },
    /// Asynchronous notification; ignored by the engine.
    NotificationResponse,
    /// Declared parameter types of a described statement.
    ParameterDescription {
        /// Parameter type OIDs in declaration order.
        types: Vec<Oid>,
    },
    /// A run-time parameter setting.
    ParameterStatus {
        /// Parameter name.
        name: String,
        /// Parameter value.
        value: String,
    },
    /// A parse has completed.
    ParseComplete,
    /// An execute stopped at its row limit.
    PortalSuspended,
    /// The server is idle and ready for the next command.
    ReadyForQuery {
        /// Transaction status indicator (`I`, `T`, or `E`).
        transaction_status: u8,
    },
    /// Column layout of the rows that follow.
    RowDescription {
        /// Result columns in order.
        columns: Vec<Column>,
    },
    /// A frame the engine has no use for.
    Unknown {
        /// The frame's tag byte.
        tag: u8,
    },
}

/// Split the next complete frame off `buf` and parse it; `None` while the
/// frame is still partial.
pub fn next_message(buf: &mut BytesMut) -> io::Result<Option<Message>> {
    if buf.len() < 5 {
        return Ok(None);
    }

    let len = (&buf[1..5]).read_u32::<BigEndian>().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid message format: reading u32",
        )
    })? as usize;

    if len < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid message format: length below minimum",
        ));
    }

    let total_len = len + 1;

    if buf.len() < total_len {
        buf.reserve(total_len - buf.len());
        return Ok(None);
    }

    Message::parse(buf).map(Some)
}

impl Message {
    /// Parse a single message frame of known and established length.
    pub fn parse(buf: &mut BytesMut) -> io::Result<Message> {
        let tag = buf[0];
        let len = (&buf[1..5]).read_u32::<BigEndian>().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid message format: reading u32",
            )
        })?;

        let total_len = len as usize + 1;

        let mut body = buf.split_to(total_len).freeze();
        body.advance(5);
        let mut buf = Frame::new(body);

        let message = match tag {
            AUTHENTICATION_TAG => match buf.take_i32()? {
                0 => Message::AuthenticationOk,
                3 => Message::AuthenticationCleartextPassword,
                5 => {
                    let salt = [
                        buf.take_u8()?,
                        buf.take_u8()?,
                        buf.take_u8()?,
                        buf.take_u8()?,
                    ];

                    Message::AuthenticationMd5Password { salt }
                }
                10 => {
                    let mut mechanisms = vec![];

                    while !buf.is_empty() {
                        let mechanism = buf.take_string()?;

                        if !mechanism.is_empty() {
                            mechanisms.push(mechanism);
                        }
                    }

                    Message::AuthenticationSasl { mechanisms }
                }
                11 => Message::AuthenticationSaslContinue {
                    data: buf.take_rest(),
                },
                12 => Message::AuthenticationSaslFinal {
                    data: buf.take_rest(),
                },
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "invalid response: authentication scheme not supported",
                    ))
                }
            },
            BACKEND_KEY_DATA_TAG => Message::BackendKeyData {
                process_id: buf.take_i32()?,
                secret_key: buf.take_i32()?,
            },
            BIND_COMPLETE_TAG => Message::BindComplete,
            CLOSE_COMPLETE_TAG => Message::CloseComplete,
            COMMAND_COMPLETE_TAG => Message::CommandComplete {
                tag: buf.take_string()?,
            },
            COPY_IN_RESPONSE_TAG => Message::CopyInResponse,
            COPY_OUT_RESPONSE_TAG => Message::CopyOutResponse,
            COPY_BOTH_RESPONSE_TAG => Message::CopyBothResponse,
            DATA_ROW_TAG => {
                let count: usize = buf.take_i16()?.try_into().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "invalid data row: negative cell count",
                    )
                })?;

                let mut values = Vec::with_capacity(count);

                for _ in 0..count {
                    let length = buf.take_i32()?;

                    if length < 0 {
                        values.push(None);
                    } else {
                        values.push(Some(buf.take_bytes(length as usize)?));
                    }
                }

                Message::DataRow { values }
            }
            EMPTY_QUERY_RESPONSE_TAG => Message::EmptyQueryResponse,
            ERROR_RESPONSE_TAG => {
                let (severity, code, message) = read_response_fields(&mut buf)?;

                Message::ErrorResponse {
                    severity,
                    code,
                    message,
                }
            }
            NO_DATA_TAG => Message::NoData,
            NOTICE_RESPONSE_TAG => {
                let (_, _, message) = read_response_fields(&mut buf)?;

                Message::NoticeResponse { message }
            }
            NOTIFICATION_RESPONSE_TAG => Message::NotificationResponse,
            PARAMETER_DESCRIPTION_TAG => {
                let count: usize = buf.take_i16()?.try_into().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "invalid parameter description: negative count",
                    )
                })?;

                let mut types = Vec::with_capacity(count);

                for _ in 0..count {
                    types.push(buf.take_u32()?);
                }

                Message::ParameterDescription { types }
            }
            PARAMETER_STATUS_TAG => Message::ParameterStatus {
                name: buf.take_string()?,
                value: buf.take_string()?,
            },
            PARSE_COMPLETE_TAG => Message::ParseComplete,
            PORTAL_SUSPENDED_TAG => Message::PortalSuspended,
            READY_FOR_QUERY_TAG => Message::ReadyForQuery {
                transaction_status: buf.take_u8()?,
            },
            ROW_DESCRIPTION_TAG => {
                let count: usize = buf.take_i16()?.try_into().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "invalid row description: negative column count",
                    )
                })?;

                let mut columns = Vec::with_capacity(count);

                for _ in 0..count {
                    let name = buf.take_string()?;
                    let _table_oid = buf.take_i32()?;
                    let _column_attr = buf.take_i16()?;
                    let type_oid = buf.take_u32()?;
                    let _type_len = buf.take_i16()?;
                    let _type_modifier = buf.take_i32()?;
                    let format = buf.take_i16()?;

                    columns.push(Column {
                        name,
                        type_oid,
                        format,
                    });
                }

                Message::RowDescription { columns }
            }
            _ => Message::Unknown { tag },
        };

        Ok(message)
    }
}

/// Pull the severity, code, and primary message out of an error or notice
/// response, skipping every other field.
fn read_response_fields(buf: &mut Frame) -> io::Result<(String, String, String)> {
    let mut severity = String::new();
    let mut code = String::new();
    let mut message = String::new();

    loop {
        let field = buf.take_u8()?;

        if field == 0 {
            break;
        }

        let value = buf.take_string()?;

        match field {
            FIELD_SEVERITY_TAG => severity = value,
            FIELD_CODE_TAG => code = value,
            FIELD_MESSAGE_TAG => message = value,
            _ => {}
        }
    }

    Ok((severity, code, message))
}
