//! Frontend message encoders.
//!
//! Each encoder appends one complete frame, length prefix included, to the
//! caller's outbound buffer.

use bytes::{BufMut, BytesMut};

use crate::params::{Oid, QueryData};

/// Byte tags for the frontend message variants the engine sends
const BIND_TAG: u8 = b'B';
const DESCRIBE_TAG: u8 = b'D';
const EXECUTE_TAG: u8 = b'E';
const PARSE_TAG: u8 = b'P';
const PASSWORD_MESSAGE_TAG: u8 = b'p';
const SYNC_TAG: u8 = b'S';
const TERMINATE_TAG: u8 = b'X';

/// Protocol version 3.0.
const PROTOCOL_VERSION: i32 = 196608;

/// Magic request code that asks the server to switch to TLS.
const SSL_REQUEST_CODE: i32 = 80877103;

/// Result-format code requesting binary row values.
const BINARY_RESULTS: i16 = 1;

/// Request a TLS session; the server answers with a single byte before any
/// regular framing starts.
pub fn ssl_request(bytes: &mut BytesMut) {
    bytes.put_i32(8);
    bytes.put_i32(SSL_REQUEST_CODE);
}

/// Open the session for `user`, optionally selecting a database.
pub fn startup(user: &str, database: Option<&str>, application_name: &str, bytes: &mut BytesMut) {
    let mut parameters: Vec<(&str, &str)> = vec![("user", user)];

    if let Some(database) = database {
        parameters.push(("database", database));
    }

    parameters.push(("application_name", application_name));
    parameters.push(("client_encoding", "UTF8"));

    let body: i32 = parameters
        .iter()
        .map(|(key, value)| key.len() as i32 + 1 + value.len() as i32 + 1)
        .sum();

    bytes.put_i32(4 + 4 + body + 1);
    bytes.put_i32(PROTOCOL_VERSION);

    for (key, value) in parameters {
        bytes.put_slice(key.as_bytes());
        bytes.put_u8(0);
        bytes.put_slice(value.as_bytes());
        bytes.put_u8(0);
    }

    bytes.put_u8(0);
}

/// Answer a cleartext or MD5 password challenge.
pub fn password(password: &[u8], bytes: &mut BytesMut) {
    bytes.put_u8(PASSWORD_MESSAGE_TAG);
    bytes.put_i32(4 + password.len() as i32 + 1);
    bytes.put_slice(password);
    bytes.put_u8(0);
}

/// Open a SASL exchange with the chosen mechanism.
pub fn sasl_initial_response(mechanism: &str, response: &[u8], bytes: &mut BytesMut) {
    bytes.put_u8(PASSWORD_MESSAGE_TAG);
    bytes.put_i32(4 + mechanism.len() as i32 + 1 + 4 + response.len() as i32);
    bytes.put_slice(mechanism.as_bytes());
    bytes.put_u8(0);
    bytes.put_i32(response.len() as i32);
    bytes.put_slice(response);
}

/// Continue a SASL exchange.
pub fn sasl_response(data: &[u8], bytes: &mut BytesMut) {
    bytes.put_u8(PASSWORD_MESSAGE_TAG);
    bytes.put_i32(4 + data.len() as i32);
    bytes.put_slice(data);
}

/// Parse `query` into the named prepared statement, pinning any declared
/// parameter types.
pub fn parse(name: &str, query: &str, types: &[Oid], bytes: &mut BytesMut) {
    bytes.put_u8(PARSE_TAG);
    bytes.put_i32(
        4 + name.len() as i32 + 1 + query.len() as i32 + 1 + 2 + 4 * types.len() as i32,
    );
    bytes.put_slice(name.as_bytes());
    bytes.put_u8(0);
    bytes.put_slice(query.as_bytes());
    bytes.put_u8(0);
    bytes.put_i16(types.len() as i16);

    for &oid in types {
        bytes.put_u32(oid);
    }
}

/// Bind parameter values to a prepared statement, requesting binary results.
pub fn bind(portal: &str, statement: &str, data: Option<&QueryData>, bytes: &mut BytesMut) {
    let empty = QueryData::default();
    let data = data.unwrap_or(&empty);

    let values_length: i32 = data
        .values()
        .iter()
        .map(|value| 4 + value.as_ref().map_or(0, |value| value.len() as i32))
        .sum();

    bytes.put_u8(BIND_TAG);
    bytes.put_i32(
        4 + portal.len() as i32
            + 1
            + statement.len() as i32
            + 1
            + 2
            + 2 * data.count() as i32
            + 2
            + values_length
            + 2
            + 2,
    );
    bytes.put_slice(portal.as_bytes());
    bytes.put_u8(0);
    bytes.put_slice(statement.as_bytes());
    bytes.put_u8(0);

    bytes.put_i16(data.count() as i16);
    for format in data.formats() {
        bytes.put_i16(format.code());
    }

    bytes.put_i16(data.count() as i16);
    for value in data.values() {
        match value {
            Some(value) => {
                bytes.put_i32(value.len() as i32);
                bytes.put_slice(value);
            }
            None => bytes.put_i32(-1),
        }
    }

    bytes.put_i16(1);
    bytes.put_i16(BINARY_RESULTS);
}

/// Ask the server to describe a prepared statement.
pub fn describe_statement(name: &str, bytes: &mut BytesMut) {
    describe(b'S', name, bytes);
}

/// Ask the server to describe a bound portal.
pub fn describe_portal(name: &str, bytes: &mut BytesMut) {
    describe(b'P', name, bytes);
}

fn describe(variant: u8, name: &str, bytes: &mut BytesMut) {
    bytes.put_u8(DESCRIBE_TAG);
    bytes.put_i32(4 + 1 + name.len() as i32 + 1);
    bytes.put_u8(variant);
    bytes.put_slice(name.as_bytes());
    bytes.put_u8(0);
}

/// Run a bound portal. A `max_rows` of zero means no limit.
pub fn execute(portal: &str, max_rows: i32, bytes: &mut BytesMut) {
    bytes.put_u8(EXECUTE_TAG);
    bytes.put_i32(4 + portal.len() as i32 + 1 + 4);
    bytes.put_slice(portal.as_bytes());
    bytes.put_u8(0);
    bytes.put_i32(max_rows);
}

/// Close the current extended-query sequence.
pub fn sync(bytes: &mut BytesMut) {
    bytes.put_u8(SYNC_TAG);
    bytes.put_i32(4);
}

/// End the session.
pub fn terminate(bytes: &mut BytesMut) {
    bytes.put_u8(TERMINATE_TAG);
    bytes.put_i32(4);
}
