//! Protocol messages carried inside STREAM frames.
//!
//! Body layout: a one-byte tag, then the variant's fields in order.
//!
//! | tag  | variant       | fields                                        |
//! |------|---------------|-----------------------------------------------|
//! | 0x01 | `Query`       | format u8, query string                       |
//! | 0x02 | `SchemaQuery` | scope u8, name optional string                |
//! | 0x03 | `CreateDb`    | name string                                   |
//! | 0x04 | `CreateUser`  | (none)                                        |
//! | 0x05 | `Credentials` | access key string, private key bytes          |
//! | 0x06 | `RequestTail` | table string, since u64, filter optional str  |
//! | 0x07 | `PushPromise` | table string                                  |
//! | 0x08 | `Data`        | fin u8, payload (rest of body)                |

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use zeroize::Zeroize;

use crate::error::{FrameError, Result};
use crate::wire::{put_bytes, put_opt_str, put_str, FieldReader};

const TAG_QUERY: u8 = 0x01;
const TAG_SCHEMA_QUERY: u8 = 0x02;
const TAG_CREATE_DB: u8 = 0x03;
const TAG_CREATE_USER: u8 = 0x04;
const TAG_CREDENTIALS: u8 = 0x05;
const TAG_REQUEST_TAIL: u8 = 0x06;
const TAG_PUSH_PROMISE: u8 = 0x07;
const TAG_DATA: u8 = 0x08;

/// Output format requested for a query result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryFormat {
    Json,
    Raw,
    Csv,
}

impl QueryFormat {
    fn as_byte(self) -> u8 {
        match self {
            QueryFormat::Json => 0,
            QueryFormat::Raw => 1,
            QueryFormat::Csv => 2,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(QueryFormat::Json),
            1 => Ok(QueryFormat::Raw),
            2 => Ok(QueryFormat::Csv),
            other => Err(FrameError::malformed(format!("unknown query format {other}"))),
        }
    }
}

/// What a schema query dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaScope {
    All,
    Table,
    View,
}

impl SchemaScope {
    fn as_byte(self) -> u8 {
        match self {
            SchemaScope::All => 0,
            SchemaScope::Table => 1,
            SchemaScope::View => 2,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(SchemaScope::All),
            1 => Ok(SchemaScope::Table),
            2 => Ok(SchemaScope::View),
            other => Err(FrameError::malformed(format!("unknown schema scope {other}"))),
        }
    }
}

/// Secret key material. Zeroed when dropped or explicitly cleared; never printed.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overwrite the bytes with zeros and empty the buffer.
    pub fn clear(&mut self) {
        self.0.zeroize();
    }
}

impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<redacted:{} bytes>", self.0.len())
    }
}

impl From<Vec<u8>> for SecretBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Run a SQL statement and return its output.
    Query { query: String, format: QueryFormat },
    /// Dump the schema, or one table or view definition.
    SchemaQuery {
        scope: SchemaScope,
        name: Option<String>,
    },
    /// Create a database (never served over a connection).
    CreateDb { name: String },
    /// Provision a new user and return its credentials.
    CreateUser,
    /// Freshly provisioned credentials; sent once, then erased.
    Credentials {
        access_key: String,
        private_key: SecretBytes,
    },
    /// Open a continuous export of changes to `table`.
    RequestTail {
        table: String,
        since: u64,
        filter_expr: Option<String>,
    },
    /// Open a continuous CSV bulk-load sink into `table`.
    PushPromise { table: String },
    /// Payload chunk of an established transfer.
    Data { payload: Bytes, fin: bool },
}

impl Message {
    /// Convenience constructor for a data chunk.
    pub fn data(payload: impl Into<Bytes>, fin: bool) -> Self {
        Message::Data {
            payload: payload.into(),
            fin,
        }
    }

    /// Short name of the variant, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Query { .. } => "Query",
            Message::SchemaQuery { .. } => "SchemaQuery",
            Message::CreateDb { .. } => "CreateDb",
            Message::CreateUser => "CreateUser",
            Message::Credentials { .. } => "Credentials",
            Message::RequestTail { .. } => "RequestTail",
            Message::PushPromise { .. } => "PushPromise",
            Message::Data { .. } => "Data",
        }
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Message::Data { .. })
    }

    /// Encode into a STREAM frame payload.
    pub fn encode(&self) -> Bytes {
        let mut dst = BytesMut::new();
        match self {
            Message::Query { query, format } => {
                dst.put_u8(TAG_QUERY);
                dst.put_u8(format.as_byte());
                put_str(&mut dst, query);
            }
            Message::SchemaQuery { scope, name } => {
                dst.put_u8(TAG_SCHEMA_QUERY);
                dst.put_u8(scope.as_byte());
                put_opt_str(&mut dst, name.as_deref());
            }
            Message::CreateDb { name } => {
                dst.put_u8(TAG_CREATE_DB);
                put_str(&mut dst, name);
            }
            Message::CreateUser => dst.put_u8(TAG_CREATE_USER),
            Message::Credentials {
                access_key,
                private_key,
            } => {
                dst.put_u8(TAG_CREDENTIALS);
                put_str(&mut dst, access_key);
                put_bytes(&mut dst, private_key.expose());
            }
            Message::RequestTail {
                table,
                since,
                filter_expr,
            } => {
                dst.put_u8(TAG_REQUEST_TAIL);
                put_str(&mut dst, table);
                dst.put_u64_le(*since);
                put_opt_str(&mut dst, filter_expr.as_deref());
            }
            Message::PushPromise { table } => {
                dst.put_u8(TAG_PUSH_PROMISE);
                put_str(&mut dst, table);
            }
            Message::Data { payload, fin } => {
                dst.reserve(2 + payload.len());
                dst.put_u8(TAG_DATA);
                dst.put_u8(u8::from(*fin));
                dst.put_slice(payload);
            }
        }
        dst.freeze()
    }

    /// Decode a STREAM frame payload.
    pub fn decode(payload: Bytes) -> Result<Self> {
        let mut body = FieldReader::new(payload);
        let tag = body.u8("tag")?;
        let message = match tag {
            TAG_QUERY => {
                let format = QueryFormat::from_byte(body.u8("format")?)?;
                let query = body.string("query")?;
                Message::Query { query, format }
            }
            TAG_SCHEMA_QUERY => {
                let scope = SchemaScope::from_byte(body.u8("scope")?)?;
                let name = body.opt_string("name")?;
                if scope != SchemaScope::All && name.is_none() {
                    return Err(FrameError::malformed("schema query needs a name"));
                }
                Message::SchemaQuery { scope, name }
            }
            TAG_CREATE_DB => Message::CreateDb {
                name: body.string("name")?,
            },
            TAG_CREATE_USER => Message::CreateUser,
            TAG_CREDENTIALS => {
                let access_key = body.string("access key")?;
                let private_key = SecretBytes::new(body.bytes("private key")?.to_vec());
                Message::Credentials {
                    access_key,
                    private_key,
                }
            }
            TAG_REQUEST_TAIL => {
                let table = body.string("table")?;
                let since = body.u64("since")?;
                let filter_expr = body.opt_string("filter")?;
                Message::RequestTail {
                    table,
                    since,
                    filter_expr,
                }
            }
            TAG_PUSH_PROMISE => Message::PushPromise {
                table: body.string("table")?,
            },
            TAG_DATA => {
                let fin = match body.u8("fin flag")? {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(FrameError::malformed(format!("invalid fin flag {other}")))
                    }
                };
                Message::Data {
                    payload: body.rest(),
                    fin,
                }
            }
            other => {
                return Err(FrameError::malformed(format!(
                    "unknown message tag 0x{other:02x}"
                )))
            }
        };
        body.finish()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<Message> {
        vec![
            Message::Query {
                query: "select 1;".to_string(),
                format: QueryFormat::Raw,
            },
            Message::SchemaQuery {
                scope: SchemaScope::All,
                name: None,
            },
            Message::SchemaQuery {
                scope: SchemaScope::View,
                name: Some("v1".to_string()),
            },
            Message::CreateDb {
                name: "x".to_string(),
            },
            Message::CreateUser,
            Message::Credentials {
                access_key: "AbC123".to_string(),
                private_key: SecretBytes::new(vec![7; 32]),
            },
            Message::RequestTail {
                table: "t1".to_string(),
                since: 42,
                filter_expr: Some("a > 1".to_string()),
            },
            Message::PushPromise {
                table: "t1".to_string(),
            },
            Message::data(Bytes::from_static(b"1|a\n"), true),
            Message::data(Bytes::new(), false),
        ]
    }

    #[test]
    fn every_variant_roundtrips() {
        for message in samples() {
            let decoded = Message::decode(message.encode()).unwrap();
            assert_eq!(decoded, message, "{} did not roundtrip", message.name());
        }
    }

    #[test]
    fn empty_payload_is_malformed() {
        let err = Message::decode(Bytes::new()).unwrap_err();
        assert!(matches!(err, FrameError::MalformedMessage(_)));
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let err = Message::decode(Bytes::from_static(&[0x99])).unwrap_err();
        assert!(matches!(err, FrameError::MalformedMessage(m) if m.contains("0x99")));
    }

    #[test]
    fn truncated_string_is_malformed() {
        let mut encoded = Message::PushPromise {
            table: "widgets".to_string(),
        }
        .encode()
        .to_vec();
        encoded.truncate(encoded.len() - 2);

        let err = Message::decode(Bytes::from(encoded)).unwrap_err();
        assert!(matches!(err, FrameError::MalformedMessage(m) if m.contains("table")));
    }

    #[test]
    fn trailing_bytes_are_malformed() {
        let mut encoded = Message::CreateUser.encode().to_vec();
        encoded.push(0);
        let err = Message::decode(Bytes::from(encoded)).unwrap_err();
        assert!(matches!(err, FrameError::MalformedMessage(m) if m.contains("trailing")));
    }

    #[test]
    fn invalid_format_and_fin_flag_are_malformed() {
        let bad_format = Bytes::from_static(&[TAG_QUERY, 9, 0, 0, 0, 0]);
        assert!(Message::decode(bad_format).is_err());

        let bad_fin = Bytes::from_static(&[TAG_DATA, 2, b'x']);
        assert!(Message::decode(bad_fin).is_err());
    }

    #[test]
    fn table_schema_query_without_name_is_malformed() {
        let encoded = Bytes::from_static(&[TAG_SCHEMA_QUERY, 1, 0]);
        let err = Message::decode(encoded).unwrap_err();
        assert!(matches!(err, FrameError::MalformedMessage(_)));
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let encoded = Bytes::from_static(&[TAG_CREATE_DB, 2, 0, 0, 0, 0xff, 0xfe]);
        let err = Message::decode(encoded).unwrap_err();
        assert!(matches!(err, FrameError::MalformedMessage(m) if m.contains("UTF-8")));
    }

    #[test]
    fn credentials_debug_redacts_key() {
        let message = Message::Credentials {
            access_key: "key".to_string(),
            private_key: SecretBytes::new(vec![0xAB; 32]),
        };
        let rendered = format!("{message:?}");
        assert!(rendered.contains("<redacted:32 bytes>"));
        assert!(!rendered.contains("171"));
    }

    #[test]
    fn secret_clear_zeroes_and_empties() {
        let mut secret = SecretBytes::new(vec![1, 2, 3]);
        secret.clear();
        assert!(secret.is_empty());
    }
}
