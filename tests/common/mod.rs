#![allow(dead_code)]

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use pgtde::config::{ColumnConfig, StaticEncryptionConfig};
use pgtde::crypto::{CryptoProvider, RustCryptoProvider};
use pgtde::mutators::MutatorContext;
use pgtde::security::SecurityAuditLogger;
use pgtde::session::{FilterSettings, TdeFilter, Transport};
use pgtde::types;
use postgres_protocol::message::frontend;

pub const NAME_KEY: [u8; 32] = [0x11; 32];
pub const NAME_BI_KEY: [u8; 32] = [0x22; 32];

/// Plaintext sockets on both sides.
#[derive(Default)]
pub struct PlainTransport;

impl Transport for PlainTransport {
    fn on_ssl_request(&mut self) -> bool {
        true
    }

    fn should_encrypt_upstream(&self) -> bool {
        false
    }

    fn send_upstream(&mut self, _data: Bytes) {}

    fn encrypt_upstream(&mut self, _upstream_agreed: bool, _startup: Bytes) -> bool {
        false
    }
}

/// cities(id join, name encrypted + blind index, population) and city2region(city_id join).
pub fn encryption_config() -> StaticEncryptionConfig {
    StaticEncryptionConfig::default()
        .with_column("cities", ColumnConfig::new("id", types::INT4).with_join())
        .with_column(
            "cities",
            ColumnConfig::new("name", types::TEXT)
                .encrypted(NAME_KEY.to_vec())
                .with_blind_index(NAME_BI_KEY.to_vec()),
        )
        .with_column("city2region", ColumnConfig::new("city_id", types::INT4).with_join())
}

pub fn context() -> MutatorContext {
    MutatorContext::new(Arc::new(encryption_config()), Arc::new(RustCryptoProvider::new()))
}

/// A filter past the startup phase.
pub fn connected_filter() -> TdeFilter<PlainTransport> {
    let mut filter = TdeFilter::new(
        FilterSettings::default(),
        &context(),
        Arc::new(SecurityAuditLogger::disabled()),
        "test-session",
        PlainTransport,
    );
    let mut startup = BytesMut::new();
    frontend::startup_message([("user", "app"), ("database", "geo")], &mut startup).unwrap();
    filter.on_frontend_data(&startup);
    filter
}

pub fn query(sql: &str) -> BytesMut {
    let mut buf = BytesMut::new();
    frontend::query(sql, &mut buf).unwrap();
    buf
}

/// Stored form of an encrypted value as the server returns it in text format.
pub fn encrypted_text(plaintext: &[u8]) -> Vec<u8> {
    let ciphertext = RustCryptoProvider::new().aes_encrypt(&NAME_KEY, plaintext).unwrap();
    format!("\\x{}", hex::encode(ciphertext)).into_bytes()
}

pub fn blind_index_literal(plaintext: &[u8]) -> String {
    let digest = RustCryptoProvider::new().hmac_sha256(&NAME_BI_KEY, plaintext).unwrap();
    format!("'\\x{}'", hex::encode(digest))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub tag: u8,
    pub body: Vec<u8>,
}

pub fn frames(mut bytes: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    while bytes.len() >= 5 {
        let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        frames.push(Frame {
            tag: bytes[0],
            body: bytes[5..1 + len].to_vec(),
        });
        bytes = &bytes[1 + len..];
    }
    assert!(bytes.is_empty(), "trailing partial message");
    frames
}

pub fn tags(bytes: &[u8]) -> String {
    frames(bytes).iter().map(|frame| frame.tag as char).collect()
}

fn cstring(body: &[u8]) -> (String, &[u8]) {
    let end = body.iter().position(|&b| b == 0).unwrap();
    (String::from_utf8(body[..end].to_vec()).unwrap(), &body[end + 1..])
}

/// Text of a Query message.
pub fn query_text(frame: &Frame) -> String {
    assert_eq!(frame.tag, b'Q');
    cstring(&frame.body).0
}

/// Values of a DataRow message.
pub fn data_row(frame: &Frame) -> Vec<Option<Vec<u8>>> {
    assert_eq!(frame.tag, b'D');
    let count = i16::from_be_bytes([frame.body[0], frame.body[1]]);
    let mut rest = &frame.body[2..];
    let mut values = Vec::new();
    for _ in 0..count {
        let len = i32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        rest = &rest[4..];
        if len < 0 {
            values.push(None);
        } else {
            values.push(Some(rest[..len as usize].to_vec()));
            rest = &rest[len as usize..];
        }
    }
    values
}

/// Name and type OID of each column of a RowDescription.
pub fn row_description(frame: &Frame) -> Vec<(String, i32)> {
    assert_eq!(frame.tag, b'T');
    let count = i16::from_be_bytes([frame.body[0], frame.body[1]]);
    let mut rest = &frame.body[2..];
    let mut columns = Vec::new();
    for _ in 0..count {
        let (name, after) = cstring(rest);
        let oid = i32::from_be_bytes([after[6], after[7], after[8], after[9]]);
        columns.push((name, oid));
        rest = &after[18..];
    }
    columns
}

/// Field `code` of an ErrorResponse.
pub fn error_field(frame: &Frame, code: u8) -> Option<String> {
    assert_eq!(frame.tag, b'E');
    let mut rest = frame.body.as_slice();
    while let Some((&field, after)) = rest.split_first() {
        if field == 0 {
            break;
        }
        let (value, after) = cstring(after);
        if field == code {
            return Some(value);
        }
        rest = after;
    }
    None
}

pub fn command_tag(frame: &Frame) -> String {
    assert_eq!(frame.tag, b'C');
    cstring(&frame.body).0
}
