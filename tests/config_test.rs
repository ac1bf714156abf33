use std::io::Write;

use pgtde::config::{EncryptionConfig, ProxySettings, UpstreamSsl};
use pgtde::types;
use pretty_assertions::assert_eq;

const KEY_A: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
const KEY_B: &str = "ffeeddccbbaa99887766554433221100ffeeddccbbaa99887766554433221100";

fn config_file(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_toml() {
    let file = config_file(
        ".toml",
        &format!(
            r#"
listen = "0.0.0.0:7432"
upstream = "db.internal:5432"
upstream_ssl = "require"
join_key_size = 6

[[tables]]
name = "cities"

[[tables.columns]]
name = "Name"
type = "text"
encryption_key = "{KEY_A}"
blind_index_key = "{KEY_B}"
blind_index_column = "name_hmac"

[[tables.columns]]
name = "id"
type = "int4"
join = true
"#
        ),
    );

    let settings = ProxySettings::load(Some(file.path())).unwrap();
    assert_eq!(settings.listen, "0.0.0.0:7432");
    assert_eq!(settings.upstream_ssl, UpstreamSsl::Require);
    assert_eq!(settings.upstream_host(), "db.internal");
    assert!(settings.enable_sql_parsing);

    let encryption = settings.encryption_config().unwrap();
    assert_eq!(encryption.join_key_size(), 6);
    assert!(encryption.has_tde_enabled("cities"));
    assert!(!encryption.has_tde_enabled("regions"));

    let name = encryption.column_config("cities", "name").unwrap();
    assert_eq!(name.data_type, types::TEXT);
    assert_eq!(name.encryption.as_ref().unwrap().key, hex::decode(KEY_A).unwrap());
    assert_eq!(name.blind_index.as_ref().unwrap().column, "name_hmac");

    let id = encryption.column_config("cities", "id").unwrap();
    assert!(!id.is_encrypted());
    assert_eq!(id.join.as_ref().unwrap().column, "id_join");
}

#[test]
fn test_load_json() {
    let file = config_file(
        ".json",
        &format!(
            r#"{{
  "upstream": "10.0.0.5:5432",
  "permissive_parsing": true,
  "tables": [
    {{ "name": "users", "columns": [ {{ "name": "email", "encryption_key": "{KEY_A}" }} ] }}
  ]
}}"#
        ),
    );

    let settings = ProxySettings::load(Some(file.path())).unwrap();
    assert!(settings.permissive_parsing);
    let encryption = settings.encryption_config().unwrap();
    let email = encryption.column_config("users", "email").unwrap();
    assert_eq!(email.data_type, types::TEXT);
    assert!(email.is_encrypted());
    assert!(!email.has_blind_index());
}

#[test]
fn test_invalid_key_is_rejected() {
    let file = config_file(
        ".toml",
        r#"
[[tables]]
name = "users"

[[tables.columns]]
name = "email"
encryption_key = "abcd"
"#,
    );
    let settings = ProxySettings::load(Some(file.path())).unwrap();
    assert!(settings.encryption_config().is_err());
}

#[test]
fn test_half_configured_tls_fails_to_load() {
    let file = config_file(".toml", "terminate_ssl = true\ntls_cert = \"/etc/pgtde/server.crt\"\n");
    let err = ProxySettings::load(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("tls_cert and tls_key"), "{}", err);
}

#[test]
fn test_unknown_column_type() {
    let file = config_file(
        ".toml",
        r#"
[[tables]]
name = "users"

[[tables.columns]]
name = "shape"
type = "polygon"
join = true
"#,
    );
    let settings = ProxySettings::load(Some(file.path())).unwrap();
    let err = settings.encryption_config().unwrap_err();
    assert!(err.to_string().contains("unknown type 'polygon'"), "{}", err);
}
