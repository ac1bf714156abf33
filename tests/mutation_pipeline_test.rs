mod common;

use bytes::BytesMut;
use common::*;
use pgtde::protocol::codec::VarByteN;
use pgtde::protocol::messages::{
    ColumnDescription, CommandCompleteMessage, DataRowMessage, ReadyForQueryMessage,
    RowDescriptionMessage,
};
use pgtde::types;
use pretty_assertions::assert_eq;

fn server_result(columns: Vec<ColumnDescription>, rows: Vec<Vec<VarByteN>>, tag: &str) -> BytesMut {
    let mut buf = BytesMut::new();
    RowDescriptionMessage::new(columns).write(&mut buf);
    for row in rows {
        DataRowMessage::new(row).write(&mut buf);
    }
    CommandCompleteMessage::new(tag).write(&mut buf);
    ReadyForQueryMessage::new(b'I').write(&mut buf);
    buf
}

#[test]
fn test_lookup_by_encrypted_column_is_decrypted_for_client() {
    let mut filter = connected_filter();

    let output = filter.on_frontend_data(&query(
        "SELECT c.id, c.name FROM cities c WHERE c.name = 'Moscow'",
    ));
    assert!(output.to_downstream.is_empty());
    let sent = frames(&output.to_upstream);
    assert_eq!(sent.len(), 1);
    assert_eq!(
        query_text(&sent[0]),
        format!(
            "SELECT c.id, c.name FROM cities AS c WHERE c.name_bi = {}",
            blind_index_literal(b"Moscow")
        )
    );

    let response = server_result(
        vec![
            ColumnDescription::new("id", types::INT4, 4, 0),
            ColumnDescription::new("name", types::BYTEA, -1, 0),
        ],
        vec![vec![VarByteN::value("7"), VarByteN::value(encrypted_text(b"Moscow"))]],
        "SELECT 1",
    );
    let output = filter.on_backend_data(&response);
    assert!(output.to_upstream.is_empty());

    let received = frames(&output.to_downstream);
    assert_eq!(tags(&output.to_downstream), "TDCZ");
    assert_eq!(
        row_description(&received[0]),
        vec![("id".to_string(), types::INT4), ("name".to_string(), types::TEXT)]
    );
    assert_eq!(
        data_row(&received[1]),
        vec![Some(b"7".to_vec()), Some(b"Moscow".to_vec())]
    );
    assert_eq!(command_tag(&received[2]), "SELECT 1");
}

#[test]
fn test_join_collisions_are_filtered() {
    let mut filter = connected_filter();

    let output = filter.on_frontend_data(&query(
        "SELECT c.id, r.city_id FROM cities c JOIN city2region r ON c.id = r.city_id",
    ));
    let sent = frames(&output.to_upstream);
    assert!(
        query_text(&sent[0]).ends_with("ON c.id_join = r.city_id_join"),
        "{}",
        query_text(&sent[0])
    );

    let response = server_result(
        vec![
            ColumnDescription::new("id", types::INT4, 4, 0),
            ColumnDescription::new("city_id", types::INT4, 4, 0),
        ],
        vec![
            vec![VarByteN::value("1"), VarByteN::value("1")],
            vec![VarByteN::value("1"), VarByteN::value("9")],
            vec![VarByteN::value("2"), VarByteN::value("2")],
        ],
        "SELECT 3",
    );
    let output = filter.on_backend_data(&response);
    let received = frames(&output.to_downstream);
    assert_eq!(tags(&output.to_downstream), "TDDCZ");
    assert_eq!(data_row(&received[1]), vec![Some(b"1".to_vec()), Some(b"1".to_vec())]);
    assert_eq!(data_row(&received[2]), vec![Some(b"2".to_vec()), Some(b"2".to_vec())]);
    assert_eq!(command_tag(&received[3]), "SELECT 2");
}

#[test]
fn test_rejected_query_never_reaches_server() {
    let mut filter = connected_filter();

    let output = filter.on_frontend_data(&query("SELECT id FROM cities WHERE name LIKE 'M%'"));
    assert!(output.to_upstream.is_empty());

    let received = frames(&output.to_downstream);
    assert_eq!(tags(&output.to_downstream), "EZ");
    assert_eq!(
        error_field(&received[0], b'M').as_deref(),
        Some("pgtde: invalid use of blind indexed column cities.name")
    );
    assert_eq!(error_field(&received[0], b'C').as_deref(), Some("42000"));
}

#[test]
fn test_undecryptable_row_fails_the_whole_result_set() {
    let mut filter = connected_filter();
    filter.on_frontend_data(&query("SELECT name FROM cities"));

    let response = server_result(
        vec![ColumnDescription::new("name", types::BYTEA, -1, 0)],
        vec![
            vec![VarByteN::value(encrypted_text(b"Kazan"))],
            vec![VarByteN::value("\\xdeadbeef")],
        ],
        "SELECT 2",
    );
    let output = filter.on_backend_data(&response);
    let received = frames(&output.to_downstream);
    // Nothing of the result set is released, not even the valid first row.
    assert_eq!(tags(&output.to_downstream), "EZ");
    assert_eq!(
        error_field(&received[0], b'M').as_deref(),
        Some("pgtde: decryption failed for column name")
    );
}

#[test]
fn test_insert_writes_ciphertext_and_shadow_columns() {
    let mut filter = connected_filter();
    let output = filter.on_frontend_data(&query("INSERT INTO cities (id, name) VALUES (5, 'Omsk')"));
    let sql = query_text(&frames(&output.to_upstream)[0]);
    assert!(sql.starts_with("INSERT INTO cities (id, name, name_bi, id_join) VALUES (5, '\\x"), "{}", sql);
    assert!(!sql.contains("'Omsk'"), "{}", sql);
    assert!(sql.contains(&blind_index_literal(b"Omsk")), "{}", sql);
}

#[test]
fn test_unprotected_tables_pass_untouched() {
    let mut filter = connected_filter();
    let sql = "select * from regions where title like 'North%'";
    let output = filter.on_frontend_data(&query(sql));
    assert_eq!(query_text(&frames(&output.to_upstream)[0]), sql);

    let response = server_result(
        vec![ColumnDescription::new("title", types::TEXT, -1, 0)],
        vec![vec![VarByteN::value("Northwest")]],
        "SELECT 1",
    );
    let output = filter.on_backend_data(&response);
    assert_eq!(output.to_downstream.as_ref(), response.as_ref());
}

#[test]
fn test_multi_statement_results_map_to_their_statements() {
    let mut filter = connected_filter();
    filter.on_frontend_data(&query("SELECT id FROM cities; SELECT name FROM cities"));

    let mut response = BytesMut::new();
    RowDescriptionMessage::new(vec![ColumnDescription::new("id", types::INT4, 4, 0)]).write(&mut response);
    DataRowMessage::new(vec![VarByteN::value("3")]).write(&mut response);
    CommandCompleteMessage::new("SELECT 1").write(&mut response);
    RowDescriptionMessage::new(vec![ColumnDescription::new("name", types::BYTEA, -1, 0)]).write(&mut response);
    DataRowMessage::new(vec![VarByteN::value(encrypted_text(b"Tver"))]).write(&mut response);
    CommandCompleteMessage::new("SELECT 1").write(&mut response);
    ReadyForQueryMessage::new(b'I').write(&mut response);

    let output = filter.on_backend_data(&response);
    let received = frames(&output.to_downstream);
    assert_eq!(tags(&output.to_downstream), "TDCTDCZ");
    assert_eq!(data_row(&received[1]), vec![Some(b"3".to_vec())]);
    assert_eq!(data_row(&received[4]), vec![Some(b"Tver".to_vec())]);
}

#[test]
fn test_explained_update_is_rewritten() {
    let mut filter = connected_filter();
    let output = filter.on_frontend_data(&query(
        "EXPLAIN ANALYZE UPDATE cities SET name = 'Kazan' WHERE population > 5",
    ));
    let sql = query_text(&frames(&output.to_upstream)[0]);
    assert!(sql.starts_with("EXPLAIN ANALYZE UPDATE cities SET name = '\\x"), "{}", sql);
    assert!(!sql.contains("'Kazan'"), "{}", sql);
    assert!(sql.contains(&format!("name_bi = {}", blind_index_literal(b"Kazan"))), "{}", sql);
}

#[test]
fn test_merge_into_protected_table_is_rejected() {
    let mut filter = connected_filter();
    let output = filter.on_frontend_data(&query(
        "MERGE INTO cities c USING src s ON c.id = s.id WHEN MATCHED THEN UPDATE SET name = 'Kazan'",
    ));
    assert!(output.to_upstream.is_empty());

    let received = frames(&output.to_downstream);
    assert_eq!(tags(&output.to_downstream), "EZ");
    assert_eq!(
        error_field(&received[0], b'M').as_deref(),
        Some("pgtde: unsupported statement")
    );
    assert_eq!(error_field(&received[0], b'C').as_deref(), Some("0A000"));
}

#[test]
fn test_upsert_assignments_are_encrypted() {
    let mut filter = connected_filter();
    let output = filter.on_frontend_data(&query(
        "INSERT INTO cities (id, name) VALUES (1, 'Omsk') ON CONFLICT (id) DO UPDATE SET name = 'Kazan'",
    ));
    let sql = query_text(&frames(&output.to_upstream)[0]);
    assert!(!sql.contains("'Omsk'"), "{}", sql);
    assert!(!sql.contains("'Kazan'"), "{}", sql);
    assert!(sql.contains("DO UPDATE SET name = '\\x"), "{}", sql);
    assert!(sql.contains(&format!("name_bi = {}", blind_index_literal(b"Kazan"))), "{}", sql);

    let output = filter.on_frontend_data(&query(
        "INSERT INTO cities (id, name) VALUES (1, 'Omsk') ON CONFLICT (id) DO UPDATE SET name = excluded.name",
    ));
    assert!(output.to_upstream.is_empty());
    let received = frames(&output.to_downstream);
    assert_eq!(
        error_field(&received[0], b'M').as_deref(),
        Some("pgtde: only literals can be used as UPDATE values for blind-indexed columns")
    );
}

#[test]
fn test_update_from_resolves_aliases() {
    let mut filter = connected_filter();
    let output = filter.on_frontend_data(&query(
        "UPDATE regions SET title = 'a' FROM cities c WHERE c.name = 'Moscow'",
    ));
    let sql = query_text(&frames(&output.to_upstream)[0]);
    assert!(
        sql.ends_with(&format!("WHERE c.name_bi = {}", blind_index_literal(b"Moscow"))),
        "{}",
        sql
    );
}

#[test]
fn test_quoted_identifiers_match_configured_columns() {
    let mut filter = connected_filter();
    let output = filter.on_frontend_data(&query(
        "SELECT c.id FROM \"Cities\" c WHERE c.\"Name\" = 'Moscow'",
    ));
    let sql = query_text(&frames(&output.to_upstream)[0]);
    assert!(
        sql.ends_with(&format!("WHERE c.name_bi = {}", blind_index_literal(b"Moscow"))),
        "{}",
        sql
    );
}
