//! Column encryption: literals written to encrypted columns are replaced by AES ciphertext and
//! result values are decrypted before they reach the client.

use sqlparser::ast::{Expr, Insert, Statement};
use tracing::{debug, warn};

use super::{
    decode_bytea_text, literal_plaintext, render_plaintext, rewrite_insert_values,
    rewrite_update_assignments, Mutator, MutatorContext, RowAction, ValueRewrite,
};
use crate::config::ColumnConfig;
use crate::error::{TdeError, TdeResult};
use crate::protocol::codec::{Int16, Int32, VarByteN};
use crate::protocol::messages::{DataRowMessage, RowDescriptionMessage};
use crate::sql::visitor::{walk_insert, walk_update, UpdateStatement};
use crate::sql::{bytea_literal, null_literal, ColumnRef, Context, Literal, Scope, Visitor};

const KIND: &str = "encrypted";

fn encrypted_value(ctx: &MutatorContext, column: &ColumnConfig, literal: &Literal) -> TdeResult<Expr> {
    let Some(settings) = &column.encryption else {
        return Ok(null_literal());
    };
    match literal_plaintext(literal, column)? {
        Some(plaintext) => {
            let ciphertext = ctx.crypto.aes_encrypt(&settings.key, &plaintext)?;
            Ok(bytea_literal(&ciphertext))
        }
        None => Ok(null_literal()),
    }
}

fn replace_encrypted(column: &ColumnConfig) -> Option<ValueRewrite> {
    column.encryption.as_ref().map(|_| ValueRewrite::Replace)
}

/// An encrypted column of the current result set.
struct EncryptedResult {
    name: String,
    config: ColumnConfig,
}

pub struct EncryptionMutator {
    ctx: MutatorContext,
    scope: Scope,
    /// One entry per column of the current result set.
    result: Vec<Option<EncryptedResult>>,
}

impl EncryptionMutator {
    pub fn new(ctx: MutatorContext) -> Self {
        EncryptionMutator {
            ctx,
            scope: Scope::default(),
            result: Vec::new(),
        }
    }

    fn decrypt(&self, config: &ColumnConfig, value: &[u8]) -> Option<Vec<u8>> {
        let key = &config.encryption.as_ref()?.key;
        let ciphertext = decode_bytea_text(value)?;
        let plaintext = self.ctx.crypto.aes_decrypt(key, &ciphertext).ok()?;
        render_plaintext(&plaintext, config)
    }
}

impl Visitor for EncryptionMutator {
    fn scope(&self) -> &Scope {
        &self.scope
    }

    fn scope_mut(&mut self) -> &mut Scope {
        &mut self.scope
    }

    fn visit_insert_statement(&mut self, insert: &mut Insert) -> TdeResult<()> {
        rewrite_insert_values(insert, &self.ctx, KIND, replace_encrypted, |column, literal| {
            encrypted_value(&self.ctx, column, literal)
        })?;
        walk_insert(self, insert)
    }

    fn visit_update_statement(&mut self, mut update: UpdateStatement<'_>) -> TdeResult<()> {
        rewrite_update_assignments(&mut update, &self.ctx, KIND, replace_encrypted, |column, literal| {
            encrypted_value(&self.ctx, column, literal)
        })?;
        walk_update(self, update)
    }

    fn visit_column(&mut self, _expr: &mut Expr, column: &ColumnRef, ctx: Context) -> TdeResult<()> {
        let encrypted = self
            .ctx
            .column(&column.table, &column.column)
            .is_some_and(ColumnConfig::is_encrypted);
        if encrypted && !ctx.in_select_body() {
            return Err(TdeError::query(format!("invalid use of encrypted column {}", column)));
        }
        Ok(())
    }

    fn visit_wildcard(&mut self) -> TdeResult<()> {
        if self.ctx.any_tde_table(&self.scope) {
            return Err(TdeError::query("star expression is not supported"));
        }
        Ok(())
    }

    fn visit_unsupported(&mut self, feature: &str) -> TdeResult<()> {
        if self.ctx.any_tde_table(&self.scope) {
            return Err(TdeError::unsupported(format!(
                "{} is not supported for TDE-enabled tables",
                feature
            )));
        }
        Ok(())
    }

    fn visit_other_statement(&mut self) -> TdeResult<()> {
        if self.ctx.any_tde_table(&self.scope) {
            return Err(TdeError::unsupported("unsupported statement"));
        }
        Ok(())
    }
}

impl Mutator for EncryptionMutator {
    fn name(&self) -> &'static str {
        "encryption"
    }

    fn mutate_query(&mut self, statements: &mut [Statement]) -> TdeResult<()> {
        self.result.clear();
        self.visit_query(statements)
    }

    fn mutate_row_description(
        &mut self,
        message: &mut RowDescriptionMessage,
        statement: usize,
    ) -> TdeResult<()> {
        self.result.clear();
        let results = self.scope.results(statement);

        for description in message.columns_mut() {
            let name = description.name();
            let config = results
                .and_then(|results| results.column(&name))
                .and_then(|column| self.ctx.column(&column.table, &column.column))
                .filter(|config| config.is_encrypted());

            let Some(config) = config else {
                self.result.push(None);
                continue;
            };
            if description.format_code() != 0 {
                return Err(TdeError::unsupported(format!(
                    "binary format is not supported for encrypted column {}",
                    name
                )));
            }
            description.data_type = Int32(config.data_type);
            description.data_size = Int16(config.data_size);
            debug!("result column {} is encrypted", name);
            self.result.push(Some(EncryptedResult {
                name,
                config: config.clone(),
            }));
        }
        Ok(())
    }

    fn mutate_data_row(&mut self, message: &mut DataRowMessage) -> TdeResult<RowAction> {
        if self.result.iter().all(Option::is_none) {
            return Ok(RowAction::Keep);
        }

        for (index, value) in message.values_mut().iter_mut().enumerate() {
            let Some(Some(encrypted)) = self.result.get(index) else {
                continue;
            };
            let Some(raw) = value.as_bytes() else {
                continue;
            };
            let plaintext = self.decrypt(&encrypted.config, raw).ok_or_else(|| {
                warn!("unable to decrypt value of column {}", encrypted.name);
                TdeError::crypto(format!("decryption failed for column {}", encrypted.name))
            })?;
            *value = VarByteN::value(plaintext);
        }
        Ok(RowAction::Keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticEncryptionConfig;
    use crate::crypto::{CryptoProvider, RustCryptoProvider};
    use crate::protocol::messages::ColumnDescription;
    use crate::sql::{dump_query, parse_query};
    use crate::types;
    use pretty_assertions::assert_eq;
    use sqlparser::ast::{OnConflictAction, OnInsert, SetExpr, Value, ValueWithSpan};
    use std::sync::Arc;

    const KEY: [u8; 32] = [3; 32];

    fn mutator() -> EncryptionMutator {
        let config = StaticEncryptionConfig::default()
            .with_column("cities", ColumnConfig::new("name", types::TEXT).encrypted(KEY.to_vec()))
            .with_column("cities", ColumnConfig::new("population", types::INT4).encrypted(KEY.to_vec()));
        EncryptionMutator::new(MutatorContext::new(
            Arc::new(config),
            Arc::new(RustCryptoProvider::new()),
        ))
    }

    fn mutate(mutator: &mut EncryptionMutator, sql: &str) -> TdeResult<Vec<Statement>> {
        let mut statements = parse_query(sql).unwrap();
        mutator.mutate_query(&mut statements)?;
        Ok(statements)
    }

    fn decrypt_literal(expr: &Expr) -> Vec<u8> {
        let Expr::Value(ValueWithSpan {
            value: Value::SingleQuotedString(s),
            ..
        }) = expr
        else {
            panic!("not a string literal: {}", expr);
        };
        let ciphertext = decode_bytea_text(s.as_bytes()).unwrap();
        RustCryptoProvider::new().aes_decrypt(&KEY, &ciphertext).unwrap()
    }

    fn ciphertext_text(plaintext: &[u8]) -> Vec<u8> {
        let ciphertext = RustCryptoProvider::new().aes_encrypt(&KEY, plaintext).unwrap();
        format!("\\x{}", hex::encode(ciphertext)).into_bytes()
    }

    #[test]
    fn test_projection_is_allowed_and_where_is_not() {
        let mut mutator = mutator();
        let statements = mutate(&mut mutator, "SELECT c.name FROM cities c WHERE c.id = 1").unwrap();
        assert_eq!(dump_query(&statements), "SELECT c.name FROM cities AS c WHERE c.id = 1");

        let err = mutate(&mut mutator, "SELECT c.id FROM cities c WHERE c.name = 'x'").unwrap_err();
        assert_eq!(err.to_string(), "pgtde: invalid use of encrypted column cities.name");
    }

    #[test]
    fn test_star_only_rejected_for_tde_tables() {
        let mut mutator = mutator();
        let err = mutate(&mut mutator, "SELECT * FROM cities").unwrap_err();
        assert_eq!(err.to_string(), "pgtde: star expression is not supported");
        assert!(mutate(&mut mutator, "SELECT * FROM regions").is_ok());
    }

    #[test]
    fn test_insert_values_are_encrypted() {
        let mut mutator = mutator();
        let statements = mutate(
            &mut mutator,
            "INSERT INTO cities (id, name, population) VALUES (1, 'Moscow', 12000000), (2, NULL, 5)",
        )
        .unwrap();
        let Statement::Insert(insert) = &statements[0] else {
            panic!();
        };
        let SetExpr::Values(values) = insert.source.as_ref().unwrap().body.as_ref() else {
            panic!();
        };
        assert_eq!(values.rows[0][0].to_string(), "1");
        assert_eq!(decrypt_literal(&values.rows[0][1]), b"Moscow");
        assert_eq!(decrypt_literal(&values.rows[0][2]), 12_000_000i32.to_be_bytes());
        assert_eq!(values.rows[1][1].to_string(), "NULL");
    }

    #[test]
    fn test_update_value_is_encrypted() {
        let mut mutator = mutator();
        let statements =
            mutate(&mut mutator, "UPDATE cities SET population = 123 WHERE id = 5").unwrap();
        let Statement::Update { assignments, selection, .. } = &statements[0] else {
            panic!();
        };
        assert_eq!(decrypt_literal(&assignments[0].value), 123i32.to_be_bytes());
        assert_eq!(selection.as_ref().unwrap().to_string(), "id = 5");
    }

    #[test]
    fn test_upsert_assignments_are_encrypted() {
        let mut mutator = mutator();
        let statements = mutate(
            &mut mutator,
            "INSERT INTO cities (id, name) VALUES (1, 'a') ON CONFLICT (id) DO UPDATE SET name = 'Kazan'",
        )
        .unwrap();
        let Statement::Insert(insert) = &statements[0] else {
            panic!();
        };
        let Some(OnInsert::OnConflict(conflict)) = &insert.on else {
            panic!("no ON CONFLICT clause");
        };
        let OnConflictAction::DoUpdate(update) = &conflict.action else {
            panic!("not DO UPDATE");
        };
        assert_eq!(decrypt_literal(&update.assignments[0].value), b"Kazan");

        let err = mutate(
            &mut mutator,
            "INSERT INTO cities (id, name) VALUES (1, 'a') ON CONFLICT (id) DO UPDATE SET name = excluded.name",
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "pgtde: only literals can be used as UPDATE values for encrypted columns"
        );
    }

    #[test]
    fn test_tuple_assignment_to_encrypted_column_is_rejected() {
        let mut mutator = mutator();
        let err = mutate(&mut mutator, "UPDATE cities SET (name, id) = ('x', 1)").unwrap_err();
        assert_eq!(
            err.to_string(),
            "pgtde: only literals can be used as UPDATE values for encrypted columns"
        );
    }

    #[test]
    fn test_explain_analyze_is_rewritten() {
        let mut mutator = mutator();
        let statements = mutate(
            &mut mutator,
            "EXPLAIN ANALYZE UPDATE cities SET population = 7 WHERE id = 1",
        )
        .unwrap();
        let Statement::Explain { statement, .. } = &statements[0] else {
            panic!();
        };
        let Statement::Update { assignments, .. } = statement.as_ref() else {
            panic!();
        };
        assert_eq!(decrypt_literal(&assignments[0].value), 7i32.to_be_bytes());
    }

    #[test]
    fn test_other_statements_on_tde_tables_are_unsupported() {
        let mut mutator = mutator();
        let err = mutate(
            &mut mutator,
            "MERGE INTO cities c USING src s ON c.id = s.id WHEN MATCHED THEN UPDATE SET name = 'x'",
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "pgtde: unsupported statement");

        assert!(mutate(
            &mut mutator,
            "MERGE INTO regions r USING src s ON r.id = s.id WHEN MATCHED THEN UPDATE SET title = 'x'",
        )
        .is_ok());
        assert!(mutate(&mut mutator, "SET search_path TO public").is_ok());
    }

    #[test]
    fn test_malformed_inserts() {
        let mut mutator = mutator();
        let err = mutate(&mut mutator, "INSERT INTO cities VALUES (1, 'x')").unwrap_err();
        assert_eq!(
            err.to_string(),
            "pgtde: columns definition for INSERT is required for TDE-enabled tables"
        );

        let err = mutate(&mut mutator, "INSERT INTO cities (id, name) VALUES (1)").unwrap_err();
        assert_eq!(err.to_string(), "pgtde: bad INSERT statement");

        let err = mutate(&mut mutator, "INSERT INTO cities (id, name) SELECT id, title FROM regions")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "pgtde: INSERT INTO SELECT is not supported for TDE-enabled tables"
        );
    }

    #[test]
    fn test_using_join_on_tde_table_is_unsupported() {
        let mut mutator = mutator();
        let err = mutate(&mut mutator, "SELECT c.name FROM cities c JOIN regions r USING (id)")
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "pgtde: JOIN ... USING is not supported for TDE-enabled tables"
        );
    }

    #[test]
    fn test_result_decryption() {
        let mut mutator = mutator();
        mutate(&mut mutator, "SELECT c.id, c.name AS city, c.population FROM cities c").unwrap();

        let mut description = RowDescriptionMessage::new(vec![
            ColumnDescription::new("id", types::INT4, 4, 0),
            ColumnDescription::new("city", types::BYTEA, -1, 0),
            ColumnDescription::new("population", types::BYTEA, -1, 0),
        ]);
        mutator.mutate_row_description(&mut description, 0).unwrap();
        assert_eq!(description.columns()[1].data_type(), types::TEXT);
        assert_eq!(description.columns()[2].data_type(), types::INT4);
        assert_eq!(description.columns()[2].data_size(), 4);

        let mut row = DataRowMessage::new(vec![
            VarByteN::value("1"),
            VarByteN::value(ciphertext_text(b"Moscow")),
            VarByteN::value(ciphertext_text(&12_000_000i32.to_be_bytes())),
        ]);
        assert_eq!(mutator.mutate_data_row(&mut row).unwrap(), RowAction::Keep);
        assert_eq!(row.values()[0].as_bytes(), Some(&b"1"[..]));
        assert_eq!(row.values()[1].as_bytes(), Some(&b"Moscow"[..]));
        assert_eq!(row.values()[2].as_bytes(), Some(&b"12000000"[..]));

        let mut nulls = DataRowMessage::new(vec![VarByteN::value("2"), VarByteN::null(), VarByteN::null()]);
        mutator.mutate_data_row(&mut nulls).unwrap();
        assert!(nulls.values()[1].is_null());
    }

    #[test]
    fn test_undecryptable_value_is_an_error() {
        let mut mutator = mutator();
        mutate(&mut mutator, "SELECT c.name FROM cities c").unwrap();
        let mut description =
            RowDescriptionMessage::new(vec![ColumnDescription::new("name", types::BYTEA, -1, 0)]);
        mutator.mutate_row_description(&mut description, 0).unwrap();

        let mut row = DataRowMessage::new(vec![VarByteN::value("\\xdeadbeef")]);
        let err = mutator.mutate_data_row(&mut row).unwrap_err();
        assert_eq!(err.to_string(), "pgtde: decryption failed for column name");
    }

    #[test]
    fn test_binary_format_is_rejected() {
        let mut mutator = mutator();
        mutate(&mut mutator, "SELECT c.name FROM cities c").unwrap();
        let mut description =
            RowDescriptionMessage::new(vec![ColumnDescription::new("name", types::BYTEA, -1, 1)]);
        let err = mutator.mutate_row_description(&mut description, 0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "pgtde: binary format is not supported for encrypted column name"
        );
    }
}
