//! Drives the mutator chain for one client session.
//!
//! Queries are rewritten on the way to the server. Result sets of rewritten queries are held
//! back until their CommandComplete arrives: either every row passed the mutators and the
//! whole set is released, or nothing is and the client gets an error instead.

use std::sync::Arc;

use sqlparser::ast::Statement;
use tracing::{debug, info, warn};

use crate::error::{TdeError, TdeResult};
use crate::mutators::{Mutator, MutatorContext, RowAction};
use crate::protocol::decoder::Outbound;
use crate::protocol::messages::{
    CommandCompleteMessage, DataRowMessage, EmptyQueryResponseMessage, ErrorResponseMessage,
    Message, ParseMessage, QueryMessage, RawMessage, ReadyForQueryMessage, RowDescriptionMessage,
    TRANSACTION_IDLE,
};
use crate::security::{events, SecurityAuditLogger};
use crate::sql;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerSettings {
    pub enable_sql_parsing: bool,
    pub permissive_parsing: bool,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        ManagerSettings {
            enable_sql_parsing: true,
            permissive_parsing: false,
        }
    }
}

/// Response bookkeeping for the query in flight.
#[derive(Debug, Default)]
struct ResponseState {
    /// Responses belong to a query that went through the mutators.
    mutated: bool,
    /// Statement of the query whose result set is arriving.
    statement: usize,
    retained: Vec<Message>,
    rows_kept: usize,
    rows_dropped: usize,
    failure: Option<TdeError>,
    /// A result set was replaced by an error; drop everything until ReadyForQuery.
    aborted: bool,
}

impl ResponseState {
    fn begin(mutated: bool) -> Self {
        ResponseState {
            mutated,
            ..Default::default()
        }
    }

    fn clear_result_set(&mut self) {
        self.retained.clear();
        self.rows_kept = 0;
        self.rows_dropped = 0;
        self.failure = None;
    }
}

pub struct MutationManager {
    settings: ManagerSettings,
    chain: Vec<Box<dyn Mutator>>,
    audit: Arc<SecurityAuditLogger>,
    session_id: String,
    response: ResponseState,
    transaction_status: u8,
    /// An extended protocol batch was rejected; its messages are dropped up to Sync.
    skip_until_sync: bool,
}

impl MutationManager {
    pub fn new(
        settings: ManagerSettings,
        context: &MutatorContext,
        audit: Arc<SecurityAuditLogger>,
        session_id: impl Into<String>,
    ) -> Self {
        Self::with_chain(settings, context.build_chain(), audit, session_id)
    }

    pub fn with_chain(
        settings: ManagerSettings,
        chain: Vec<Box<dyn Mutator>>,
        audit: Arc<SecurityAuditLogger>,
        session_id: impl Into<String>,
    ) -> Self {
        MutationManager {
            settings,
            chain,
            audit,
            session_id: session_id.into(),
            response: ResponseState::default(),
            transaction_status: TRANSACTION_IDLE,
            skip_until_sync: false,
        }
    }

    pub fn transaction_status(&self) -> u8 {
        self.transaction_status
    }

    /// Rewritten SQL, or `None` to forward the original text.
    fn mutate_sql(&mut self, query: &str) -> TdeResult<Option<String>> {
        let mut statements: Vec<Statement> = match sql::parse_query(query) {
            Ok(statements) => statements,
            Err(e) if self.settings.permissive_parsing => {
                warn!("forwarding query the parser rejected: {}", e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if statements.is_empty() {
            return Ok(None);
        }

        let original = sql::dump_query(&statements);
        for mutator in self.chain.iter_mut() {
            mutator.mutate_query(&mut statements).inspect_err(|e| {
                debug!("{} mutator rejected query: {}", mutator.name(), e);
            })?;
        }
        let rewritten = sql::dump_query(&statements);
        if rewritten == original {
            // Nothing protected was touched; keep the client's own text.
            return Ok(Some(query.to_string()));
        }
        Ok(Some(rewritten))
    }

    fn reject(&mut self, error: &TdeError, out: &mut Outbound) {
        ErrorResponseMessage::error(error.sqlstate(), &error.to_string()).write(&mut out.downstream);
        ReadyForQueryMessage::new(self.transaction_status).write(&mut out.downstream);
    }

    pub fn process_query(&mut self, mut message: QueryMessage, out: &mut Outbound) {
        if !self.settings.enable_sql_parsing {
            message.write(&mut out.upstream);
            return;
        }

        let query = match message.query_string() {
            Ok(query) => query.to_string(),
            Err(e) => {
                let error = TdeError::Protocol(e);
                events::query_rejected(&self.audit, &self.session_id, &error.to_string());
                self.reject(&error, out);
                return;
            }
        };

        match self.mutate_sql(&query) {
            Ok(Some(rewritten)) => {
                if rewritten != query {
                    debug!("rewritten query: {}", rewritten);
                    events::query_rewritten(&self.audit, &self.session_id, &rewritten);
                    message.set_query_string(rewritten);
                }
                self.response = ResponseState::begin(true);
                message.write(&mut out.upstream);
            }
            Ok(None) => {
                self.response = ResponseState::begin(false);
                message.write(&mut out.upstream);
            }
            Err(error) => {
                info!("query rejected: {}", error);
                events::query_rejected(&self.audit, &self.session_id, &error.to_string());
                self.reject(&error, out);
            }
        }
    }

    /// Prepared statements cannot be rewritten; the batch is answered locally.
    pub fn process_parse(&mut self, message: ParseMessage, out: &mut Outbound) {
        if !self.settings.enable_sql_parsing {
            message.write(&mut out.upstream);
            return;
        }
        let error = TdeError::unsupported("prepared statements are not supported");
        events::prepared_statement_rejected(&self.audit, &self.session_id);
        ErrorResponseMessage::error(error.sqlstate(), &error.to_string()).write(&mut out.downstream);
        self.skip_until_sync = true;
    }

    pub fn process_frontend_raw(&mut self, message: RawMessage, out: &mut Outbound) {
        if !self.skip_until_sync {
            message.write_to(&mut out.upstream);
            return;
        }
        match message.tag {
            Some(b'S') => {
                self.skip_until_sync = false;
                ReadyForQueryMessage::new(self.transaction_status).write(&mut out.downstream);
            }
            Some(b'B' | b'D' | b'E' | b'C' | b'H') => {
                debug!("dropping extended protocol message {:?}", message.tag.map(char::from));
            }
            _ => {
                self.skip_until_sync = false;
                message.write_to(&mut out.upstream);
            }
        }
    }

    pub fn process_row_description(&mut self, mut message: RowDescriptionMessage, out: &mut Outbound) {
        if !self.response.mutated {
            message.write(&mut out.downstream);
            return;
        }
        if self.response.aborted || self.response.failure.is_some() {
            return;
        }

        let statement = self.response.statement;
        for mutator in self.chain.iter_mut().rev() {
            if let Err(e) = mutator.mutate_row_description(&mut message, statement) {
                warn!("{} mutator failed on row description: {}", mutator.name(), e);
                self.response.failure = Some(e);
                return;
            }
        }
        self.response.retained.push(Message::RowDescription(message));
    }

    pub fn process_data_row(&mut self, mut message: DataRowMessage, out: &mut Outbound) {
        if !self.response.mutated {
            message.write(&mut out.downstream);
            return;
        }
        if self.response.aborted || self.response.failure.is_some() {
            return;
        }

        for mutator in self.chain.iter_mut().rev() {
            match mutator.mutate_data_row(&mut message) {
                Ok(RowAction::Keep) => {}
                Ok(RowAction::Discard) => {
                    self.response.rows_dropped += 1;
                    return;
                }
                Err(e) => {
                    self.response.failure = Some(e);
                    return;
                }
            }
        }
        self.response.rows_kept += 1;
        self.response.retained.push(Message::DataRow(message));
    }

    pub fn process_command_complete(&mut self, message: CommandCompleteMessage, out: &mut Outbound) {
        if !self.response.mutated {
            message.write(&mut out.downstream);
            return;
        }
        if self.response.aborted {
            return;
        }

        if let Some(error) = self.response.failure.take() {
            events::result_set_discarded(
                &self.audit,
                &self.session_id,
                &error.to_string(),
                self.response.retained.len(),
            );
            ErrorResponseMessage::error(error.sqlstate(), &error.to_string())
                .write(&mut out.downstream);
            self.response.clear_result_set();
            self.response.aborted = true;
            return;
        }

        for retained in self.response.retained.drain(..) {
            retained.write(&mut out.downstream);
        }

        let dropped = self.response.rows_dropped;
        if dropped > 0 {
            events::rows_filtered(&self.audit, &self.session_id, dropped);
            let tag = message.command_tag();
            if tag.starts_with("SELECT ") {
                let kept = format!("SELECT {}", self.response.rows_kept);
                CommandCompleteMessage::new(&kept).write(&mut out.downstream);
            } else {
                message.write(&mut out.downstream);
            }
        } else {
            message.write(&mut out.downstream);
        }

        self.response.clear_result_set();
        self.response.statement += 1;
    }

    pub fn process_empty_query_response(
        &mut self,
        message: EmptyQueryResponseMessage,
        out: &mut Outbound,
    ) {
        if self.response.aborted {
            return;
        }
        self.response.clear_result_set();
        self.response.statement += 1;
        message.write(&mut out.downstream);
    }

    pub fn process_error_response(&mut self, message: ErrorResponseMessage, out: &mut Outbound) {
        if self.response.mutated && !self.response.retained.is_empty() {
            debug!(
                "server error, dropping {} retained messages",
                self.response.retained.len()
            );
        }
        self.response.clear_result_set();
        if self.response.aborted {
            return;
        }
        message.write(&mut out.downstream);
    }

    pub fn process_ready_for_query(&mut self, message: ReadyForQueryMessage, out: &mut Outbound) {
        self.transaction_status = message.transaction_status();
        self.response = ResponseState::default();
        message.write(&mut out.downstream);
    }
}
