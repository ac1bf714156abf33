use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, Bytes, BytesMut};

use super::codec::{
    wire_struct, Array, Byte1, ByteN, CString, CodecError, Int16, Int32, Repeated, Validation,
    VarByteN, WireType,
};

/// Message framed by a one byte tag and an Int32 length, with a typed body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Typed<const TAG: u8, B> {
    body: B,
}

impl<const TAG: u8, B: WireType> Typed<TAG, B> {
    pub fn from_body(body: B) -> Self {
        Typed { body }
    }

    pub fn tag(&self) -> u8 {
        TAG
    }

    pub fn body(&self) -> &B {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut B {
        &mut self.body
    }

    /// Decodes a body that already passed validation.
    pub fn decode(body: &[u8]) -> Result<Self, CodecError> {
        let mut pos = 0;
        let mut left = body.len();
        let body_value = B::read(body, &mut pos, &mut left)?;
        if left != 0 {
            return Err(CodecError::MalformedMessage(format!(
                "{} trailing bytes in '{}' message",
                left, TAG as char
            )));
        }
        Ok(Typed { body: body_value })
    }

    pub fn write(&self, out: &mut BytesMut) {
        out.put_u8(TAG);
        let len_pos = out.len();
        out.put_i32(0);
        self.body.write(out);
        let len = (out.len() - len_pos) as i32;
        BigEndian::write_i32(&mut out[len_pos..len_pos + 4], len);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.write(&mut out);
        out.freeze()
    }
}

pub type QueryMessage = Typed<b'Q', CString>;

impl QueryMessage {
    pub fn new(query: impl Into<Vec<u8>>) -> Self {
        Typed::from_body(CString::new(query))
    }

    pub fn query_string(&self) -> Result<&str, CodecError> {
        self.body.to_str()
    }

    pub fn set_query_string(&mut self, query: impl Into<Vec<u8>>) {
        self.body = CString::new(query);
    }
}

pub type ParseMessage = Typed<b'P', (CString, CString, Array<Int32>)>;

impl ParseMessage {
    pub fn statement_name(&self) -> &CString {
        &self.body.0
    }

    pub fn query_string(&self) -> Result<&str, CodecError> {
        self.body.1.to_str()
    }

    pub fn parameter_types(&self) -> impl Iterator<Item = i32> + '_ {
        self.body.2.items.iter().map(|oid| oid.0)
    }
}

wire_struct! {
    /// One field of a RowDescription.
    pub struct ColumnDescription {
        pub name: CString,
        pub table_oid: Int32,
        pub attribute_number: Int16,
        pub data_type: Int32,
        pub data_size: Int16,
        pub type_modifier: Int32,
        pub format_code: Int16,
    }
}

impl ColumnDescription {
    /// Column without table origin.
    pub fn new(name: &str, data_type: i32, data_size: i16, format_code: i16) -> Self {
        ColumnDescription {
            name: CString::new(name),
            table_oid: Int32(0),
            attribute_number: Int16(0),
            data_type: Int32(data_type),
            data_size: Int16(data_size),
            type_modifier: Int32(-1),
            format_code: Int16(format_code),
        }
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(self.name.as_bytes()).into_owned()
    }

    pub fn data_type(&self) -> i32 {
        self.data_type.0
    }

    pub fn data_size(&self) -> i16 {
        self.data_size.0
    }

    pub fn format_code(&self) -> i16 {
        self.format_code.0
    }
}

pub type RowDescriptionMessage = Typed<b'T', Array<ColumnDescription>>;

impl RowDescriptionMessage {
    pub fn new(columns: Vec<ColumnDescription>) -> Self {
        Typed::from_body(Array::new(columns))
    }

    pub fn columns(&self) -> &[ColumnDescription] {
        &self.body.items
    }

    pub fn columns_mut(&mut self) -> &mut [ColumnDescription] {
        &mut self.body.items
    }
}

pub type DataRowMessage = Typed<b'D', Array<VarByteN>>;

impl DataRowMessage {
    pub fn new(values: Vec<VarByteN>) -> Self {
        Typed::from_body(Array::new(values))
    }

    pub fn values(&self) -> &[VarByteN] {
        &self.body.items
    }

    pub fn values_mut(&mut self) -> &mut [VarByteN] {
        &mut self.body.items
    }
}

pub type CommandCompleteMessage = Typed<b'C', CString>;

impl CommandCompleteMessage {
    pub fn new(tag: &str) -> Self {
        Typed::from_body(CString::new(tag))
    }

    pub fn command_tag(&self) -> String {
        String::from_utf8_lossy(self.body.as_bytes()).into_owned()
    }
}

pub type EmptyQueryResponseMessage = Typed<b'I', ()>;

wire_struct! {
    pub struct ErrorField {
        pub code: Byte1,
        pub value: CString,
    }
}

pub type ErrorResponseMessage = Typed<b'E', (Repeated<ErrorField>, Byte1)>;

impl ErrorResponseMessage {
    /// Builds an `ERROR` severity response carrying `message`.
    pub fn error(sqlstate: &str, message: &str) -> Self {
        let field = |code: u8, value: &str| ErrorField {
            code: Byte1(code),
            value: CString::new(value),
        };
        Typed::from_body((
            Repeated(vec![
                field(b'S', "ERROR"),
                field(b'V', "ERROR"),
                field(b'C', sqlstate),
                field(b'M', message),
            ]),
            Byte1(0),
        ))
    }

    pub fn fields(&self) -> &[ErrorField] {
        &self.body.0.0
    }

    pub fn field(&self, code: u8) -> Option<String> {
        self.fields()
            .iter()
            .find(|f| f.code.0 == code)
            .map(|f| String::from_utf8_lossy(f.value.as_bytes()).into_owned())
    }

    pub fn message(&self) -> Option<String> {
        self.field(b'M')
    }
}

pub type ReadyForQueryMessage = Typed<b'Z', Byte1>;

pub const TRANSACTION_IDLE: u8 = b'I';

impl ReadyForQueryMessage {
    pub fn new(status: u8) -> Self {
        Typed::from_body(Byte1(status))
    }

    pub fn transaction_status(&self) -> u8 {
        self.body.0
    }
}

/// Known message whose body is validated but never interpreted. It is forwarded byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub tag: Option<u8>,
    pub bytes: Bytes,
}

impl RawMessage {
    pub fn write_to(&self, out: &mut BytesMut) {
        out.put_slice(&self.bytes);
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Query(QueryMessage),
    Parse(ParseMessage),
    RowDescription(RowDescriptionMessage),
    DataRow(DataRowMessage),
    CommandComplete(CommandCompleteMessage),
    EmptyQueryResponse(EmptyQueryResponseMessage),
    ErrorResponse(ErrorResponseMessage),
    ReadyForQuery(ReadyForQueryMessage),
    Raw(RawMessage),
}

impl Message {
    pub fn write(&self, out: &mut BytesMut) {
        match self {
            Message::Query(m) => m.write(out),
            Message::Parse(m) => m.write(out),
            Message::RowDescription(m) => m.write(out),
            Message::DataRow(m) => m.write(out),
            Message::CommandComplete(m) => m.write(out),
            Message::EmptyQueryResponse(m) => m.write(out),
            Message::ErrorResponse(m) => m.write(out),
            Message::ReadyForQuery(m) => m.write(out),
            Message::Raw(m) => m.write_to(out),
        }
    }
}

/// Shape of a message body, used both to validate and to decode it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    Query,
    Parse,
    RowDescription,
    DataRow,
    CommandComplete,
    EmptyQueryResponse,
    ErrorResponse,
    ReadyForQuery,
    /// Startup packet or one of the negotiation requests sharing its framing.
    Startup,
    Empty,
    Bytes,
    String,
    KindAndName,
    Bind,
    Execute,
    FunctionCall,
    Authentication,
    BackendKeyData,
    CopyResponse,
    FunctionCallResponse,
    NegotiateProtocolVersion,
    Notice,
    Notification,
    ParameterDescription,
    ParameterStatus,
}

impl BodyFormat {
    pub fn validate(self, data: &[u8], pos: &mut usize, left: &mut usize) -> Validation {
        match self {
            BodyFormat::Query | BodyFormat::CommandComplete | BodyFormat::String => {
                CString::validate(data, pos, left)
            }
            BodyFormat::Parse => <(CString, CString, Array<Int32>)>::validate(data, pos, left),
            BodyFormat::RowDescription => Array::<ColumnDescription>::validate(data, pos, left),
            BodyFormat::DataRow => Array::<VarByteN>::validate(data, pos, left),
            BodyFormat::EmptyQueryResponse | BodyFormat::Empty => Validation::Ok,
            BodyFormat::ErrorResponse | BodyFormat::Notice => {
                <(Repeated<ErrorField>, Byte1)>::validate(data, pos, left)
            }
            BodyFormat::ReadyForQuery => Byte1::validate(data, pos, left),
            BodyFormat::Startup => <(Int32, Repeated<CString>, ByteN)>::validate(data, pos, left),
            BodyFormat::Bytes => ByteN::validate(data, pos, left),
            BodyFormat::KindAndName => <(Byte1, CString)>::validate(data, pos, left),
            BodyFormat::Bind => <(
                CString,
                CString,
                Array<Int16>,
                Array<VarByteN>,
                Array<Int16>,
            )>::validate(data, pos, left),
            BodyFormat::Execute => <(CString, Int32)>::validate(data, pos, left),
            BodyFormat::FunctionCall => {
                <(Int32, Array<Int16>, Array<VarByteN>, Int16)>::validate(data, pos, left)
            }
            BodyFormat::Authentication | BodyFormat::BackendKeyData => {
                <(Int32, ByteN)>::validate(data, pos, left)
            }
            BodyFormat::CopyResponse => <(Byte1, Array<Int16>)>::validate(data, pos, left),
            BodyFormat::FunctionCallResponse => VarByteN::validate(data, pos, left),
            BodyFormat::NegotiateProtocolVersion => {
                <(Int32, Array<CString, Int32>)>::validate(data, pos, left)
            }
            BodyFormat::Notification => <(Int32, CString, CString)>::validate(data, pos, left),
            BodyFormat::ParameterDescription => Array::<Int32>::validate(data, pos, left),
            BodyFormat::ParameterStatus => <(CString, CString)>::validate(data, pos, left),
        }
    }

    /// Turns a validated frame into a message. `frame` holds the full message including its
    /// header of `header_len` bytes.
    pub fn decode(self, tag: Option<u8>, frame: Bytes, header_len: usize) -> Result<Message, CodecError> {
        let body = &frame[header_len..];
        let message = match self {
            BodyFormat::Query => Message::Query(QueryMessage::decode(body)?),
            BodyFormat::Parse => Message::Parse(ParseMessage::decode(body)?),
            BodyFormat::RowDescription => {
                Message::RowDescription(RowDescriptionMessage::decode(body)?)
            }
            BodyFormat::DataRow => Message::DataRow(DataRowMessage::decode(body)?),
            BodyFormat::CommandComplete => {
                Message::CommandComplete(CommandCompleteMessage::decode(body)?)
            }
            BodyFormat::EmptyQueryResponse => {
                Message::EmptyQueryResponse(EmptyQueryResponseMessage::decode(body)?)
            }
            BodyFormat::ErrorResponse => Message::ErrorResponse(ErrorResponseMessage::decode(body)?),
            BodyFormat::ReadyForQuery => Message::ReadyForQuery(ReadyForQueryMessage::decode(body)?),
            _ => Message::Raw(RawMessage { tag, bytes: frame }),
        };
        Ok(message)
    }
}

/// Table entry describing how the decoder treats one message tag.
#[derive(Debug, Clone, Copy)]
pub struct MessageSpec {
    pub name: &'static str,
    pub format: BodyFormat,
}

const fn spec(name: &'static str, format: BodyFormat) -> MessageSpec {
    MessageSpec { name, format }
}

pub const UNKNOWN_MESSAGE: MessageSpec = spec("Other", BodyFormat::Bytes);

pub const STARTUP_MESSAGE: MessageSpec = spec("Startup", BodyFormat::Startup);

pub fn frontend_message(tag: u8) -> MessageSpec {
    match tag {
        b'B' => spec("Bind", BodyFormat::Bind),
        b'C' => spec("Close", BodyFormat::KindAndName),
        b'd' => spec("CopyData", BodyFormat::Bytes),
        b'c' => spec("CopyDone", BodyFormat::Empty),
        b'f' => spec("CopyFail", BodyFormat::String),
        b'D' => spec("Describe", BodyFormat::KindAndName),
        b'E' => spec("Execute", BodyFormat::Execute),
        b'H' => spec("Flush", BodyFormat::Empty),
        b'F' => spec("FunctionCall", BodyFormat::FunctionCall),
        b'p' => spec("PasswordMessage/SASLMessage", BodyFormat::Bytes),
        b'P' => spec("Parse", BodyFormat::Parse),
        b'Q' => spec("Query", BodyFormat::Query),
        b'S' => spec("Sync", BodyFormat::Empty),
        b'X' => spec("Terminate", BodyFormat::Empty),
        _ => UNKNOWN_MESSAGE,
    }
}

pub fn backend_message(tag: u8) -> MessageSpec {
    match tag {
        b'R' => spec("Authentication", BodyFormat::Authentication),
        b'K' => spec("BackendKeyData", BodyFormat::BackendKeyData),
        b'2' => spec("BindComplete", BodyFormat::Empty),
        b'3' => spec("CloseComplete", BodyFormat::Empty),
        b'C' => spec("CommandComplete", BodyFormat::CommandComplete),
        b'd' => spec("CopyData", BodyFormat::Bytes),
        b'c' => spec("CopyDone", BodyFormat::Empty),
        b'G' => spec("CopyInResponse", BodyFormat::CopyResponse),
        b'H' => spec("CopyOutResponse", BodyFormat::CopyResponse),
        b'W' => spec("CopyBothResponse", BodyFormat::CopyResponse),
        b'D' => spec("DataRow", BodyFormat::DataRow),
        b'I' => spec("EmptyQueryResponse", BodyFormat::EmptyQueryResponse),
        b'E' => spec("ErrorResponse", BodyFormat::ErrorResponse),
        b'V' => spec("FunctionCallResponse", BodyFormat::FunctionCallResponse),
        b'v' => spec("NegotiateProtocolVersion", BodyFormat::NegotiateProtocolVersion),
        b'n' => spec("NoData", BodyFormat::Empty),
        b'N' => spec("NoticeResponse", BodyFormat::Notice),
        b'A' => spec("NotificationResponse", BodyFormat::Notification),
        b't' => spec("ParameterDescription", BodyFormat::ParameterDescription),
        b'S' => spec("ParameterStatus", BodyFormat::ParameterStatus),
        b'1' => spec("ParseComplete", BodyFormat::Empty),
        b's' => spec("PortalSuspended", BodyFormat::Empty),
        b'Z' => spec("ReadyForQuery", BodyFormat::ReadyForQuery),
        b'T' => spec("RowDescription", BodyFormat::RowDescription),
        _ => UNKNOWN_MESSAGE,
    }
}
