//! Wire primitives of the PostgreSQL v3 protocol.
//!
//! Every type follows a two-phase contract. `validate` inspects the bytes received so far
//! without touching them and reports whether a complete, well-formed value is present.
//! It is re-run from the start of the message whenever more bytes arrive. `read` is only
//! called after the enclosing message validated and materializes the value.
//!
//! Both phases take the whole receive buffer, the current position and the number of bytes
//! the enclosing message still declares (`left`). Positions and `left` advance together.

use std::fmt;
use std::marker::PhantomData;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Buffer underrun")]
    BufferUnderrun,
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(u32),
    #[error("Invalid encoding")]
    InvalidEncoding,
}

/// Outcome of validating a value against a partially received buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    Ok,
    NeedMoreData,
    Failed,
}

pub trait WireType: fmt::Debug + Sized {
    fn validate(data: &[u8], pos: &mut usize, left: &mut usize) -> Validation;

    fn read(data: &[u8], pos: &mut usize, left: &mut usize) -> Result<Self, CodecError>;

    fn write(&self, out: &mut BytesMut);
}

fn available(data: &[u8], pos: usize) -> usize {
    data.len().saturating_sub(pos)
}

fn take<'a>(
    data: &'a [u8],
    pos: &mut usize,
    left: &mut usize,
    n: usize,
) -> Result<&'a [u8], CodecError> {
    if n > *left {
        return Err(CodecError::MalformedMessage(format!(
            "field of {} bytes exceeds remaining {} bytes",
            n, left
        )));
    }
    let bytes = data.get(*pos..*pos + n).ok_or(CodecError::BufferUnderrun)?;
    *pos += n;
    *left -= n;
    Ok(bytes)
}

fn validate_fixed(data: &[u8], pos: &mut usize, left: &mut usize, width: usize) -> Validation {
    if *left < width {
        return Validation::Failed;
    }
    if available(data, *pos) < width {
        return Validation::NeedMoreData;
    }
    *pos += width;
    *left -= width;
    Validation::Ok
}

macro_rules! fixed_width {
    ($name:ident, $inner:ty, $width:expr, $read:expr, $put:ident) => {
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name(pub $inner);

        impl WireType for $name {
            fn validate(data: &[u8], pos: &mut usize, left: &mut usize) -> Validation {
                validate_fixed(data, pos, left, $width)
            }

            fn read(data: &[u8], pos: &mut usize, left: &mut usize) -> Result<Self, CodecError> {
                let bytes = take(data, pos, left, $width)?;
                Ok($name($read(bytes)))
            }

            fn write(&self, out: &mut BytesMut) {
                out.$put(self.0);
            }
        }
    };
}

fixed_width!(Byte1, u8, 1, |b: &[u8]| b[0], put_u8);
fixed_width!(Int16, i16, 2, BigEndian::read_i16, put_i16);
fixed_width!(Int32, i32, 4, BigEndian::read_i32, put_i32);

/// Null-terminated string. The bytes are kept as received since the client encoding is not
/// necessarily UTF-8; `to_str` performs the conversion when a caller needs text.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CString(Vec<u8>);

impl CString {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        CString(value.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_str(&self) -> Result<&str, CodecError> {
        std::str::from_utf8(&self.0).map_err(|_| CodecError::InvalidEncoding)
    }
}

impl fmt::Debug for CString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

impl WireType for CString {
    fn validate(data: &[u8], pos: &mut usize, left: &mut usize) -> Validation {
        let window = available(data, *pos).min(*left);
        let search = &data[*pos..*pos + window];
        match memchr::memchr(0, search) {
            Some(index) => {
                *pos += index + 1;
                *left -= index + 1;
                Validation::Ok
            }
            // Every declared byte has arrived and none of them terminates the string.
            None if *left <= available(data, *pos) => Validation::Failed,
            None => Validation::NeedMoreData,
        }
    }

    fn read(data: &[u8], pos: &mut usize, left: &mut usize) -> Result<Self, CodecError> {
        let window = data.get(*pos..*pos + *left).ok_or(CodecError::BufferUnderrun)?;
        let end = memchr::memchr(0, window).ok_or_else(|| {
            CodecError::MalformedMessage("string is missing its terminator".to_string())
        })?;
        let bytes = take(data, pos, left, end + 1)?;
        Ok(CString(bytes[..end].to_vec()))
    }

    fn write(&self, out: &mut BytesMut) {
        out.put_slice(&self.0);
        out.put_u8(0);
    }
}

/// Remainder of the enclosing message, uninterpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteN(pub Vec<u8>);

impl WireType for ByteN {
    fn validate(data: &[u8], pos: &mut usize, left: &mut usize) -> Validation {
        if *left > available(data, *pos) {
            return Validation::NeedMoreData;
        }
        *pos += *left;
        *left = 0;
        Validation::Ok
    }

    fn read(data: &[u8], pos: &mut usize, left: &mut usize) -> Result<Self, CodecError> {
        let n = *left;
        Ok(ByteN(take(data, pos, left, n)?.to_vec()))
    }

    fn write(&self, out: &mut BytesMut) {
        out.put_slice(&self.0);
    }
}

/// Int32 length followed by that many bytes. A negative length encodes SQL NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarByteN(pub Option<Vec<u8>>);

impl VarByteN {
    pub fn null() -> Self {
        VarByteN(None)
    }

    pub fn value(bytes: impl Into<Vec<u8>>) -> Self {
        VarByteN(Some(bytes.into()))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        self.0.as_deref()
    }

    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }
}

impl WireType for VarByteN {
    fn validate(data: &[u8], pos: &mut usize, left: &mut usize) -> Validation {
        if *left < 4 {
            return Validation::Failed;
        }
        if available(data, *pos) < 4 {
            return Validation::NeedMoreData;
        }
        let len = BigEndian::read_i32(&data[*pos..*pos + 4]);
        if len < 0 {
            *pos += 4;
            *left -= 4;
            return Validation::Ok;
        }
        let len = len as usize;
        if len > *left - 4 {
            return Validation::Failed;
        }
        if available(data, *pos) < len + 4 {
            return Validation::NeedMoreData;
        }
        *pos += len + 4;
        *left -= len + 4;
        Validation::Ok
    }

    fn read(data: &[u8], pos: &mut usize, left: &mut usize) -> Result<Self, CodecError> {
        let len = BigEndian::read_i32(take(data, pos, left, 4)?);
        if len < 0 {
            return Ok(VarByteN(None));
        }
        Ok(VarByteN(Some(take(data, pos, left, len as usize)?.to_vec())))
    }

    fn write(&self, out: &mut BytesMut) {
        match &self.0 {
            Some(bytes) => {
                out.put_i32(bytes.len() as i32);
                out.put_slice(bytes);
            }
            None => out.put_i32(-1),
        }
    }
}

/// Element count prefix of an [`Array`].
pub trait Count: WireType {
    fn get(&self) -> Option<usize>;

    fn from_len(len: usize) -> Self;
}

impl Count for Int16 {
    fn get(&self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }

    fn from_len(len: usize) -> Self {
        Int16(len as i16)
    }
}

impl Count for Int32 {
    fn get(&self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }

    fn from_len(len: usize) -> Self {
        Int32(len as i32)
    }
}

/// Count-prefixed list. Protocol v3 uses an Int16 count almost everywhere.
#[derive(Clone, PartialEq, Eq)]
pub struct Array<T, C = Int16> {
    pub items: Vec<T>,
    count: PhantomData<C>,
}

impl<T, C> Array<T, C> {
    pub fn new(items: Vec<T>) -> Self {
        Array { items, count: PhantomData }
    }
}

impl<T, C> Default for Array<T, C> {
    fn default() -> Self {
        Array::new(Vec::new())
    }
}

impl<T: fmt::Debug, C> fmt::Debug for Array<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.items).finish()
    }
}

impl<T: WireType, C: Count> WireType for Array<T, C> {
    fn validate(data: &[u8], pos: &mut usize, left: &mut usize) -> Validation {
        let start = *pos;
        match C::validate(data, pos, left) {
            Validation::Ok => {}
            other => return other,
        }
        let mut cursor = start;
        let mut scratch = usize::MAX;
        let Ok(count) = C::read(data, &mut cursor, &mut scratch) else {
            return Validation::Failed;
        };
        let Some(count) = count.get() else {
            return Validation::Failed;
        };
        for _ in 0..count {
            match T::validate(data, pos, left) {
                Validation::Ok => {}
                other => return other,
            }
        }
        Validation::Ok
    }

    fn read(data: &[u8], pos: &mut usize, left: &mut usize) -> Result<Self, CodecError> {
        let count = C::read(data, pos, left)?
            .get()
            .ok_or_else(|| CodecError::MalformedMessage("negative array length".to_string()))?;
        let mut items = Vec::with_capacity(count.min(*left));
        for _ in 0..count {
            items.push(T::read(data, pos, left)?);
        }
        Ok(Array::new(items))
    }

    fn write(&self, out: &mut BytesMut) {
        C::from_len(self.items.len()).write(out);
        for item in &self.items {
            item.write(out);
        }
    }
}

/// Values repeated until a zero byte or the end of the message. The terminator itself is not
/// consumed; messages that carry one describe it as a trailing [`Byte1`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repeated<T>(pub Vec<T>);

impl<T> Default for Repeated<T> {
    fn default() -> Self {
        Repeated(Vec::new())
    }
}

impl<T: WireType> WireType for Repeated<T> {
    fn validate(data: &[u8], pos: &mut usize, left: &mut usize) -> Validation {
        loop {
            if *left == 0 {
                return Validation::Ok;
            }
            match data.get(*pos) {
                None => return Validation::NeedMoreData,
                Some(0) => return Validation::Ok,
                Some(_) => {}
            }
            let before = *pos;
            match T::validate(data, pos, left) {
                Validation::Ok if *pos == before => return Validation::Failed,
                Validation::Ok => {}
                other => return other,
            }
        }
    }

    fn read(data: &[u8], pos: &mut usize, left: &mut usize) -> Result<Self, CodecError> {
        let mut items = Vec::new();
        while *left > 0 {
            match data.get(*pos) {
                None => return Err(CodecError::BufferUnderrun),
                Some(0) => break,
                Some(_) => items.push(T::read(data, pos, left)?),
            }
        }
        Ok(Repeated(items))
    }

    fn write(&self, out: &mut BytesMut) {
        for item in &self.0 {
            item.write(out);
        }
    }
}

impl WireType for () {
    fn validate(_data: &[u8], _pos: &mut usize, _left: &mut usize) -> Validation {
        Validation::Ok
    }

    fn read(_data: &[u8], _pos: &mut usize, _left: &mut usize) -> Result<Self, CodecError> {
        Ok(())
    }

    fn write(&self, _out: &mut BytesMut) {}
}

// Fixed ordered sequences of fields.
macro_rules! sequence {
    ($($field:ident),+) => {
        impl<$($field: WireType),+> WireType for ($($field,)+) {
            fn validate(data: &[u8], pos: &mut usize, left: &mut usize) -> Validation {
                $(
                    match $field::validate(data, pos, left) {
                        Validation::Ok => {}
                        other => return other,
                    }
                )+
                Validation::Ok
            }

            fn read(data: &[u8], pos: &mut usize, left: &mut usize) -> Result<Self, CodecError> {
                Ok(($($field::read(data, pos, left)?,)+))
            }

            #[allow(non_snake_case)]
            fn write(&self, out: &mut BytesMut) {
                let ($($field,)+) = self;
                $($field.write(out);)+
            }
        }
    };
}

sequence!(A);
sequence!(A, B);
sequence!(A, B, C);
sequence!(A, B, C, D);
sequence!(A, B, C, D, E);

/// Declares a struct whose fields are encoded back to back, in declaration order.
macro_rules! wire_struct {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $($(#[$field_meta:meta])* pub $field:ident: $ty:ty,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $name {
            $($(#[$field_meta])* pub $field: $ty,)+
        }

        impl $crate::protocol::codec::WireType for $name {
            fn validate(
                data: &[u8],
                pos: &mut usize,
                left: &mut usize,
            ) -> $crate::protocol::codec::Validation {
                $(
                    match <$ty as $crate::protocol::codec::WireType>::validate(data, pos, left) {
                        $crate::protocol::codec::Validation::Ok => {}
                        other => return other,
                    }
                )+
                $crate::protocol::codec::Validation::Ok
            }

            fn read(
                data: &[u8],
                pos: &mut usize,
                left: &mut usize,
            ) -> Result<Self, $crate::protocol::codec::CodecError> {
                Ok($name {
                    $($field: <$ty as $crate::protocol::codec::WireType>::read(data, pos, left)?,)+
                })
            }

            fn write(&self, out: &mut bytes::BytesMut) {
                $($crate::protocol::codec::WireType::write(&self.$field, out);)+
            }
        }
    };
}

pub(crate) use wire_struct;
