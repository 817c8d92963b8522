//! Binary codec for the scripting session messages.
//!
//! Every frame is one message: a tag byte followed by the fields in order.
//! Strings are an unsigned LEB128 byte length followed by UTF-8 bytes. The
//! environment list carries a single-byte count, so at most 255 names fit in
//! one listing.

use crate::error::ProtocolError;

pub const MAX_LISTED_ENVIRONMENTS: usize = u8::MAX as usize;
pub const MAX_STRING_BYTES: usize = 1 << 20;

const TAG_LIST_REQUEST: u8 = 0x01;
const TAG_CREATE: u8 = 0x02;
const TAG_DELETE: u8 = 0x03;
const TAG_VIEW: u8 = 0x04;
const TAG_END_VIEW: u8 = 0x05;
const TAG_EXECUTE: u8 = 0x06;

const TAG_LIST: u8 = 0x81;
const TAG_DELETED: u8 = 0x82;
const TAG_CONFIRM_VIEW: u8 = 0x83;
const TAG_SCRIPT_STATE: u8 = 0x84;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientMessage {
    ListEnvironmentsRequest,
    RequestCreateEnvironment { name: String },
    RequestDeleteEnvironment { name: String },
    ViewEnvironment { name: String },
    EndViewEnvironment { name: String },
    ScriptExecute { env_name: String, source: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerMessage {
    ListEnvironments { names: Vec<String> },
    EnvironmentDeleted { name: String },
    ConfirmView { name: String, state: String },
    ScriptState {
        env_name: String,
        state: String,
        result: String,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ListEnvironmentsRequest => "list",
            Self::RequestCreateEnvironment { .. } => "create",
            Self::RequestDeleteEnvironment { .. } => "delete",
            Self::ViewEnvironment { .. } => "view",
            Self::EndViewEnvironment { .. } => "end-view",
            Self::ScriptExecute { .. } => "execute",
        }
    }

    pub fn environment(&self) -> Option<&str> {
        match self {
            Self::ListEnvironmentsRequest => None,
            Self::RequestCreateEnvironment { name }
            | Self::RequestDeleteEnvironment { name }
            | Self::ViewEnvironment { name }
            | Self::EndViewEnvironment { name } => Some(name),
            Self::ScriptExecute { env_name, .. } => Some(env_name),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        match self {
            Self::ListEnvironmentsRequest => w.u8(TAG_LIST_REQUEST),
            Self::RequestCreateEnvironment { name } => w.u8(TAG_CREATE).string(name),
            Self::RequestDeleteEnvironment { name } => w.u8(TAG_DELETE).string(name),
            Self::ViewEnvironment { name } => w.u8(TAG_VIEW).string(name),
            Self::EndViewEnvironment { name } => w.u8(TAG_END_VIEW).string(name),
            Self::ScriptExecute { env_name, source } => {
                w.u8(TAG_EXECUTE).string(env_name).string(source)
            }
        };
        w.0
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(frame);
        let msg = match r.u8()? {
            TAG_LIST_REQUEST => Self::ListEnvironmentsRequest,
            TAG_CREATE => Self::RequestCreateEnvironment { name: r.string()? },
            TAG_DELETE => Self::RequestDeleteEnvironment { name: r.string()? },
            TAG_VIEW => Self::ViewEnvironment { name: r.string()? },
            TAG_END_VIEW => Self::EndViewEnvironment { name: r.string()? },
            TAG_EXECUTE => Self::ScriptExecute {
                env_name: r.string()?,
                source: r.string()?,
            },
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        r.finish()?;
        Ok(msg)
    }
}

impl ServerMessage {
    /// Lists longer than [`MAX_LISTED_ENVIRONMENTS`] are cut to fit.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::default();
        match self {
            Self::ListEnvironments { names } => {
                let shown = names.len().min(MAX_LISTED_ENVIRONMENTS);
                w.u8(TAG_LIST).u8(shown as u8);
                for name in &names[..shown] {
                    w.string(name);
                }
            }
            Self::EnvironmentDeleted { name } => {
                w.u8(TAG_DELETED).string(name);
            }
            Self::ConfirmView { name, state } => {
                w.u8(TAG_CONFIRM_VIEW).string(name).string(state);
            }
            Self::ScriptState {
                env_name,
                state,
                result,
            } => {
                w.u8(TAG_SCRIPT_STATE)
                    .string(env_name)
                    .string(state)
                    .string(result);
            }
        }
        w.0
    }

    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(frame);
        let msg = match r.u8()? {
            TAG_LIST => {
                let count = r.u8()? as usize;
                let names = (0..count)
                    .map(|_| r.string())
                    .collect::<Result<Vec<_>, _>>()?;
                Self::ListEnvironments { names }
            }
            TAG_DELETED => Self::EnvironmentDeleted { name: r.string()? },
            TAG_CONFIRM_VIEW => Self::ConfirmView {
                name: r.string()?,
                state: r.string()?,
            },
            TAG_SCRIPT_STATE => Self::ScriptState {
                env_name: r.string()?,
                state: r.string()?,
                result: r.string()?,
            },
            other => return Err(ProtocolError::UnknownTag(other)),
        };
        r.finish()?;
        Ok(msg)
    }
}

#[derive(Default)]
struct Writer(Vec<u8>);

impl Writer {
    fn u8(&mut self, v: u8) -> &mut Self {
        self.0.push(v);
        self
    }

    fn varint(&mut self, mut v: usize) -> &mut Self {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.0.push(byte);
                return self;
            }
            self.0.push(byte | 0x80);
        }
    }

    fn string(&mut self, s: &str) -> &mut Self {
        self.varint(s.len());
        self.0.extend_from_slice(s.as_bytes());
        self
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        let b = *self.buf.get(self.pos).ok_or(ProtocolError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn varint(&mut self) -> Result<usize, ProtocolError> {
        let mut value: usize = 0;
        for shift in (0..35).step_by(7) {
            let byte = self.u8()?;
            value |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProtocolError::LengthOverflow)
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.varint()?;
        if len > MAX_STRING_BYTES {
            return Err(ProtocolError::StringTooLong(len));
        }
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(ProtocolError::UnexpectedEof)?;
        let s = std::str::from_utf8(&self.buf[self.pos..end])
            .map_err(|_| ProtocolError::InvalidUtf8)?
            .to_string();
        self.pos = end;
        Ok(s)
    }

    fn finish(&self) -> Result<(), ProtocolError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            extra => Err(ProtocolError::TrailingBytes(extra)),
        }
    }
}
