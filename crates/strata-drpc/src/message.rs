//! Call protocol messages.
//!
//! One `Call` and one `Response` are exchanged per connection turn, each
//! encoded as a single line of JSON. The response status travels as a raw
//! integer and is validated on receipt: only `0` (success) and `1`
//! (failure) are legal.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DrpcError, DrpcResult};

/// Handler module a call is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Module {
    /// Engine-side management handlers (control process to engine).
    Mgmt,
    /// Control-process handlers (engine to control process).
    Srv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    SetRank,
    SetUp,
    PrepShutdown,
    PingRank,
    GroupUpdate,
    SetLogMasks,
    NotifyReady,
}

impl Method {
    pub fn module(&self) -> Module {
        match self {
            Method::NotifyReady => Module::Srv,
            _ => Module::Mgmt,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::SetRank => "SetRank",
            Method::SetUp => "SetUp",
            Method::PrepShutdown => "PrepShutdown",
            Method::PingRank => "PingRank",
            Method::GroupUpdate => "GroupUpdate",
            Method::SetLogMasks => "SetLogMasks",
            Method::NotifyReady => "NotifyReady",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Call {
    pub module: Module,
    pub method: Method,
    pub sequence: u64,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl Call {
    pub fn new(method: Method, sequence: u64, body: Vec<u8>) -> Self {
        Self {
            module: method.module(),
            method,
            sequence,
            body,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Failure,
}

impl Status {
    pub fn code(&self) -> i32 {
        match self {
            Status::Success => 0,
            Status::Failure => 1,
        }
    }

    pub fn from_code(code: i32) -> DrpcResult<Self> {
        match code {
            0 => Ok(Status::Success),
            1 => Ok(Status::Failure),
            other => Err(DrpcError::UnknownStatus(other)),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => f.write_str("SUCCESS"),
            Status::Failure => f.write_str("FAILURE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub sequence: u64,
    pub status: Status,
    pub body: Vec<u8>,
}

impl Response {
    pub fn success(sequence: u64, body: Vec<u8>) -> Self {
        Self {
            sequence,
            status: Status::Success,
            body,
        }
    }

    pub fn failure(sequence: u64, reason: impl Into<String>) -> Self {
        Self {
            sequence,
            status: Status::Failure,
            body: reason.into().into_bytes(),
        }
    }
}

/// On-the-wire response with an unvalidated status code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireResponse {
    pub sequence: u64,
    pub status: i32,
    #[serde(default)]
    pub body: Vec<u8>,
}

impl From<&Response> for WireResponse {
    fn from(resp: &Response) -> Self {
        Self {
            sequence: resp.sequence,
            status: resp.status.code(),
            body: resp.body.clone(),
        }
    }
}

impl TryFrom<WireResponse> for Response {
    type Error = DrpcError;

    fn try_from(wire: WireResponse) -> DrpcResult<Self> {
        Ok(Self {
            sequence: wire.sequence,
            status: Status::from_code(wire.status)?,
            body: wire.body,
        })
    }
}

/// Encode a message as one newline-terminated JSON line.
pub(crate) fn encode_line<T: Serialize>(msg: &T) -> DrpcResult<Vec<u8>> {
    let mut line = serde_json::to_vec(msg).map_err(|e| DrpcError::Malformed(e.to_string()))?;
    line.push(b'\n');
    Ok(line)
}
