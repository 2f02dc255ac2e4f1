//! Lifecycle stages at which hooks may run

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::HookError;

/// A named point in the request or application lifecycle.
///
/// Request stages run once per request, in the order listed here
/// (`OnTimeout` and `OnError` are alternate paths). Application stages run
/// at route registration, scope creation, startup and shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    OnRequest,
    PreParsing,
    PreValidation,
    PreHandler,
    PreSerialization,
    OnSend,
    OnResponse,
    OnTimeout,
    OnError,
    OnRoute,
    OnRegister,
    OnReady,
    OnClose,
}

impl Stage {
    pub const COUNT: usize = 13;

    pub const ALL: [Stage; Stage::COUNT] = [
        Stage::OnRequest,
        Stage::PreParsing,
        Stage::PreValidation,
        Stage::PreHandler,
        Stage::PreSerialization,
        Stage::OnSend,
        Stage::OnResponse,
        Stage::OnTimeout,
        Stage::OnError,
        Stage::OnRoute,
        Stage::OnRegister,
        Stage::OnReady,
        Stage::OnClose,
    ];

    /// The camelCase name used when registering hooks by name
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::OnRequest => "onRequest",
            Stage::PreParsing => "preParsing",
            Stage::PreValidation => "preValidation",
            Stage::PreHandler => "preHandler",
            Stage::PreSerialization => "preSerialization",
            Stage::OnSend => "onSend",
            Stage::OnResponse => "onResponse",
            Stage::OnTimeout => "onTimeout",
            Stage::OnError => "onError",
            Stage::OnRoute => "onRoute",
            Stage::OnRegister => "onRegister",
            Stage::OnReady => "onReady",
            Stage::OnClose => "onClose",
        }
    }

    /// Dense index, used for per-stage tables
    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn is_request_stage(&self) -> bool {
        !self.is_application_stage()
    }

    pub fn is_application_stage(&self) -> bool {
        matches!(
            self,
            Stage::OnRoute | Stage::OnRegister | Stage::OnReady | Stage::OnClose
        )
    }

    /// Stages whose hooks may replace the in-flight payload
    pub fn is_reducer(&self) -> bool {
        matches!(self, Stage::PreSerialization | Stage::OnSend)
    }

    /// Stages that accept a payload replacement at all.
    ///
    /// `PreParsing` may swap the raw inbound body before it reaches the parser.
    pub fn accepts_payload(&self) -> bool {
        self.is_reducer() || *self == Stage::PreParsing
    }

    /// Stages before the route handler, where a hook may reply early
    pub fn allows_early_reply(&self) -> bool {
        matches!(
            self,
            Stage::OnRequest | Stage::PreParsing | Stage::PreValidation | Stage::PreHandler
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = HookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| HookError::InvalidStage(s.to_string()))
    }
}
