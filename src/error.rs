// SPDX-License-Identifier: Apache-2.0

// Try not implement From for LinkError here unless you are sure this
// error should always convert to a certain ErrorKind.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    Bug,
    /// A kernel operation failed with an errno other than the ones the
    /// caller is expected to tolerate (EEXIST on configure, ENOENT on
    /// drop).
    Kernel,
    NoSupport,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkError {
    pub kind: ErrorKind,
    pub msg: String,
}

impl LinkError {
    pub fn new(kind: ErrorKind, msg: String) -> Self {
        Self { kind, msg }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn kernel(errno: i32, msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Kernel, format!("errno {errno}: {}", msg.into()))
    }
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for LinkError {}
