use std::fmt;

/// Process-unique identifier of a runtime domain session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host-visible handle for an object living inside a script domain
///
/// The host never interprets the value; it only hands it back to the
/// session that issued it. Zero and negative values are never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefHandle(pub i32);

impl RefHandle {
    pub const NULL: RefHandle = RefHandle(0);

    pub fn raw(self) -> i32 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 <= 0
    }
}

impl fmt::Display for RefHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlates an asynchronous export invocation with its later result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AsyncResultId(pub u64);

impl fmt::Display for AsyncResultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
