/// Guest ABI contract for scriptdomain
///
/// This crate holds everything a host and a script module have to agree on:
/// the names of the entry points a module exports, the host functions it may
/// import, the status codes that cross the boundary and the layout of the
/// small records used to hand buffers back and forth.
///
/// Hosts depend on this crate through scriptdomain-host. Script authors can
/// depend on it directly to share the constants.
pub mod abi;
pub mod ids;
pub mod status;

pub use abi::{AbiError, ExportRecord, OutRecord};
pub use ids::{AsyncResultId, RefHandle, SessionId};
pub use status::CallStatus;
