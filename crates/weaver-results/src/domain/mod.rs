//! Domain model (ids, task state, group meta, signature, errors).
//!
//! I/O を持たない純粋なデータ型だけを置きます。

pub mod errors;
pub mod group;
pub mod ids;
pub mod result;
pub mod signature;
pub mod state;

pub use self::errors::{BackendError, BackendResult, ErrorKind};
pub use self::group::GroupMeta;
pub use self::ids::{GroupUuid, Id, IdMarker, TaskUuid};
pub use self::result::TaskResult;
pub use self::signature::Signature;
pub use self::state::{TaskState, TaskStatus};
