#![forbid(unsafe_code)]
//! rufs public API facade.
//!
//! Re-exports the mount-session hypermetadata interface from `rufs-core`
//! through a stable external surface, with the supporting layers reachable
//! as submodules.

pub use rufs_core::*;

pub use rufs_block as block;
pub use rufs_error as error;
pub use rufs_ondisk as ondisk;
pub use rufs_types as types;
