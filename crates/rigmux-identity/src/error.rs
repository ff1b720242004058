use std::path::PathBuf;

use rigmux_protocol::{AddressError, Role};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("not in a rigmux workspace: {0}")]
    NotInWorkspace(PathBuf),

    #[error("cannot determine role from {0}")]
    UnknownLocation(PathBuf),

    #[error("{role} identity is incomplete: missing {missing} (set it in the environment or run from the agent's directory)")]
    Incomplete { role: Role, missing: &'static str },

    #[error("invalid role value {value:?}: {source}")]
    InvalidRole {
        value: String,
        #[source]
        source: AddressError,
    },

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
