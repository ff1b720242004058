pub mod error;
pub mod resolver;
pub mod workspace;

pub use error::IdentityError;
pub use resolver::{AgentIdentity, EnvSnapshot, IdentityResolver, IdentitySource, home_dir};
pub use workspace::{
    CwdRole, detect_cwd_role, discover_agents, discover_rigs, find_town_root, rig_default_branch,
};
