pub mod mailbox;
pub mod messaging;
pub mod resolver;
pub mod router;

pub use mailbox::Mailbox;
pub use messaging::{ChannelConfig, MessagingConfig, QueueConfig, matches_pattern};
pub use resolver::{AddressResolver, Recipient, RecipientKind, ResolveError};
pub use router::{Delivery, MailError, MailRouter, OutgoingMessage, SendReport, is_wisp_subject};
