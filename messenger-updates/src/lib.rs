pub mod handlers;
pub mod listener;
pub mod notifier;
pub mod registry;

pub use handlers::{HandlerContext, UpdateHandler};
pub use listener::{build_handler_context, process_payload, run};
pub use notifier::{Notifier, WebhookNotifier};
pub use registry::Registry;
