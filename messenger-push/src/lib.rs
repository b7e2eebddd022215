pub mod error;
pub mod handlers;
pub mod listener;
pub mod registry;
pub mod sender;

pub use error::{classify_status, PushError};
pub use handlers::{PushContext, PushHandler};
pub use listener::{deliver_with_retry, process_push_message, run};
pub use registry::PushRegistry;
pub use sender::{PreparedPushNotification, PushSender, PushUrgency, WebPushSender};
