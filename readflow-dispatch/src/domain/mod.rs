//! Domain models shared by every dispatch component.

mod article;
mod attempt;
mod subscription;

pub use article::Article;
pub use attempt::{AttemptKey, DeliveryAttempt, DeliveryReport, DeliveryStatus};
pub use subscription::Subscription;
pub(crate) use subscription::rate_limit_key;
