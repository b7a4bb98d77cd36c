//! Microsoft Graph request execution.

pub mod client;
pub mod models;
pub mod page;
pub mod request;
pub mod throttle;

pub use client::{GraphClient, GraphConfig};
pub use models::UserProfile;
pub use page::{GraphPage, PageStream};
pub use request::GraphRequest;
pub use throttle::ThrottlePolicy;
