pub mod credentials;
pub mod cursor;
pub mod limiter;
pub mod model;
pub mod normalize;
pub mod redact;
pub mod retry;
pub mod source;
pub mod submit;
pub mod transport;

pub use credentials::{CredentialConfig, CredentialManager};
pub use limiter::RateLimiter;
pub use model::{FeedEvent, Page, PageRequest, StreamAccess};
pub use retry::RetryPolicy;
pub use source::{EventsSource, SourceConfig};
pub use transport::{HttpClient, HttpError, HttpResponse};
