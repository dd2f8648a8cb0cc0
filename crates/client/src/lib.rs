pub mod auth;
pub mod client;
pub mod error;
pub mod models;
pub mod submission;

pub use auth::{AuthError, TokenManager, TokenPair};
pub use client::{ApiClient, Upload, UploadFile};
pub use error::{ClientError, ClientResult};
pub use models::*;
pub use submission::TaskSubmission;
