pub mod device;
pub mod manager;
pub mod refresh;

pub use device::{AuthStatus, DeviceAuthRegistry, DeviceAuthSession};
pub use manager::TokenManager;
pub use refresh::{is_token_invalid_body, jwt_expiry, RefreshOutcome};
