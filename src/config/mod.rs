pub mod settings;

pub use settings::Config;

use crate::error::NetError;
use std::sync::Arc;

/// Loads `.env` (if present) and the process environment, then validates.
pub fn load_config() -> Result<Arc<Config>, NetError> {
    dotenv::dotenv().ok(); // Load .env file if present, ignore errors

    let config = Config::from_env();
    config.validate()?;
    Ok(Arc::new(config))
}
