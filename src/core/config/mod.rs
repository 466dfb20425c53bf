pub mod data;
pub mod io;


pub use data::{Config, CredentialsConfig, McpConfig, ProviderConfig};
pub use io::ConfigError;
