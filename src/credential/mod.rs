mod endpoints;
mod manager;
mod store;
mod token;

pub use manager::CredentialManager;
pub use store::CredentialFile;
pub use token::Credential;
