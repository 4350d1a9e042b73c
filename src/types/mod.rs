pub mod account;
pub mod authorization;
pub mod challenge;
pub mod directory;
pub mod error;
pub mod identifier;
pub mod jose;
pub mod order;
pub mod revocation;
