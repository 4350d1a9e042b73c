#[macro_use]
extern crate rocket;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate log;
#[macro_use]
extern crate diesel;
#[macro_use]
extern crate diesel_migrations;

pub mod types;
pub mod util;
pub mod acme;
pub mod ca;
pub mod config;
pub mod issuance;
pub mod provisioner;
pub mod store;
pub mod validator;

#[cfg(test)]
pub(crate) mod testing;
