//! MongoDB admin interface and backup store, driven through the shell and
//! tools shipped inside the server image.

pub mod admin;
pub mod backup;
pub mod shell;

pub use admin::MongoAdmin;
pub use backup::MongoBackup;
pub use shell::{Credentials, MongoShell};
