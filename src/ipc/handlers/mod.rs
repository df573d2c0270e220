pub mod core;
pub mod grades;
pub mod layout;
pub mod reports;
pub mod setup;
