pub mod models;
pub mod pk;
pub mod recurrence;
pub mod timezone;
