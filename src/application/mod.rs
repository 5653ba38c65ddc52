pub mod bootstrap;
pub mod commands;
pub mod projection;
pub mod reconcile;
pub mod refresh;
