pub mod config;
pub mod dose_repository;
pub mod error;
pub mod logging;
pub mod medication_repository;
pub mod schedule_repository;
pub mod settings_repository;
pub mod storage;
