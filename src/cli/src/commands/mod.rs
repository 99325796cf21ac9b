pub mod config;
pub mod health;
pub mod jobs;
pub mod queues;
pub mod schedules;
pub mod workers;
