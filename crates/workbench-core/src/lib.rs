pub mod config;
pub mod cron;
pub mod permissions;
pub mod roles;
pub mod runner;
pub mod scheduler;
pub mod skill_router;

pub use workbench_store::EventBus;

pub const DEFAULT_ENGINE_HOST: &str = "127.0.0.1";
pub const DEFAULT_ENGINE_PORT: u16 = 8787;
