pub mod apply;
pub mod command;
pub mod command_handler;
pub mod context;
pub mod env_locker;
pub mod hooks;
pub mod locking;
pub mod plan;
pub mod pre_execute;
pub mod project_config;
pub mod project_finder;
pub mod pull_closed;
pub mod render;
pub mod result;
pub mod terraform;
pub mod webhooks;
pub mod workspace;

#[cfg(test)]
mod test_support;
