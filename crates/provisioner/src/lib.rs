pub mod commands;
pub mod compose;
pub mod config;
pub mod configuration;
pub mod db;
pub mod dispatch;
pub mod firewall;
pub mod provisioning;
pub mod secrets;
pub mod ssh;

#[cfg(test)]
mod testing;
