pub mod commands;
pub mod config_cmd;
pub mod output;
pub mod renderer;
