pub mod checkpoint;
pub mod file_server;
pub mod file_watcher;
