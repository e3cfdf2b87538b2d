pub mod cdi;
pub mod config;
pub mod device;
pub mod deviceinfo;
pub mod logging;
pub mod mock;
pub mod plugin;
pub mod pool;
pub mod vduse;
