mod command;
mod config;
mod paths;
mod prerequisites;
mod process;
mod sandbox;

pub use command::CommandSpec;
pub use config::ProotConfig;
pub use paths::{HostPaths, LoaderPaths, RootfsPaths};
pub use sandbox::ProotSandbox;
