mod maintenance;
mod naming_server;
mod path_lock;
mod tree;


pub use maintenance::*;
pub use naming_server::*;
pub use path_lock::*;
pub use tree::*;
