mod storage_server;

pub use storage_server::*;

#[cfg(test)]
mod storage_server_tests;
