pub mod consumer;
pub mod error;
pub mod flv;
pub mod frame;
pub mod idr;
pub mod producer;
pub mod registry;
pub mod rtmp_io;
pub mod server;
pub mod session;
pub mod settings;
pub mod stream;
