pub mod handshake;
pub mod program;
pub mod runner;
pub mod serial;
pub mod status;
pub mod transport;
