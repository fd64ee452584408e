pub mod protocol;
pub mod transfer_engine;
