pub mod bus;
pub mod id;
pub mod logging;
