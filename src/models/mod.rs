pub mod appointment;
pub mod pet;
pub mod session;
pub mod user;
