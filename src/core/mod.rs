pub mod connection;
pub mod constants;
pub mod socket;
pub mod user_data;
