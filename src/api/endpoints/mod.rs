pub mod admin;
pub mod audit;
pub mod auth;
pub mod bookings;
pub mod documents;
pub mod export;
pub mod health;
pub mod laws;
