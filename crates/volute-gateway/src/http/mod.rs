pub mod auth_routes;
pub mod channels;
pub mod env_routes;
pub mod events;
pub mod health;
pub mod minds;
pub mod pages;
