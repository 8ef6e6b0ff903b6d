//! REST API route handlers for the control surface.

pub mod health;
pub mod traffic;
pub mod tunnels;
