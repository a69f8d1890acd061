pub mod discord;
pub mod web;
