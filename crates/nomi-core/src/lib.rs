//! Core types, config, and errors for the Nomi voice agent.

pub mod chat;
pub mod config;
pub mod error;
