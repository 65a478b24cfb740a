// Single-table Migrator - Core
//
// This crate moves legacy per-entity tables into one single-table store and
// repairs the denormalized index rows that live alongside the entities.
// Every job runs through the same checkpointed batch runner.
//
// Jobs are registered in data_migrations/mod.rs

pub mod common;
pub mod config;
pub mod data_migrations;
pub mod kernel;

pub use config::*;
