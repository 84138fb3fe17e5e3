//! Physical blob accounts.
//!
//! The [`backend::ObjectStore`] trait abstracts over one storage account.
//! Implementations are an in-process store (tests and local runs) and a
//! client for Azure Blob Storage.

pub mod azure;
pub mod backend;
pub mod memory;
