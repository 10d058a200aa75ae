//! Adapter trait for the external object-storage service.
//!
//! The upload/transform pipeline is a black box; the core only ever calls
//! delete. Upload is part of the contract because the surrounding
//! application shares the adapter instance.

use async_trait::async_trait;
use std::fmt::Debug;

use crate::prelude::*;

#[async_trait]
pub trait ObjectAdapter: Debug + Send + Sync {
	/// Deletes a stored object by its public id
	async fn delete_object(&self, public_id: &str) -> SlResult<()>;

	/// Uploads a blob, returns its delivery URL
	async fn upload_object(&self, bytes: &[u8], folder: &str) -> SlResult<Box<str>>;
}

// vim: ts=4
