//! Error types shared across the Syncline workspace.

pub type SlResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
	/// Requested document, channel, or object does not exist
	NotFound,
	/// Input failed validation before reaching a store
	ValidationError(String),
	/// Document-store failure (query, batch write, delete)
	DbError(String),
	/// Object-store failure (delete, upload)
	StorageError(String),
	/// The underlying change channel was closed by the remote side
	ChannelClosed,
	/// Transient failure, the operation may succeed when retried
	ServiceUnavailable(String),
	/// Invariant violation inside the library itself
	Internal(String),

	// externals
	Io(std::io::Error),
	Json(serde_json::Error),
}

impl Error {
	/// Whether a bounded retry with back-off is worth attempting
	pub fn is_transient(&self) -> bool {
		matches!(self, Error::ServiceUnavailable(_) | Error::ChannelClosed | Error::Io(_))
	}
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Error::NotFound => write!(f, "not found"),
			Error::ValidationError(msg) => write!(f, "validation error: {}", msg),
			Error::DbError(msg) => write!(f, "document store error: {}", msg),
			Error::StorageError(msg) => write!(f, "object store error: {}", msg),
			Error::ChannelClosed => write!(f, "channel closed"),
			Error::ServiceUnavailable(msg) => write!(f, "service unavailable: {}", msg),
			Error::Internal(msg) => write!(f, "internal error: {}", msg),
			Error::Io(e) => write!(f, "io error: {}", e),
			Error::Json(e) => write!(f, "json error: {}", e),
		}
	}
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Self::Io(err)
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Self::Json(err)
	}
}

// vim: ts=4
