//! Utility functions

use crate::prelude::*;
use rand::RngExt;

pub const ID_LENGTH: usize = 24;
pub const SAFE: [char; 62] = [
	'0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
	'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B',
	'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U',
	'V', 'W', 'X', 'Y', 'Z',
];

pub fn random_id() -> SlResult<String> {
	let mut rng = rand::rng();
	let mut result = String::with_capacity(ID_LENGTH);

	for _ in 0..ID_LENGTH {
		result.push(SAFE[rng.random_range(0..SAFE.len())]);
	}
	Ok(result)
}

/// Reduce an object-store URL to its public id.
///
/// Attachment references may be stored either as bare public ids or as full
/// delivery URLs (`https://host/folder/public_id.ext`). The public id is the
/// last path segment with any extension stripped.
///
/// # Examples
/// - `"https://cdn.example.com/chat/img_42.jpg"` → `"img_42"`
/// - `"chat/img_42"` → `"img_42"`
/// - `"img_42"` → `"img_42"`
pub fn public_id_from_url(reference: &str) -> &str {
	let segment = reference.rsplit('/').next().unwrap_or(reference);
	match segment.rsplit_once('.') {
		Some((id, ext)) if !id.is_empty() && !ext.contains('/') => id,
		_ => segment,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_random_id_length_and_alphabet() {
		let id = random_id().unwrap();
		assert_eq!(id.len(), ID_LENGTH);
		assert!(id.chars().all(|c| SAFE.contains(&c)));
	}

	#[test]
	fn test_public_id_from_url() {
		assert_eq!(public_id_from_url("https://cdn.example.com/chat/img_42.jpg"), "img_42");
		assert_eq!(public_id_from_url("chat/img_42"), "img_42");
		assert_eq!(public_id_from_url("img_42"), "img_42");
		assert_eq!(public_id_from_url("img_42.png"), "img_42");
		assert_eq!(public_id_from_url(""), "");
	}
}

// vim: ts=4
