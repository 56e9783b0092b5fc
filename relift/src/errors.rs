use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
	/// The converter reached a pair of types it has no rule for. Fatal to
	/// the calling pass.
	#[error("unsupported conversion from `{src}` to `{dst}`")]
	UnsupportedConversion { src: String, dst: String },

	#[error("malformed config document: {0}")]
	InvalidDocument(String),
}
