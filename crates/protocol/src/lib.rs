pub mod binary;
pub mod constants;
pub mod envelope;
pub mod messages;

// Re-export primary types for convenience.
pub use binary::{ParseError, UploadFrame, UploadFrameHeader, encode_upload_frame, parse_upload_frame};
pub use constants::{MessageType, Status};
pub use envelope::{Message, WsError};
pub use messages::FileMeta;
