mod client;
mod dispatch;

pub use client::{Uploader, UploadError, STREAMING_THRESHOLD};
pub use dispatch::{Dispatcher, SuccessCallback, QUEUE_CAPACITY, WORKERS_PER_BINDING};
