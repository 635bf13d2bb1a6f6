//! Discovery source adapters.

mod document_watch;
mod http_polling;

pub use document_watch::{DocumentLocation, DocumentWatchSource};
pub use http_polling::HttpPollingSource;
