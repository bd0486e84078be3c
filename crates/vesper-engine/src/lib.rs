pub mod app;
pub mod config;
pub mod effects;
pub mod imagegen;
pub mod reveal;
pub mod secrets;
pub mod session;
pub mod text;
mod util;

pub use app::{ChatApp, Dispatch, DownloadRequest, ImageExport, UiEvent, UnknownImage, UnknownSession};
pub use config::AppConfig;
pub use secrets::Secrets;
pub use util::error_chain_text;
