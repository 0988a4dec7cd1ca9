mod admin;
mod download;
mod files;

pub use admin::{global_stats, health};
pub use download::download_file;
pub use files::{delete_file, file_stats, get_file, list_files, upload_files};
