//! User-facing bot texts

use crate::metadata_store::FileRecord;
use crate::progress::ProgressSnapshot;
use crate::size_format::format_file_size;
use crate::upload_pipeline::UploadSummary;

pub const WELCOME: &str = "TURBO FILE BOT\n\nSend any file and get a fast upload to cloud storage.";

pub const HELP: &str = "Send any file to upload.\n\
Commands:\n\
/start - Welcome\n\
/list - Your files\n\
/web - Web interface\n\
/help - This message";

pub const UPLOAD_HELP: &str = "Send a file to upload. Supports documents, videos, audio and photos.";

pub const SEND_FILE_HINT: &str = "Send a file to upload!";

pub const NO_FILES: &str = "No files uploaded yet.";

pub const FILE_NOT_FOUND: &str = "File not found!";

pub const WEB_NOT_CONFIGURED: &str = "Web interface not configured. Set FILEBOT__API__PUBLIC_DOMAIN.";

pub const LINK_UNAVAILABLE: &str = "Could not generate a link right now. Please try again later.";

pub fn upload_started(file_name: &str) -> String {
    format!("Starting upload: {}", file_name)
}

pub fn upload_progress(file_name: &str, snapshot: &ProgressSnapshot) -> String {
    format!(
        "Uploading: {}\nProgress: {:.1}%\nSpeed: {:.1} MB/s\nETA: {}",
        file_name,
        snapshot.percentage,
        snapshot.speed_mbps,
        snapshot.eta_text()
    )
}

pub fn upload_complete(summary: &UploadSummary) -> String {
    format!(
        "Upload complete: {}\nSize: {}\nAvg speed: {:.1} MB/s",
        summary.record.original_name,
        format_file_size(summary.record.size_bytes),
        summary.average_speed_mbps
    )
}

pub fn upload_failed(file_name: &str) -> String {
    format!("Upload failed: {}", file_name)
}

pub fn web_interface(url: &str) -> String {
    format!("Web interface: {}", url)
}

pub fn download_ready(file_name: &str) -> String {
    format!("Download {}:", file_name)
}

pub fn player_ready(file_name: &str, intent_url: &str) -> String {
    format!(
        "MX Player ready: {}\nOpen this link on Android:\n{}",
        file_name, intent_url
    )
}

/// Numbered list of a user's files
pub fn file_list(files: &[FileRecord]) -> String {
    if files.is_empty() {
        return NO_FILES.to_string();
    }

    let mut text = String::from("Your Uploaded Files:\n\n");
    for (i, file) in files.iter().enumerate() {
        text.push_str(&format!(
            "{}. {} ({}) - {}\n",
            i + 1,
            file.original_name,
            format_file_size(file.size_bytes),
            file.created_at.format("%Y-%m-%d %H:%M")
        ));
    }
    text
}
